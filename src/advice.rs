use crate::config::Config;
use crate::resilience::FetchError;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::time::Duration;

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

/// Health-advice generation client. A plain request/response call; it gets
/// no retry pipeline of its own, just a cache entry keyed by prompt hash so
/// identical conditions reuse the generated text.
pub struct AdviceClient {
    client: Client,
    config: Config,
}

impl AdviceClient {
    pub fn new(config: Config) -> anyhow::Result<Self> {
        let client = Client::builder()
            .user_agent("AirwatchServer/1.0")
            .timeout(Duration::from_secs(60))
            .build()?;

        Ok(Self { client, config })
    }

    pub fn cache_key(prompt: &str) -> String {
        let mut hasher = DefaultHasher::new();
        prompt.hash(&mut hasher);
        format!("advice:{:016x}", hasher.finish())
    }

    pub fn build_prompt(
        weather_summary: &str,
        aqi: i64,
        components: &HashMap<String, f64>,
        language: &str,
    ) -> String {
        let components = serde_json::to_string(components).unwrap_or_default();
        let instructions = if language == "es" {
            "Actúa como un experto en salud ambiental. Genera un consejo directo \
             (máximo 3 renglones) con el formato [Nivel de Riesgo]: [Consejo]."
        } else {
            "Act as an environmental health expert. Generate a direct recommendation \
             (maximum 3 lines) in the format [Risk Level]: [Advice]."
        };
        format!(
            "{}\n\nWeather: {}\nAQI: {}\nComponents: {}",
            instructions, weather_summary, aqi, components
        )
    }

    pub async fn health_advice(&self, prompt: &str) -> Result<String, FetchError> {
        let request = ChatRequest {
            model: self.config.advice_model.clone(),
            messages: vec![ChatMessage {
                role: "user".to_string(),
                content: prompt.to_string(),
            }],
            max_tokens: 200,
            temperature: 0.4,
        };

        let response = self
            .client
            .post(&self.config.advice_base_url)
            .bearer_auth(&self.config.advice_api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| FetchError::Transient(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS
            {
                Err(FetchError::Transient(format!("advice HTTP {}", status)))
            } else {
                Err(FetchError::Rejected(format!(
                    "advice HTTP {}: {}",
                    status, body
                )))
            };
        }

        let chat: ChatResponse = response
            .json()
            .await
            .map_err(|e| FetchError::Rejected(format!("malformed advice payload: {}", e)))?;

        chat.choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content.trim().to_string())
            .ok_or_else(|| FetchError::Rejected("advice response had no choices".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prompt_carries_conditions_and_language() {
        let components = HashMap::from([("pm2_5".to_string(), 35.2)]);
        let prompt = AdviceClient::build_prompt("sunny, 24C", 4, &components, "en");
        assert!(prompt.contains("AQI: 4"));
        assert!(prompt.contains("sunny, 24C"));
        assert!(prompt.contains("pm2_5"));
        assert!(prompt.contains("Risk Level"));

        let prompt_es = AdviceClient::build_prompt("soleado, 24C", 4, &components, "es");
        assert!(prompt_es.contains("Nivel de Riesgo"));
    }

    #[test]
    fn test_cache_key_is_stable_per_prompt() {
        let a = AdviceClient::cache_key("prompt one");
        let b = AdviceClient::cache_key("prompt one");
        let c = AdviceClient::cache_key("prompt two");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with("advice:"));
    }
}
