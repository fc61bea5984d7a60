/// Validate latitude and longitude coordinates
pub fn validate_coordinates(lat: f64, lon: f64) -> Result<(), String> {
    if !(-90.0..=90.0).contains(&lat) {
        return Err(format!("Invalid latitude: {}. Must be between -90 and 90", lat));
    }
    if !(-180.0..=180.0).contains(&lon) {
        return Err(format!("Invalid longitude: {}. Must be between -180 and 180", lon));
    }
    Ok(())
}

/// Calculate distance between two coordinates using Haversine formula
pub fn haversine_distance(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    const EARTH_RADIUS_KM: f64 = 6371.0;

    let lat1_rad = lat1.to_radians();
    let lat2_rad = lat2.to_radians();
    let delta_lat = (lat2 - lat1).to_radians();
    let delta_lon = (lon2 - lon1).to_radians();

    let a = (delta_lat / 2.0).sin().powi(2)
        + lat1_rad.cos() * lat2_rad.cos() * (delta_lon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());

    EARTH_RADIUS_KM * c
}

/// Round to specified decimal places
pub fn quantize(value: f64, decimals: u32) -> f64 {
    let multiplier = 10_f64.powi(decimals as i32);
    (value * multiplier).round() / multiplier
}

/// Cache key for a live air quality reading. Coordinates are quantized so
/// nearby requests share an entry; the precision is a deliberate hit-rate
/// tradeoff, not a correctness concern.
pub fn live_cache_key(lat: f64, lon: f64, precision: u32) -> String {
    format!(
        "air_quality:{}:{}",
        quantize(lat, precision),
        quantize(lon, precision)
    )
}

/// Cache key for a spatial-temporal history query.
pub fn history_cache_key(lat: f64, lon: f64, precision: u32, days: i64) -> String {
    format!(
        "history:{}:{}:{}d",
        quantize(lat, precision),
        quantize(lon, precision),
        days
    )
}

/// Cache key for a visit-frequency summary.
pub fn visits_cache_key(user_id: &str, days: i64) -> String {
    format!("visits:{}:{}d", user_id, days)
}
