/// Process-wide configuration, read once at startup from the environment.
///
/// Mirrors `web_server.rs`'s `std::env::var("DB_DIR")` / `PORT` reads, just
/// collected into one struct instead of scattered `env::var` calls.
#[derive(Debug, Clone)]
pub struct Config {
    pub db_path: String,
    pub bind_addr: String,
    pub bind_port: u16,
    pub vendor_historical_url: String,
    pub vendor_ws_url: String,
    pub vendor_api_key: String,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            db_path: std::env::var("DB_PATH").unwrap_or_else(|_| "market_data.db".to_string()),
            bind_addr: std::env::var("BIND_ADDR").unwrap_or_else(|_| "127.0.0.1".to_string()),
            bind_port: std::env::var("BIND_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(8080),
            vendor_historical_url: std::env::var("VENDOR_HISTORICAL_URL")
                .unwrap_or_else(|_| "https://vendor.example.com/historical".to_string()),
            vendor_ws_url: std::env::var("VENDOR_WS_URL")
                .unwrap_or_else(|_| "wss://vendor.example.com/stream".to_string()),
            vendor_api_key: std::env::var("VENDOR_API_KEY").unwrap_or_default(),
        }
    }
}
