use tether_core::HandleOptions;

/// Settings for the ping/pong demo, read from the environment (and `.env`).
#[derive(Clone, Debug)]
pub struct DemoConfig {
    pub uri: String,
    /// Pings posted before the closing call; at least one, or nothing
    /// would ever close the handles
    pub rounds: u32,
    /// Loopback delivery threads
    pub workers: usize,
    pub call_timeout_ms: u32,
    pub options: HandleOptions,
}

impl DemoConfig {
    pub fn from_env() -> Self {
        Self {
            uri: std::env::var("TETHER_URI")
                .ok()
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| "loopback:demo".to_string()),
            rounds: std::env::var("PING_ROUNDS")
                .ok()
                .and_then(|v| v.parse::<u32>().ok())
                .unwrap_or(3)
                .max(1),
            workers: std::env::var("LOOPBACK_WORKERS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(4),
            call_timeout_ms: std::env::var("CALL_TIMEOUT_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(5_000),
            options: HandleOptions::from_env(),
        }
    }
}
