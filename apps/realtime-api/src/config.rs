/// Realtime API configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// HS256 secret used to verify API-key JWTs and client access tokens.
    pub jwt_secret: String,
    /// The anonymous API key accepted at WebSocket upgrade.
    pub anon_key: String,
    /// The service API key. Also required by the stats and notify endpoints.
    pub service_key: String,
    /// Port the HTTP server binds to.
    pub port: u16,
    /// Capacity of each connection's outbound frame queue.
    pub send_queue_capacity: usize,
}

/// Default per-connection outbound queue capacity (buffered frames).
pub const DEFAULT_SEND_QUEUE_CAPACITY: usize = 256;

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Panics with a descriptive message if a required variable is missing.
    pub fn from_env() -> Self {
        Self {
            jwt_secret: required_var("JWT_SECRET"),
            anon_key: required_var("ANON_KEY"),
            service_key: required_var("SERVICE_KEY"),
            port: std::env::var("PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(4000),
            send_queue_capacity: std::env::var("REALTIME_SEND_QUEUE")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|n: &usize| *n > 0)
                .unwrap_or(DEFAULT_SEND_QUEUE_CAPACITY),
        }
    }
}

fn required_var(name: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| panic!("{name} env var is required"))
}
