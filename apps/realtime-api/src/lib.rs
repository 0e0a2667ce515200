pub mod auth;
pub mod config;
pub mod error;
pub mod realtime;
pub mod rls;
pub mod routes;

use std::sync::Arc;

use config::Config;
use realtime::RealtimeService;
use rls::RlsService;

/// Shared application state available to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub realtime: RealtimeService,
}

impl AppState {
    pub fn new(config: Config, rls: Arc<dyn RlsService>) -> Self {
        let realtime = RealtimeService::new(&config, rls);
        Self {
            config: Arc::new(config),
            realtime,
        }
    }
}
