pub mod channel;
pub mod connection;
pub mod events;
pub mod filter;
pub mod hub;
pub mod presence;
pub mod protocol;
pub mod server;
pub mod service;

pub use service::RealtimeService;
