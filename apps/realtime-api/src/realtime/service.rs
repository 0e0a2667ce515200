//! Boundary between the HTTP layer and the realtime core.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::auth::jwt::JwtVerifier;
use crate::config::Config;
use crate::rls::RlsService;

use super::connection::Connection;
use super::events::{ChangeEvent, ChangeEventType, Row};
use super::hub::{Hub, HubStats};

/// Cheap to clone; shared by the upgrade handler and upstream notifiers.
#[derive(Clone)]
pub struct RealtimeService {
    hub: Arc<Hub>,
    verifier: Arc<JwtVerifier>,
    send_queue_capacity: usize,
    shutdown: CancellationToken,
}

impl RealtimeService {
    pub fn new(config: &Config, rls: Arc<dyn RlsService>) -> Self {
        Self {
            hub: Arc::new(Hub::new(rls)),
            verifier: Arc::new(JwtVerifier::new(&config.jwt_secret)),
            send_queue_capacity: config.send_queue_capacity.max(1),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn hub(&self) -> &Hub {
        &self.hub
    }

    pub fn verifier(&self) -> &JwtVerifier {
        &self.verifier
    }

    /// Create and register a connection. The receiver feeds its write loop.
    pub fn connect(&self) -> (Arc<Connection>, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(self.send_queue_capacity);
        let conn = Arc::new(Connection::new(tx));
        self.hub.register_conn(conn.clone());
        (conn, rx)
    }

    /// Tear down a connection. Idempotent.
    pub fn disconnect(&self, conn: &Connection) {
        conn.close();
        self.hub.unregister_conn(conn.id());
    }

    /// Entry point for committed row mutations. Returns the number of
    /// subscribers the change was queued for.
    pub async fn notify_change(
        &self,
        schema: &str,
        table: &str,
        event_type: ChangeEventType,
        old_record: Option<Row>,
        record: Option<Row>,
    ) -> usize {
        let change = ChangeEvent::new(schema, table, event_type, old_record, record);
        let delivered = self.hub.broadcast_change(&change).await;
        tracing::debug!(%schema, %table, ?event_type, delivered, "change notified");
        delivered
    }

    /// Close every open socket, and any opened afterwards, with a close
    /// frame. Each connection then tears down as if the peer had left.
    pub fn shutdown(&self) {
        tracing::info!(connections = self.hub.stats().connections, "closing realtime connections");
        self.shutdown.cancel();
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn stats(&self) -> HubStats {
        self.hub.stats()
    }
}
