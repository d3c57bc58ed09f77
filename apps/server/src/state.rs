use std::sync::Arc;

use tokio::sync::watch;

use crate::bridge::SessionBackend;
use crate::calls::CallTracker;
use crate::config::Config;
use crate::dedupe::OfferDeduplicator;
use crate::registry::ConnectionRegistry;

/// Everything shared across connections. Cheap to clone.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub registry: ConnectionRegistry,
    pub offers: Arc<OfferDeduplicator>,
    /// Ringing/active call per session (session_id -> call).
    pub calls: CallTracker,
    pub backend: Arc<dyn SessionBackend>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl AppState {
    pub fn new(config: Config, backend: Arc<dyn SessionBackend>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            config: Arc::new(config),
            registry: ConnectionRegistry::new(),
            offers: Arc::new(OfferDeduplicator::default()),
            calls: CallTracker::new(),
            backend,
            shutdown: Arc::new(shutdown),
        }
    }

    /// Resolves for every open connection once shutdown begins.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    pub fn begin_shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }
}
