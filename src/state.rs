// src/state.rs
use std::sync::Arc;

use crate::services::callbacks::CallbackIngestor;
use crate::services::gateway::MpesaGateway;
use crate::services::reconciliation::Reconciler;
use crate::store::CallbackStore;

#[derive(Clone)]
pub struct AppState {
    pub ingestor: Arc<CallbackIngestor>,
    pub reconciler: Arc<Reconciler>,
    /// None when gateway credentials are not configured; storage-backed
    /// endpoints keep working, outbound calls report service-unavailable.
    pub gateway: Option<Arc<MpesaGateway>>,
}

impl AppState {
    pub fn new(store: Arc<dyn CallbackStore>) -> Self {
        AppState {
            ingestor: Arc::new(CallbackIngestor::new(store.clone())),
            reconciler: Arc::new(Reconciler::new(store)),
            gateway: None,
        }
    }

    pub fn with_gateway(mut self, gateway: Arc<MpesaGateway>) -> Self {
        self.gateway = Some(gateway);
        self
    }
}
