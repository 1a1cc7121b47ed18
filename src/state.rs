use std::sync::Arc;

use crate::auth::IdentityVerifier;
use crate::config::HubConfig;
use crate::hub::{EventRouter, Hub, ThrottleGuard, ThrottlePolicy};
use crate::store::MessageStore;

/// Shared application state passed to all handlers via axum State extractor.
#[derive(Clone)]
pub struct AppState {
    /// Connection registry, pending queue and status machine
    pub hub: Arc<Hub>,
    /// Inbound event dispatch, shared by every read pump
    pub router: Arc<EventRouter>,
    /// Validates `?token=` on upgrade and bearer headers on REST calls
    pub verifier: Arc<dyn IdentityVerifier>,
    pub hub_config: HubConfig,
}

impl AppState {
    /// Wire the hub and router around a message store.
    pub fn new(
        store: Arc<dyn MessageStore>,
        verifier: Arc<dyn IdentityVerifier>,
        hub_config: HubConfig,
    ) -> Self {
        let hub = Arc::new(Hub::new(Arc::clone(&store)));
        let throttle = ThrottleGuard::new(hub_config.throttle_limit, hub_config.throttle_window());
        let router = Arc::new(EventRouter::new(
            Arc::clone(&hub),
            store,
            throttle,
            ThrottlePolicy::from_flag(hub_config.throttle_all_events),
        ));

        Self {
            hub,
            router,
            verifier,
            hub_config,
        }
    }
}
