//! Shared handler state.

use std::sync::Arc;

use maren_pipeline::protocol::ProtocolManager;
use maren_pipeline::recovery::RecoveryAgent;
use maren_pipeline::Resources;

use crate::service::ReviewService;

/// State shared by every handler.
#[derive(Clone)]
pub struct ApiState {
    /// Shared pipeline resources.
    pub resources: Resources,
    /// Protocol manager.
    pub protocol: Arc<ProtocolManager>,
    /// Recovery agent.
    pub recovery: Arc<RecoveryAgent>,
    /// Review-queue service.
    pub review: Arc<ReviewService>,
}

impl ApiState {
    /// Assemble the API state from pipeline components.
    #[must_use]
    pub fn new(
        resources: Resources,
        protocol: Arc<ProtocolManager>,
        recovery: Arc<RecoveryAgent>,
    ) -> Self {
        let review = Arc::new(ReviewService::new(resources.clone()));
        Self {
            resources,
            protocol,
            recovery,
            review,
        }
    }
}
