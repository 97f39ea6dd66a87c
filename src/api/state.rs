//! API server state.

use std::sync::Arc;

use crate::service::LabService;

/// Shared API server state.
pub struct ApiState {
    service: Arc<LabService>,
}

impl ApiState {
    /// Create a new API state.
    pub fn new(service: Arc<LabService>) -> Self {
        Self { service }
    }

    /// The lab service requests run against.
    pub fn service(&self) -> &LabService {
        &self.service
    }
}
