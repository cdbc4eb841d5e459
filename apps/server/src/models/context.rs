//! Explicit per-operation context (who, which request, when)

use chrono::{DateTime, Utc};

use super::ids::ActorId;

#[derive(Debug, Clone)]
pub struct OperationContext {
    pub actor: ActorId,
    pub request_id: Option<String>,
    /// Single timestamp used for every write of the unit of work
    pub now: DateTime<Utc>,
}

impl OperationContext {
    pub fn new(actor: impl Into<ActorId>) -> Self {
        Self {
            actor: actor.into(),
            request_id: None,
            now: Utc::now(),
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    /// Context for work started by the service itself rather than a user
    pub fn system() -> Self {
        Self::new("system")
    }
}
