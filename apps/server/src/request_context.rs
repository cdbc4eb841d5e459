//! Per-request context injected by middleware.

/// Server-assigned identifiers of the request being handled.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: String,
}
