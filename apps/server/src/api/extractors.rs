//! Custom Axum extractors for occupancy requests.

use axum::{
    async_trait,
    extract::{
        rejection::{JsonRejection, PathRejection},
        FromRequest, FromRequestParts, Path, Request,
    },
    http::request::Parts,
    Json,
};
use serde::de::DeserializeOwned;
use validator::Validate;

use crate::{models::OperationContext, request_context::RequestContext, Error};

/// Header carrying the authenticated actor, set by the upstream authentication proxy.
pub const ACTOR_HEADER: &str = "x-actor-id";

/// Operation context of a mutating request.
///
/// Built from the `X-Actor-Id` header and the request id assigned by the request-id middleware.
/// A missing or blank actor rejects the request before any service is called.
pub struct Actor(pub OperationContext);

#[async_trait]
impl<S> FromRequestParts<S> for Actor
where
    S: Send + Sync,
{
    type Rejection = Error;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let actor = parts
            .headers
            .get(ACTOR_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| {
                Error::Validation(format!("missing {ACTOR_HEADER} header on mutating request"))
            })?;

        let mut ctx = OperationContext::new(actor);
        if let Some(request) = parts.extensions.get::<RequestContext>() {
            ctx = ctx.with_request_id(request.request_id.clone());
        }
        Ok(Actor(ctx))
    }
}

/// JSON body that has passed its `validator` rules.
///
/// Malformed JSON and rule violations both surface as `VALIDATION_FAILED`.
pub struct ValidatedJson<T>(pub T);

#[async_trait]
impl<S, T> FromRequest<S> for ValidatedJson<T>
where
    S: Send + Sync,
    T: DeserializeOwned + Validate,
{
    type Rejection = Error;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state)
            .await
            .map_err(|e: JsonRejection| Error::Validation(e.body_text()))?;
        value.validate()?;
        Ok(ValidatedJson(value))
    }
}

/// Path parameters parsed into typed ids.
///
/// An id that does not parse surfaces as `VALIDATION_FAILED` instead of axum's plain-text 400.
pub struct ValidatedPath<T>(pub T);

#[async_trait]
impl<S, T> FromRequestParts<S> for ValidatedPath<T>
where
    S: Send + Sync,
    T: DeserializeOwned + Send,
{
    type Rejection = Error;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let Path(value) = Path::<T>::from_request_parts(parts, state)
            .await
            .map_err(|e: PathRejection| Error::Validation(e.body_text()))?;
        Ok(ValidatedPath(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request as HttpRequest;

    async fn actor_from(builder: axum::http::request::Builder) -> Result<Actor, Error> {
        let (mut parts, _) = builder.body(()).unwrap().into_parts();
        Actor::from_request_parts(&mut parts, &()).await
    }

    #[tokio::test]
    async fn actor_header_builds_context() {
        let mut builder = HttpRequest::builder().header(ACTOR_HEADER, "nurse-17");
        builder = builder.extension(RequestContext {
            request_id: "req-1".to_string(),
        });
        let Actor(ctx) = actor_from(builder).await.unwrap();
        assert_eq!(ctx.actor.as_str(), "nurse-17");
        assert_eq!(ctx.request_id.as_deref(), Some("req-1"));
    }

    #[tokio::test]
    async fn blank_actor_is_rejected() {
        let err = actor_from(HttpRequest::builder().header(ACTOR_HEADER, "  "))
            .await
            .err()
            .unwrap();
        assert_eq!(err.code(), "VALIDATION_FAILED");

        assert!(actor_from(HttpRequest::builder()).await.is_err());
    }
}
