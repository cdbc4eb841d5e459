pub mod assertions;
pub mod fixtures;

use anyhow::Context as _;
use axum::{
    body::{Body, Bytes},
    http::{HeaderMap, Method, Request, StatusCode},
    Router,
};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tower::ServiceExt as _;
use wardline::{
    api::create_router,
    db::MemoryOccupancyStore,
    services::{OpenPatientDirectory, PatientDirectory},
    AppState, Config,
};

pub use assertions::*;
pub use fixtures::*;

pub const ACTOR: &str = "nurse-station-4";

/// Router and services over a fresh in-memory store.
pub struct TestApp {
    pub router: Router,
    pub state: AppState,
}

impl TestApp {
    pub fn new() -> Self {
        Self::new_with_config(|_| {})
    }

    pub fn new_with_config(configure: impl FnOnce(&mut Config)) -> Self {
        Self::with_directory(configure, Arc::new(OpenPatientDirectory))
    }

    pub fn with_directory(
        configure: impl FnOnce(&mut Config),
        patients: Arc<dyn PatientDirectory>,
    ) -> Self {
        let mut config = Config::default();
        configure(&mut config);
        let state = AppState::with_store(config, Arc::new(MemoryOccupancyStore::new()), patients);
        Self {
            router: create_router(state.clone()),
            state,
        }
    }

    pub async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> anyhow::Result<(StatusCode, HeaderMap, Value)> {
        self.request_as(Some(ACTOR), method, path, body).await
    }

    pub async fn request_as(
        &self,
        actor: Option<&str>,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> anyhow::Result<(StatusCode, HeaderMap, Value)> {
        let mut builder = Request::builder()
            .method(method)
            .uri(path)
            .header("content-type", "application/json");
        if let Some(actor) = actor {
            builder = builder.header("x-actor-id", actor);
        }
        let request = builder
            .body(match body {
                Some(value) => Body::from(serde_json::to_vec(&value)?),
                None => Body::empty(),
            })
            .context("build request")?;

        let response = self
            .router
            .clone()
            .oneshot(request)
            .await
            .context("dispatch request")?;

        let status = response.status();
        let headers = response.headers().clone();
        let bytes: Bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .context("read response body")?;
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::String(
                String::from_utf8_lossy(&bytes).into_owned(),
            ))
        };

        Ok((status, headers, json))
    }

    pub async fn get(&self, path: &str) -> anyhow::Result<Value> {
        let (status, _, body) = self.request(Method::GET, path, None).await?;
        assert_status(status, StatusCode::OK, path);
        Ok(body)
    }

    pub async fn post(
        &self,
        path: &str,
        body: &impl Serialize,
    ) -> anyhow::Result<(StatusCode, Value)> {
        let (status, _, body) = self
            .request(Method::POST, path, Some(serde_json::to_value(body)?))
            .await?;
        Ok((status, body))
    }
}
