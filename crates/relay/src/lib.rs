//! Collaborative editing relay: sessions, shared documents and the `/ws`
//! multiplexing protocol.

pub mod auth;
pub mod config;
pub mod error;
pub mod session;
pub mod sync;
pub mod ws;

use std::{sync::Arc, time::Duration, time::Instant};

use anyhow::Context;
use axum::{
    body::Body,
    extract::DefaultBodyLimit,
    http::{Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use tracing::{error, info};

use crate::auth::{AuthGate, Scope};
use crate::config::RelayConfig;
use crate::error::{attach_request_id_header, request_id_from_headers_or_generate, with_request_id_scope};
use crate::session::{OpenSession, SessionStore};
use crate::sync::{FilePersistence, PersistenceProvider, Registry};
use crate::ws::Dispatcher;

const MAX_REQUEST_BODY_BYTES: usize = 64 * 1024;

/// Shared handles behind every route.
#[derive(Clone)]
pub struct RelayState {
    pub sessions: Arc<SessionStore>,
    pub registry: Arc<Registry>,
    pub dispatcher: Dispatcher,
    pub auth: Arc<dyn AuthGate>,
    pub api_key: Arc<str>,
    pub session_ttl: Duration,
    pub max_frame_bytes: usize,
}

impl RelayState {
    pub fn from_parts(
        sessions: Arc<SessionStore>,
        registry: Arc<Registry>,
        auth: Arc<dyn AuthGate>,
        api_key: &str,
        session_ttl: Duration,
        max_frame_bytes: usize,
    ) -> Self {
        Self {
            dispatcher: Dispatcher::new(Arc::clone(&registry), session_ttl),
            sessions,
            registry,
            auth,
            api_key: Arc::from(api_key),
            session_ttl,
            max_frame_bytes,
        }
    }

    /// Builds the relay described by `config`, including sessions it
    /// provisions up front.
    pub async fn from_config(config: &RelayConfig) -> anyhow::Result<Self> {
        let persistence = match &config.persistence_dir {
            Some(dir) => {
                let store = FilePersistence::new(dir).context("failed to initialize persistence")?;
                Some(Arc::new(store) as Arc<dyn PersistenceProvider>)
            }
            None => None,
        };
        let registry = Arc::new(Registry::new(persistence, config.gc_enabled));
        let auth: Arc<dyn AuthGate> = Arc::new(config.auth_gate());
        let state = Self::from_parts(
            Arc::new(SessionStore::new(config.heartbeat)),
            registry,
            Arc::clone(&auth),
            &config.api_key,
            config.session_ttl,
            config.max_frame_bytes,
        );

        for provisioned in &config.sessions {
            let read_only = !auth.is_authorized(Scope::Writers, provisioned.username.as_deref());
            let session = state
                .sessions
                .open_session(OpenSession {
                    id: Some(provisioned.id),
                    room: provisioned.room.clone(),
                    key: config.api_key.clone(),
                    username: provisioned.username.clone(),
                    read_only,
                    ttl: config.session_ttl,
                })
                .await;
            info!(session_id = %session.id(), room = session.room(), read_only, "session provisioned");
        }
        Ok(state)
    }
}

pub fn build_router(state: RelayState) -> Router {
    apply_middleware(Router::new().route("/healthz", get(healthz)).merge(ws::router(state)))
}

fn apply_middleware(router: Router) -> Router {
    router
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BODY_BYTES))
        .layer(middleware::from_fn(request_context_middleware))
        .layer(middleware::from_fn(panic_handler))
}

async fn healthz() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

async fn panic_handler(request: Request<Body>, next: Next) -> Response {
    match tokio::spawn(async move { next.run(request).await }).await {
        Ok(response) => response,
        Err(join_error) => {
            error!(?join_error, "request handling panicked");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn request_context_middleware(request: Request<Body>, next: Next) -> Response {
    let request_id = request_id_from_headers_or_generate(request.headers());
    let method = request.method().clone();
    let path = request.uri().path().to_owned();
    let started_at = Instant::now();

    let mut response = with_request_id_scope(request_id.clone(), next.run(request)).await;
    attach_request_id_header(&mut response, &request_id);

    info!(
        request_id = %request_id,
        method = %method,
        path = %path,
        status = response.status().as_u16(),
        latency_ms = started_at.elapsed().as_millis() as u64,
        "request completed"
    );

    response
}
