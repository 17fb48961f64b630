//! HTTP surface: the subscription endpoint plus a health probe.

pub mod error;
mod placeholder;
pub mod sub;

use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use sqlx::PgPool;

use crate::collector::Collector;
use crate::enforcement::Enforcer;

#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub collector: Arc<Collector>,
    pub enforcer: Arc<Enforcer>,
    pub admin_ids: Vec<i64>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/sub/{username}/{app_key}/links", get(sub::unified_links))
        .route("/healthz", get(|| async { "ok" }))
        .with_state(state)
}
