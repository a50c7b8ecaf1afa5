use std::sync::Arc;

use axum::{extract::State, routing::get, Json, Router};

use crate::daemon::{Daemon, DaemonSnapshot};

#[derive(Clone)]
pub struct ApiState {
    pub daemon: Arc<Daemon>,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(get_health))
        .with_state(state)
}

/// Unit states plus the health registry, deep-copied at request time.
async fn get_health(State(state): State<ApiState>) -> Json<DaemonSnapshot> {
    Json(state.daemon.snapshot().await)
}
