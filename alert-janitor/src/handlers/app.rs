use std::future::ready;

use axum::{routing, Router};
use health::HealthRegistry;

pub fn app(liveness: HealthRegistry) -> Router {
    Router::new()
        .route("/", routing::get(index))
        .route("/_readiness", routing::get(index))
        .route("/_liveness", routing::get(move || ready(liveness.get_status())))
}

pub async fn index() -> &'static str {
    "court-alert janitor"
}
