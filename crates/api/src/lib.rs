//! HTTP API server for the onboarding reconciler.
//!
//! Receives signed provider webhooks, serves the checkout-session and
//! signup-link endpoints, and exposes health and Prometheus metrics, with
//! structured logging (tracing) throughout.

pub mod config;
pub mod error;
pub mod routes;
pub mod signature;
pub mod state;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post, put};
use metrics_exporter_prometheus::PrometheusHandle;
use session_store::Store;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub use config::Config;
pub use state::{AppState, Collaborators};

/// Creates the Axum application router with all routes and shared state.
pub fn create_app<S: Store + Clone + 'static>(
    state: Arc<AppState<S>>,
    metrics_handle: PrometheusHandle,
) -> Router {
    let metrics_router = Router::new()
        .route("/metrics", get(routes::metrics::get))
        .with_state(metrics_handle);

    Router::new()
        .route("/health", get(routes::health::check))
        .route("/webhooks/stripe", post(routes::webhooks::stripe::<S>))
        .route("/webhooks/docusign", post(routes::webhooks::docusign::<S>))
        .route(
            "/webhooks/zoho-billing",
            post(routes::webhooks::zoho_billing::<S>),
        )
        .route("/users", post(routes::users::create::<S>))
        .route(
            "/sessions",
            post(routes::sessions::create::<S>).get(routes::sessions::list::<S>),
        )
        .route("/sessions/{id}", get(routes::sessions::get::<S>))
        .route(
            "/sessions/{id}/company-info",
            put(routes::sessions::upsert_company_info::<S>),
        )
        .route(
            "/sessions/{id}/agreement",
            post(routes::sessions::initiate_signing::<S>),
        )
        .route(
            "/sessions/{id}/provision",
            post(routes::sessions::provision::<S>),
        )
        .route(
            "/sessions/{id}/refresh-payment",
            post(routes::sessions::refresh_payment::<S>),
        )
        .route("/signup-links", post(routes::signup_links::issue::<S>))
        .route(
            "/crm-data/{contact_id}/{login_code}",
            get(routes::signup_links::crm_data::<S>),
        )
        .with_state(state)
        .merge(metrics_router)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}

/// Builds the application state over `store` with in-memory collaborators.
pub fn create_default_state<S: Store + Clone + 'static>(
    store: S,
    config: &Config,
) -> Arc<AppState<S>> {
    Arc::new(AppState::new(store, Collaborators::default(), config))
}
