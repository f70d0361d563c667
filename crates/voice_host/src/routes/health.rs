use crate::handlers::health;
use axum::routing::get;
use axum::Router;

pub fn health_routes() -> Router {
	Router::new().route("/healthz", get(health::healthz))
}
