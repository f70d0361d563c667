use crate::util::now_display;
use axum::Json;
use serde_json::{json, Value};
use tracing::instrument;

/// Liveness probe. The process being up is healthy: models and external
/// model endpoints load lazily, so their state never downgrades the answer.
#[instrument(name = "healthz")]
pub async fn healthz() -> Json<Value> {
	Json(json!({
		"status": "healthy",
		"service": "voice_host",
		"timestamp": now_display(),
		"checks": {
			"models": { "status": "lazy" },
		},
	}))
}
