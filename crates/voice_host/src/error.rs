use crate::registry::RegistryError;
use crate::runner::RunnerError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum VoiceHostError {
	#[error("文件不存在")]
	NotFound,

	#[error("{0}")]
	Validation(String),

	#[error("{0}")]
	Conflict(String),

	#[error("{0}")]
	Registry(#[from] RegistryError),

	#[error("{0}")]
	Runner(#[from] RunnerError),

	#[error("生成会议纪要失败: {0}")]
	Summary(String),

	#[error("io error: {0}")]
	Io(#[from] std::io::Error),

	#[error("serialization failed: {0}")]
	Serialization(#[from] serde_json::Error),

	#[error("an internal server error occurred")]
	Anyhow(#[from] anyhow::Error),
}

impl VoiceHostError {
	pub fn validation(message: impl Into<String>) -> Self {
		Self::Validation(message.into())
	}

	pub fn conflict(message: impl Into<String>) -> Self {
		Self::Conflict(message.into())
	}

	fn status_code(&self) -> StatusCode {
		match self {
			Self::NotFound => StatusCode::NOT_FOUND,
			Self::Validation(_) => StatusCode::BAD_REQUEST,
			Self::Conflict(_) => StatusCode::BAD_REQUEST,
			Self::Registry(inner) => match inner {
				RegistryError::NotFound(_) => StatusCode::NOT_FOUND,
				RegistryError::Busy(_) => StatusCode::BAD_REQUEST,
				RegistryError::DuplicateId(_) => StatusCode::CONFLICT,
				RegistryError::ProgressRegression { .. } | RegistryError::InvalidTransition { .. } => StatusCode::UNPROCESSABLE_ENTITY,
			},
			Self::Runner(_) => StatusCode::INTERNAL_SERVER_ERROR,
			Self::Summary(_) => StatusCode::INTERNAL_SERVER_ERROR,
			Self::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
			Self::Serialization(_) => StatusCode::INTERNAL_SERVER_ERROR,
			Self::Anyhow(_) => StatusCode::INTERNAL_SERVER_ERROR,
		}
	}
}

impl IntoResponse for VoiceHostError {
	fn into_response(self) -> Response {
		let status = self.status_code();
		if status.is_server_error() {
			tracing::error!("request failed: {self:?}");
		}

		(
			status,
			Json(json!({
				"success": false,
				"error": self.to_string(),
			})),
		)
			.into_response()
	}
}
