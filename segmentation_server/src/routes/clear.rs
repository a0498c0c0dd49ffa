use super::{ErrorBody, MessageBody, SessionQuery};
use crate::{
    lifecycle::{ClearOutcome, LifecycleError},
    server::SharedState,
};
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use thiserror::Error;
use tracing::instrument;

#[derive(Error, Debug)]
pub enum ClearError {
    #[error("Missing session_id")]
    MissingSessionId,
    #[error("Failed to clear session: {0}")]
    Lifecycle(#[from] LifecycleError),
}

impl IntoResponse for ClearError {
    fn into_response(self) -> Response {
        let status = match self {
            ClearError::MissingSessionId => StatusCode::BAD_REQUEST,
            ClearError::Lifecycle(_) => {
                tracing::error!("{}", self);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let body = ErrorBody {
            error: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

#[instrument(skip(state))]
pub async fn clear(
    State(state): State<SharedState>,
    Query(query): Query<SessionQuery>,
) -> Result<Json<MessageBody>, ClearError> {
    state.metrics.record_request("/api/clear");
    let session_id = query.session_id.ok_or(ClearError::MissingSessionId)?;

    match state.lifecycle.clear(&session_id).await {
        Ok(ClearOutcome::Cleared) => {
            tracing::info!("Cleared session {}", session_id);
        }
        Ok(ClearOutcome::CleanupConflict(dir)) => {
            tracing::warn!(
                "Cleared session {} but {:?} still holds other files",
                session_id,
                dir
            );
        }
        Err(LifecycleError::SessionNotFound(_)) => {
            tracing::warn!("Clear requested for unknown session {}", session_id);
        }
        Err(e) => return Err(e.into()),
    }

    Ok(Json(MessageBody {
        message: "Temp directory cleared".into(),
    }))
}
