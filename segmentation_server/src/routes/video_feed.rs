use super::SessionQuery;
use crate::{
    server::SharedState,
    stream::{SegmentationStream, VideoStreamError},
};
use axum::{
    body::Body,
    extract::{Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};
use std::convert::Infallible;
use tokio_stream::StreamExt;
use tracing::instrument;

const CONTENT_TYPE: &str = "multipart/x-mixed-replace; boundary=frame";

#[instrument(skip(state))]
pub async fn video_feed(
    State(state): State<SharedState>,
    Query(query): Query<SessionQuery>,
) -> Result<Response, VideoStreamError> {
    state.metrics.record_request("/video_feed");
    let session_id = query.session_id.unwrap_or_default();
    stream_response(&state, &session_id)
}

/// The response has already started when frames fail, so errors end the
/// stream instead of producing an error part.
pub(super) fn stream_response(
    state: &SharedState,
    session_id: &str,
) -> Result<Response, VideoStreamError> {
    let stream = SegmentationStream::from_state(session_id, state)
        .generate_stream()
        .map_while(|part| match part {
            Ok(bytes) => Some(Ok::<_, Infallible>(bytes)),
            Err(e) => {
                tracing::warn!("Ending video stream: {}", e);
                None
            }
        });

    let body = Body::from_stream(stream);

    let response = Response::builder()
        .header(header::CONTENT_TYPE, CONTENT_TYPE)
        .body(body)
        .map_err(|e| VideoStreamError::HttpBuilderError(e.to_string()))?;

    Ok(response)
}

impl IntoResponse for VideoStreamError {
    fn into_response(self) -> Response {
        tracing::error!("Video feed failed: {}", self);
        (StatusCode::INTERNAL_SERVER_ERROR, self.to_string()).into_response()
    }
}
