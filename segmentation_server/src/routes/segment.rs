use super::{video_feed::stream_response, ErrorBody, SessionQuery};
use crate::{
    cv_utils::{decode_image, denormalize, mask_to_png, normalize, CvUtilsError},
    lifecycle::{LifecycleError, Registration, Upload},
    server::SharedState,
    stream::VideoStreamError,
};
use axum::{
    extract::{
        multipart::{MultipartError, MultipartRejection},
        Multipart, Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::Bytes;
use segmentation_model::{ModelError, ModelService};
use serde::Serialize;
use std::time::Instant;
use thiserror::Error;
use tokio::task::JoinError;
use tracing::instrument;

const ROUTE_LABEL: &str = "/api/segment";

#[derive(Error, Debug)]
pub enum SegmentError {
    #[error("{0}")]
    BadUpload(&'static str),
    #[error("Invalid multipart body: {0}")]
    Multipart(#[from] MultipartError),
    #[error("Session storage failed: {0}")]
    Storage(LifecycleError),
    #[error("Segmentation failed: {0}")]
    Model(#[from] ModelError),
    #[error("Image conversion failed: {0}")]
    ImageConversion(#[from] CvUtilsError),
    #[error("Segmentation worker failed: {0}")]
    Task(#[from] JoinError),
    #[error("Video stream failed: {0}")]
    Stream(#[from] VideoStreamError),
}

impl From<LifecycleError> for SegmentError {
    fn from(err: LifecycleError) -> Self {
        match err {
            LifecycleError::InvalidSessionId(_) => SegmentError::BadUpload("Invalid session id"),
            LifecycleError::InvalidFileName(_) => SegmentError::BadUpload("Invalid file name"),
            LifecycleError::UnsupportedMediaKind(_) => {
                SegmentError::BadUpload("Unsupported file type")
            }
            other => SegmentError::Storage(other),
        }
    }
}

impl IntoResponse for SegmentError {
    fn into_response(self) -> Response {
        let status = match self {
            SegmentError::BadUpload(_) | SegmentError::Multipart(_) => StatusCode::BAD_REQUEST,
            _ => {
                tracing::error!("Segmentation request failed: {}", self);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let body = ErrorBody {
            error: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

#[derive(Serialize)]
pub struct MaskResponse {
    mask: String,
}

#[instrument(skip(state, multipart))]
pub async fn segment(
    State(state): State<SharedState>,
    Query(query): Query<SessionQuery>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Response, SegmentError> {
    state.metrics.record_request(ROUTE_LABEL);

    let session_id = query
        .session_id
        .ok_or(SegmentError::BadUpload("Missing session_id"))?;
    let mut multipart = multipart.map_err(|e| {
        tracing::debug!("Request is not a multipart upload: {}", e);
        SegmentError::BadUpload("No file part")
    })?;
    let upload = read_upload(&mut multipart).await?;

    let registration = state.lifecycle.register(&session_id, upload).await?;
    state
        .metrics
        .record_registered_sessions(state.lifecycle.registry().len());

    match registration {
        Registration::Image(data) => {
            tracing::info!("Segmenting single image for session {}", session_id);
            let model = state.model.clone();
            let started = Instant::now();
            let mask = tokio::task::spawn_blocking(move || segment_image(model.as_ref(), &data))
                .await??;
            state
                .metrics
                .record_segmentation_duration(started.elapsed().as_millis() as u64, ROUTE_LABEL);

            Ok(Json(MaskResponse { mask }).into_response())
        }
        Registration::Video(_) => Ok(stream_response(&state, &session_id)?),
    }
}

async fn read_upload(multipart: &mut Multipart) -> Result<Upload, SegmentError> {
    while let Some(field) = multipart.next_field().await? {
        if field.name() != Some("file") {
            continue;
        }

        let file_name = field.file_name().unwrap_or_default().to_string();
        let content_type = field.content_type().unwrap_or_default().to_string();
        let data = field.bytes().await?;
        if file_name.is_empty() || data.is_empty() {
            return Err(SegmentError::BadUpload("No selected file"));
        }

        return Ok(Upload {
            file_name,
            content_type,
            data,
        });
    }

    Err(SegmentError::BadUpload("No file part"))
}

/// Decode, segment and PNG-encode a single image, returned as a data URL.
fn segment_image(model: &dyn ModelService, data: &Bytes) -> Result<String, SegmentError> {
    let frame = decode_image(data).map_err(|e| {
        tracing::debug!("Rejecting upload: {}", e);
        SegmentError::BadUpload("Invalid image")
    })?;

    let segmentation = model.segment(normalize(frame.view()).view())?;
    let png = mask_to_png(denormalize(segmentation.mask.view()).view())?;

    Ok(format!("data:image/png;base64,{}", STANDARD.encode(png)))
}
