mod clear;
mod health;
mod metrics;
mod segment;
mod video_feed;

use crate::server::SharedState;
use axum::{
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};

pub use clear::clear;
pub use health::healthcheck;
pub use metrics::metrics_handler;
pub use segment::segment;
pub use video_feed::video_feed;

#[derive(Debug, Deserialize)]
pub struct SessionQuery {
    pub session_id: Option<String>,
}

#[derive(Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

#[derive(Serialize, Deserialize)]
pub struct MessageBody {
    pub message: String,
}

pub fn api_routes() -> Router<SharedState> {
    Router::new()
        .route("/api/segment", post(segment))
        .route("/api/clear", post(clear))
        .route("/video_feed", get(video_feed))
        .route("/health", get(healthcheck))
        .route("/metrics", get(metrics_handler))
}
