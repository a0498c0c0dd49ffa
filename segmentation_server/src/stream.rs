use crate::{
    cv_utils::{
        compose_side_by_side, denormalize, normalize, to_jpg, CvUtilsError, FrameSource,
        FrameSourceOpener,
    },
    server::SharedState,
    session::SessionRegistry,
    telemetry::Metrics,
};
use bytes::Bytes;
use futures::stream;
use ndarray::Array3;
use segmentation_model::{ModelError, ModelService, Segmentation};
use std::{path::PathBuf, sync::Arc, time::Instant};
use thiserror::Error;
use tokio::task::{spawn_blocking, JoinError};
use tracing::instrument;

const FRAME_BOUNDARY: &str = "--frame";
const ROUTE_LABEL: &str = "video_stream";

#[derive(Error, Debug)]
pub enum VideoStreamError {
    #[error("Failed to open video source: {0}")]
    SourceOpen(CvUtilsError),
    #[error("Failed to decode frame: {0}")]
    Decode(CvUtilsError),
    #[error("Segmentation failed: {0}")]
    Model(#[from] ModelError),
    #[error("Failed to compose frame: {0}")]
    Compose(CvUtilsError),
    #[error("Failed to encode frame: {0}")]
    Encode(CvUtilsError),
    #[error("Frame worker failed: {0}")]
    Task(#[from] JoinError),
    #[error("Http builder error: {0}")]
    HttpBuilderError(String),
}

/// Streams one session's video as multipart JPEG parts.
///
/// Every part is produced by one decode, inference and encode step. The
/// session's liveness flag is read before each step, so a clear request
/// stops the stream after at most the frame already in flight.
#[derive(Clone)]
pub struct SegmentationStream {
    session_id: String,
    registry: Arc<SessionRegistry>,
    opener: Arc<dyn FrameSourceOpener>,
    model: Arc<dyn ModelService>,
    metrics: Arc<Metrics>,
}

enum StreamState {
    Pending(SegmentationStream),
    Streaming(SegmentationStream, Box<dyn FrameSource>),
    Finished,
}

type Step = Option<(Result<Bytes, VideoStreamError>, StreamState)>;

impl SegmentationStream {
    pub fn new(
        session_id: impl Into<String>,
        registry: Arc<SessionRegistry>,
        opener: Arc<dyn FrameSourceOpener>,
        model: Arc<dyn ModelService>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            registry,
            opener,
            model,
            metrics,
        }
    }

    pub fn from_state(session_id: impl Into<String>, state: &SharedState) -> Self {
        Self::new(
            session_id,
            state.lifecycle.registry().clone(),
            state.frame_source.clone(),
            state.model.clone(),
            state.metrics.clone(),
        )
    }

    /// Lazy, and not restartable: each call opens the source from the start.
    #[instrument(skip(self), fields(session_id = %self.session_id))]
    pub fn generate_stream(self) -> impl futures::Stream<Item = Result<Bytes, VideoStreamError>> {
        stream::unfold(StreamState::Pending(self), |state| async move {
            match state {
                StreamState::Pending(pipeline) => pipeline.start().await,
                StreamState::Streaming(pipeline, source) => pipeline.advance(source).await,
                StreamState::Finished => None,
            }
        })
    }

    async fn start(self) -> Step {
        let source_path = match self.registry.get(&self.session_id) {
            Ok(session) if session.active => session.source_path,
            _ => {
                tracing::info!("Session {} is not streamable", self.session_id);
                return None;
            }
        };
        let Some(path) = source_path else {
            return None;
        };

        match self.open_source(path).await {
            Ok(source) => self.advance(source).await,
            Err(e) => {
                tracing::warn!("Could not open source for {}: {}", self.session_id, e);
                Some((Err(e), StreamState::Finished))
            }
        }
    }

    async fn open_source(&self, path: PathBuf) -> Result<Box<dyn FrameSource>, VideoStreamError> {
        let opener = self.opener.clone();
        spawn_blocking(move || opener.open(&path))
            .await?
            .map_err(VideoStreamError::SourceOpen)
    }

    async fn advance(self, mut source: Box<dyn FrameSource>) -> Step {
        if !self.registry.is_active(&self.session_id) {
            tracing::info!("Session {} cleared, stopping stream", self.session_id);
            return None;
        }

        let model = self.model.clone();
        let started = Instant::now();
        let step = spawn_blocking(move || {
            let rendered = match source.next_frame() {
                Ok(Some(frame)) => render_frame(model.as_ref(), frame).map(Some),
                Ok(None) => Ok(None),
                Err(e) => Err(VideoStreamError::Decode(e)),
            };
            (source, rendered)
        })
        .await;

        match step {
            Ok((source, Ok(Some(jpg)))) => {
                self.metrics
                    .record_segmentation_duration(started.elapsed().as_millis() as u64, ROUTE_LABEL);
                self.metrics.record_frame_streamed();
                Some((Ok(multipart_part(&jpg)), StreamState::Streaming(self, source)))
            }
            Ok((_, Ok(None))) => {
                tracing::info!("Source for session {} exhausted", self.session_id);
                None
            }
            Ok((_, Err(e))) => Some((Err(e), StreamState::Finished)),
            Err(e) => Some((Err(VideoStreamError::from(e)), StreamState::Finished)),
        }
    }
}

fn render_frame(model: &dyn ModelService, frame: Array3<u8>) -> Result<Vec<u8>, VideoStreamError> {
    let Segmentation { mask, input } = model.segment(normalize(frame.view()).view())?;

    let composed = compose_side_by_side(denormalize(input.view()).view(), denormalize(mask.view()).view())
        .map_err(VideoStreamError::Compose)?;

    to_jpg(&composed).map_err(VideoStreamError::Encode)
}

fn multipart_part(jpg: &[u8]) -> Bytes {
    let part_header = format!("{}\r\nContent-Type: image/jpeg\r\n\r\n", FRAME_BOUNDARY);
    let mut body = part_header.into_bytes();
    body.extend_from_slice(jpg);
    body.extend_from_slice(b"\r\n");
    Bytes::from(body)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::{
        lifecycle::{ClearOutcome, SessionLifecycle, Upload},
        session::Session,
    };
    use futures::StreamExt;
    use ndarray::ArrayView3;
    use std::{
        collections::VecDeque,
        path::Path,
        sync::atomic::{AtomicUsize, Ordering},
    };

    pub(crate) const PART_HEADER: &[u8] = b"--frame\r\nContent-Type: image/jpeg\r\n\r\n";

    pub(crate) struct VecSource {
        frames: VecDeque<Array3<u8>>,
    }

    impl FrameSource for VecSource {
        fn next_frame(&mut self) -> Result<Option<Array3<u8>>, CvUtilsError> {
            Ok(self.frames.pop_front())
        }
    }

    /// Opens every path as a clip of `frames` solid 16x12 frames.
    pub(crate) struct FakeOpener {
        pub frames: usize,
        pub opened: AtomicUsize,
    }

    impl FakeOpener {
        pub(crate) fn new(frames: usize) -> Self {
            Self {
                frames,
                opened: AtomicUsize::new(0),
            }
        }
    }

    impl FrameSourceOpener for FakeOpener {
        fn open(&self, _path: &Path) -> Result<Box<dyn FrameSource>, CvUtilsError> {
            self.opened.fetch_add(1, Ordering::SeqCst);
            let frames = (0..self.frames)
                .map(|i| Array3::from_elem((12, 16, 3), (i * 20) as u8))
                .collect();
            Ok(Box::new(VecSource { frames }))
        }
    }

    struct BrokenOpener;

    impl FrameSourceOpener for BrokenOpener {
        fn open(&self, path: &Path) -> Result<Box<dyn FrameSource>, CvUtilsError> {
            Err(CvUtilsError::SourceUnavailable(format!("{:?}", path)))
        }
    }

    /// Echoes the frame at half size with a grey single channel mask.
    #[derive(Default)]
    pub(crate) struct MockModelService {
        pub calls: AtomicUsize,
    }

    impl ModelService for MockModelService {
        fn segment(&self, image: ArrayView3<'_, f32>) -> Result<Segmentation, ModelError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let (height, width, _) = image.dim();
            let input = Array3::from_elem((height / 2, width / 2, 3), 0.25);
            let mask = Array3::from_elem((height / 2, width / 2, 1), 1.0);
            Ok(Segmentation { mask, input })
        }
    }

    /// Clears the session while the given frame is being segmented.
    struct ClearingModel {
        registry: Arc<SessionRegistry>,
        session_id: String,
        clear_on_call: usize,
        calls: AtomicUsize,
    }

    impl ModelService for ClearingModel {
        fn segment(&self, image: ArrayView3<'_, f32>) -> Result<Segmentation, ModelError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call == self.clear_on_call {
                self.registry.set_active(&self.session_id, false).unwrap();
            }
            MockModelService::default().segment(image)
        }
    }

    /// Yields `good` frames, then fails the way a deleted file does mid-read.
    pub(crate) struct TruncatedOpener {
        pub good: usize,
    }

    struct TruncatedSource {
        remaining: usize,
    }

    impl FrameSource for TruncatedSource {
        fn next_frame(&mut self) -> Result<Option<Array3<u8>>, CvUtilsError> {
            if self.remaining == 0 {
                return Err(CvUtilsError::InvalidFrame("truncated container".into()));
            }
            self.remaining -= 1;
            Ok(Some(Array3::from_elem((12, 16, 3), 128)))
        }
    }

    impl FrameSourceOpener for TruncatedOpener {
        fn open(&self, _path: &Path) -> Result<Box<dyn FrameSource>, CvUtilsError> {
            Ok(Box::new(TruncatedSource {
                remaining: self.good,
            }))
        }
    }

    struct FailingModel;

    impl ModelService for FailingModel {
        fn segment(&self, _image: ArrayView3<'_, f32>) -> Result<Segmentation, ModelError> {
            Err(ModelError::InvalidOutput("no mask".into()))
        }
    }

    fn registry_with_video(id: &str) -> Arc<SessionRegistry> {
        let registry = Arc::new(SessionRegistry::new());
        registry.put(id, Session::video(PathBuf::from("temp").join(id).join("x.mp4")));
        registry
    }

    fn pipeline(
        registry: Arc<SessionRegistry>,
        opener: Arc<dyn FrameSourceOpener>,
        model: Arc<dyn ModelService>,
    ) -> SegmentationStream {
        SegmentationStream::new("s1", registry, opener, model, Arc::new(Metrics::new().unwrap()))
    }

    async fn collect(pipeline: SegmentationStream) -> Vec<Result<Bytes, VideoStreamError>> {
        pipeline.generate_stream().collect().await
    }

    #[tokio::test]
    async fn test_streams_every_frame_then_ends() {
        let registry = registry_with_video("s1");
        let parts = collect(pipeline(
            registry,
            Arc::new(FakeOpener::new(3)),
            Arc::new(MockModelService::default()),
        ))
        .await;

        assert_eq!(parts.len(), 3);
        for part in parts {
            let part = part.unwrap();
            assert!(part.starts_with(PART_HEADER));
            assert!(part.ends_with(b"\r\n"));

            let jpg = &part[PART_HEADER.len()..part.len() - 2];
            let composed = image::load_from_memory(jpg).unwrap();
            // echoed input and mask are 8x6
            assert_eq!(composed.width(), 8 + 50 + 8);
            assert_eq!(composed.height(), 6);
        }
    }

    #[tokio::test]
    async fn test_inactive_or_missing_session_is_empty() {
        let opener = Arc::new(FakeOpener::new(3));
        let model = Arc::new(MockModelService::default());

        let registry = registry_with_video("s1");
        registry.set_active("s1", false).unwrap();
        assert!(collect(pipeline(registry, opener.clone(), model.clone())).await.is_empty());

        let empty = Arc::new(SessionRegistry::new());
        assert!(collect(pipeline(empty, opener.clone(), model.clone())).await.is_empty());

        let image_only = Arc::new(SessionRegistry::new());
        image_only.put("s1", Session::image());
        assert!(collect(pipeline(image_only, opener.clone(), model)).await.is_empty());

        assert_eq!(opener.opened.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_deactivation_stops_before_next_frame() {
        let registry = registry_with_video("s1");
        let model = Arc::new(MockModelService::default());
        let mut stream = Box::pin(
            pipeline(registry.clone(), Arc::new(FakeOpener::new(10)), model.clone())
                .generate_stream(),
        );

        assert!(stream.next().await.unwrap().is_ok());
        assert!(stream.next().await.unwrap().is_ok());
        registry.set_active("s1", false).unwrap();

        assert!(stream.next().await.is_none());
        assert_eq!(model.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_clear_during_frame_two_emits_at_most_frame_two() {
        let registry = registry_with_video("s1");
        let model = Arc::new(ClearingModel {
            registry: registry.clone(),
            session_id: "s1".into(),
            clear_on_call: 2,
            calls: AtomicUsize::new(0),
        });

        let parts = collect(pipeline(registry, Arc::new(FakeOpener::new(10)), model.clone())).await;

        assert_eq!(parts.len(), 2);
        assert!(parts.iter().all(Result::is_ok));
        assert_eq!(model.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_source_open_error_is_reported_once() {
        let registry = registry_with_video("s1");
        let parts = collect(pipeline(
            registry,
            Arc::new(BrokenOpener),
            Arc::new(MockModelService::default()),
        ))
        .await;

        assert_eq!(parts.len(), 1);
        assert!(matches!(parts[0], Err(VideoStreamError::SourceOpen(_))));
    }

    #[tokio::test]
    async fn test_model_error_ends_stream() {
        let registry = registry_with_video("s1");
        let parts = collect(pipeline(registry, Arc::new(FakeOpener::new(5)), Arc::new(FailingModel))).await;

        assert_eq!(parts.len(), 1);
        assert!(matches!(parts[0], Err(VideoStreamError::Model(_))));
    }

    #[tokio::test]
    async fn test_each_stream_reopens_the_source() {
        let registry = registry_with_video("s1");
        let opener = Arc::new(FakeOpener::new(2));
        let model = Arc::new(MockModelService::default());

        let first = collect(pipeline(registry.clone(), opener.clone(), model.clone())).await;
        let second = collect(pipeline(registry, opener.clone(), model)).await;

        assert_eq!(first.len(), 2);
        assert_eq!(second.len(), 2);
        assert_eq!(opener.opened.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_decode_error_ends_stream() {
        let registry = registry_with_video("s1");
        let parts = collect(pipeline(
            registry,
            Arc::new(TruncatedOpener { good: 1 }),
            Arc::new(MockModelService::default()),
        ))
        .await;

        assert_eq!(parts.len(), 2);
        assert!(parts[0].is_ok());
        assert!(matches!(parts[1], Err(VideoStreamError::Decode(_))));
    }

    #[tokio::test]
    async fn test_lifecycle_clear_stops_running_stream() {
        let temp = tempfile::TempDir::new().unwrap();
        let lifecycle = SessionLifecycle::new(Arc::new(SessionRegistry::new()), temp.path());
        let upload = Upload {
            file_name: "x.mp4".into(),
            content_type: "video/mp4".into(),
            data: Bytes::from_static(b"fake video bytes"),
        };
        lifecycle.register("s1", upload).await.unwrap();

        let model = Arc::new(MockModelService::default());
        let mut stream = Box::pin(
            pipeline(
                lifecycle.registry().clone(),
                Arc::new(FakeOpener::new(10)),
                model.clone(),
            )
            .generate_stream(),
        );
        assert!(stream.next().await.unwrap().is_ok());
        assert!(stream.next().await.unwrap().is_ok());

        assert_eq!(lifecycle.clear("s1").await.unwrap(), ClearOutcome::Cleared);

        assert!(stream.next().await.is_none());
        assert!(!lifecycle.session_dir("s1").exists());
        assert_eq!(model.calls.load(Ordering::SeqCst), 2);
    }
}
