use image::{GrayImage, ImageFormat, RgbImage};
use ndarray::{Array3, ArrayView3};
use opencv::{
    core::Mat,
    imgproc,
    prelude::*,
    videoio,
};
use std::{io::Cursor, path::Path};
use thiserror::Error;

/// Width of the white band between the frame and its mask.
pub const SEPARATOR_WIDTH: usize = 50;
const SEPARATOR_VALUE: u8 = 255;

#[derive(Error, Debug)]
pub enum CvUtilsError {
    #[error("OpenCV error: {0}")]
    OpenCvError(#[from] opencv::Error),
    #[error("Failed to open video source {0}")]
    SourceUnavailable(String),
    #[error("Invalid frame: {0}")]
    InvalidFrame(String),
    #[error("Failed to decode image: {0}")]
    DecodeFailed(image::ImageError),
    #[error("Failed to encode image: {0}")]
    EncodeFailed(image::ImageError),
    #[error("Cannot compose frames of height {left} and {right}")]
    HeightMismatch { left: usize, right: usize },
}

/// Sequential decoder over one video source.
pub trait FrameSource: Send {
    /// Next RGB frame (HWC, `u8`), or `None` once the source is exhausted.
    fn next_frame(&mut self) -> Result<Option<Array3<u8>>, CvUtilsError>;
}

pub trait FrameSourceOpener: Send + Sync + 'static {
    fn open(&self, path: &Path) -> Result<Box<dyn FrameSource>, CvUtilsError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct OpenCvVideoOpener;

impl FrameSourceOpener for OpenCvVideoOpener {
    fn open(&self, path: &Path) -> Result<Box<dyn FrameSource>, CvUtilsError> {
        let path_str = path
            .to_str()
            .ok_or_else(|| CvUtilsError::SourceUnavailable(format!("{:?}", path)))?;
        let capture = videoio::VideoCapture::from_file(path_str, videoio::CAP_ANY)?;
        if !capture.is_opened()? {
            return Err(CvUtilsError::SourceUnavailable(path_str.to_string()));
        }
        Ok(Box::new(OpenCvVideoSource { capture }))
    }
}

pub struct OpenCvVideoSource {
    capture: videoio::VideoCapture,
}

impl FrameSource for OpenCvVideoSource {
    fn next_frame(&mut self) -> Result<Option<Array3<u8>>, CvUtilsError> {
        let mut frame = Mat::default();
        if !self.capture.read(&mut frame)? || frame.empty() {
            return Ok(None);
        }

        let mut rgb = Mat::default();
        imgproc::cvt_color_def(&frame, &mut rgb, imgproc::COLOR_BGR2RGB)?;
        mat_to_array(&rgb).map(Some)
    }
}

impl Drop for OpenCvVideoSource {
    fn drop(&mut self) {
        if let Err(e) = self.capture.release() {
            tracing::warn!("Failed to release video source: {:?}", e);
        }
    }
}

fn mat_to_array(mat: &Mat) -> Result<Array3<u8>, CvUtilsError> {
    let rows = mat.rows() as usize;
    let cols = mat.cols() as usize;
    let channels = mat.channels() as usize;
    if channels != 3 {
        return Err(CvUtilsError::InvalidFrame(format!(
            "expected 3 channels, got {channels}"
        )));
    }

    let owned;
    let continuous = if mat.is_continuous() {
        mat
    } else {
        owned = mat.try_clone()?;
        &owned
    };

    Array3::from_shape_vec((rows, cols, channels), continuous.data_bytes()?.to_vec())
        .map_err(|e| CvUtilsError::InvalidFrame(e.to_string()))
}

pub fn decode_image(bytes: &[u8]) -> Result<Array3<u8>, CvUtilsError> {
    let rgb = image::load_from_memory(bytes)
        .map_err(CvUtilsError::DecodeFailed)?
        .to_rgb8();
    let (width, height) = rgb.dimensions();
    Array3::from_shape_vec((height as usize, width as usize, 3), rgb.into_raw())
        .map_err(|e| CvUtilsError::InvalidFrame(e.to_string()))
}

pub fn normalize(frame: ArrayView3<'_, u8>) -> Array3<f32> {
    frame.mapv(|v| v as f32 / 255.0)
}

pub fn denormalize(frame: ArrayView3<'_, f32>) -> Array3<u8> {
    frame.mapv(|v| (v.clamp(0.0, 1.0) * 255.0) as u8)
}

fn rgb_at(image: &ArrayView3<'_, u8>, y: usize, x: usize) -> [u8; 3] {
    if image.dim().2 == 1 {
        let v = image[[y, x, 0]];
        [v, v, v]
    } else {
        [image[[y, x, 0]], image[[y, x, 1]], image[[y, x, 2]]]
    }
}

fn check_channels(image: &ArrayView3<'_, u8>) -> Result<(), CvUtilsError> {
    match image.dim().2 {
        1 | 3 => Ok(()),
        other => Err(CvUtilsError::InvalidFrame(format!(
            "unsupported channel count {other}"
        ))),
    }
}

/// `left | white separator | right`, sharing the height of `left`.
///
/// Single channel inputs are drawn as grey.
pub fn compose_side_by_side(
    left: ArrayView3<'_, u8>,
    right: ArrayView3<'_, u8>,
) -> Result<RgbImage, CvUtilsError> {
    check_channels(&left)?;
    check_channels(&right)?;

    let (height, left_width, _) = left.dim();
    let (right_height, right_width, _) = right.dim();
    if height != right_height {
        return Err(CvUtilsError::HeightMismatch {
            left: height,
            right: right_height,
        });
    }

    let width = left_width + SEPARATOR_WIDTH + right_width;
    let composed = RgbImage::from_fn(width as u32, height as u32, |x, y| {
        let (x, y) = (x as usize, y as usize);
        let pixel = if x < left_width {
            rgb_at(&left, y, x)
        } else if x < left_width + SEPARATOR_WIDTH {
            [SEPARATOR_VALUE; 3]
        } else {
            rgb_at(&right, y, x - left_width - SEPARATOR_WIDTH)
        };
        image::Rgb(pixel)
    });

    Ok(composed)
}

pub fn to_jpg(image: &RgbImage) -> Result<Vec<u8>, CvUtilsError> {
    let mut buf = Cursor::new(Vec::new());
    image
        .write_to(&mut buf, ImageFormat::Jpeg)
        .map_err(CvUtilsError::EncodeFailed)?;
    Ok(buf.into_inner())
}

/// PNG-encode a mask: grey for one channel, RGB for three.
pub fn mask_to_png(mask: ArrayView3<'_, u8>) -> Result<Vec<u8>, CvUtilsError> {
    check_channels(&mask)?;
    let (height, width, channels) = mask.dim();
    let data: Vec<u8> = mask.iter().copied().collect();
    let too_small = || CvUtilsError::InvalidFrame(format!("{width}x{height} mask"));

    let mut buf = Cursor::new(Vec::new());
    if channels == 1 {
        GrayImage::from_raw(width as u32, height as u32, data)
            .ok_or_else(too_small)?
            .write_to(&mut buf, ImageFormat::Png)
            .map_err(CvUtilsError::EncodeFailed)?;
    } else {
        RgbImage::from_raw(width as u32, height as u32, data)
            .ok_or_else(too_small)?
            .write_to(&mut buf, ImageFormat::Png)
            .map_err(CvUtilsError::EncodeFailed)?;
    }
    Ok(buf.into_inner())
}
