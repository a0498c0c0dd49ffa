use crate::model_service::ModelError;
use image::{imageops::FilterType, ImageBuffer, Luma, Rgb};
use ndarray::{Array3, Array4, ArrayD, ArrayView3, Axis, Ix3, Ix4};

const MASK_PALETTE: [[f32; 3]; 8] = [
    [0.0, 0.0, 0.0],
    [1.0, 0.0, 0.0],
    [0.0, 1.0, 0.0],
    [0.0, 0.0, 1.0],
    [1.0, 1.0, 0.0],
    [1.0, 0.0, 1.0],
    [0.0, 1.0, 1.0],
    [1.0, 1.0, 1.0],
];

/// Resize an HWC float image with 1 or 3 channels. Values are clamped to `[0, 1]`.
pub fn resize_hwc(
    image: ArrayView3<'_, f32>,
    width: u32,
    height: u32,
) -> Result<Array3<f32>, ModelError> {
    let (src_height, src_width, channels) = image.dim();
    if (src_width as u32, src_height as u32) == (width, height) {
        return Ok(image.mapv(|v| v.clamp(0.0, 1.0)));
    }

    let data: Vec<f32> = image.iter().copied().collect();
    let invalid = || ModelError::InvalidInput(format!("empty or malformed {src_width}x{src_height} image"));

    let resized = match channels {
        3 => {
            let buffer: ImageBuffer<Rgb<f32>, Vec<f32>> =
                ImageBuffer::from_raw(src_width as u32, src_height as u32, data)
                    .ok_or_else(invalid)?;
            image::imageops::resize(&buffer, width, height, FilterType::CatmullRom).into_raw()
        }
        1 => {
            let buffer: ImageBuffer<Luma<f32>, Vec<f32>> =
                ImageBuffer::from_raw(src_width as u32, src_height as u32, data)
                    .ok_or_else(invalid)?;
            image::imageops::resize(&buffer, width, height, FilterType::CatmullRom).into_raw()
        }
        other => {
            return Err(ModelError::InvalidInput(format!(
                "unsupported channel count {other}"
            )))
        }
    };

    let array = Array3::from_shape_vec((height as usize, width as usize, channels), resized)?;
    Ok(array.mapv(|v| v.clamp(0.0, 1.0)))
}

/// Build the NCHW model input and the HWC image it was built from.
pub fn to_input_tensor(
    image: ArrayView3<'_, f32>,
    width: u32,
    height: u32,
) -> Result<(Array4<f32>, Array3<f32>), ModelError> {
    if image.dim().2 != 3 {
        return Err(ModelError::InvalidInput(format!(
            "expected 3 channels, got {}",
            image.dim().2
        )));
    }

    let echoed = resize_hwc(image, width, height)?;

    let mut input = Array4::zeros((1, 3, height as usize, width as usize));
    for ((y, x, c), value) in echoed.indexed_iter() {
        input[[0, c, y, x]] = *value;
    }

    Ok((input, echoed))
}

/// Turn raw model output into an HWC mask.
///
/// Accepted shapes are `[1, C, H, W]`, `[1, H, W]` and `[H, W]`. A single
/// channel is kept as a probability map; several channels are reduced with
/// argmax and coloured from a fixed palette.
pub fn decode_mask(output: ArrayD<f32>) -> Result<Array3<f32>, ModelError> {
    let chw = match output.ndim() {
        4 => output
            .into_dimensionality::<Ix4>()?
            .index_axis_move(Axis(0), 0),
        3 => output.into_dimensionality::<Ix3>()?,
        2 => output.insert_axis(Axis(0)).into_dimensionality::<Ix3>()?,
        n => {
            return Err(ModelError::InvalidOutput(format!(
                "unexpected output rank {n}"
            )))
        }
    };

    let (channels, height, width) = chw.dim();
    if channels == 0 || height == 0 || width == 0 {
        return Err(ModelError::InvalidOutput(format!(
            "empty output {channels}x{height}x{width}"
        )));
    }

    if channels == 1 {
        let mask = chw.permuted_axes([1, 2, 0]).mapv(|v| v.clamp(0.0, 1.0));
        return Ok(mask);
    }

    let mut mask = Array3::zeros((height, width, 3));
    for y in 0..height {
        for x in 0..width {
            let class_id = (0..channels)
                .map(|c| (c, chw[[c, y, x]]))
                .reduce(|best, cur| if cur.1 > best.1 { cur } else { best })
                .map(|(c, _)| c)
                .unwrap_or(0);
            let color = MASK_PALETTE[class_id % MASK_PALETTE.len()];
            for (c, value) in color.iter().enumerate() {
                mask[[y, x, c]] = *value;
            }
        }
    }

    Ok(mask)
}
