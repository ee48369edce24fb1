use burn::prelude::*;
use image::{imageops::FilterType, RgbImage};

use crate::error::PredictError;

/// Side of the square images the classifier was trained on.
pub const IMAGE_SIZE: u32 = 224;

/// Turns uploaded image bytes into model input.
///
/// Images are converted to 8-bit RGB, stretched to a square of [IMAGE_SIZE] pixels without
/// preserving the aspect ratio, and scaled to `[0, 1]` in channel-first layout. No mean/std
/// normalization is applied: the weights were trained on raw `[0, 1]` pixels.
#[derive(Clone, Debug)]
pub struct ImagePreprocessor {
    size: u32,
    filter: FilterType,
}

impl Default for ImagePreprocessor {
    fn default() -> Self {
        Self::new(IMAGE_SIZE)
    }
}

impl ImagePreprocessor {
    /// Preprocessor resizing to `size` x `size` with bilinear filtering.
    pub fn new(size: u32) -> Self {
        Self {
            size,
            filter: FilterType::Triangle,
        }
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    /// Decodes, converts to RGB and resizes.
    pub fn decode(&self, bytes: &[u8]) -> Result<RgbImage, PredictError> {
        if bytes.is_empty() {
            return Err(PredictError::EmptyImage);
        }

        let image = image::load_from_memory(bytes)?.into_rgb8();

        Ok(image::imageops::resize(
            &image,
            self.size,
            self.size,
            self.filter,
        ))
    }

    /// Converts an RGB image to a `[1, 3, height, width]` tensor with values in `[0, 1]`.
    pub fn to_tensor<B: Backend>(&self, image: &RgbImage, device: &B::Device) -> Tensor<B, 4> {
        let height = image.height() as usize;
        let width = image.width() as usize;
        let data = TensorData::new(image.as_raw().clone(), [height, width, 3]);

        Tensor::<B, 3>::from_data(data.convert::<B::FloatElem>(), device)
            .swap_dims(0, 1)
            .swap_dims(0, 2)
            .div_scalar(255.0)
            .unsqueeze()
    }

    /// Runs [decode](Self::decode) then [to_tensor](Self::to_tensor).
    pub fn preprocess<B: Backend>(
        &self,
        bytes: &[u8],
        device: &B::Device,
    ) -> Result<Tensor<B, 4>, PredictError> {
        let image = self.decode(bytes)?;

        Ok(self.to_tensor(&image, device))
    }
}
