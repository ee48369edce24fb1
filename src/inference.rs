use std::{
    path::Path,
    sync::{Mutex, PoisonError},
};

use burn::prelude::*;

use crate::{
    data::ImagePreprocessor,
    error::{ModelError, PredictError},
    labels::LabelMap,
    model::{NasModel, NasModelConfig},
    weights::load_pytorch_record,
};

/// Outcome of classifying one image.
#[derive(Clone, Debug, PartialEq)]
pub struct Prediction {
    /// Index of the highest score.
    pub index: usize,
    /// Label of that index.
    pub label: String,
    /// Raw logits, one per class.
    pub scores: Vec<f32>,
}

/// A loaded classifier ready to serve predictions.
///
/// The graph is never mutated after construction. Module handles aren't `Sync`, so the
/// lock is only held while cloning the handle; the forward pass itself runs on the clone
/// and concurrent predictions never wait on each other.
#[derive(Debug)]
pub struct Classifier<B: Backend> {
    model: Mutex<NasModel<B>>,
    labels: LabelMap,
    preprocessor: ImagePreprocessor,
    device: B::Device,
}

impl<B: Backend> Classifier<B> {
    /// Wraps an already built model.
    pub fn new(model: NasModel<B>, labels: LabelMap, device: B::Device) -> Result<Self, ModelError> {
        let classes = model.num_classes();
        if classes != labels.len() {
            return Err(ModelError::LabelCountMismatch {
                classes,
                labels: labels.len(),
            });
        }

        Ok(Self {
            model: Mutex::new(model),
            labels,
            preprocessor: ImagePreprocessor::default(),
            device,
        })
    }

    /// Builds the graph described by `config` and loads the PyTorch parameters at `path`.
    pub fn from_file(
        config: &NasModelConfig,
        path: &Path,
        labels: LabelMap,
        device: B::Device,
    ) -> Result<Self, ModelError> {
        let model = config.init::<B>(&device)?;
        let record = load_pytorch_record::<B>(path, config, &device)?;
        let model = model.load_checked(record)?;

        log::info!(
            "Loaded {} parameters from '{}'",
            model.num_params(),
            path.display()
        );

        Self::new(model, labels, device)
    }

    /// Replaces the default preprocessing.
    pub fn with_preprocessor(mut self, preprocessor: ImagePreprocessor) -> Self {
        self.preprocessor = preprocessor;
        self
    }

    pub fn labels(&self) -> &LabelMap {
        &self.labels
    }

    /// Classifies one encoded image.
    pub fn classify(&self, bytes: &[u8]) -> Result<Prediction, PredictError> {
        let input = self.preprocessor.preprocess::<B>(bytes, &self.device)?;
        let model = self
            .model
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        let scores = model
            .forward(input)
            .into_data()
            .iter::<f32>()
            .collect::<Vec<_>>();

        let index = argmax(&scores).ok_or(PredictError::NoScore)?;
        let label = self
            .labels
            .get(index)
            .ok_or(PredictError::UnknownClass(index))?
            .to_string();

        Ok(Prediction {
            index,
            label,
            scores,
        })
    }
}

/// Index of the largest score, the lowest index winning ties.
///
/// NaN scores are skipped, unlike `torch.argmax` which ranks NaN above every number. A
/// vector holding only NaN has no arg-max.
pub fn argmax(scores: &[f32]) -> Option<usize> {
    scores
        .iter()
        .enumerate()
        .filter(|(_, score)| !score.is_nan())
        .fold(None, |best: Option<(usize, f32)>, (index, &score)| match best {
            Some((_, best_score)) if best_score >= score => best,
            _ => Some((index, score)),
        })
        .map(|(index, _)| index)
}

#[cfg(all(test, feature = "ndarray"))]
mod tests {
    use super::*;
    use crate::model::{ConvLayerConfig, DenseLayerConfig};
    use crate::TestBackend;
    use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
    use std::io::Cursor;

    fn classifier() -> Classifier<TestBackend> {
        let device = Default::default();
        let model = NasModelConfig::new(
            vec![ConvLayerConfig::new(4, 3, "leakyrelu".to_string())],
            vec![DenseLayerConfig::new(8, "relu".to_string())],
        )
        .init::<TestBackend>(&device)
        .unwrap();

        Classifier::new(model, LabelMap::tumor_classes(), device)
            .unwrap()
            .with_preprocessor(ImagePreprocessor::new(32))
    }

    fn png(color: [u8; 3]) -> Vec<u8> {
        let image = RgbImage::from_pixel(224, 224, Rgb(color));
        let mut bytes = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(image)
            .write_to(&mut bytes, ImageFormat::Png)
            .unwrap();
        bytes.into_inner()
    }

    #[test]
    fn argmax_prefers_the_lowest_index_on_ties() {
        assert_eq!(argmax(&[0.1, 0.7, 0.7, 0.2]), Some(1));
        assert_eq!(argmax(&[3.0, -1.0, 3.0]), Some(0));
        assert_eq!(argmax(&[-2.0, -1.0]), Some(1));
    }

    #[test]
    fn argmax_skips_nan() {
        assert_eq!(argmax(&[f32::NAN, 0.5, 0.1]), Some(1));
        assert_eq!(argmax(&[f32::NAN]), None);
        assert_eq!(argmax(&[]), None);
    }

    #[test]
    fn classify_returns_a_known_label() {
        let classifier = classifier();

        let prediction = classifier.classify(&png([120, 40, 200])).unwrap();

        assert_eq!(prediction.scores.len(), 4);
        assert_eq!(argmax(&prediction.scores), Some(prediction.index));
        assert!(classifier.labels().contains(&prediction.label));
    }

    #[test]
    fn classify_is_deterministic() {
        let classifier = classifier();
        let bytes = png([10, 200, 30]);

        let first = classifier.classify(&bytes).unwrap();
        let second = classifier.classify(&bytes).unwrap();

        assert_eq!(first, second);
    }

    #[test]
    fn invalid_uploads_are_client_errors() {
        let classifier = classifier();

        let err = classifier.classify(&[]).unwrap_err();
        assert!(matches!(err, PredictError::EmptyImage));
        assert!(err.is_client_error());

        let err = classifier.classify(b"definitely not an image").unwrap_err();
        assert!(matches!(err, PredictError::Decode(_)));
        assert!(err.is_client_error());
    }

    #[test]
    fn label_count_must_match_the_output_layer() {
        let device = Default::default();
        let model = NasModelConfig::new(
            vec![ConvLayerConfig::new(4, 2, "relu".to_string())],
            vec![],
        )
        .with_num_classes(3)
        .init::<TestBackend>(&device)
        .unwrap();

        let result = Classifier::new(model, LabelMap::tumor_classes(), device);

        assert!(matches!(
            result,
            Err(ModelError::LabelCountMismatch {
                classes: 3,
                labels: 4
            })
        ));
    }
}
