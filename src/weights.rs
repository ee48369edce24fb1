//! Loading of the trained parameters exported from PyTorch.
//!
//! The parameter file is the `state_dict` of a model laid out as two `nn.Sequential`
//! containers: `conv_part` holds four entries per convolutional stage (convolution, batch
//! norm, activation, pooling) and `fc_part` holds three entries per fully-connected stage
//! (linear, activation, dropout) followed by the output layer. Only the convolutions,
//! batch norms and linears carry parameters, so their indices are remapped onto the
//! named fields of [NasModel].

use std::path::Path;

use burn::{
    module::Param,
    prelude::*,
    record::{FullPrecisionSettings, Recorder},
};
use burn_import::pytorch::{LoadArgs, PyTorchFileRecorder};

use crate::{
    error::ModelError,
    model::{
        ConvBlock, ConvBlockRecord, DenseBlock, DenseBlockRecord, NasModel, NasModelConfig,
        NasModelRecord,
    },
};

/// Stages per convolutional block in the PyTorch `conv_part` container.
const CONV_STRIDE: usize = 4;
/// Stages per fully-connected block in the PyTorch `fc_part` container.
const DENSE_STRIDE: usize = 3;

/// Regex remaps from PyTorch `state_dict` keys to [NasModel] record keys.
pub fn pytorch_key_remaps(config: &NasModelConfig) -> Vec<(String, String)> {
    let capacity = 2 * config.conv_layers.len() + config.fc_layers.len() + 1;
    let mut remaps = Vec::with_capacity(capacity);

    for index in 0..config.conv_layers.len() {
        let base = index * CONV_STRIDE;
        remaps.push((
            format!(r"^conv_part\.{base}\.(.+)$"),
            format!("conv_blocks.{index}.conv.$1"),
        ));
        remaps.push((
            format!(r"^conv_part\.{}\.(.+)$", base + 1),
            format!("conv_blocks.{index}.norm.$1"),
        ));
    }

    for index in 0..config.fc_layers.len() {
        remaps.push((
            format!(r"^fc_part\.{}\.(.+)$", index * DENSE_STRIDE),
            format!("dense_blocks.{index}.linear.$1"),
        ));
    }

    remaps.push((
        format!(r"^fc_part\.{}\.(.+)$", config.fc_layers.len() * DENSE_STRIDE),
        "output.$1".to_string(),
    ));

    remaps
}

/// Reads a PyTorch parameter file into a record matching `config`.
pub fn load_pytorch_record<B: Backend>(
    path: &Path,
    config: &NasModelConfig,
    device: &B::Device,
) -> Result<NasModelRecord<B>, ModelError> {
    let args = pytorch_key_remaps(config)
        .iter()
        .fold(LoadArgs::new(path.to_path_buf()), |args, (pattern, replacement)| {
            args.with_key_remap(pattern, replacement)
        });

    PyTorchFileRecorder::<FullPrecisionSettings>::default()
        .load(args, device)
        .map_err(|err| ModelError::Record {
            path: path.to_path_buf(),
            reason: err.to_string(),
        })
}

impl<B: Backend> NasModel<B> {
    /// Loads `record` after checking every stage count and parameter shape against the
    /// current graph.
    pub fn load_checked(self, record: NasModelRecord<B>) -> Result<Self, ModelError> {
        self.check_record(&record)?;

        Ok(self.load_record(record))
    }

    fn check_record(&self, record: &NasModelRecord<B>) -> Result<(), ModelError> {
        check_count("convolutional", self.conv_blocks.len(), record.conv_blocks.len())?;
        check_count("fully-connected", self.dense_blocks.len(), record.dense_blocks.len())?;

        let conv_blocks = self.conv_blocks.iter().zip(&record.conv_blocks);
        for (index, (block, record)) in conv_blocks.enumerate() {
            block.check_record(&format!("conv_blocks.{index}"), record)?;
        }

        let dense_blocks = self.dense_blocks.iter().zip(&record.dense_blocks);
        for (index, (block, record)) in dense_blocks.enumerate() {
            block.check_record(&format!("dense_blocks.{index}"), record)?;
        }

        check_param("output.weight", &self.output.weight, &record.output.weight)?;
        check_bias("output.bias", &self.output.bias, &record.output.bias)
    }
}

impl<B: Backend> ConvBlock<B> {
    fn check_record(&self, prefix: &str, record: &ConvBlockRecord<B>) -> Result<(), ModelError> {
        let conv = &record.conv;
        check_param(&format!("{prefix}.conv.weight"), &self.conv.weight, &conv.weight)?;
        check_bias(&format!("{prefix}.conv.bias"), &self.conv.bias, &conv.bias)?;

        let norm = &record.norm;
        check_param(&format!("{prefix}.norm.gamma"), &self.norm.gamma, &norm.gamma)?;
        check_param(&format!("{prefix}.norm.beta"), &self.norm.beta, &norm.beta)?;
        check_dims(
            &format!("{prefix}.norm.running_mean"),
            self.norm.running_mean.value().dims(),
            norm.running_mean.val().dims(),
        )?;
        check_dims(
            &format!("{prefix}.norm.running_var"),
            self.norm.running_var.value().dims(),
            norm.running_var.val().dims(),
        )
    }
}

impl<B: Backend> DenseBlock<B> {
    fn check_record(&self, prefix: &str, record: &DenseBlockRecord<B>) -> Result<(), ModelError> {
        let linear = &record.linear;
        check_param(&format!("{prefix}.linear.weight"), &self.linear.weight, &linear.weight)?;
        check_bias(&format!("{prefix}.linear.bias"), &self.linear.bias, &linear.bias)
    }
}

fn check_count(stage: &'static str, expected: usize, actual: usize) -> Result<(), ModelError> {
    if expected != actual {
        return Err(ModelError::StageCountMismatch {
            stage,
            expected,
            actual,
        });
    }

    Ok(())
}

fn check_param<B: Backend, const D: usize>(
    name: &str,
    expected: &Param<Tensor<B, D>>,
    actual: &Param<Tensor<B, D>>,
) -> Result<(), ModelError> {
    check_dims(name, expected.val().dims(), actual.val().dims())
}

fn check_bias<B: Backend>(
    name: &str,
    expected: &Option<Param<Tensor<B, 1>>>,
    actual: &Option<Param<Tensor<B, 1>>>,
) -> Result<(), ModelError> {
    match (expected, actual) {
        (Some(expected), Some(actual)) => check_param(name, expected, actual),
        (None, None) => Ok(()),
        (Some(_), None) => Err(ModelError::MissingParam(name.to_string())),
        (None, Some(actual)) => Err(ModelError::ShapeMismatch {
            param: name.to_string(),
            expected: vec![],
            actual: actual.val().dims().to_vec(),
        }),
    }
}

fn check_dims<const D: usize>(
    name: &str,
    expected: [usize; D],
    actual: [usize; D],
) -> Result<(), ModelError> {
    if expected != actual {
        return Err(ModelError::ShapeMismatch {
            param: name.to_string(),
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        });
    }

    Ok(())
}

#[cfg(all(test, feature = "ndarray"))]
mod tests {
    use super::*;
    use crate::model::{ConvLayerConfig, DenseLayerConfig};
    use crate::TestBackend;

    fn config(filters: &[usize], units: &[usize]) -> NasModelConfig {
        NasModelConfig::new(
            filters
                .iter()
                .map(|filters| ConvLayerConfig::new(*filters, 2, "relu".to_string()))
                .collect(),
            units
                .iter()
                .map(|units| DenseLayerConfig::new(*units, "leakyrelu".to_string()))
                .collect(),
        )
    }

    #[test]
    fn remaps_follow_the_sequential_layout() {
        let remaps = pytorch_key_remaps(&NasModelConfig::tumor_classifier());

        assert_eq!(remaps.len(), 6 * 2 + 2 + 1);
        assert_eq!(
            remaps[0],
            (r"^conv_part\.0\.(.+)$".to_string(), "conv_blocks.0.conv.$1".to_string())
        );
        assert_eq!(
            remaps[11],
            (r"^conv_part\.21\.(.+)$".to_string(), "conv_blocks.5.norm.$1".to_string())
        );
        assert_eq!(
            remaps[13],
            (r"^fc_part\.3\.(.+)$".to_string(), "dense_blocks.1.linear.$1".to_string())
        );
        assert_eq!(
            remaps[14],
            (r"^fc_part\.6\.(.+)$".to_string(), "output.$1".to_string())
        );
    }

    #[test]
    fn output_remap_without_dense_stages() {
        let remaps = pytorch_key_remaps(&config(&[8], &[]));

        assert_eq!(
            remaps.last().unwrap(),
            &(r"^fc_part\.0\.(.+)$".to_string(), "output.$1".to_string())
        );
    }

    #[test]
    fn missing_parameter_file_is_a_record_error() {
        let device = Default::default();
        let path = Path::new("does/not/exist.pth");

        let result =
            load_pytorch_record::<TestBackend>(path, &NasModelConfig::tumor_classifier(), &device);

        match result {
            Err(ModelError::Record { path: reported, .. }) => assert_eq!(reported.as_path(), path),
            other => panic!("Expected a record error, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn matching_record_is_loaded() {
        let device = Default::default();
        let trained = config(&[4, 6], &[5]).init::<TestBackend>(&device).unwrap();
        let fresh = config(&[4, 6], &[5]).init::<TestBackend>(&device).unwrap();
        let input = Tensor::<TestBackend, 4>::ones([1, 3, 16, 16], &device);

        let expected = trained.forward(input.clone());
        let loaded = fresh.load_checked(trained.into_record()).unwrap();

        loaded
            .forward(input)
            .to_data()
            .assert_approx_eq(&expected.to_data(), 5);
    }

    #[test]
    fn filter_mismatch_is_rejected() {
        let device = Default::default();
        let trained = config(&[8, 6], &[5]).init::<TestBackend>(&device).unwrap();
        let model = config(&[4, 6], &[5]).init::<TestBackend>(&device).unwrap();

        match model.load_checked(trained.into_record()) {
            Err(ModelError::ShapeMismatch {
                param,
                expected,
                actual,
            }) => {
                assert_eq!(param, "conv_blocks.0.conv.weight");
                assert_eq!(expected, vec![4, 3, 2, 2]);
                assert_eq!(actual, vec![8, 3, 2, 2]);
            }
            other => panic!("Expected a shape mismatch, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn class_count_mismatch_is_rejected() {
        let device = Default::default();
        let trained = config(&[4], &[5])
            .with_num_classes(3)
            .init::<TestBackend>(&device)
            .unwrap();
        let model = config(&[4], &[5]).init::<TestBackend>(&device).unwrap();

        let result = model.load_checked(trained.into_record());
        assert!(matches!(
            result,
            Err(ModelError::ShapeMismatch { param, .. }) if param == "output.weight"
        ));
    }

    #[test]
    fn stage_count_mismatch_is_rejected() {
        let device = Default::default();
        let trained = config(&[4, 4], &[5]).init::<TestBackend>(&device).unwrap();
        let model = config(&[4], &[5]).init::<TestBackend>(&device).unwrap();

        let result = model.load_checked(trained.into_record());
        assert!(matches!(
            result,
            Err(ModelError::StageCountMismatch {
                expected: 1,
                actual: 2,
                ..
            })
        ));
    }
}
