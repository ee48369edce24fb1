//! HTTP inference service for a brain tumor MRI classifier whose architecture was found by
//! neural architecture search.
//!
//! - [model]: builds the network from a declarative [NasModelConfig](model::NasModelConfig).
//! - [weights]: loads the trained PyTorch parameters and checks them against the graph.
//! - [data]: turns uploaded image bytes into model input.
//! - [inference]: the [Classifier](inference::Classifier) combining all of the above.
//! - [server]: the `POST /predict` endpoint.

pub mod backend;
pub mod cli;
pub mod config;
pub mod data;
pub mod error;
pub mod inference;
pub mod labels;
pub mod logging;
pub mod model;
pub mod server;
pub mod weights;

#[cfg(all(test, feature = "ndarray"))]
pub(crate) type TestBackend = burn::backend::NdArray<f32>;
