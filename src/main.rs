use std::process::ExitCode;

use clap::Parser;
use nas_classifier::{
    backend::{default_device, InferenceBackend},
    cli::Cli,
    error::ServerError,
    inference::Classifier,
    labels::LabelMap,
    logging::install_logger,
    server,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    install_logger(cli.log_level);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            log::error!("{err}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<(), ServerError> {
    let config = cli.server_config()?;
    let architecture = cli.architecture()?;
    let device = default_device();

    log::info!("Running inference on {device:?}");
    log::debug!("Architecture: {architecture}");

    let classifier = Classifier::<InferenceBackend>::from_file(
        &architecture,
        &config.weights,
        LabelMap::tumor_classes(),
        device,
    )?;

    server::serve(classifier, &config).await
}
