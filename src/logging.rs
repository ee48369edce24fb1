use tracing_core::{Level, LevelFilter};
use tracing_subscriber::filter::filter_fn;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{registry, Layer};

/// Installs a stdout logger at `level` unless a global subscriber is already set.
///
/// `log` records emitted by this crate and its dependencies are forwarded to the same
/// subscriber. Returns whether the logger was installed.
pub fn install_logger(level: LevelFilter) -> bool {
    let layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_filter(level)
        .with_filter(filter_fn(|m| {
            if let Some(path) = m.module_path() {
                // The wgpu crate is logging too much, so we skip `info` level.
                if path.starts_with("wgpu") && *m.level() >= Level::INFO {
                    return false;
                }
            }
            true
        }));

    registry().with(layer).try_init().is_ok()
}
