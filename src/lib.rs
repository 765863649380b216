pub mod cancellation;
pub mod serial;
pub mod live;
pub mod transfer;
pub mod calibration;
pub mod device;
pub mod config;
pub mod update;
pub mod events;
pub mod settings;
pub mod commands;

pub use commands::AppState;
pub use settings::EngineSettings;

use log::LevelFilter;

/// Install the `env_logger` backend. `RUST_LOG` overrides `default_level`.
/// Safe to call more than once.
pub fn init_logging(default_level: LevelFilter) {
    let _ = env_logger::Builder::new()
        .filter_level(default_level)
        .parse_default_env()
        .format_timestamp_millis()
        .try_init();
}

/// Logger for tests: everything, captured per test.
#[cfg(test)]
pub(crate) fn init_test_logger() {
    let _ = env_logger::builder().filter_level(LevelFilter::max()).is_test(true).try_init();
}
