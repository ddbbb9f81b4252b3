// Logger setup
//
// The device installs env_logger at initialization with the requested
// level. RUST_LOG, when set, takes precedence. A second initialization
// (tests, several devices in one process) leaves the first logger in place.

use crate::config::LogLevel;

pub fn init_logging(level: LogLevel) {
    use env_logger::{Builder, Env};

    let mut builder = Builder::new();
    builder.filter_level(level.filter());
    builder.parse_env(Env::default());
    builder.format_timestamp_millis();

    if builder.try_init().is_ok() {
        log::debug!("Logger initialized at {:?}", level);
    }
}
