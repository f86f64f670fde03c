//! Tracing subscriber setup.

use crate::config::LoggingConfig;

/// Install a global `tracing` subscriber built from `config`.
///
/// Returns `false` if a global subscriber was already installed, in which
/// case the existing one stays in place.
pub fn init_tracing(config: &LoggingConfig) -> bool {
    let level: tracing::Level = config.level.into();
    let builder = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(config.include_targets);

    let installed = match (config.json_format, config.include_timestamps) {
        (true, true) => builder.json().try_init(),
        (true, false) => builder.json().without_time().try_init(),
        (false, true) => builder.with_ansi(config.colored).try_init(),
        (false, false) => builder.with_ansi(config.colored).without_time().try_init(),
    };

    match installed {
        Ok(()) => {
            tracing::debug!(?level, json = config.json_format, "tracing initialised");
            true
        }
        Err(_) => false,
    }
}
