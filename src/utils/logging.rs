use std::str::FromStr;

use tracing::Level;

/// Installs the global fmt subscriber for `level` (`error` to `trace`, any case).
///
/// Unknown levels fall back to `info`. Returns `false` when a subscriber is
/// already installed, which happens when tests and the binary both call this.
pub fn init(level: &str) -> bool {
    let parsed = Level::from_str(level.trim()).ok();

    let installed = tracing_subscriber::fmt()
        .with_max_level(parsed.unwrap_or(Level::INFO))
        .with_target(false)
        .with_thread_names(true)
        .try_init()
        .is_ok();

    if installed && parsed.is_none() {
        tracing::warn!("unknown log level '{level}', logging at info");
    }
    installed
}
