//! Diagnostic-aware logging configuration.
//!
//! With diagnostics off only WARN and ERROR reach the output. Turning them
//! on shows the DEBUG/INFO trail of every loop decision as well. `RUST_LOG`
//! still narrows individual modules.

use lazy_static::lazy_static;
use log::LevelFilter;
use std::sync::atomic::{AtomicBool, Ordering};

lazy_static! {
    static ref DIAGNOSTICS_ENABLED: AtomicBool = AtomicBool::new(true);
}

/// Initialize the logging system. Call once at startup.
pub fn init_logging(diagnostics: bool) {
    let _ = env_logger::Builder::new()
        .filter_level(LevelFilter::Debug)
        .parse_default_env()
        .format_timestamp_millis()
        .format_module_path(false)
        .try_init();

    set_diagnostics_enabled(diagnostics);
}

pub fn set_diagnostics_enabled(enabled: bool) {
    DIAGNOSTICS_ENABLED.store(enabled, Ordering::SeqCst);

    let level = if enabled {
        LevelFilter::Debug
    } else {
        LevelFilter::Warn
    };
    log::set_max_level(level);
    log::warn!(
        "[DiagnosticLogger] Diagnostics {}",
        if enabled { "ENABLED - showing all logs" } else { "DISABLED - only warnings/errors" }
    );
}

pub fn is_diagnostics_enabled() -> bool {
    DIAGNOSTICS_ENABLED.load(Ordering::SeqCst)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_toggle_changes_max_level() {
        set_diagnostics_enabled(false);
        assert!(!is_diagnostics_enabled());
        assert_eq!(log::max_level(), LevelFilter::Warn);

        set_diagnostics_enabled(true);
        assert!(is_diagnostics_enabled());
        assert_eq!(log::max_level(), LevelFilter::Debug);
    }
}
