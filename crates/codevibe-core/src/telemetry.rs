//! Tracing setup for codevibe binaries.
//!
//! Logs always go to stderr: stdout is reserved for result JSON. With
//! `RUST_LOG` unset, the engine crates log at the requested level and
//! everything else at `warn`.

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Install the global subscriber. Only the first call in a process takes
/// effect.
///
/// * `json`: newline-delimited JSON log lines instead of text.
/// * `level`: engine verbosity when `RUST_LOG` is not set.
pub fn init_tracing(json: bool, level: Level) {
    let layer = fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);
    let installed = if json {
        tracing_subscriber::registry()
            .with(default_filter(level))
            .with(layer.json().flatten_event(true))
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(default_filter(level))
            .with(layer)
            .try_init()
    };
    if installed.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}

fn default_filter(level: Level) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = level.as_str();
        EnvFilter::new(format!("warn,codevibe_core={level},codevibe={level}"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_filter_scopes_engine_crates() {
        if std::env::var_os("RUST_LOG").is_some() {
            return;
        }
        let filter = default_filter(Level::DEBUG).to_string().to_lowercase();
        assert!(filter.contains("codevibe_core=debug"), "{filter}");
        assert!(filter.contains("warn"), "{filter}");
    }

    #[test]
    fn test_init_twice_is_harmless() {
        init_tracing(false, Level::WARN);
        init_tracing(true, Level::DEBUG);
        tracing::debug!("after init");
    }
}
