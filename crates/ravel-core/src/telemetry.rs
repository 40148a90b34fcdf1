//! Tracing subscriber setup for programs embedding the runtime.
//!
//! [`init_tracing`] installs a registry with an `EnvFilter` (honouring
//! `RUST_LOG`) and plain or JSON formatting. Only the first call in a process
//! takes effect.

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// `json` or `text`; selects the output format for [`init_tracing_from_env`].
pub const ENV_LOG_FORMAT: &str = "RAVEL_LOG_FORMAT";
/// Default level when `RUST_LOG` is unset.
pub const ENV_LOG_LEVEL: &str = "RAVEL_LOG_LEVEL";

/// Install the global subscriber. Returns `false` if one was already set.
pub fn init_tracing(json: bool, level: Level) -> bool {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str()));
    let registry = tracing_subscriber::registry().with(filter);
    let installed = if json {
        registry
            .with(fmt::layer().with_target(false).json())
            .try_init()
    } else {
        registry.with(fmt::layer().with_target(false)).try_init()
    };
    installed.is_ok()
}

/// Configure from `RAVEL_LOG_FORMAT` and `RAVEL_LOG_LEVEL`.
pub fn init_tracing_from_env() -> bool {
    let json = std::env::var(ENV_LOG_FORMAT)
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    let level = std::env::var(ENV_LOG_LEVEL)
        .ok()
        .and_then(|v| parse_level(&v))
        .unwrap_or(Level::INFO);
    init_tracing(json, level)
}

fn parse_level(raw: &str) -> Option<Level> {
    raw.trim().parse::<Level>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("debug"), Some(Level::DEBUG));
        assert_eq!(parse_level(" WARN "), Some(Level::WARN));
        assert_eq!(parse_level("loud"), None);
    }

    #[test]
    fn test_second_init_is_ignored() {
        let _ = init_tracing(false, Level::WARN);
        assert!(!init_tracing(true, Level::DEBUG));
    }
}
