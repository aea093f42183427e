//! tracing-subscriber setup for terminal diagnostics.
//!
//! The plain-text run log in the output directory is written by
//! [`crate::context::RunContext`] and does not depend on this filter.

use tracing_subscriber::EnvFilter;

/// Environment variable holding an `EnvFilter` directive, e.g. `jobspawn=debug`.
pub const LOG_ENV: &str = "JOBSPAWN_LOG";

fn build_env_filter(spec: Option<&str>, verbose: bool) -> anyhow::Result<EnvFilter> {
    let directive = match spec {
        Some(spec) if !spec.trim().is_empty() => spec.to_string(),
        _ if verbose => "debug".to_string(),
        _ => "info".to_string(),
    };
    EnvFilter::try_new(&directive)
        .map_err(|e| anyhow::anyhow!("Invalid tracing filter '{}': {}", directive, e))
}

/// Installs the global subscriber, writing to stderr.
pub fn init(verbose: bool) -> anyhow::Result<()> {
    let spec = std::env::var(LOG_ENV).ok();
    let filter = build_env_filter(spec.as_deref(), verbose)?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| anyhow::anyhow!("could not install tracing subscriber: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_subscriber::filter::LevelFilter;

    fn level(spec: Option<&str>, verbose: bool) -> Option<LevelFilter> {
        build_env_filter(spec, verbose).unwrap().max_level_hint()
    }

    #[test]
    fn default_levels() {
        assert_eq!(level(None, false), Some(LevelFilter::INFO));
        assert_eq!(level(None, true), Some(LevelFilter::DEBUG));
        assert_eq!(level(Some("  "), false), Some(LevelFilter::INFO));
    }

    #[test]
    fn explicit_filter_wins() {
        assert_eq!(level(Some("jobspawn=trace"), false), Some(LevelFilter::TRACE));
        assert_eq!(level(Some("warn"), true), Some(LevelFilter::WARN));
    }

    #[test]
    fn invalid_filter_is_reported() {
        let err = build_env_filter(Some("jobspawn=loud"), false).unwrap_err();
        assert!(err.to_string().starts_with("Invalid tracing filter"));
    }
}
