//! Tracing initialization.
//!
//! Logs are filtered by `RUST_LOG` and always written to stderr: with the
//! stdio transport, stdout carries MCP JSON-RPC frames and must stay clean.
//!
//! ```no_run
//! use kokoro_mcp_common::tracing::init_tracing;
//!
//! init_tracing("info");
//! tracing::info!("Server starting");
//! ```
//!
//! Examples of `RUST_LOG` values:
//! - `RUST_LOG=debug`
//! - `RUST_LOG=kokoro_mcp_stream=debug`
//! - `RUST_LOG=warn,kokoro_mcp_stream::session=trace`

use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    prelude::*,
    EnvFilter,
};

fn env_filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
}

fn stderr_layer<S>() -> impl tracing_subscriber::Layer<S>
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .with_target(true)
        .with_level(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_span_events(FmtSpan::NONE)
}

/// Install the global subscriber, defaulting to `default_level` when
/// `RUST_LOG` is unset.
///
/// # Panics
///
/// Panics if a global subscriber is already installed.
pub fn init_tracing(default_level: &str) {
    tracing_subscriber::registry()
        .with(env_filter(default_level))
        .with(stderr_layer())
        .init();
}

/// Like `init_tracing("info")` but returns `false` instead of panicking when
/// a subscriber is already installed. Useful in tests.
pub fn try_init_tracing() -> bool {
    tracing_subscriber::registry()
        .with(env_filter("info"))
        .with(stderr_layer())
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_try_init_tracing_does_not_panic() {
        let _ = try_init_tracing();
        // A second attempt must report failure rather than panic.
        assert!(!try_init_tracing());
    }

    #[test]
    fn test_env_filter_parses_module_specific() {
        let filter = EnvFilter::new("warn,kokoro_mcp_stream::session=trace");
        drop(filter);
    }
}
