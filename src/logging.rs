//! Tracing setup for the CLI

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Default filter for a verbosity count (`-v` repeats).
pub fn default_directive(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "buildmedic=info",
        1 => "buildmedic=debug",
        _ => "buildmedic=trace",
    }
}

/// Install a compact stderr subscriber. `RUST_LOG` overrides the verbosity.
///
/// A second call is a no-op.
pub fn init(verbosity: u8) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(verbosity)));

    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(verbosity > 1)
        .without_time()
        .compact();

    if tracing_subscriber::registry()
        .with(env_filter)
        .with(stderr_layer)
        .try_init()
        .is_ok()
    {
        tracing::debug!("Tracing initialized");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verbosity_directives() {
        assert_eq!(default_directive(0), "buildmedic=info");
        assert_eq!(default_directive(1), "buildmedic=debug");
        assert_eq!(default_directive(5), "buildmedic=trace");
    }

    #[test]
    fn test_init_twice_is_harmless() {
        init(0);
        init(2);
    }
}
