//! Tracing subscriber setup.

use tracing_subscriber::{ fmt, prelude::*, EnvFilter };

/// Level used when `RUST_LOG` is not set.
pub fn default_directive(verbose: bool) -> &'static str {
    if verbose { "debug" } else { "info" }
}

/// Installs a formatted subscriber for the whole process. `RUST_LOG` takes
/// precedence over `verbose`.
pub fn init_logging(verbose: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_|
        EnvFilter::new(default_directive(verbose))
    );

    let _ = tracing_subscriber
        ::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .try_init();
}
