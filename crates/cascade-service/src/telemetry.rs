//! Tracing setup for the binary

use tracing_subscriber::EnvFilter;

/// Install the global subscriber; `RUST_LOG` wins over the default `info`
pub fn init(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let installed = if json {
        builder.json().with_current_span(false).try_init()
    } else {
        builder.try_init()
    };
    if let Err(e) = installed {
        eprintln!("tracing already initialised: {e}");
    }
}
