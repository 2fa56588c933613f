//! Tracing subscriber setup for hosts without their own

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Default directive when neither `filter` nor `RUST_LOG` is given
pub const DEFAULT_FILTER: &str = "sessiond=info,sessiond_auth=info,sessiond_resilience=info";

/// Install a fmt subscriber filtered by `filter`, else `RUST_LOG`, else
/// [`DEFAULT_FILTER`].
///
/// Returns false if a global subscriber was already installed, in which
/// case nothing changes.
pub fn init_tracing(filter: Option<&str>) -> bool {
    let filter = match filter {
        Some(directives) => EnvFilter::new(directives),
        None => {
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
        }
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .is_ok()
}
