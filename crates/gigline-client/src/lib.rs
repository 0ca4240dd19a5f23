//! # gigline-client
//!
//! Inbox core of the Gigline client: the message dispatch façade over the
//! REST API, the inbox that keeps the conversation and notification stores
//! in sync, and the bridge that feeds live broker events into it.

pub mod api;
pub mod bridge;
pub mod config;
pub mod dispatch;
pub mod events;
pub mod inbox;
pub mod session;

mod error;

#[cfg(test)]
mod test_helpers;

use tracing_subscriber::{fmt, EnvFilter};

pub use api::{ApiError, Backend, HttpBackend};
pub use bridge::LiveUpdates;
pub use config::ClientConfig;
pub use dispatch::MessageDispatch;
pub use error::{ClientError, Result};
pub use events::InboxEvent;
pub use inbox::Inbox;
pub use session::SessionContext;

/// Install the global `tracing` subscriber. `RUST_LOG` overrides the
/// default filter. Calling it twice is harmless.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("gigline_client_lib=debug,gigline_net=debug,gigline_store=info,warn")
    });

    let _ = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .try_init();

    tracing::info!("{} client tracing initialised", gigline_shared::constants::APP_NAME);
}
