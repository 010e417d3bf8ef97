//! # rendezvous-client
//!
//! Client-side engine of Rendezvous: keeps the local store in step with the
//! backend and carries out user actions offline-first.
//!
//! - [`sync::SyncEngine`] pulls and applies server changesets, then pushes
//!   local edits, advancing the checkpoints only on success.
//! - [`reconciler::Reconciler`] folds realtime events into the same store
//!   without double counting what a later pull brings again.
//! - [`swipes::SwipeQueue`] records swipes durably and delivers them when the
//!   backend is reachable.
//! - [`freshness`] serves cached profiles and discovery feeds, re-fetching
//!   at most once per throttle window.
//! - [`messaging::Messenger`] sends messages and edits chats and matches.
//!
//! Everything hangs off one [`state::AppContext`] per signed-in session.

pub mod config;
pub mod error;
pub mod events;
pub mod freshness;
pub mod http;
pub mod messaging;
pub mod reconciler;
pub mod remote;
pub mod scheduler;
pub mod state;
pub mod swipes;
pub mod sync;

#[cfg(test)]
mod test_support;

use tracing_subscriber::{fmt, EnvFilter};

pub use config::ClientConfig;
pub use error::{ApiRetryClass, ClientError, Result};
pub use events::{ClientEvent, EventBus};
pub use freshness::{should_fetch, DiscoveryFeed, ProfileCache};
pub use http::HttpRemote;
pub use messaging::Messenger;
pub use reconciler::{ReconcileOutcome, RealtimeEvent, Reconciler};
pub use remote::Remote;
pub use scheduler::SyncScheduler;
pub use state::{AppContext, SwipeClaim};
pub use swipes::{FlushReport, SwipeOutcome, SwipeQueue};
pub use sync::{SyncEngine, SyncOutcome, SyncPhase, SyncReport};

/// Install the global `tracing` subscriber.  `RUST_LOG` overrides the
/// default filter.  Calling it twice is harmless.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("rendezvous_client=debug,rendezvous_store=info,warn")
    });

    let installed = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .try_init();

    if installed.is_ok() {
        tracing::info!("Rendezvous client logging initialised");
    }
}
