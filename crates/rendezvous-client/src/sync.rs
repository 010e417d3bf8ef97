//! Bidirectional sync with the backend.
//!
//! One cycle pulls the server's changes since the last checkpoint, drops
//! messages already delivered by the realtime path, applies the rest in one
//! transaction and then pushes local pending changes.  A checkpoint is only
//! persisted once the step it describes has fully succeeded, so a failed
//! cycle is retried from where the last good one ended.
//!
//! [`SyncEngine::sync`] is non-reentrant: callers arriving while a cycle runs
//! await that same cycle and receive its outcome.

use std::sync::{Arc, Mutex};
use std::time::Instant;

use futures::future::{BoxFuture, FutureExt, Shared};
use serde::Serialize;
use tokio::task::JoinHandle;

use rendezvous_store::{ApplyStats, Table};

use crate::error::{ClientError, Result};
use crate::events::ClientEvent;
use crate::remote::{PullRequest, PushRequest};
use crate::state::AppContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    Idle,
    Pulling,
    Applying,
    Pushing,
}

/// Summary of one completed cycle.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SyncReport {
    /// Rows in the pulled changeset, before dedupe.
    pub pulled: usize,
    /// Created messages dropped because they already existed locally.
    pub deduped: usize,
    pub applied: ApplyStats,
    /// Rows sent to the push endpoint.
    pub pushed: usize,
    /// Pull checkpoint now persisted.
    pub timestamp: i64,
    pub duration_ms: u64,
}

/// Shared by every caller of one cycle; the error is behind an `Arc` so it
/// can be handed to all of them.
pub type SyncOutcome = std::result::Result<SyncReport, Arc<ClientError>>;

type InFlight = Shared<BoxFuture<'static, SyncOutcome>>;

#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<Inner>,
}

struct Inner {
    ctx: Arc<AppContext>,
    phase: Mutex<SyncPhase>,
    in_flight: Mutex<Option<InFlight>>,
}

impl SyncEngine {
    pub fn new(ctx: Arc<AppContext>) -> Self {
        Self {
            inner: Arc::new(Inner {
                ctx,
                phase: Mutex::new(SyncPhase::Idle),
                in_flight: Mutex::new(None),
            }),
        }
    }

    pub fn phase(&self) -> SyncPhase {
        *self.inner.phase.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn is_running(&self) -> bool {
        self.phase() != SyncPhase::Idle
    }

    /// Run a cycle, or join the one already running.
    pub async fn sync(&self) -> SyncOutcome {
        let cycle = {
            let mut slot = self.inner.in_flight.lock().unwrap_or_else(|p| p.into_inner());
            match slot.as_ref() {
                Some(running) => {
                    tracing::debug!("sync already running, joining it");
                    running.clone()
                }
                None => {
                    let engine = self.clone();
                    let cycle = async move {
                        let outcome = engine.run_cycle().await.map_err(Arc::new);
                        engine.finish(&outcome);
                        outcome
                    }
                    .boxed()
                    .shared();
                    *slot = Some(cycle.clone());
                    cycle
                }
            }
        };
        cycle.await
    }

    /// Fire-and-forget sync, used to self-heal after a realtime miss.
    pub fn spawn_sync(&self) -> Option<JoinHandle<()>> {
        let engine = self.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => Some(handle.spawn(async move {
                let _ = engine.sync().await;
            })),
            Err(_) => {
                tracing::warn!("no async runtime, corrective sync skipped");
                None
            }
        }
    }

    fn set_phase(&self, phase: SyncPhase) {
        *self.inner.phase.lock().unwrap_or_else(|p| p.into_inner()) = phase;
    }

    fn finish(&self, outcome: &SyncOutcome) {
        self.set_phase(SyncPhase::Idle);
        self.inner
            .in_flight
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();

        let ctx = &self.inner.ctx;
        match outcome {
            Ok(report) => {
                tracing::info!(
                    pulled = report.pulled,
                    deduped = report.deduped,
                    applied = report.applied.applied(),
                    pushed = report.pushed,
                    duration_ms = report.duration_ms,
                    "sync completed"
                );
                ctx.events().emit(ClientEvent::SyncCompleted {
                    pulled: report.pulled,
                    pushed: report.pushed,
                    timestamp: report.timestamp,
                });
            }
            Err(e) => {
                tracing::error!(error = %e, "sync failed");
                ctx.events().emit(ClientEvent::SyncFailed {
                    error: e.to_string(),
                });
            }
        }
    }

    async fn run_cycle(&self) -> Result<SyncReport> {
        let ctx = &self.inner.ctx;
        let started = Instant::now();
        let mut report = SyncReport::default();

        // -- Pull --
        self.set_phase(SyncPhase::Pulling);
        let checkpoints = ctx.checkpoints().load()?;
        let last_pulled_at = match checkpoints.last_pulled_at {
            Some(ts) => Some(ts),
            None => ctx.remote().server_checkpoint().await?,
        };

        let (local_chat_ids, local_match_ids) = ctx.with_db(|db| {
            Ok((db.local_ids(Table::Chats)?, db.local_ids(Table::Matches)?))
        })?;
        tracing::debug!(?last_pulled_at, chats = local_chat_ids.len(), "pulling changes");

        let pulled = ctx
            .remote()
            .pull(&PullRequest {
                last_pulled_at,
                local_chat_ids,
                local_match_ids,
            })
            .await?;
        report.pulled = pulled.changes.len();
        report.timestamp = pulled.timestamp;

        // -- Dedupe and apply --
        self.set_phase(SyncPhase::Applying);
        let mut changes = pulled.changes;
        let user_id = ctx.user_id();
        let (deduped, applied) = ctx.with_db(|db| {
            let existing = db.existing_message_ids(changes.created_message_ids())?;
            let deduped = changes.dedupe_messages(&existing);
            let applied = db.write(|w| w.apply_changeset(&changes, user_id))?;
            Ok((deduped, applied))
        })?;
        report.deduped = deduped;
        report.applied = applied;
        ctx.checkpoints().record_pull(pulled.timestamp)?;

        // -- Push --
        self.set_phase(SyncPhase::Pushing);
        let pending = ctx.with_db(|db| db.pending_changes())?;
        if pending.is_empty() {
            tracing::debug!("nothing to push");
        } else {
            let response = ctx
                .remote()
                .push(&PushRequest {
                    changes: pending.clone(),
                    last_pulled_at: Some(pulled.timestamp),
                })
                .await?;
            ctx.with_db(|db| db.write(|w| w.mark_pushed(&pending)))?;
            ctx.checkpoints().record_push(response.timestamp)?;
            report.pushed = pending.len();
        }

        report.duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        Ok(report)
    }
}
