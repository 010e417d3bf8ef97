//! Offline swipe queue.
//!
//! A swipe is written to the durable queue before anything else happens, so
//! it survives going offline or a restart.  Delivery is attempted right away
//! and again on every [`SwipeQueue::flush`]; an entry leaves the queue only
//! once the server has accepted it.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use uuid::Uuid;

use rendezvous_shared::SwipeAction;
use rendezvous_store::SwipeQueueEntry;

use crate::error::Result;
use crate::events::ClientEvent;
use crate::remote::{InteractRequest, InteractResponse};
use crate::state::AppContext;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SwipeOutcome {
    /// Stored locally; the server has not confirmed it yet.
    Queued,
    Delivered { match_id: Option<String> },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FlushReport {
    pub sent: usize,
    pub failed: usize,
    /// Skipped because a swipe on the same target was in flight.
    pub skipped: usize,
    pub matches: Vec<String>,
}

#[derive(Clone)]
pub struct SwipeQueue {
    ctx: Arc<AppContext>,
}

impl SwipeQueue {
    pub fn new(ctx: Arc<AppContext>) -> Self {
        Self { ctx }
    }

    /// Durably append a swipe.  An earlier unsent swipe on the same target
    /// is replaced: the last decision wins.
    pub fn enqueue(
        &self,
        target_user_id: &str,
        action: SwipeAction,
        place_id: &str,
        context: Option<serde_json::Value>,
    ) -> Result<SwipeQueueEntry> {
        let entry = new_entry(target_user_id, action, place_id, context);
        let replaced = self.ctx.with_db(|db| db.enqueue_swipe(&entry))?;
        if replaced > 0 {
            tracing::debug!(target = target_user_id, replaced, "replaced queued swipe");
        }
        Ok(entry)
    }

    /// Record a swipe and try to deliver it.
    ///
    /// The card disappears from the feed immediately.  A delivery failure is
    /// not an error: the swipe stays queued for the next flush.
    pub async fn swipe(
        &self,
        target_user_id: &str,
        action: SwipeAction,
        place_id: &str,
        context: Option<serde_json::Value>,
    ) -> Result<SwipeOutcome> {
        let _claim = self.ctx.begin_swipe(target_user_id)?;

        let entry = new_entry(target_user_id, action, place_id, context);
        self.ctx.with_db(|db| {
            db.write(|w| {
                w.enqueue_swipe(&entry)?;
                w.delete_discovery_for_user(target_user_id)
            })
        })?;
        self.ctx.mark_acted(target_user_id);
        tracing::info!(target = target_user_id, action = %action, "swipe queued");

        match self.deliver(&entry).await {
            Ok(resp) => Ok(SwipeOutcome::Delivered {
                match_id: resp.matched.map(|m| m.id),
            }),
            Err(_) => Ok(SwipeOutcome::Queued),
        }
    }

    /// Try to deliver every queued swipe, oldest first.  Failed entries stay
    /// queued; the others are removed.
    pub async fn flush(&self) -> Result<FlushReport> {
        let entries = self.ctx.with_db(|db| db.list_swipe_queue())?;
        let mut report = FlushReport::default();

        for entry in entries {
            // Held across delivery so a concurrent swipe on the target is refused.
            let Ok(_claim) = self.ctx.begin_swipe(&entry.target_user_id) else {
                report.skipped += 1;
                continue;
            };
            match self.deliver(&entry).await {
                Ok(resp) => {
                    report.sent += 1;
                    if let Some(m) = resp.matched {
                        report.matches.push(m.id);
                    }
                }
                Err(_) => report.failed += 1,
            }
        }

        if report.sent + report.failed > 0 {
            tracing::info!(sent = report.sent, failed = report.failed, "swipe queue flushed");
        }
        Ok(report)
    }

    pub fn pending(&self) -> Result<Vec<SwipeQueueEntry>> {
        self.ctx.with_db(|db| db.list_swipe_queue())
    }

    async fn deliver(&self, entry: &SwipeQueueEntry) -> Result<InteractResponse> {
        let request = InteractRequest {
            target_user_id: entry.target_user_id.clone(),
            action: entry.action,
            place_id: entry.place_id.clone(),
            context: entry.context.clone(),
        };

        let resp = match self.ctx.remote().interact(&request).await {
            Ok(resp) => resp,
            Err(e) => {
                tracing::warn!(
                    target = %entry.target_user_id,
                    attempts = entry.attempts + 1,
                    error = %e,
                    "swipe delivery failed"
                );
                self.ctx
                    .with_db(|db| db.write(|w| w.record_swipe_failure(&entry.id, &e.to_string())))?;
                return Err(e);
            }
        };

        let matched = resp.matched.clone();
        self.ctx.with_db(|db| {
            db.write(|w| {
                w.remove_swipe(&entry.id)?;
                if let Some(m) = &matched {
                    w.insert_match_if_absent(m)?;
                    w.remove_liker(&entry.target_user_id)?;
                }
                Ok(())
            })
        })?;

        if let Some(m) = matched {
            tracing::info!(match_id = %m.id, instant = resp.instant_match, "match created");
            self.ctx.events().emit(ClientEvent::MatchCreated {
                match_id: m.id.clone(),
                other_user_id: Some(entry.target_user_id.clone()),
                instant: resp.instant_match,
            });
            if resp.instant_match {
                self.ctx.set_pending_match(m);
            }
        }
        Ok(resp)
    }
}

fn new_entry(
    target_user_id: &str,
    action: SwipeAction,
    place_id: &str,
    context: Option<serde_json::Value>,
) -> SwipeQueueEntry {
    SwipeQueueEntry {
        id: Uuid::new_v4().to_string(),
        target_user_id: target_user_id.to_string(),
        action,
        place_id: place_id.to_string(),
        context,
        created_at: Utc::now(),
        attempts: 0,
        last_error: None,
    }
}
