//! Applies realtime broadcast events to the local store.
//!
//! Each handler is idempotent and runs in its own transaction.  None of them
//! returns an error: a failure is logged and reported as
//! [`ReconcileOutcome::Failed`], because an error escaping into the realtime
//! subscription would tear it down.

use std::sync::Arc;

use futures::{Stream, StreamExt};
use serde::Deserialize;

use rendezvous_shared::SyncStatus;
use rendezvous_store::{Chat, MatchPatch, Message};

use crate::error::ClientError;
use crate::events::ClientEvent;
use crate::state::AppContext;
use crate::sync::SyncEngine;

/// Payloads delivered on a chat's realtime channel.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RealtimeEvent {
    NewMessage {
        message: Message,
    },
    MatchUpdate {
        match_id: String,
        #[serde(flatten)]
        patch: MatchPatch,
    },
    NewChat {
        chat: Chat,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Applied,
    /// Already present locally; nothing written.
    Duplicate,
    /// Not for us to apply (own message, unknown match).
    Ignored,
    /// Parent row missing; a corrective sync was requested.
    Deferred,
    Failed,
}

pub struct Reconciler {
    ctx: Arc<AppContext>,
    sync: SyncEngine,
}

impl Reconciler {
    pub fn new(ctx: Arc<AppContext>, sync: SyncEngine) -> Self {
        Self { ctx, sync }
    }

    /// Drive `events` until the stream ends.  Returns how many were handled.
    pub async fn pump<S>(&self, events: S) -> usize
    where
        S: Stream<Item = RealtimeEvent>,
    {
        futures::pin_mut!(events);
        let mut handled = 0;
        while let Some(event) = events.next().await {
            self.dispatch(event);
            handled += 1;
        }
        tracing::info!(handled, "realtime stream ended");
        handled
    }

    pub fn dispatch(&self, event: RealtimeEvent) -> ReconcileOutcome {
        match event {
            RealtimeEvent::NewMessage { message } => self.handle_new_message(message),
            RealtimeEvent::MatchUpdate { match_id, patch } => {
                self.handle_match_update(&match_id, &patch)
            }
            RealtimeEvent::NewChat { chat } => self.handle_new_chat(chat),
        }
    }

    pub fn handle_new_message(&self, message: Message) -> ReconcileOutcome {
        if message.sender_id == self.ctx.user_id() {
            return ReconcileOutcome::Ignored;
        }

        let result = self.ctx.with_db(|db| {
            db.write(|w| {
                if !w.chat_exists(&message.chat_id)? {
                    return Ok(ReconcileOutcome::Deferred);
                }
                if w.message_exists(&message.id)? {
                    return Ok(ReconcileOutcome::Duplicate);
                }
                w.insert_message(&message, SyncStatus::Synced)?;
                w.bump_chat_last_message(
                    &message.chat_id,
                    &message.content,
                    message.created_at,
                    message.read_at.is_none(),
                )?;
                Ok(ReconcileOutcome::Applied)
            })
        });

        match result {
            Ok(ReconcileOutcome::Applied) => {
                tracing::debug!(id = %message.id, chat_id = %message.chat_id, "message received");
                self.ctx.events().emit(ClientEvent::MessageReceived {
                    chat_id: message.chat_id,
                    message_id: message.id,
                });
                ReconcileOutcome::Applied
            }
            Ok(ReconcileOutcome::Deferred) => {
                tracing::warn!(
                    id = %message.id,
                    chat_id = %message.chat_id,
                    "message for unknown chat, scheduling full sync"
                );
                self.sync.spawn_sync();
                ReconcileOutcome::Deferred
            }
            Ok(outcome) => outcome,
            Err(ClientError::Store(e)) if e.is_unique_violation() => {
                // Raced with the pull path.  Keep the preview current anyway.
                let bumped = self.ctx.with_db(|db| {
                    db.write(|w| {
                        w.bump_chat_last_message(
                            &message.chat_id,
                            &message.content,
                            message.created_at,
                            false,
                        )
                    })
                });
                if let Err(e) = bumped {
                    tracing::debug!(
                        chat_id = %message.chat_id,
                        error = %e,
                        "chat preview update after duplicate failed"
                    );
                }
                ReconcileOutcome::Duplicate
            }
            Err(e) => {
                tracing::warn!(id = %message.id, error = %e, "failed to apply realtime message");
                ReconcileOutcome::Failed
            }
        }
    }

    pub fn handle_match_update(&self, match_id: &str, patch: &MatchPatch) -> ReconcileOutcome {
        match self.ctx.with_db(|db| db.write(|w| w.patch_match(match_id, patch))) {
            Ok(true) => {
                self.ctx.events().emit(ClientEvent::MatchUpdated {
                    match_id: match_id.to_string(),
                });
                ReconcileOutcome::Applied
            }
            Ok(false) => {
                tracing::debug!(match_id, "update for unknown match, skipped");
                ReconcileOutcome::Ignored
            }
            Err(e) => {
                tracing::warn!(match_id, error = %e, "failed to apply match update");
                ReconcileOutcome::Failed
            }
        }
    }

    pub fn handle_new_chat(&self, chat: Chat) -> ReconcileOutcome {
        match self.ctx.with_db(|db| db.write(|w| w.insert_chat_if_absent(&chat))) {
            Ok(true) => {
                self.ctx
                    .events()
                    .emit(ClientEvent::ChatCreated { chat_id: chat.id });
                ReconcileOutcome::Applied
            }
            Ok(false) => ReconcileOutcome::Duplicate,
            Err(e) => {
                tracing::warn!(chat_id = %chat.id, error = %e, "failed to create chat");
                ReconcileOutcome::Failed
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use rendezvous_shared::MatchStatus;
    use rendezvous_store::ChangeSet;

    use super::*;
    use crate::test_support::{sample_chat, sample_match, sample_message, test_context, FakeRemote};

    fn setup() -> (Arc<FakeRemote>, Arc<AppContext>, Reconciler) {
        let remote = FakeRemote::new();
        let ctx = test_context(remote.clone());
        let sync = SyncEngine::new(ctx.clone());
        let reconciler = Reconciler::new(ctx.clone(), sync);
        (remote, ctx, reconciler)
    }

    fn unread(ctx: &AppContext) -> u32 {
        ctx.with_db(|db| db.get_chat("c1")).unwrap().unread_count
    }

    #[test]
    fn own_messages_are_ignored() {
        let (_, ctx, r) = setup();
        r.handle_new_chat(sample_chat("c1"));
        let own = sample_message("m1", "c1", ctx.user_id());
        assert_eq!(r.handle_new_message(own), ReconcileOutcome::Ignored);
        assert!(ctx.with_db(|db| db.messages_for_chat("c1")).unwrap().is_empty());
    }

    #[test]
    fn duplicate_broadcast_counts_once() {
        let (_, ctx, r) = setup();
        r.handle_new_chat(sample_chat("c1"));

        let msg = sample_message("m1", "c1", "them");
        assert_eq!(r.handle_new_message(msg.clone()), ReconcileOutcome::Applied);
        assert_eq!(r.handle_new_message(msg), ReconcileOutcome::Duplicate);
        assert_eq!(unread(&ctx), 1);
    }

    #[tokio::test]
    async fn broadcast_then_pull_converges() {
        let (remote, ctx, r) = setup();
        r.handle_new_chat(sample_chat("c1"));

        let msg = sample_message("m1", "c1", "them");
        r.handle_new_message(msg.clone());

        let mut changes = ChangeSet::default();
        changes.messages.created.push(msg);
        remote.set_pull(changes, 10);
        SyncEngine::new(ctx.clone()).sync().await.unwrap();

        assert_eq!(ctx.with_db(|db| db.messages_for_chat("c1")).unwrap().len(), 1);
        assert_eq!(unread(&ctx), 1);
    }

    #[tokio::test]
    async fn pull_then_broadcast_converges() {
        let (remote, ctx, r) = setup();
        r.handle_new_chat(sample_chat("c1"));

        let msg = sample_message("m1", "c1", "them");
        let mut changes = ChangeSet::default();
        changes.messages.created.push(msg.clone());
        remote.set_pull(changes, 10);
        SyncEngine::new(ctx.clone()).sync().await.unwrap();

        assert_eq!(r.handle_new_message(msg), ReconcileOutcome::Duplicate);
        assert_eq!(ctx.with_db(|db| db.messages_for_chat("c1")).unwrap().len(), 1);
        assert_eq!(unread(&ctx), 1);
    }

    #[tokio::test]
    async fn message_for_unknown_chat_defers_to_sync() {
        let (remote, ctx, r) = setup();
        let outcome = r.handle_new_message(sample_message("m1", "nope", "them"));
        assert_eq!(outcome, ReconcileOutcome::Deferred);

        // Let the spawned corrective sync run.
        for _ in 0..50 {
            if remote.pull_count() > 0 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert_eq!(remote.pull_count(), 1);
        assert!(ctx.with_db(|db| db.messages_for_chat("nope")).unwrap().is_empty());
    }

    #[test]
    fn match_update_applies_or_skips() {
        let (_, ctx, r) = setup();
        let patch = MatchPatch {
            status: Some(MatchStatus::Unmatched),
            ..Default::default()
        };
        assert_eq!(r.handle_match_update("m1", &patch), ReconcileOutcome::Ignored);

        ctx.with_db(|db| db.write(|w| w.upsert_match(&sample_match("m1"), SyncStatus::Synced)))
            .unwrap();
        assert_eq!(r.handle_match_update("m1", &patch), ReconcileOutcome::Applied);
        assert_eq!(
            ctx.with_db(|db| db.get_match("m1")).unwrap().status,
            MatchStatus::Unmatched
        );
    }

    #[tokio::test]
    async fn pump_handles_tagged_json_events() {
        let (_, ctx, r) = setup();
        let raw = [
            serde_json::json!({ "type": "new_chat", "chat": sample_chat("c1") }),
            serde_json::json!({ "type": "new_message", "message": sample_message("m1", "c1", "them") }),
            serde_json::json!({ "type": "match_update", "match_id": "zzz", "status": "unmatched" }),
        ];
        let events: Vec<RealtimeEvent> = raw
            .into_iter()
            .map(|v| serde_json::from_value(v).unwrap())
            .collect();

        let handled = r.pump(futures::stream::iter(events)).await;
        assert_eq!(handled, 3);
        assert_eq!(unread(&ctx), 1);
    }
}
