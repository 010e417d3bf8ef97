//! User actions on chats and matches.
//!
//! Outgoing messages are written locally first with a client `temp_id` and
//! status `pending`, then sent through [`Remote::send_message`].  The row is
//! re-keyed to the server id once the server accepts it.  Everything else
//! here is a local edit that the next sync pushes.
//!
//! [`Remote::send_message`]: crate::remote::Remote::send_message

use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use rendezvous_shared::{MessageStatus, SyncStatus};
use rendezvous_store::{Message, StoreError, Table};

use crate::error::{ClientError, Result};
use crate::events::ClientEvent;
use crate::remote::SendMessageRequest;
use crate::state::AppContext;

pub struct Messenger {
    ctx: Arc<AppContext>,
}

impl Messenger {
    pub fn new(ctx: Arc<AppContext>) -> Self {
        Self { ctx }
    }

    /// Write the message locally and send it.
    ///
    /// A failed send is not an error: the returned row has status `failed`
    /// and can be passed to [`Messenger::retry_message`].
    pub async fn send_message(&self, chat_id: &str, content: &str) -> Result<Message> {
        let content = content.trim();
        if content.is_empty() {
            return Err(ClientError::InvalidRequest("message is empty".into()));
        }

        let temp_id = Uuid::new_v4().to_string();
        let message = Message {
            id: temp_id.clone(),
            chat_id: chat_id.to_string(),
            sender_id: self.ctx.user_id().to_string(),
            content: content.to_string(),
            created_at: Utc::now(),
            read_at: None,
            status: MessageStatus::Pending,
            temp_id: Some(temp_id),
            synced_at: None,
            sync_status: SyncStatus::Created,
        };

        self.ctx.with_db(|db| {
            db.write(|w| {
                if !w.chat_exists(chat_id)? {
                    return Err(StoreError::NotFound);
                }
                w.insert_message(&message, SyncStatus::Created)?;
                w.bump_chat_last_message(chat_id, &message.content, message.created_at, false)?;
                Ok(())
            })
        })?;

        self.deliver(message).await
    }

    /// Send a failed message again under its original `temp_id`.
    pub async fn retry_message(&self, id: &str) -> Result<Message> {
        let message = self.ctx.with_db(|db| db.get_message(id))?;
        if message.status != MessageStatus::Failed {
            return Err(ClientError::InvalidRequest(format!(
                "message {id} is {}, not failed",
                message.status
            )));
        }

        self.ctx
            .with_db(|db| db.write(|w| w.set_message_status(id, MessageStatus::Pending)))?;
        self.deliver(Message {
            status: MessageStatus::Pending,
            ..message
        })
        .await
    }

    /// Drop a message that never reached the server.
    pub fn delete_failed_message(&self, id: &str) -> Result<bool> {
        let message = self.ctx.with_db(|db| db.get_message(id))?;
        if message.status != MessageStatus::Failed {
            return Err(ClientError::InvalidRequest(format!(
                "message {id} is {}, not failed",
                message.status
            )));
        }
        Ok(self
            .ctx
            .with_db(|db| db.write(|w| w.tombstone(Table::Messages, id)))?)
    }

    /// Zero the chat's unread counter and mark inbound messages read.
    /// Returns how many messages were marked.
    pub fn mark_chat_read(&self, chat_id: &str) -> Result<usize> {
        let user_id = self.ctx.user_id();
        let marked = self.ctx.with_db(|db| {
            db.write(|w| {
                w.clear_chat_unread(chat_id)?;
                w.mark_inbound_read(chat_id, user_id, Utc::now())
            })
        })?;
        if marked > 0 {
            tracing::debug!(chat_id, marked, "chat marked read");
        }
        Ok(marked)
    }

    /// Record that the local user opened the match.  Only the first call
    /// has an effect.
    pub fn mark_match_opened(&self, match_id: &str) -> Result<bool> {
        let user_id = self.ctx.user_id();
        Ok(self
            .ctx
            .with_db(|db| db.write(|w| w.mark_match_opened(match_id, user_id, Utc::now())))?)
    }

    pub fn unmatch(&self, match_id: &str) -> Result<bool> {
        let changed = self
            .ctx
            .with_db(|db| db.write(|w| w.unmatch(match_id, Utc::now())))?;
        if changed {
            tracing::info!(match_id, "unmatched");
            self.ctx.events().emit(ClientEvent::MatchUpdated {
                match_id: match_id.to_string(),
            });
        }
        Ok(changed)
    }

    async fn deliver(&self, message: Message) -> Result<Message> {
        let temp_id = message.id.clone();
        let request = SendMessageRequest {
            chat_id: message.chat_id.clone(),
            content: message.content.clone(),
            temp_id: temp_id.clone(),
        };

        match self.ctx.remote().send_message(&request).await {
            Ok(resp) => {
                let stored = self.ctx.with_db(|db| {
                    db.write(|w| w.confirm_message(&temp_id, &resp.id, resp.created_at))?;
                    db.get_message(&resp.id)
                })?;
                tracing::debug!(message_id = %resp.id, temp_id = %temp_id, "message sent");
                self.ctx.events().emit(ClientEvent::MessageSent {
                    message_id: resp.id,
                    temp_id,
                });
                Ok(stored)
            }
            Err(e) => {
                tracing::warn!(temp_id = %temp_id, error = %e, "message send failed");
                self.ctx.with_db(|db| {
                    db.write(|w| w.set_message_status(&temp_id, MessageStatus::Failed))
                })?;
                self.ctx.events().emit(ClientEvent::MessageFailed {
                    message_id: temp_id,
                });
                Ok(Message {
                    status: MessageStatus::Failed,
                    ..message
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use rendezvous_shared::MatchStatus;

    use super::*;
    use crate::test_support::{sample_chat, sample_match, sample_message, test_context, FakeRemote};

    fn context_with_chat(remote: Arc<FakeRemote>) -> Arc<AppContext> {
        let ctx = test_context(remote);
        ctx.with_db(|db| db.write(|w| w.upsert_chat(&sample_chat("c1"), SyncStatus::Synced)))
            .unwrap();
        ctx
    }

    #[tokio::test]
    async fn sent_message_is_rekeyed_to_server_id() {
        let remote = FakeRemote::new();
        remote.set_send_response("srv-1");
        let ctx = context_with_chat(remote.clone());
        let messenger = Messenger::new(ctx.clone());

        let sent = messenger.send_message("c1", " hi there ").await.unwrap();
        assert_eq!(sent.id, "srv-1");
        assert_eq!(sent.status, MessageStatus::Sent);
        assert_eq!(sent.content, "hi there");

        let temp_id = remote.send_requests()[0].temp_id.clone();
        assert_eq!(sent.temp_id.as_deref(), Some(temp_id.as_str()));

        let rows = ctx.with_db(|db| db.messages_for_chat("c1")).unwrap();
        assert_eq!(rows.len(), 1);
        let chat = ctx.with_db(|db| db.get_chat("c1")).unwrap();
        assert_eq!(chat.last_message_content.as_deref(), Some("hi there"));
        assert_eq!(chat.unread_count, 0);
        assert!(ctx.with_db(|db| db.pending_changes()).unwrap().messages.is_empty());
    }

    #[tokio::test]
    async fn failed_send_can_be_retried() {
        let remote = FakeRemote::new();
        remote.set_offline(true);
        let ctx = context_with_chat(remote.clone());
        let messenger = Messenger::new(ctx.clone());
        let mut events = ctx.events().subscribe();

        let failed = messenger.send_message("c1", "hello").await.unwrap();
        assert_eq!(failed.status, MessageStatus::Failed);
        assert_eq!(
            events.recv().await.unwrap(),
            ClientEvent::MessageFailed {
                message_id: failed.id.clone()
            }
        );
        assert_eq!(ctx.with_db(|db| db.failed_messages()).unwrap().len(), 1);
        // Failed sends never go out through push.
        assert!(ctx.with_db(|db| db.pending_changes()).unwrap().messages.is_empty());

        remote.set_offline(false);
        remote.set_send_response("srv-2");
        let sent = messenger.retry_message(&failed.id).await.unwrap();
        assert_eq!(sent.id, "srv-2");
        assert_eq!(remote.send_requests()[1].temp_id, failed.id);
        assert!(ctx.with_db(|db| db.failed_messages()).unwrap().is_empty());

        let err = messenger.retry_message("srv-2").await.unwrap_err();
        assert!(matches!(err, ClientError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn failed_message_can_be_deleted() {
        let remote = FakeRemote::new();
        remote.set_offline(true);
        let ctx = context_with_chat(remote);
        let messenger = Messenger::new(ctx.clone());

        let failed = messenger.send_message("c1", "hello").await.unwrap();
        assert!(messenger.delete_failed_message(&failed.id).unwrap());
        assert!(ctx.with_db(|db| db.messages_for_chat("c1")).unwrap().is_empty());
    }

    #[tokio::test]
    async fn send_to_unknown_chat_is_rejected() {
        let messenger = Messenger::new(test_context(FakeRemote::new()));
        let err = messenger.send_message("nope", "hi").await.unwrap_err();
        assert!(matches!(err, ClientError::Store(StoreError::NotFound)));

        let err = messenger.send_message("nope", "   ").await.unwrap_err();
        assert!(matches!(err, ClientError::InvalidRequest(_)));
    }

    #[test]
    fn mark_chat_read_touches_only_inbound() {
        let ctx = context_with_chat(FakeRemote::new());
        ctx.with_db(|db| {
            db.write(|w| {
                w.insert_message(&sample_message("in-1", "c1", "them"), SyncStatus::Synced)?;
                w.insert_message(&sample_message("in-2", "c1", "them"), SyncStatus::Synced)?;
                w.insert_message(&sample_message("out-1", "c1", "me"), SyncStatus::Synced)?;
                w.bump_chat_last_message("c1", "x", Utc::now(), true)?;
                Ok(())
            })
        })
        .unwrap();

        let messenger = Messenger::new(ctx.clone());
        assert_eq!(messenger.mark_chat_read("c1").unwrap(), 2);
        assert_eq!(messenger.mark_chat_read("c1").unwrap(), 0);

        assert_eq!(ctx.with_db(|db| db.get_chat("c1")).unwrap().unread_count, 0);
        let out = ctx.with_db(|db| db.get_message("out-1")).unwrap();
        assert!(out.read_at.is_none());
        let pending = ctx.with_db(|db| db.pending_changes()).unwrap();
        assert_eq!(pending.messages.updated.len(), 2);
        assert_eq!(pending.chats.updated.len(), 1);
    }

    #[test]
    fn open_and_unmatch_are_pending_push() {
        let ctx = test_context(FakeRemote::new());
        ctx.with_db(|db| db.write(|w| w.upsert_match(&sample_match("m1"), SyncStatus::Synced)))
            .unwrap();
        let messenger = Messenger::new(ctx.clone());

        assert!(messenger.mark_match_opened("m1").unwrap());
        assert!(!messenger.mark_match_opened("m1").unwrap());
        assert!(messenger.unmatch("m1").unwrap());
        assert!(!messenger.unmatch("m1").unwrap());

        let m = ctx.with_db(|db| db.get_match("m1")).unwrap();
        assert!(m.user_a_opened_at.is_some());
        assert_eq!(m.status, MatchStatus::Unmatched);
        let pending = ctx.with_db(|db| db.pending_changes()).unwrap();
        assert_eq!(pending.matches.updated.len(), 1);
    }
}
