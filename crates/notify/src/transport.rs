//! Stream transport — lifecycle of one long-lived push connection.
//!
//! Each connection moves `Connecting → Streaming → Closed`, terminal; a
//! reconnect gets a fresh connection id. Connect order matters: the
//! connection registers *before* the backlog query, so events published
//! during the flush land in its live queue, and the overlap between the two
//! is deduplicated by notification id when the stream is assembled.
//!
//! The returned stream owns the registry slot via a drop-guard: however the
//! connection ends (client close, write failure, server shutdown), dropping
//! the stream unregisters it and releases the queue.

use std::collections::HashSet;
use std::sync::Arc;

use futures::stream::{self, Stream, StreamExt};
use sqlx::PgPool;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use uuid::Uuid;

use crewflow_common::error::AppError;
use crewflow_common::types::{Envelope, Role};

use crate::registry::SubscriptionRegistry;
use crate::store::{ListOptions, NotificationStore};

/// Per-connection state machine. Terminal once `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Streaming,
    Closed,
}

/// Releases the registry slot when the stream is dropped.
struct ConnectionGuard {
    connection_id: Uuid,
    registry: Arc<SubscriptionRegistry>,
}

impl ConnectionGuard {
    fn touch(&self) {
        self.registry.touch(self.connection_id);
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.registry.unregister(self.connection_id);
        tracing::debug!(
            connection_id = %self.connection_id,
            state = ?ConnectionState::Closed,
            "Stream closed"
        );
    }
}

/// An established subscriber connection: flushed backlog plus the live queue.
pub struct StreamSession {
    pub connection_id: Uuid,
    backlog: Vec<Envelope>,
    live: broadcast::Receiver<Envelope>,
    guard: ConnectionGuard,
}

impl StreamSession {
    /// Register the connection and load its unread backlog.
    ///
    /// The identity snapshot (`user_id`, `roles`) comes verified from the
    /// auth layer and is not re-evaluated for the connection's lifetime.
    pub async fn connect(
        pool: &PgPool,
        registry: Arc<SubscriptionRegistry>,
        user_id: Uuid,
        roles: &[Role],
        backlog_limit: i64,
    ) -> Result<Self, AppError> {
        let connection_id = Uuid::new_v4();
        tracing::debug!(
            connection_id = %connection_id,
            user_id = %user_id,
            state = ?ConnectionState::Connecting,
            "Stream connecting"
        );

        let live = registry.register(connection_id, user_id, roles);
        let guard = ConnectionGuard {
            connection_id,
            registry,
        };

        // Newest-first from the store; the flush pushes oldest-first.
        let rows = NotificationStore::list_for_recipient(
            pool,
            user_id,
            roles,
            &ListOptions {
                only_unread: true,
                since: None,
                limit: Some(backlog_limit),
            },
        )
        .await?;
        let backlog: Vec<Envelope> = rows.iter().rev().map(Envelope::from).collect();

        tracing::info!(
            connection_id = %connection_id,
            user_id = %user_id,
            backlog = backlog.len(),
            state = ?ConnectionState::Streaming,
            "Stream established"
        );

        Ok(Self {
            connection_id,
            backlog,
            live,
            guard,
        })
    }

    /// Assemble the outbound stream: backlog oldest-first, then live
    /// envelopes in enqueue order. Dropping the stream tears the connection
    /// down.
    pub fn into_stream(self) -> impl Stream<Item = Envelope> + Send {
        let Self {
            connection_id,
            backlog,
            live,
            guard,
        } = self;

        let flushed: HashSet<Uuid> = backlog.iter().map(|e| e.id).collect();

        let live = BroadcastStream::new(live).filter_map(move |item| {
            let next = match item {
                // Published during the flush and already delivered from the
                // backlog.
                Ok(envelope) if flushed.contains(&envelope.id) => None,
                Ok(envelope) => Some(envelope),
                Err(BroadcastStreamRecvError::Lagged(dropped)) => {
                    tracing::warn!(
                        connection_id = %connection_id,
                        dropped,
                        "Slow consumer; dropped oldest queued envelopes"
                    );
                    None
                }
            };
            futures::future::ready(next)
        });

        stream::iter(backlog).chain(live).map(move |envelope| {
            guard.touch();
            envelope
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use crewflow_common::types::NotificationKind;

    fn envelope(message: &str) -> Envelope {
        Envelope {
            id: Uuid::new_v4(),
            kind: NotificationKind::TaskAssigned,
            message: message.to_string(),
            payload: serde_json::json!({}),
            created_at: Utc::now(),
        }
    }

    fn session_with_backlog(
        registry: &Arc<SubscriptionRegistry>,
        backlog: Vec<Envelope>,
    ) -> StreamSession {
        let connection_id = Uuid::new_v4();
        let live = registry.register(connection_id, Uuid::new_v4(), &[Role::Employee]);
        StreamSession {
            connection_id,
            backlog,
            live,
            guard: ConnectionGuard {
                connection_id,
                registry: registry.clone(),
            },
        }
    }

    #[tokio::test]
    async fn test_backlog_flushed_before_live() {
        let registry = Arc::new(SubscriptionRegistry::new(16));
        let backlog = vec![envelope("old-1"), envelope("old-2")];
        let session = session_with_backlog(&registry, backlog);
        let connection_id = session.connection_id;

        registry.send_to(connection_id, envelope("live-1"));

        let received: Vec<Envelope> = session.into_stream().take(3).collect().await;
        assert_eq!(received[0].message, "old-1");
        assert_eq!(received[1].message, "old-2");
        assert_eq!(received[2].message, "live-1");
    }

    #[tokio::test]
    async fn test_live_duplicate_of_backlog_filtered() {
        let registry = Arc::new(SubscriptionRegistry::new(16));
        let duplicated = envelope("raced-the-flush");
        let session = session_with_backlog(&registry, vec![duplicated.clone()]);
        let connection_id = session.connection_id;

        registry.send_to(connection_id, duplicated.clone());
        registry.send_to(connection_id, envelope("fresh"));

        let received: Vec<Envelope> = session.into_stream().take(2).collect().await;
        assert_eq!(received[0].message, "raced-the-flush");
        assert_eq!(received[1].message, "fresh");
    }

    #[tokio::test]
    async fn test_slow_consumer_drops_oldest() {
        let registry = Arc::new(SubscriptionRegistry::new(4));
        let session = session_with_backlog(&registry, Vec::new());
        let connection_id = session.connection_id;

        for i in 0..8 {
            registry.send_to(connection_id, envelope(&format!("msg-{}", i)));
        }

        // Ring capacity 4: the oldest four were dropped, the newest four
        // survive in order.
        let received: Vec<Envelope> = session.into_stream().take(4).collect().await;
        let messages: Vec<&str> = received.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(messages, vec!["msg-4", "msg-5", "msg-6", "msg-7"]);
    }

    #[tokio::test]
    async fn test_dropping_stream_unregisters() {
        let registry = Arc::new(SubscriptionRegistry::new(16));
        let session = session_with_backlog(&registry, Vec::new());
        assert_eq!(registry.connection_count(), 1);

        let stream = session.into_stream();
        drop(stream);

        assert_eq!(registry.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_stream_ends_after_drain() {
        let registry = Arc::new(SubscriptionRegistry::new(16));
        let session = session_with_backlog(&registry, vec![envelope("only")]);

        registry.drain();

        // Backlog still flushes; the live side is closed so the stream ends.
        let received: Vec<Envelope> = session.into_stream().collect().await;
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].message, "only");
    }
}
