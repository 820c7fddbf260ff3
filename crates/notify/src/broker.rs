//! Event broker — the single write path for notifications.
//!
//! Producers (task/leave/collaboration handlers) call [`EventBroker::publish`].
//! The broker persists first, then fans the envelope out to every live
//! connection matching the recipient. Persistence failures surface to the
//! producer with nothing delivered; delivery failures stay contained to the
//! one affected connection.

use std::sync::Arc;

use sqlx::PgPool;

use crewflow_common::error::AppError;
use crewflow_common::types::{Envelope, Notification, NotificationKind, Recipient};

use crate::registry::SubscriptionRegistry;
use crate::store::NotificationStore;

/// Accepts publish requests, persists them, and dispatches live pushes.
#[derive(Clone)]
pub struct EventBroker {
    pool: PgPool,
    registry: Arc<SubscriptionRegistry>,
}

impl EventBroker {
    pub fn new(pool: PgPool, registry: Arc<SubscriptionRegistry>) -> Self {
        Self { pool, registry }
    }

    /// Publish an event: validate, persist, then push to every matching live
    /// connection.
    ///
    /// Enqueues are non-blocking; a full queue drops that connection's oldest
    /// envelope (observed and logged on the drain side), and a closed
    /// connection is simply skipped. Per-connection delivery order follows
    /// enqueue order, which follows persistence completion.
    pub async fn publish(
        &self,
        kind: NotificationKind,
        message: &str,
        recipient: Recipient,
        payload: serde_json::Value,
    ) -> Result<Notification, AppError> {
        if message.trim().is_empty() {
            return Err(AppError::Validation(
                "Notification message must not be empty".to_string(),
            ));
        }
        if let Recipient::User(user_id) = recipient
            && user_id.is_nil()
        {
            return Err(AppError::Validation(
                "Notification target user id must not be nil".to_string(),
            ));
        }

        let notification =
            NotificationStore::create(&self.pool, kind, message, recipient, &payload).await?;

        let targets = match recipient {
            Recipient::User(user_id) => self.registry.lookup_by_user(user_id),
            Recipient::Role(role) => self.registry.lookup_by_role(role),
        };

        let envelope = Envelope::from(&notification);
        let mut delivered = 0usize;
        for connection_id in &targets {
            if self.registry.send_to(*connection_id, envelope.clone()) {
                delivered += 1;
            }
        }

        tracing::debug!(
            notification_id = %notification.id,
            kind = %kind,
            recipient = %recipient,
            matched = targets.len(),
            delivered,
            "Notification published"
        );

        Ok(notification)
    }
}
