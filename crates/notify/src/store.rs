//! Notification store — durable record of notifications.
//!
//! Rows target either a specific user (`user_id` set) or every holder of a
//! role (`recipient_role` set); a CHECK constraint keeps the pair exactly-one.
//! Read state is the row's own `is_read` flag for user-targeted rows and a
//! per-reader receipt in `notification_reads` for role-targeted rows, so one
//! supervisor marking a role notification read never hides it from the others.

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crewflow_common::error::AppError;
use crewflow_common::types::{Notification, NotificationKind, Recipient, Role};

/// Service layer for notification persistence.
pub struct NotificationStore;

/// Options for `list_for_recipient`.
#[derive(Debug, Clone, Default, serde::Deserialize)]
#[serde(default)]
pub struct ListOptions {
    /// Only return notifications the acting reader has not read.
    pub only_unread: bool,
    /// Only return notifications created after this instant.
    pub since: Option<DateTime<Utc>>,
    /// Maximum number of rows returned.
    pub limit: Option<i64>,
}

/// Hard cap on rows returned by a single list query.
const MAX_LIST_LIMIT: i64 = 1000;

impl NotificationStore {
    /// Persist a new notification and return the stored row.
    pub async fn create(
        pool: &PgPool,
        kind: NotificationKind,
        message: &str,
        recipient: Recipient,
        payload: &serde_json::Value,
    ) -> Result<Notification, AppError> {
        let id = Uuid::new_v4();
        let (user_id, recipient_role) = recipient.columns();

        let notification: Notification = sqlx::query_as(
            r#"
            INSERT INTO notifications (id, kind, message, user_id, recipient_role, payload, is_read, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, false, NOW())
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(kind.to_string())
        .bind(message)
        .bind(user_id)
        .bind(recipient_role.map(|r| r.to_string()))
        .bind(payload)
        .fetch_one(pool)
        .await?;

        tracing::info!(
            notification_id = %notification.id,
            kind = %kind,
            recipient = %recipient,
            "Notification created"
        );

        Ok(notification)
    }

    /// List notifications visible to a reader, newest first.
    ///
    /// A row is visible when it targets the reader's user id or any of the
    /// reader's roles. Role-targeted rows come back with the reader's own
    /// effective read state.
    pub async fn list_for_recipient(
        pool: &PgPool,
        user_id: Uuid,
        roles: &[Role],
        opts: &ListOptions,
    ) -> Result<Vec<Notification>, AppError> {
        let role_names: Vec<String> = roles.iter().map(|r| r.to_string()).collect();
        let limit = opts.limit.unwrap_or(MAX_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT);

        let notifications: Vec<Notification> = sqlx::query_as(
            r#"
            SELECT n.id,
                   n.kind,
                   n.message,
                   n.user_id,
                   n.recipient_role,
                   n.payload,
                   CASE WHEN n.user_id IS NOT NULL THEN n.is_read
                        ELSE r.user_id IS NOT NULL END AS is_read,
                   n.created_at,
                   CASE WHEN n.user_id IS NOT NULL THEN n.read_at
                        ELSE r.read_at END AS read_at
            FROM notifications n
            LEFT JOIN notification_reads r
              ON r.notification_id = n.id AND r.user_id = $1
            WHERE (n.user_id = $1 OR n.recipient_role = ANY($2))
              AND ($3::bool = false OR
                   CASE WHEN n.user_id IS NOT NULL THEN NOT n.is_read
                        ELSE r.user_id IS NULL END)
              AND ($4::timestamptz IS NULL OR n.created_at > $4)
            ORDER BY n.created_at DESC
            LIMIT $5
            "#,
        )
        .bind(user_id)
        .bind(&role_names)
        .bind(opts.only_unread)
        .bind(opts.since)
        .bind(limit)
        .fetch_all(pool)
        .await?;

        Ok(notifications)
    }

    /// Mark a notification read on behalf of the acting identity.
    ///
    /// Idempotent: marking an already-read notification is a no-op, not an
    /// error. User-targeted rows may only be read by their target user;
    /// role-targeted rows only by a holder of the role.
    pub async fn mark_read(
        pool: &PgPool,
        notification_id: Uuid,
        acting_user_id: Uuid,
        acting_roles: &[Role],
    ) -> Result<Notification, AppError> {
        let existing: Notification = sqlx::query_as("SELECT * FROM notifications WHERE id = $1")
            .bind(notification_id)
            .fetch_optional(pool)
            .await?
            .ok_or_else(|| {
                AppError::NotFound(format!("Notification {} not found", notification_id))
            })?;

        match existing.recipient() {
            Recipient::User(target) => {
                if target != acting_user_id {
                    return Err(AppError::Forbidden(
                        "Not authorized to read this notification".to_string(),
                    ));
                }
                if existing.is_read {
                    return Ok(existing);
                }

                let updated: Notification = sqlx::query_as(
                    r#"
                    UPDATE notifications
                    SET is_read = true, read_at = NOW()
                    WHERE id = $1
                    RETURNING *
                    "#,
                )
                .bind(notification_id)
                .fetch_one(pool)
                .await?;

                tracing::info!(
                    notification_id = %notification_id,
                    user_id = %acting_user_id,
                    "Notification marked read"
                );

                Ok(updated)
            }
            Recipient::Role(role) => {
                if !acting_roles.contains(&role) {
                    return Err(AppError::Forbidden(
                        "Not authorized to read this notification".to_string(),
                    ));
                }

                // Per-reader receipt; conflict means already read, keep the
                // original read_at.
                sqlx::query(
                    r#"
                    INSERT INTO notification_reads (notification_id, user_id, read_at)
                    VALUES ($1, $2, NOW())
                    ON CONFLICT (notification_id, user_id) DO NOTHING
                    "#,
                )
                .bind(notification_id)
                .bind(acting_user_id)
                .execute(pool)
                .await?;

                let (read_at,): (DateTime<Utc>,) = sqlx::query_as(
                    "SELECT read_at FROM notification_reads WHERE notification_id = $1 AND user_id = $2",
                )
                .bind(notification_id)
                .bind(acting_user_id)
                .fetch_one(pool)
                .await?;

                tracing::info!(
                    notification_id = %notification_id,
                    user_id = %acting_user_id,
                    role = %role,
                    "Role notification marked read"
                );

                Ok(Notification {
                    is_read: true,
                    read_at: Some(read_at),
                    ..existing
                })
            }
        }
    }
}
