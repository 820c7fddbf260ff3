use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Roles a user can hold. Role-targeted notifications fan out to every
/// connected holder of the role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Employee,
    Supervisor,
    Admin,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Employee => write!(f, "employee"),
            Role::Supervisor => write!(f, "supervisor"),
            Role::Admin => write!(f, "admin"),
        }
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "employee" => Ok(Role::Employee),
            "supervisor" => Ok(Role::Supervisor),
            "admin" => Ok(Role::Admin),
            other => Err(format!("unknown role '{}'", other)),
        }
    }
}

/// Kinds of events the task/leave/collaboration handlers publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    TaskAssigned,
    TaskCompleted,
    LeaveRequested,
    LeaveApproved,
    LeaveRejected,
    CollaborationCreated,
}

impl std::fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NotificationKind::TaskAssigned => write!(f, "task_assigned"),
            NotificationKind::TaskCompleted => write!(f, "task_completed"),
            NotificationKind::LeaveRequested => write!(f, "leave_requested"),
            NotificationKind::LeaveApproved => write!(f, "leave_approved"),
            NotificationKind::LeaveRejected => write!(f, "leave_rejected"),
            NotificationKind::CollaborationCreated => write!(f, "collaboration_created"),
        }
    }
}

/// Target of a notification: exactly one of a specific user or a role class.
///
/// The tagged representation makes the "neither or both targets set" state
/// unrepresentable; the `notifications` table enforces the same with a CHECK
/// constraint over its nullable `user_id`/`recipient_role` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Recipient {
    User(Uuid),
    Role(Role),
}

impl Recipient {
    /// Split into the nullable column pair used by the persisted layout.
    pub fn columns(&self) -> (Option<Uuid>, Option<Role>) {
        match self {
            Recipient::User(id) => (Some(*id), None),
            Recipient::Role(role) => (None, Some(*role)),
        }
    }
}

impl std::fmt::Display for Recipient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Recipient::User(id) => write!(f, "user:{}", id),
            Recipient::Role(role) => write!(f, "role:{}", role),
        }
    }
}

/// A persisted notification row.
///
/// Exactly one of `user_id` / `recipient_role` is set. For role-targeted rows
/// `is_read`/`read_at` carry the *acting reader's* effective state, computed
/// against the per-reader receipt table by the store queries.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Notification {
    pub id: Uuid,
    pub kind: NotificationKind,
    pub message: String,
    pub user_id: Option<Uuid>,
    pub recipient_role: Option<Role>,
    pub payload: serde_json::Value,
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
    pub read_at: Option<DateTime<Utc>>,
}

impl Notification {
    /// Reassemble the tagged recipient from the column pair.
    pub fn recipient(&self) -> Recipient {
        match (self.user_id, self.recipient_role) {
            (Some(id), None) => Recipient::User(id),
            (None, Some(role)) => Recipient::Role(role),
            // Unreachable for rows that passed the table CHECK constraint.
            (user_id, role) => {
                unreachable!("notification {} has user_id={:?} role={:?}", self.id, user_id, role)
            }
        }
    }
}

/// The wire shape pushed on a subscriber's stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: Uuid,
    pub kind: NotificationKind,
    pub message: String,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl From<&Notification> for Envelope {
    fn from(n: &Notification) -> Self {
        Self {
            id: n.id,
            kind: n.kind,
            message: n.message.clone(),
            payload: n.payload.clone(),
            created_at: n.created_at,
        }
    }
}
