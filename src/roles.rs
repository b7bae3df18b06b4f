use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::engine::BookingError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Visitor,
    Operator,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Visitor => "visitor",
            Role::Operator => "operator",
            Role::Admin => "admin",
        }
    }

    /// Operators and admins watch the admin broadcast channel.
    pub fn is_staff(&self) -> bool {
        matches!(self, Role::Operator | Role::Admin)
    }

    pub fn allows(&self, capability: Capability) -> bool {
        use Capability::*;
        match self {
            Role::Visitor => matches!(capability, CreateBooking | PayDeposit | ViewOwn),
            Role::Operator => !matches!(
                capability,
                DeleteBookings | DeleteCourts | RunIntegrity | ManageTasks
            ),
            Role::Admin => true,
        }
    }
}

/// Everything a protected operation may require.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    CreateBooking,
    PayDeposit,
    ViewOwn,
    ViewAllBookings,
    ManageBookings,
    DeleteBookings,
    ManageCourts,
    DeleteCourts,
    ViewSchedule,
    RunIntegrity,
    ManageTasks,
}

/// Who is performing an operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    pub user_id: Option<Ulid>,
    pub username: Option<String>,
    pub email: Option<String>,
    pub role: Role,
}

impl Actor {
    pub fn anonymous() -> Self {
        Self {
            user_id: None,
            username: None,
            email: None,
            role: Role::Visitor,
        }
    }

    pub fn user(id: Ulid, username: impl Into<String>, email: impl Into<String>, role: Role) -> Self {
        Self {
            user_id: Some(id),
            username: Some(username.into()),
            email: Some(email.into()),
            role,
        }
    }

    /// Internal jobs (reaper, periodic audits).
    pub fn system() -> Self {
        Self {
            user_id: None,
            username: Some("system".into()),
            email: None,
            role: Role::Admin,
        }
    }

    pub fn is_staff(&self) -> bool {
        self.role.is_staff()
    }
}

/// The single capability gate every protected operation goes through.
pub fn authorize(actor: &Actor, capability: Capability) -> Result<(), BookingError> {
    if actor.role.allows(capability) {
        Ok(())
    } else {
        Err(BookingError::Forbidden(format!(
            "role {} may not {:?}",
            actor.role.as_str(),
            capability
        )))
    }
}
