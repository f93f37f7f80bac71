//! Authentication and authorization substrate.
//!
//! Three pieces: password hashing ([`password`]), signed short-lived bearer
//! tokens with server-side revocation ([`token`]), and the relational store
//! holding users, groups, token records, and DB-sourced agents ([`store`]).
//!
//! The HTTP middleware lives in the `serve` crate; this module only provides
//! the primitives it composes.

pub mod password;
pub mod store;
pub mod token;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use store::AuthStore;
pub use token::{Claims, IssuedToken};

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error("not authenticated")]
    NotAuthenticated,
    #[error("not authorized")]
    NotAuthorized,
    #[error("token error: {0}")]
    Token(String),
    #[error("password hash error: {0}")]
    PasswordHash(String),
    #[error("setup already completed")]
    SetupDone,
    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),
}

/// Access level of a user. `AdminGeral` crosses tenant groups; `Admin`
/// administers its own group; `Normal` is a non-admin member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UserLevel {
    #[serde(rename = "NORMAL")]
    Normal,
    #[serde(rename = "ADMIN")]
    Admin,
    #[serde(rename = "ADMIN_GERAL")]
    AdminGeral,
}

impl UserLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserLevel::Normal => "NORMAL",
            UserLevel::Admin => "ADMIN",
            UserLevel::AdminGeral => "ADMIN_GERAL",
        }
    }

    pub fn parse(s: &str) -> UserLevel {
        match s {
            "ADMIN_GERAL" => UserLevel::AdminGeral,
            "ADMIN" => UserLevel::Admin,
            _ => UserLevel::Normal,
        }
    }
}

/// The authenticated principal attached to a request after the middleware
/// validated its token.
#[derive(Debug, Clone, Serialize)]
pub struct AuthUser {
    pub id: String,
    pub email: String,
    pub level: UserLevel,
    pub group_id: Option<String>,
}

impl AuthUser {
    /// Synthetic principal used by the legacy shared-secret path and by
    /// development mode (no secrets configured at all).
    pub fn system() -> Self {
        Self {
            id: "system".into(),
            email: "system@admin".into(),
            level: UserLevel::AdminGeral,
            group_id: None,
        }
    }

    /// Agents are visible to ADMIN_GERAL unconditionally, and to everyone
    /// else when the agent belongs to their group or to no group (legacy
    /// file-sourced agents).
    pub fn can_see_agent(&self, agent_group_id: Option<&str>) -> bool {
        match self.level {
            UserLevel::AdminGeral => true,
            _ => match agent_group_id {
                None => true,
                Some(g) => self.group_id.as_deref() == Some(g),
            },
        }
    }
}

/// Requires the `ADMIN_GERAL` level.
pub fn require_admin_geral(user: &AuthUser) -> Result<(), AuthError> {
    if user.level == UserLevel::AdminGeral {
        Ok(())
    } else {
        Err(AuthError::NotAuthorized)
    }
}

/// Requires `ADMIN` or `ADMIN_GERAL`.
pub fn require_admin_grupo(user: &AuthUser) -> Result<(), AuthError> {
    match user.level {
        UserLevel::Admin | UserLevel::AdminGeral => Ok(()),
        UserLevel::Normal => Err(AuthError::NotAuthorized),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(level: UserLevel, group: Option<&str>) -> AuthUser {
        AuthUser {
            id: "u1".into(),
            email: "u1@example.com".into(),
            level,
            group_id: group.map(String::from),
        }
    }

    #[test]
    fn admin_geral_sees_every_agent() {
        let u = user(UserLevel::AdminGeral, None);
        assert!(u.can_see_agent(Some("g1")));
        assert!(u.can_see_agent(None));
    }

    #[test]
    fn group_member_sees_own_group_and_legacy_agents() {
        let u = user(UserLevel::Normal, Some("g1"));
        assert!(u.can_see_agent(Some("g1")));
        assert!(u.can_see_agent(None));
        assert!(!u.can_see_agent(Some("g2")));
    }

    #[test]
    fn rbac_helpers_enforce_levels() {
        assert!(require_admin_geral(&user(UserLevel::AdminGeral, None)).is_ok());
        assert!(require_admin_geral(&user(UserLevel::Admin, None)).is_err());
        assert!(require_admin_grupo(&user(UserLevel::Admin, None)).is_ok());
        assert!(require_admin_grupo(&user(UserLevel::Normal, None)).is_err());
    }

    #[test]
    fn user_level_round_trips_through_strings() {
        for level in [UserLevel::Normal, UserLevel::Admin, UserLevel::AdminGeral] {
            assert_eq!(UserLevel::parse(level.as_str()), level);
        }
        assert_eq!(UserLevel::parse("garbage"), UserLevel::Normal);
    }
}
