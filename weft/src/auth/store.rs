//! SQLite-backed relational store: users, groups, token records, and the
//! agents table feeding the registry's DB source.
//!
//! Connections are opened per operation against a shared file path; the
//! store itself is a cheap `Clone` handle. Migrations are idempotent
//! `CREATE TABLE IF NOT EXISTS` statements run at startup when
//! `migrate_on_startup` is set.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use super::{password, AuthError, UserLevel};

/// One row of the `users` table.
#[derive(Debug, Clone)]
pub struct UserRecord {
    pub id: String,
    pub email: String,
    pub password_hash: String,
    pub level: UserLevel,
    pub group_id: Option<String>,
}

/// One row of the `access_tokens` table. Exists iff a bearer token was
/// issued; a token is valid iff the row exists, `revoked_at` is null, and
/// `expires_at` is in the future.
#[derive(Debug, Clone)]
pub struct TokenRecord {
    pub jti: String,
    pub user_id: String,
    pub expires_at: DateTime<Utc>,
    pub revoked_at: Option<DateTime<Utc>>,
}

/// One row of the `agents` table: the persisted (possibly `enc:`-bearing)
/// JSON config plus the columns the registry forces onto the loaded value.
#[derive(Debug, Clone)]
pub struct AgentRow {
    pub id: String,
    pub name: Option<String>,
    pub group_id: Option<String>,
    pub config: serde_json::Value,
}

#[derive(Clone)]
pub struct AuthStore {
    db_path: PathBuf,
}

impl AuthStore {
    /// Creates the handle and runs migrations.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, AuthError> {
        let store = Self {
            db_path: path.as_ref().to_path_buf(),
        };
        store.migrate()?;
        Ok(store)
    }

    fn conn(&self) -> Result<Connection, AuthError> {
        Ok(Connection::open(&self.db_path)?)
    }

    /// Idempotent schema setup.
    pub fn migrate(&self) -> Result<(), AuthError> {
        let conn = self.conn()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS groups (
                 id          TEXT PRIMARY KEY,
                 name        TEXT NOT NULL,
                 description TEXT
             );
             CREATE TABLE IF NOT EXISTS users (
                 id            TEXT PRIMARY KEY,
                 email         TEXT NOT NULL UNIQUE,
                 password_hash TEXT NOT NULL,
                 level         TEXT NOT NULL,
                 group_id      TEXT REFERENCES groups(id)
             );
             CREATE TABLE IF NOT EXISTS access_tokens (
                 jti        TEXT PRIMARY KEY,
                 user_id    TEXT NOT NULL REFERENCES users(id),
                 expires_at INTEGER NOT NULL,
                 revoked_at INTEGER
             );
             CREATE TABLE IF NOT EXISTS agents (
                 id       TEXT PRIMARY KEY,
                 name     TEXT,
                 group_id TEXT REFERENCES groups(id),
                 config   TEXT NOT NULL
             );",
        )?;
        Ok(())
    }

    /// One-time bootstrap: creates the first group and its `ADMIN_GERAL`
    /// user. Rejected with [`AuthError::SetupDone`] once any user exists.
    pub fn setup_initial(
        &self,
        admin_email: &str,
        admin_password: &str,
        group_name: &str,
    ) -> Result<UserRecord, AuthError> {
        let conn = self.conn()?;
        let existing: i64 = conn.query_row("SELECT COUNT(*) FROM users", [], |r| r.get(0))?;
        if existing > 0 {
            return Err(AuthError::SetupDone);
        }

        let group_id = Uuid::new_v4().to_string();
        conn.execute(
            "INSERT INTO groups (id, name, description) VALUES (?1, ?2, ?3)",
            params![group_id, group_name, "System administration group"],
        )?;

        let user = UserRecord {
            id: Uuid::new_v4().to_string(),
            email: admin_email.to_string(),
            password_hash: password::hash_password(admin_password)?,
            level: UserLevel::AdminGeral,
            group_id: Some(group_id),
        };
        conn.execute(
            "INSERT INTO users (id, email, password_hash, level, group_id)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                user.id,
                user.email,
                user.password_hash,
                user.level.as_str(),
                user.group_id
            ],
        )?;
        Ok(user)
    }

    pub fn find_user_by_email(&self, email: &str) -> Result<Option<UserRecord>, AuthError> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT id, email, password_hash, level, group_id FROM users WHERE email = ?1",
                params![email],
                user_from_row,
            )
            .optional()?;
        Ok(row)
    }

    pub fn find_user(&self, id: &str) -> Result<Option<UserRecord>, AuthError> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT id, email, password_hash, level, group_id FROM users WHERE id = ?1",
                params![id],
                user_from_row,
            )
            .optional()?;
        Ok(row)
    }

    /// Records an issued token's `jti` so it can be validated and revoked.
    pub fn insert_token(
        &self,
        jti: &str,
        user_id: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<(), AuthError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO access_tokens (jti, user_id, expires_at) VALUES (?1, ?2, ?3)",
            params![jti, user_id, expires_at.timestamp()],
        )?;
        Ok(())
    }

    pub fn find_token(&self, jti: &str) -> Result<Option<TokenRecord>, AuthError> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT jti, user_id, expires_at, revoked_at FROM access_tokens WHERE jti = ?1",
                params![jti],
                |r| {
                    Ok(TokenRecord {
                        jti: r.get(0)?,
                        user_id: r.get(1)?,
                        expires_at: ts_to_datetime(r.get(2)?),
                        revoked_at: r.get::<_, Option<i64>>(3)?.map(ts_to_datetime),
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    /// Marks a token revoked; validation rejects it from then on.
    pub fn revoke_token(&self, jti: &str) -> Result<(), AuthError> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE access_tokens SET revoked_at = ?1 WHERE jti = ?2",
            params![Utc::now().timestamp(), jti],
        )?;
        Ok(())
    }

    /// Is a token currently valid at the store level (exists, not revoked,
    /// not past its expiry)?
    pub fn token_is_live(&self, jti: &str) -> Result<bool, AuthError> {
        Ok(match self.find_token(jti)? {
            Some(rec) => rec.revoked_at.is_none() && rec.expires_at > Utc::now(),
            None => false,
        })
    }

    pub fn list_agent_rows(&self) -> Result<Vec<AgentRow>, AuthError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT id, name, group_id, config FROM agents")?;
        let rows = stmt
            .query_map([], |r| {
                let raw: String = r.get(3)?;
                Ok(AgentRow {
                    id: r.get(0)?,
                    name: r.get(1)?,
                    group_id: r.get(2)?,
                    config: serde_json::from_str(&raw).unwrap_or(serde_json::Value::Null),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn upsert_agent_row(&self, row: &AgentRow) -> Result<(), AuthError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO agents (id, name, group_id, config) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET name = ?2, group_id = ?3, config = ?4",
            params![row.id, row.name, row.group_id, row.config.to_string()],
        )?;
        Ok(())
    }

    pub fn delete_agent_row(&self, id: &str) -> Result<bool, AuthError> {
        let conn = self.conn()?;
        let n = conn.execute("DELETE FROM agents WHERE id = ?1", params![id])?;
        Ok(n > 0)
    }
}

fn ts_to_datetime(ts: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp(ts, 0).unwrap_or_else(Utc::now)
}

fn user_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<UserRecord> {
    Ok(UserRecord {
        id: r.get(0)?,
        email: r.get(1)?,
        password_hash: r.get(2)?,
        level: UserLevel::parse(&r.get::<_, String>(3)?),
        group_id: r.get(4)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn store() -> (tempfile::TempDir, AuthStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = AuthStore::open(dir.path().join("auth.db")).unwrap();
        (dir, store)
    }

    #[test]
    fn setup_creates_admin_and_is_then_rejected() {
        let (_dir, store) = store();
        let admin = store
            .setup_initial("admin@example.com", "pw", "ops")
            .unwrap();
        assert_eq!(admin.level, UserLevel::AdminGeral);
        assert!(admin.group_id.is_some());

        let again = store.setup_initial("other@example.com", "pw", "ops");
        assert!(matches!(again, Err(AuthError::SetupDone)));
    }

    #[test]
    fn find_user_by_email_verifies_password() {
        let (_dir, store) = store();
        store.setup_initial("a@b.c", "hunter2", "g").unwrap();
        let user = store.find_user_by_email("a@b.c").unwrap().unwrap();
        assert!(password::verify_password("hunter2", &user.password_hash));
        assert!(store.find_user_by_email("nobody@b.c").unwrap().is_none());
    }

    #[test]
    fn token_lifecycle_insert_validate_revoke() {
        let (_dir, store) = store();
        let admin = store.setup_initial("a@b.c", "pw", "g").unwrap();
        let exp = Utc::now() + Duration::minutes(10);
        store.insert_token("jti-1", &admin.id, exp).unwrap();

        assert!(store.token_is_live("jti-1").unwrap());
        assert!(!store.token_is_live("missing").unwrap());

        store.revoke_token("jti-1").unwrap();
        assert!(!store.token_is_live("jti-1").unwrap());
        let rec = store.find_token("jti-1").unwrap().unwrap();
        assert!(rec.revoked_at.is_some());
    }

    #[test]
    fn expired_token_record_is_not_live() {
        let (_dir, store) = store();
        let admin = store.setup_initial("a@b.c", "pw", "g").unwrap();
        store
            .insert_token("jti-old", &admin.id, Utc::now() - Duration::minutes(1))
            .unwrap();
        assert!(!store.token_is_live("jti-old").unwrap());
    }

    #[test]
    fn agent_rows_upsert_and_delete() {
        let (_dir, store) = store();
        let row = AgentRow {
            id: "bot".into(),
            name: Some("Bot".into()),
            group_id: None,
            config: serde_json::json!({"model": "m", "system_prompt": "p"}),
        };
        store.upsert_agent_row(&row).unwrap();
        let listed = store.list_agent_rows().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].config["model"], "m");

        let updated = AgentRow {
            config: serde_json::json!({"model": "m2", "system_prompt": "p"}),
            ..row
        };
        store.upsert_agent_row(&updated).unwrap();
        assert_eq!(store.list_agent_rows().unwrap()[0].config["model"], "m2");

        assert!(store.delete_agent_row("bot").unwrap());
        assert!(!store.delete_agent_row("bot").unwrap());
        assert!(store.list_agent_rows().unwrap().is_empty());
    }
}
