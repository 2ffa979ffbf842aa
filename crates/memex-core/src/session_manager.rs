//! Relational persistence for groups and sessions: the roster/configuration
//! bookkeeping layer underneath [`crate::manager::EpisodicMemoryManager`].
//!
//! Grounded on `session_manager/session_manager.py`'s SQLAlchemy-backed
//! `SessionManager`, reworked onto the same `rusqlite` +
//! `Arc<tokio::sync::Mutex<Connection>>` shape already established in
//! `graph/sqlite_store.rs`. Table names follow the relational schema
//! (`groups`, `sessions`, `users`, `agents`) rather than the original's
//! `group_info` naming.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::Mutex as AsyncMutex;

use crate::types::{Group, SessionInfo};

/// Error surface for [`SessionManager`] operations.
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum SessionManagerError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("group not found: {0}")]
    GroupNotFound(String),

    #[error("group already exists: {0}")]
    GroupAlreadyExists(String),

    #[error("session not found: group_id={group_id}, session_id={session_id}")]
    SessionNotFound { group_id: String, session_id: String },

    #[error("session already exists: group_id={group_id}, session_id={session_id}")]
    SessionAlreadyExists { group_id: String, session_id: String },

    #[error("group {0} still has sessions")]
    GroupHasSessions(String),
}

/// Relational store for group rosters and session metadata. Mirrors
/// `SessionManager`.
pub struct SessionManager {
    conn: Arc<AsyncMutex<Connection>>,
}

impl SessionManager {
    /// Open (creating if absent) a session store at `path`, or an in-memory
    /// store when `path` is `None`.
    pub async fn open(path: Option<PathBuf>) -> Result<Self, SessionManagerError> {
        let conn = match path {
            Some(p) => Connection::open(p)?,
            None => Connection::open_in_memory()?,
        };
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS groups (
                group_id TEXT PRIMARY KEY,
                user_list TEXT NOT NULL,
                agent_list TEXT NOT NULL,
                configuration TEXT NOT NULL
             );
             CREATE TABLE IF NOT EXISTS sessions (
                group_id TEXT NOT NULL REFERENCES groups(group_id) ON DELETE CASCADE,
                session_id TEXT NOT NULL,
                user_ids TEXT NOT NULL,
                agent_ids TEXT NOT NULL,
                configuration TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (group_id, session_id)
             );
             CREATE TABLE IF NOT EXISTS users (
                user_id TEXT NOT NULL,
                group_id TEXT NOT NULL,
                session_id TEXT NOT NULL,
                PRIMARY KEY (user_id, group_id, session_id),
                FOREIGN KEY (group_id, session_id) REFERENCES sessions(group_id, session_id) ON DELETE CASCADE
             );
             CREATE INDEX IF NOT EXISTS idx_users_user_id ON users(user_id);
             CREATE TABLE IF NOT EXISTS agents (
                agent_id TEXT NOT NULL,
                group_id TEXT NOT NULL,
                session_id TEXT NOT NULL,
                PRIMARY KEY (agent_id, group_id, session_id),
                FOREIGN KEY (group_id, session_id) REFERENCES sessions(group_id, session_id) ON DELETE CASCADE
             );
             CREATE INDEX IF NOT EXISTS idx_agents_agent_id ON agents(agent_id);",
        )?;

        Ok(Self { conn: Arc::new(AsyncMutex::new(conn)) })
    }

    /// Create a new group with the given roster and configuration. Fails if
    /// the group already exists.
    pub async fn create_group(
        &self,
        group_id: &str,
        user_ids: HashSet<String>,
        agent_ids: HashSet<String>,
        configuration: serde_json::Value,
    ) -> Result<Group, SessionManagerError> {
        let conn = self.conn.lock().await;
        let user_list = serde_json::to_string(&user_ids)?;
        let agent_list = serde_json::to_string(&agent_ids)?;
        let configuration_json = serde_json::to_string(&configuration)?;
        let inserted = conn.execute(
            "INSERT INTO groups (group_id, user_list, agent_list, configuration)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(group_id) DO NOTHING",
            params![group_id, user_list, agent_list, configuration_json],
        )?;
        if inserted == 0 {
            return Err(SessionManagerError::GroupAlreadyExists(group_id.to_string()));
        }
        Ok(Group { group_id: group_id.to_string(), user_ids, agent_ids, configuration })
    }

    /// Look up a group by id, if it exists.
    pub async fn get_group(&self, group_id: &str) -> Result<Option<Group>, SessionManagerError> {
        let conn = self.conn.lock().await;
        Self::get_group_locked(&conn, group_id)
    }

    fn get_group_locked(
        conn: &Connection,
        group_id: &str,
    ) -> Result<Option<Group>, SessionManagerError> {
        let row: Option<(String, String, String)> = conn
            .query_row(
                "SELECT user_list, agent_list, configuration FROM groups WHERE group_id = ?1",
                params![group_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;
        let Some((user_list, agent_list, configuration)) = row else {
            return Ok(None);
        };
        Ok(Some(Group {
            group_id: group_id.to_string(),
            user_ids: serde_json::from_str(&user_list)?,
            agent_ids: serde_json::from_str(&agent_list)?,
            configuration: serde_json::from_str(&configuration)?,
        }))
    }

    /// List every registered group.
    pub async fn list_groups(&self) -> Result<Vec<Group>, SessionManagerError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare("SELECT group_id, user_list, agent_list, configuration FROM groups")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;
        let mut groups = Vec::new();
        for row in rows {
            let (group_id, user_list, agent_list, configuration) = row?;
            groups.push(Group {
                group_id,
                user_ids: serde_json::from_str(&user_list)?,
                agent_ids: serde_json::from_str(&agent_list)?,
                configuration: serde_json::from_str(&configuration)?,
            });
        }
        Ok(groups)
    }

    /// Delete a group. Fails if any session still belongs to it.
    pub async fn delete_group(&self, group_id: &str) -> Result<(), SessionManagerError> {
        let conn = self.conn.lock().await;
        let session_count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM sessions WHERE group_id = ?1",
            params![group_id],
            |row| row.get(0),
        )?;
        if session_count > 0 {
            return Err(SessionManagerError::GroupHasSessions(group_id.to_string()));
        }
        let deleted = conn.execute("DELETE FROM groups WHERE group_id = ?1", params![group_id])?;
        if deleted == 0 {
            return Err(SessionManagerError::GroupNotFound(group_id.to_string()));
        }
        Ok(())
    }

    /// Create a session under `group_id`. Fails if the session already
    /// exists, or if the group does not exist.
    pub async fn create_session(
        &self,
        group_id: &str,
        session_id: &str,
        user_ids: Vec<String>,
        agent_ids: Vec<String>,
        configuration: serde_json::Value,
    ) -> Result<SessionInfo, SessionManagerError> {
        let conn = self.conn.lock().await;
        if Self::get_group_locked(&conn, group_id)?.is_none() {
            return Err(SessionManagerError::GroupNotFound(group_id.to_string()));
        }
        if Self::get_session_locked(&conn, group_id, session_id)?.is_some() {
            return Err(SessionManagerError::SessionAlreadyExists {
                group_id: group_id.to_string(),
                session_id: session_id.to_string(),
            });
        }
        Self::insert_session(&conn, group_id, session_id, &user_ids, &agent_ids, &configuration)
    }

    /// Return the existing session if one is already registered under
    /// `group_id`/`session_id`; otherwise create it. If the group does not
    /// exist yet, it is created with `user_ids`/`agent_ids` as its initial
    /// roster; if the group already exists, its existing roster is used and
    /// `user_ids`/`agent_ids` are ignored (matching the original's
    /// `create_session_if_not_exist`, which treats a pre-existing group's
    /// roster as authoritative).
    pub async fn create_session_if_not_exist(
        &self,
        group_id: &str,
        session_id: &str,
        user_ids: Vec<String>,
        agent_ids: Vec<String>,
        configuration: serde_json::Value,
    ) -> Result<SessionInfo, SessionManagerError> {
        let conn = self.conn.lock().await;
        if let Some(existing) = Self::get_session_locked(&conn, group_id, session_id)? {
            return Ok(existing);
        }

        let (effective_user_ids, effective_agent_ids) = match Self::get_group_locked(&conn, group_id)? {
            Some(group) => (
                group.user_ids.into_iter().collect::<Vec<_>>(),
                group.agent_ids.into_iter().collect::<Vec<_>>(),
            ),
            None => {
                let user_list = serde_json::to_string(&user_ids)?;
                let agent_list = serde_json::to_string(&agent_ids)?;
                let configuration_json = serde_json::to_string(&serde_json::Value::Object(Default::default()))?;
                conn.execute(
                    "INSERT INTO groups (group_id, user_list, agent_list, configuration) VALUES (?1, ?2, ?3, ?4)",
                    params![group_id, user_list, agent_list, configuration_json],
                )?;
                (user_ids, agent_ids)
            }
        };

        Self::insert_session(
            &conn,
            group_id,
            session_id,
            &effective_user_ids,
            &effective_agent_ids,
            &configuration,
        )
    }

    fn insert_session(
        conn: &Connection,
        group_id: &str,
        session_id: &str,
        user_ids: &[String],
        agent_ids: &[String],
        configuration: &serde_json::Value,
    ) -> Result<SessionInfo, SessionManagerError> {
        let now = Utc::now();
        let user_ids_json = serde_json::to_string(user_ids)?;
        let agent_ids_json = serde_json::to_string(agent_ids)?;
        let configuration_json = serde_json::to_string(configuration)?;
        conn.execute(
            "INSERT INTO sessions (group_id, session_id, user_ids, agent_ids, configuration, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                group_id,
                session_id,
                user_ids_json,
                agent_ids_json,
                configuration_json,
                now.to_rfc3339(),
                now.to_rfc3339()
            ],
        )?;
        for user_id in user_ids {
            conn.execute(
                "INSERT OR IGNORE INTO users (user_id, group_id, session_id) VALUES (?1, ?2, ?3)",
                params![user_id, group_id, session_id],
            )?;
        }
        for agent_id in agent_ids {
            conn.execute(
                "INSERT OR IGNORE INTO agents (agent_id, group_id, session_id) VALUES (?1, ?2, ?3)",
                params![agent_id, group_id, session_id],
            )?;
        }
        Ok(SessionInfo {
            group_id: group_id.to_string(),
            session_id: session_id.to_string(),
            user_ids: user_ids.to_vec(),
            agent_ids: agent_ids.to_vec(),
            created_at: now,
            updated_at: now,
            configuration: configuration.clone(),
        })
    }

    /// Look up a session by `(group_id, session_id)`, if it exists.
    pub async fn get_session(
        &self,
        group_id: &str,
        session_id: &str,
    ) -> Result<Option<SessionInfo>, SessionManagerError> {
        let conn = self.conn.lock().await;
        Self::get_session_locked(&conn, group_id, session_id)
    }

    fn get_session_locked(
        conn: &Connection,
        group_id: &str,
        session_id: &str,
    ) -> Result<Option<SessionInfo>, SessionManagerError> {
        let row = conn
            .query_row(
                "SELECT user_ids, agent_ids, configuration, created_at, updated_at
                 FROM sessions WHERE group_id = ?1 AND session_id = ?2",
                params![group_id, session_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                },
            )
            .optional()?;
        let Some((user_ids, agent_ids, configuration, created_at, updated_at)) = row else {
            return Ok(None);
        };
        Ok(Some(session_info_from_row(
            group_id,
            session_id,
            &user_ids,
            &agent_ids,
            &configuration,
            &created_at,
            &updated_at,
        )?))
    }

    /// List every session, across every group.
    pub async fn list_all_sessions(&self) -> Result<Vec<SessionInfo>, SessionManagerError> {
        let conn = self.conn.lock().await;
        Self::collect_sessions(&conn, "SELECT group_id, session_id, user_ids, agent_ids, configuration, created_at, updated_at FROM sessions", params![])
    }

    /// List every session belonging to `group_id`.
    pub async fn list_sessions_by_group(
        &self,
        group_id: &str,
    ) -> Result<Vec<SessionInfo>, SessionManagerError> {
        let conn = self.conn.lock().await;
        Self::collect_sessions(
            &conn,
            "SELECT group_id, session_id, user_ids, agent_ids, configuration, created_at, updated_at
             FROM sessions WHERE group_id = ?1",
            params![group_id],
        )
    }

    /// List every session `user_id` participates in.
    pub async fn list_sessions_by_user(
        &self,
        user_id: &str,
    ) -> Result<Vec<SessionInfo>, SessionManagerError> {
        let conn = self.conn.lock().await;
        Self::collect_sessions(
            &conn,
            "SELECT s.group_id, s.session_id, s.user_ids, s.agent_ids, s.configuration, s.created_at, s.updated_at
             FROM sessions s JOIN users u ON u.group_id = s.group_id AND u.session_id = s.session_id
             WHERE u.user_id = ?1",
            params![user_id],
        )
    }

    /// List every session `agent_id` participates in.
    pub async fn list_sessions_by_agent(
        &self,
        agent_id: &str,
    ) -> Result<Vec<SessionInfo>, SessionManagerError> {
        let conn = self.conn.lock().await;
        Self::collect_sessions(
            &conn,
            "SELECT s.group_id, s.session_id, s.user_ids, s.agent_ids, s.configuration, s.created_at, s.updated_at
             FROM sessions s JOIN agents a ON a.group_id = s.group_id AND a.session_id = s.session_id
             WHERE a.agent_id = ?1",
            params![agent_id],
        )
    }

    fn collect_sessions(
        conn: &Connection,
        sql: &str,
        query_params: &[&dyn rusqlite::ToSql],
    ) -> Result<Vec<SessionInfo>, SessionManagerError> {
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(query_params, |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, String>(6)?,
            ))
        })?;
        let mut sessions = Vec::new();
        for row in rows {
            let (group_id, session_id, user_ids, agent_ids, configuration, created_at, updated_at) = row?;
            sessions.push(session_info_from_row(
                &group_id,
                &session_id,
                &user_ids,
                &agent_ids,
                &configuration,
                &created_at,
                &updated_at,
            )?);
        }
        Ok(sessions)
    }

    /// Delete a session and its user/agent roster rows (cascades via the
    /// foreign keys declared on `users`/`agents`).
    pub async fn delete_session(
        &self,
        group_id: &str,
        session_id: &str,
    ) -> Result<(), SessionManagerError> {
        let conn = self.conn.lock().await;
        let deleted = conn.execute(
            "DELETE FROM sessions WHERE group_id = ?1 AND session_id = ?2",
            params![group_id, session_id],
        )?;
        if deleted == 0 {
            return Err(SessionManagerError::SessionNotFound {
                group_id: group_id.to_string(),
                session_id: session_id.to_string(),
            });
        }
        Ok(())
    }

    /// Close the underlying connection. A no-op beyond dropping the
    /// connection handle, kept for symmetry with
    /// [`crate::graph::VectorGraphStore::close`].
    pub async fn close(&self) -> Result<(), SessionManagerError> {
        Ok(())
    }
}

fn session_info_from_row(
    group_id: &str,
    session_id: &str,
    user_ids: &str,
    agent_ids: &str,
    configuration: &str,
    created_at: &str,
    updated_at: &str,
) -> Result<SessionInfo, SessionManagerError> {
    Ok(SessionInfo {
        group_id: group_id.to_string(),
        session_id: session_id.to_string(),
        user_ids: serde_json::from_str(user_ids)?,
        agent_ids: serde_json::from_str(agent_ids)?,
        configuration: serde_json::from_str(configuration)?,
        created_at: parse_rfc3339(created_at),
        updated_at: parse_rfc3339(updated_at),
    })
}

fn parse_rfc3339(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw).map(|dt| dt.with_timezone(&Utc)).unwrap_or_else(|_| Utc::now())
}
