//! SQLite storage for sessions, turns, orders and profiles

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::{Map, Value};
use tracing::info;
use uuid::Uuid;

use super::{ProfileStore, SessionStore, StoredTurn};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::memory::long_term::{MemoryProfile, OrderSummary};
use crate::memory::session::{InteractionOutcome, SessionState};
use crate::turn::ConversationTurn;
use crate::CustomerId;

/// SQLite storage backend. Statements run on the blocking pool; a
/// transaction that has started is finished even if the caller goes away.
#[derive(Clone)]
pub struct SqliteStorage {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStorage {
    /// Open the database under the configured data directory
    pub fn new(config: &Config) -> Result<Self> {
        config.ensure_dirs()?;
        Self::open(config.sqlite_path())
    }

    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;
        info!(path = %path.as_ref().display(), "Opened SQLite store");
        Self::init(conn)
    }

    /// Private in-memory database, for tests and throwaway runs
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(include_str!("schema.sql"))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().map_err(|e| Error::storage(e.to_string()))?;
            f(&mut conn)
        })
        .await
        .map_err(|e| Error::storage(format!("SQLite task failed: {}", e)))?
    }
}

fn ts(at: &DateTime<Utc>) -> String {
    // fixed width so stored timestamps compare as text
    at.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::storage(format!("Invalid timestamp {:?}: {}", raw, e)))
}

fn parse_uuid(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw).map_err(|e| Error::storage(e.to_string()))
}

fn upsert_session(conn: &Connection, state: &SessionState) -> Result<()> {
    conn.execute(
        r#"
        INSERT INTO sessions (
            customer_id, session_id, started_at, last_activity,
            current_intent, pending_confirmation, cart, preferences
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
        ON CONFLICT(customer_id) DO UPDATE SET
            session_id = excluded.session_id,
            started_at = excluded.started_at,
            last_activity = excluded.last_activity,
            current_intent = excluded.current_intent,
            pending_confirmation = excluded.pending_confirmation,
            cart = excluded.cart,
            preferences = excluded.preferences
        "#,
        params![
            state.customer_id,
            state.session_id.to_string(),
            ts(&state.started_at),
            ts(&state.last_activity),
            state.current_intent,
            state.pending_confirmation,
            serde_json::to_string(&state.cart)?,
            serde_json::to_string(&state.preferences)?,
        ],
    )?;
    Ok(())
}

fn upsert_profile(conn: &Connection, profile: &MemoryProfile) -> Result<()> {
    conn.execute(
        r#"
        INSERT INTO profiles (customer_id, profile, updated_at)
        VALUES (?1, ?2, ?3)
        ON CONFLICT(customer_id) DO UPDATE SET
            profile = excluded.profile,
            updated_at = excluded.updated_at
        "#,
        params![
            profile.customer_id,
            serde_json::to_string(profile)?,
            ts(&profile.updated_at),
        ],
    )?;
    Ok(())
}

/// Intermediate struct for reading sessions from SQLite
struct SessionRow {
    customer_id: CustomerId,
    session_id: String,
    started_at: String,
    last_activity: String,
    current_intent: Option<String>,
    pending_confirmation: bool,
    cart: String,
    preferences: String,
}

impl SessionRow {
    fn into_state(self) -> Result<SessionState> {
        Ok(SessionState {
            customer_id: self.customer_id,
            session_id: parse_uuid(&self.session_id)?,
            started_at: parse_ts(&self.started_at)?,
            last_activity: parse_ts(&self.last_activity)?,
            current_intent: self.current_intent,
            pending_confirmation: self.pending_confirmation,
            cart: serde_json::from_str(&self.cart)?,
            preferences: serde_json::from_str(&self.preferences)?,
        })
    }
}

/// Intermediate struct for reading interaction outcomes from SQLite
struct OutcomeRow {
    outcome: String,
    details: String,
    recorded_at: String,
}

impl OutcomeRow {
    fn into_outcome(self) -> Result<InteractionOutcome> {
        let details: Map<String, Value> = serde_json::from_str(&self.details)?;
        Ok(InteractionOutcome {
            outcome: self.outcome,
            details,
            recorded_at: parse_ts(&self.recorded_at)?,
        })
    }
}

/// Intermediate struct for reading turns from SQLite
struct TurnRow {
    seq: i64,
    id: String,
    customer_id: CustomerId,
    role: String,
    text: String,
    timestamp: String,
    payload: Option<String>,
}

impl TurnRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            seq: row.get(0)?,
            id: row.get(1)?,
            customer_id: row.get(2)?,
            role: row.get(3)?,
            text: row.get(4)?,
            timestamp: row.get(5)?,
            payload: row.get(6)?,
        })
    }

    fn into_stored(self) -> Result<StoredTurn> {
        let payload = self
            .payload
            .map(|raw| serde_json::from_str(&raw))
            .transpose()?;

        Ok(StoredTurn {
            seq: self.seq,
            turn: ConversationTurn {
                id: parse_uuid(&self.id)?,
                customer_id: self.customer_id,
                role: self.role.parse()?,
                text: self.text,
                timestamp: parse_ts(&self.timestamp)?,
                payload,
            },
        })
    }
}

#[async_trait]
impl SessionStore for SqliteStorage {
    async fn load_session(&self, customer_id: CustomerId) -> Result<Option<SessionState>> {
        self.with_conn(move |conn| {
            let row = conn
                .query_row(
                    r#"
                    SELECT customer_id, session_id, started_at, last_activity,
                           current_intent, pending_confirmation, cart, preferences
                    FROM sessions WHERE customer_id = ?1
                    "#,
                    params![customer_id],
                    |row| {
                        Ok(SessionRow {
                            customer_id: row.get(0)?,
                            session_id: row.get(1)?,
                            started_at: row.get(2)?,
                            last_activity: row.get(3)?,
                            current_intent: row.get(4)?,
                            pending_confirmation: row.get(5)?,
                            cart: row.get(6)?,
                            preferences: row.get(7)?,
                        })
                    },
                )
                .optional()?;

            row.map(SessionRow::into_state).transpose()
        })
        .await
    }

    async fn save_session(&self, state: &SessionState) -> Result<()> {
        let state = state.clone();
        self.with_conn(move |conn| upsert_session(conn, &state)).await
    }

    async fn append_turns(&self, state: &SessionState, turns: &[ConversationTurn]) -> Result<()> {
        let state = state.clone();
        let turns = turns.to_vec();

        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            upsert_session(&tx, &state)?;

            for turn in &turns {
                let payload = turn
                    .payload
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?;

                tx.execute(
                    r#"
                    INSERT INTO turns (id, customer_id, session_id, role, text, timestamp, payload)
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                    "#,
                    params![
                        turn.id.to_string(),
                        turn.customer_id,
                        state.session_id.to_string(),
                        turn.role.as_str(),
                        turn.text,
                        ts(&turn.timestamp),
                        payload,
                    ],
                )?;
            }

            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn recent_turns(
        &self,
        customer_id: CustomerId,
        session_id: Uuid,
        limit: usize,
    ) -> Result<Vec<ConversationTurn>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);

        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                r#"
                SELECT seq, id, customer_id, role, text, timestamp, payload FROM (
                    SELECT seq, id, customer_id, role, text, timestamp, payload
                    FROM turns
                    WHERE customer_id = ?1 AND session_id = ?2
                    ORDER BY seq DESC
                    LIMIT ?3
                ) ORDER BY seq ASC
                "#,
            )?;

            let rows = stmt.query_map(
                params![customer_id, session_id.to_string(), limit],
                TurnRow::from_row,
            )?;

            let mut turns = Vec::new();
            for row in rows {
                turns.push(row?.into_stored()?.turn);
            }
            Ok(turns)
        })
        .await
    }

    async fn count_turns(&self, customer_id: CustomerId, session_id: Uuid) -> Result<usize> {
        self.with_conn(move |conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM turns WHERE customer_id = ?1 AND session_id = ?2",
                params![customer_id, session_id.to_string()],
                |row| row.get(0),
            )?;
            Ok(count as usize)
        })
        .await
    }

    async fn turns_after(
        &self,
        customer_id: CustomerId,
        after_seq: i64,
        limit: usize,
    ) -> Result<Vec<StoredTurn>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);

        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                r#"
                SELECT seq, id, customer_id, role, text, timestamp, payload
                FROM turns
                WHERE customer_id = ?1 AND seq > ?2
                ORDER BY seq ASC
                LIMIT ?3
                "#,
            )?;

            let rows = stmt.query_map(params![customer_id, after_seq, limit], TurnRow::from_row)?;

            let mut turns = Vec::new();
            for row in rows {
                turns.push(row?.into_stored()?);
            }
            Ok(turns)
        })
        .await
    }

    async fn end_session(&self, customer_id: CustomerId) -> Result<bool> {
        self.with_conn(move |conn| {
            let deleted = conn.execute(
                "DELETE FROM sessions WHERE customer_id = ?1",
                params![customer_id],
            )?;
            Ok(deleted > 0)
        })
        .await
    }

    async fn active_customers(&self, since: DateTime<Utc>) -> Result<Vec<CustomerId>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT customer_id FROM sessions WHERE last_activity >= ?1 ORDER BY customer_id",
            )?;
            let rows = stmt.query_map(params![ts(&since)], |row| row.get(0))?;
            rows.collect::<std::result::Result<Vec<_>, _>>()
                .map_err(Error::from)
        })
        .await
    }

    async fn record_outcome(
        &self,
        customer_id: CustomerId,
        outcome: &InteractionOutcome,
        keep: usize,
    ) -> Result<()> {
        let outcome = outcome.clone();
        let keep = i64::try_from(keep).unwrap_or(i64::MAX);

        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            tx.execute(
                r#"
                INSERT INTO interaction_outcomes (customer_id, outcome, details, recorded_at)
                VALUES (?1, ?2, ?3, ?4)
                "#,
                params![
                    customer_id,
                    outcome.outcome,
                    serde_json::to_string(&outcome.details)?,
                    ts(&outcome.recorded_at),
                ],
            )?;
            tx.execute(
                r#"
                DELETE FROM interaction_outcomes
                WHERE customer_id = ?1 AND seq NOT IN (
                    SELECT seq FROM interaction_outcomes
                    WHERE customer_id = ?1
                    ORDER BY seq DESC
                    LIMIT ?2
                )
                "#,
                params![customer_id, keep],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn recent_outcomes(
        &self,
        customer_id: CustomerId,
        limit: usize,
    ) -> Result<Vec<InteractionOutcome>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);

        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                r#"
                SELECT outcome, details, recorded_at FROM (
                    SELECT seq, outcome, details, recorded_at
                    FROM interaction_outcomes
                    WHERE customer_id = ?1
                    ORDER BY seq DESC
                    LIMIT ?2
                ) ORDER BY seq ASC
                "#,
            )?;
            let rows = stmt.query_map(params![customer_id, limit], |row| {
                Ok(OutcomeRow {
                    outcome: row.get(0)?,
                    details: row.get(1)?,
                    recorded_at: row.get(2)?,
                })
            })?;

            let mut outcomes = Vec::new();
            for row in rows {
                outcomes.push(row?.into_outcome()?);
            }
            Ok(outcomes)
        })
        .await
    }
}

#[async_trait]
impl ProfileStore for SqliteStorage {
    async fn has_order(&self, order_id: i64) -> Result<bool> {
        self.with_conn(move |conn| {
            let found = conn
                .query_row(
                    "SELECT 1 FROM orders WHERE order_id = ?1",
                    params![order_id],
                    |_| Ok(()),
                )
                .optional()?;
            Ok(found.is_some())
        })
        .await
    }

    async fn load_profile(&self, customer_id: CustomerId) -> Result<Option<MemoryProfile>> {
        self.with_conn(move |conn| {
            let raw: Option<String> = conn
                .query_row(
                    "SELECT profile FROM profiles WHERE customer_id = ?1",
                    params![customer_id],
                    |row| row.get(0),
                )
                .optional()?;

            raw.map(|raw| serde_json::from_str(&raw).map_err(Error::from))
                .transpose()
        })
        .await
    }

    async fn commit_order(&self, order: &OrderSummary, profile: &MemoryProfile) -> Result<bool> {
        let order = order.clone();
        let profile = profile.clone();

        self.with_conn(move |conn| {
            let tx = conn.transaction()?;

            let inserted = tx.execute(
                r#"
                INSERT INTO orders (order_id, customer_id, summary, completed_at)
                VALUES (?1, ?2, ?3, ?4)
                ON CONFLICT(order_id) DO NOTHING
                "#,
                params![
                    order.order_id,
                    order.customer_id,
                    serde_json::to_string(&order)?,
                    ts(&order.completed_at),
                ],
            )?;
            if inserted == 0 {
                // dropping the transaction rolls it back
                return Ok(false);
            }

            upsert_profile(&tx, &profile)?;
            tx.commit()?;
            Ok(true)
        })
        .await
    }

    async fn save_profile(&self, profile: &MemoryProfile) -> Result<()> {
        let profile = profile.clone();
        self.with_conn(move |conn| upsert_profile(conn, &profile)).await
    }

    async fn list_orders(&self, customer_id: CustomerId) -> Result<Vec<OrderSummary>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                r#"
                SELECT summary FROM orders
                WHERE customer_id = ?1
                ORDER BY completed_at ASC, order_id ASC
                "#,
            )?;
            let rows = stmt.query_map(params![customer_id], |row| row.get::<_, String>(0))?;

            let mut orders = Vec::new();
            for raw in rows {
                orders.push(serde_json::from_str(&raw?)?);
            }
            Ok(orders)
        })
        .await
    }

    async fn recent_orders(
        &self,
        customer_id: CustomerId,
        limit: usize,
    ) -> Result<Vec<OrderSummary>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);

        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                r#"
                SELECT summary FROM orders
                WHERE customer_id = ?1
                ORDER BY completed_at DESC, order_id DESC
                LIMIT ?2
                "#,
            )?;
            let rows = stmt.query_map(params![customer_id, limit], |row| row.get::<_, String>(0))?;

            let mut orders = Vec::new();
            for raw in rows {
                orders.push(serde_json::from_str(&raw?)?);
            }
            Ok(orders)
        })
        .await
    }
}
