//! SQLite-backed record store for work items and per-owner SMTP settings.
//!
//! Every mutation of `status` / `batch_id` is one conditional `UPDATE` whose
//! `WHERE` clause carries the expected current state. Several scheduler
//! processes may share the same database file; whichever statement commits
//! first wins and the others match zero rows.

use std::collections::HashSet;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use nexus_core::error::{NexusError, Result};
use nexus_core::traits::{RecordStore, TransportResolver};
use nexus_core::types::{ItemStatus, NewWorkItem, SmtpSettings, TerminalUpdate, WorkItem};
use rusqlite::types::Value;
use rusqlite::{Connection, OptionalExtension, params, params_from_iter};

/// Shared SELECT column list for work item queries.
const ITEM_SELECT: &str = "SELECT id, owner_key, campaign_key, recipient, subject, body, status, \
     scheduled_at_ms, batch_id, dispatched_at_ms, rate_limit_retry_at_ms, \
     consecutive_rate_limit_failures, terminal_at_ms, opened_at_ms, created_at_ms FROM work_items";

fn to_ms(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

fn from_ms(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

fn db_err(context: &'static str) -> impl Fn(rusqlite::Error) -> NexusError {
    move |e| NexusError::StoreUnavailable(format!("{context}: {e}"))
}

/// `?{start}, ?{start+1}, ...` for an `IN (...)` list.
fn placeholders(start: usize, count: usize) -> String {
    (start..start + count)
        .map(|i| format!("?{i}"))
        .collect::<Vec<_>>()
        .join(", ")
}

fn row_to_item(row: &rusqlite::Row) -> rusqlite::Result<WorkItem> {
    let status: String = row.get(6)?;
    let status = ItemStatus::parse(&status).ok_or_else(|| {
        rusqlite::Error::InvalidColumnType(6, status.clone(), rusqlite::types::Type::Text)
    })?;
    Ok(WorkItem {
        id: row.get(0)?,
        owner_key: row.get(1)?,
        campaign_key: row.get(2)?,
        recipient: row.get(3)?,
        subject: row.get(4)?,
        body: row.get(5)?,
        status,
        scheduled_at: from_ms(row.get(7)?),
        batch_id: row.get(8)?,
        dispatched_at: row.get::<_, Option<i64>>(9)?.map(from_ms),
        rate_limit_retry_at: row.get::<_, Option<i64>>(10)?.map(from_ms),
        consecutive_rate_limit_failures: row.get(11)?,
        terminal_at: row.get::<_, Option<i64>>(12)?.map(from_ms),
        opened_at: row.get::<_, Option<i64>>(13)?.map(from_ms),
        created_at: from_ms(row.get(14)?),
    })
}

/// Record store + transport settings, one SQLite connection.
pub struct MailDb {
    conn: Mutex<Connection>,
    /// Used when an owner has no `smtp_settings` row.
    fallback_smtp: Option<SmtpSettings>,
}

impl MailDb {
    /// Open or create the database. `":memory:"` gives a private in-memory store.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .map_err(|e| NexusError::StoreUnavailable(format!("DB open error: {e}")))?;

        // WAL lets several dispatcher processes share the file; busy_timeout turns
        // lock contention into a short wait instead of an error.
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA busy_timeout = 5000;",
        )
        .map_err(db_err("DB pragma error"))?;

        let db = Self {
            conn: Mutex::new(conn),
            fallback_smtp: None,
        };
        db.migrate()?;
        Ok(db)
    }

    /// Settings for owners without their own row.
    pub fn with_fallback_smtp(mut self, settings: Option<SmtpSettings>) -> Self {
        self.fallback_smtp = settings;
        self
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| NexusError::StoreUnavailable(format!("connection lock poisoned: {e}")))
    }

    fn migrate(&self) -> Result<()> {
        self.conn()?
            .execute_batch(
                "
            CREATE TABLE IF NOT EXISTS work_items (
                id TEXT PRIMARY KEY,
                owner_key TEXT NOT NULL,
                campaign_key TEXT,
                recipient TEXT NOT NULL,
                subject TEXT NOT NULL,
                body TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                scheduled_at_ms INTEGER NOT NULL,
                batch_id TEXT,
                dispatched_at_ms INTEGER,
                rate_limit_retry_at_ms INTEGER,
                consecutive_rate_limit_failures INTEGER NOT NULL DEFAULT 0,
                terminal_at_ms INTEGER,
                opened_at_ms INTEGER,
                created_at_ms INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_work_items_due
                ON work_items (status, owner_key, scheduled_at_ms);
            CREATE INDEX IF NOT EXISTS idx_work_items_batch
                ON work_items (batch_id);

            -- Per-owner outbound relay
            CREATE TABLE IF NOT EXISTS smtp_settings (
                owner_key TEXT PRIMARY KEY,
                host TEXT NOT NULL,
                port INTEGER NOT NULL DEFAULT 587,
                use_tls INTEGER NOT NULL DEFAULT 1,
                username TEXT,
                password TEXT,
                from_email TEXT NOT NULL,
                display_name TEXT,
                signature TEXT NOT NULL DEFAULT '',
                timeout_secs INTEGER,
                updated_at_ms INTEGER NOT NULL
            );
            ",
            )
            .map_err(db_err("Migration"))?;
        Ok(())
    }

    // ─── SMTP settings ──────────────────────────────────────

    /// Create or replace an owner's SMTP settings.
    pub fn save_smtp_settings(&self, owner_key: &str, settings: &SmtpSettings) -> Result<()> {
        self.conn()?
            .execute(
                "INSERT OR REPLACE INTO smtp_settings
                 (owner_key, host, port, use_tls, username, password, from_email, display_name,
                  signature, timeout_secs, updated_at_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    owner_key,
                    settings.host,
                    settings.port,
                    settings.use_tls as i32,
                    settings.username,
                    settings.password,
                    settings.from_email,
                    settings.display_name,
                    settings.signature,
                    settings.timeout_secs.map(|t| t as i64),
                    to_ms(Utc::now()),
                ],
            )
            .map_err(db_err("Save SMTP settings"))?;
        Ok(())
    }

    /// An owner's own SMTP settings, ignoring the fallback.
    pub fn smtp_settings(&self, owner_key: &str) -> Result<Option<SmtpSettings>> {
        self.conn()?
            .query_row(
                "SELECT host, port, use_tls, username, password, from_email, display_name,
                        signature, timeout_secs
                 FROM smtp_settings WHERE owner_key = ?1",
                [owner_key],
                |row| {
                    Ok(SmtpSettings {
                        host: row.get(0)?,
                        port: row.get(1)?,
                        use_tls: row.get::<_, i32>(2)? != 0,
                        username: row.get(3)?,
                        password: row.get(4)?,
                        from_email: row.get(5)?,
                        display_name: row.get(6)?,
                        signature: row.get(7)?,
                        timeout_secs: row.get::<_, Option<i64>>(8)?.map(|t| t.max(0) as u64),
                    })
                },
            )
            .optional()
            .map_err(db_err("Load SMTP settings"))
    }
}

#[async_trait]
impl RecordStore for MailDb {
    async fn insert(&self, item: &NewWorkItem, now: DateTime<Utc>) -> Result<WorkItem> {
        let id = uuid::Uuid::new_v4().to_string();
        self.conn()?
            .execute(
                "INSERT INTO work_items
                 (id, owner_key, campaign_key, recipient, subject, body, status, scheduled_at_ms,
                  created_at_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'pending', ?7, ?8)",
                params![
                    id,
                    item.owner_key,
                    item.campaign_key,
                    item.recipient,
                    item.subject,
                    item.body,
                    to_ms(item.scheduled_at),
                    to_ms(now),
                ],
            )
            .map_err(db_err("Insert work item"))?;
        Ok(WorkItem {
            id,
            owner_key: item.owner_key.clone(),
            campaign_key: item.campaign_key.clone(),
            recipient: item.recipient.clone(),
            subject: item.subject.clone(),
            body: item.body.clone(),
            status: ItemStatus::Pending,
            scheduled_at: from_ms(to_ms(item.scheduled_at)),
            batch_id: None,
            dispatched_at: None,
            rate_limit_retry_at: None,
            consecutive_rate_limit_failures: 0,
            terminal_at: None,
            opened_at: None,
            created_at: from_ms(to_ms(now)),
        })
    }

    async fn get(&self, id: &str) -> Result<Option<WorkItem>> {
        self.conn()?
            .query_row(&format!("{ITEM_SELECT} WHERE id = ?1"), [id], row_to_item)
            .optional()
            .map_err(db_err("Get work item"))
    }

    async fn release_expired_holds(&self, now: DateTime<Utc>) -> Result<usize> {
        self.conn()?
            .execute(
                "UPDATE work_items
                 SET status = 'pending', rate_limit_retry_at_ms = NULL,
                     batch_id = NULL, dispatched_at_ms = NULL
                 WHERE status IN ('pending', 'rate_limited')
                   AND rate_limit_retry_at_ms IS NOT NULL
                   AND rate_limit_retry_at_ms <= ?1",
                [to_ms(now)],
            )
            .map_err(db_err("Release expired holds"))
    }

    async fn reclaim_stuck(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        self.conn()?
            .execute(
                "UPDATE work_items
                 SET status = 'pending', batch_id = NULL, dispatched_at_ms = NULL
                 WHERE status IN ('dispatched', 'sending')
                   AND dispatched_at_ms < ?1",
                [to_ms(cutoff)],
            )
            .map_err(db_err("Reclaim stuck claims"))
    }

    async fn eligible_owners(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT owner_key FROM work_items
                 WHERE status = 'pending' AND scheduled_at_ms <= ?1
                   AND rate_limit_retry_at_ms IS NULL
                 GROUP BY owner_key
                 ORDER BY MIN(scheduled_at_ms), owner_key
                 LIMIT ?2",
            )
            .map_err(db_err("Prepare eligible owners"))?;
        let owners = stmt
            .query_map(params![to_ms(now), limit as i64], |row| row.get(0))
            .map_err(db_err("Query eligible owners"))?
            .collect::<rusqlite::Result<Vec<String>>>()
            .map_err(db_err("Scan eligible owners"))?;
        Ok(owners)
    }

    async fn select_eligible(
        &self,
        owner_key: &str,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT id FROM work_items
                 WHERE owner_key = ?1 AND status = 'pending' AND scheduled_at_ms <= ?2
                   AND rate_limit_retry_at_ms IS NULL
                 ORDER BY scheduled_at_ms, created_at_ms, rowid
                 LIMIT ?3",
            )
            .map_err(db_err("Prepare select eligible"))?;
        let ids = stmt
            .query_map(params![owner_key, to_ms(now), limit as i64], |row| row.get(0))
            .map_err(db_err("Query select eligible"))?
            .collect::<rusqlite::Result<Vec<String>>>()
            .map_err(db_err("Scan select eligible"))?;
        Ok(ids)
    }

    async fn conditional_claim(
        &self,
        ids: &[String],
        batch_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<String>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "UPDATE work_items
             SET status = 'dispatched', batch_id = ?1, dispatched_at_ms = ?2
             WHERE status = 'pending' AND rate_limit_retry_at_ms IS NULL
               AND id IN ({})
             RETURNING id",
            placeholders(3, ids.len())
        );
        let mut values = vec![Value::Text(batch_id.to_string()), Value::Integer(to_ms(now))];
        values.extend(ids.iter().cloned().map(Value::Text));

        let conn = self.conn()?;
        let mut stmt = conn.prepare(&sql).map_err(db_err("Prepare claim"))?;
        let claimed = stmt
            .query_map(params_from_iter(values.iter()), |row| row.get::<_, String>(0))
            .map_err(db_err("Claim"))?
            .collect::<rusqlite::Result<HashSet<String>>>()
            .map_err(db_err("Scan claim"))?;

        // RETURNING order is unspecified; keep the selection (send) order.
        Ok(ids.iter().filter(|id| claimed.contains(*id)).cloned().collect())
    }

    async fn conditional_release(&self, ids: &[String], batch_id: &str) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let sql = format!(
            "UPDATE work_items
             SET status = 'pending', batch_id = NULL, dispatched_at_ms = NULL
             WHERE batch_id = ?1 AND status IN ('dispatched', 'sending')
               AND id IN ({})",
            placeholders(2, ids.len())
        );
        let mut values = vec![Value::Text(batch_id.to_string())];
        values.extend(ids.iter().cloned().map(Value::Text));
        self.conn()?
            .execute(&sql, params_from_iter(values.iter()))
            .map_err(db_err("Release claim"))
    }

    async fn mark_sending(&self, id: &str, batch_id: &str) -> Result<bool> {
        let changed = self
            .conn()?
            .execute(
                "UPDATE work_items SET status = 'sending'
                 WHERE id = ?1 AND batch_id = ?2 AND status = 'dispatched'",
                params![id, batch_id],
            )
            .map_err(db_err("Mark sending"))?;
        Ok(changed == 1)
    }

    async fn update_terminal(
        &self,
        id: &str,
        batch_id: &str,
        update: TerminalUpdate,
    ) -> Result<bool> {
        let conn = self.conn()?;
        let changed = match &update {
            TerminalUpdate::Sent { at } | TerminalUpdate::Failed { at } => conn.execute(
                "UPDATE work_items
                 SET status = ?3, terminal_at_ms = ?4, consecutive_rate_limit_failures = 0
                 WHERE id = ?1 AND batch_id = ?2 AND status = 'sending'",
                params![id, batch_id, update.status().as_str(), to_ms(*at)],
            ),
            TerminalUpdate::RateLimited {
                retry_at,
                consecutive_failures,
            } => conn.execute(
                "UPDATE work_items
                 SET status = 'rate_limited', rate_limit_retry_at_ms = ?3,
                     consecutive_rate_limit_failures = ?4
                 WHERE id = ?1 AND batch_id = ?2 AND status = 'sending'",
                params![id, batch_id, to_ms(*retry_at), consecutive_failures],
            ),
        }
        .map_err(db_err("Update terminal status"))?;
        Ok(changed == 1)
    }

    async fn status_counts(&self) -> Result<Vec<(ItemStatus, u64)>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT status, COUNT(*) FROM work_items GROUP BY status")
            .map_err(db_err("Prepare status counts"))?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))
            .map_err(db_err("Query status counts"))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err("Scan status counts"))?;

        Ok(ItemStatus::ALL
            .into_iter()
            .map(|status| {
                let count = rows
                    .iter()
                    .find(|(s, _)| s == status.as_str())
                    .map(|(_, c)| *c as u64)
                    .unwrap_or(0);
                (status, count)
            })
            .collect())
    }
}

#[async_trait]
impl TransportResolver for MailDb {
    async fn resolve(&self, owner_key: &str) -> Result<SmtpSettings> {
        match self.smtp_settings(owner_key)? {
            Some(settings) => Ok(settings),
            None => self
                .fallback_smtp
                .clone()
                .ok_or_else(|| NexusError::NotConfigured(owner_key.to_string())),
        }
    }
}
