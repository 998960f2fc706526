//! SQLite-backed mailbox store

use crate::mailbox::{Batch, Job, Mailbox, MailboxError, Outcome, Query, Resolution};
use crate::smtp::address::Address;
use crate::smtp::envelope::Envelope;
use chrono::Utc;
use sqlite::{Connection, ConnectionThreadSafe, State};
use std::path::Path;
use std::sync::Mutex;
use tracing::{debug, warn};

const SCHEMA: &[&str] = &[
    "PRAGMA foreign_keys = ON",
    "CREATE TABLE IF NOT EXISTS ids (
        next INTEGER NOT NULL
    )",
    "INSERT INTO ids (next) SELECT 1 WHERE NOT EXISTS (SELECT 1 FROM ids)",
    "CREATE TABLE IF NOT EXISTS mailboxes (
        user TEXT PRIMARY KEY
    )",
    "CREATE TABLE IF NOT EXISTS messages (
        id     INTEGER PRIMARY KEY,
        sender TEXT NOT NULL,
        rcpt   TEXT NOT NULL,
        raw    TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS queue (
        host       TEXT NOT NULL,
        message_id INTEGER NOT NULL REFERENCES messages (id),
        rcpt       TEXT NOT NULL,
        date_added INTEGER NOT NULL,
        attempts   INTEGER NOT NULL DEFAULT 0
    )",
    "CREATE INDEX IF NOT EXISTS queue_age ON queue (date_added, host)",
    "CREATE TABLE IF NOT EXISTS inbox (
        user       TEXT NOT NULL REFERENCES mailboxes (user),
        message_id INTEGER NOT NULL REFERENCES messages (id)
    )",
    "CREATE TABLE IF NOT EXISTS failures (
        host       TEXT NOT NULL,
        message_id INTEGER NOT NULL,
        rcpt       TEXT NOT NULL,
        reason     TEXT NOT NULL,
        failed_at  INTEGER NOT NULL
    )",
];

/// Durable queue and local-inbox store on one SQLite database.
///
/// All writes are serialized behind a single connection; every multi-step
/// operation runs inside one BEGIN IMMEDIATE transaction with sequential
/// sub-writes, never concurrent writers on a shared handle.
pub struct SqlMailbox {
    conn: Mutex<ConnectionThreadSafe>,
    local_host: String,
}

impl SqlMailbox {
    /// Open (and initialize if needed) a store backed by the given file
    pub fn open(path: impl AsRef<Path>, local_host: &str) -> Result<Self, MailboxError> {
        let conn = Connection::open_thread_safe(path)?;
        for statement in SCHEMA {
            conn.execute(statement)?;
        }
        Ok(Self {
            conn: Mutex::new(conn),
            local_host: local_host.to_owned(),
        })
    }

    /// Open a store that lives only as long as the process
    pub fn open_in_memory(local_host: &str) -> Result<Self, MailboxError> {
        Self::open(":memory:", local_host)
    }

    /// Provision a local mailbox; idempotent
    pub fn add_mailbox(&self, user: &str) -> Result<(), MailboxError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("INSERT OR IGNORE INTO mailboxes (user) VALUES (?)")?;
        stmt.bind((1, user))?;
        stmt.next()?;
        Ok(())
    }

    /// Message ids appended to a local mailbox, oldest first
    pub fn inbox(&self, user: &str) -> Result<Vec<u64>, MailboxError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare("SELECT message_id FROM inbox WHERE user = ? ORDER BY message_id")?;
        stmt.bind((1, user))?;
        let mut ids = Vec::new();
        while stmt.next()? == State::Row {
            ids.push(stmt.read::<i64, _>(0)? as u64);
        }
        Ok(ids)
    }

    /// Raw content of a stored message, if it exists
    pub fn message(&self, id: u64) -> Result<Option<String>, MailboxError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT raw FROM messages WHERE id = ?")?;
        stmt.bind((1, id as i64))?;
        if stmt.next()? == State::Row {
            Ok(Some(stmt.read::<String, _>(0)?))
        } else {
            Ok(None)
        }
    }

    /// Number of rows currently queued for outbound delivery
    pub fn queue_len(&self) -> Result<usize, MailboxError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT COUNT(*) FROM queue")?;
        stmt.next()?;
        Ok(stmt.read::<i64, _>(0)? as usize)
    }

    /// Number of recorded permanent failures
    pub fn failure_count(&self) -> Result<usize, MailboxError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT COUNT(*) FROM failures")?;
        stmt.next()?;
        Ok(stmt.read::<i64, _>(0)? as usize)
    }
}

/// Run `body` inside one transaction, rolling back on error.
fn transaction<T>(
    conn: &ConnectionThreadSafe,
    body: impl FnOnce(&ConnectionThreadSafe) -> Result<T, MailboxError>,
) -> Result<T, MailboxError> {
    conn.execute("BEGIN IMMEDIATE")?;
    match body(conn) {
        Ok(value) => {
            conn.execute("COMMIT")?;
            Ok(value)
        }
        Err(err) => {
            let _ = conn.execute("ROLLBACK");
            Err(err)
        }
    }
}

fn now_micros() -> i64 {
    Utc::now().timestamp_micros()
}

fn placeholders(count: usize) -> String {
    vec!["?"; count].join(", ")
}

impl Mailbox for SqlMailbox {
    fn next_id(&self) -> Result<u64, MailboxError> {
        let conn = self.conn.lock().unwrap();
        transaction(&conn, |conn| {
            let mut stmt = conn.prepare("SELECT next FROM ids")?;
            if stmt.next()? != State::Row {
                return Err(MailboxError::Invariant("ids table is empty".to_string()));
            }
            let id = stmt.read::<i64, _>(0)?;
            drop(stmt);
            conn.execute("UPDATE ids SET next = next + 1")?;
            Ok(id as u64)
        })
    }

    fn enqueue(&self, envelope: &Envelope) -> Result<(), MailboxError> {
        let conn = self.conn.lock().unwrap();
        transaction(&conn, |conn| {
            let rcpt_list = envelope
                .rcpt()
                .map(|a| a.to_string())
                .collect::<Vec<_>>()
                .join(", ");

            let mut stmt =
                conn.prepare("INSERT INTO messages (id, sender, rcpt, raw) VALUES (?, ?, ?, ?)")?;
            stmt.bind((1, envelope.id as i64))?;
            stmt.bind((2, envelope.from.to_string().as_str()))?;
            stmt.bind((3, rcpt_list.as_str()))?;
            stmt.bind((4, envelope.raw.as_str()))?;
            stmt.next()?;
            drop(stmt);

            let now = now_micros();
            let mut stmt = conn.prepare(
                "INSERT INTO queue (host, message_id, rcpt, date_added, attempts)
                 VALUES (?, ?, ?, ?, 0)",
            )?;
            for rcpt in &envelope.outbound {
                stmt.reset()?;
                stmt.bind((1, rcpt.host.as_str()))?;
                stmt.bind((2, envelope.id as i64))?;
                stmt.bind((3, rcpt.user.as_str()))?;
                stmt.bind((4, now))?;
                stmt.next()?;
            }
            drop(stmt);

            let mut stmt = conn.prepare("INSERT INTO inbox (user, message_id) VALUES (?, ?)")?;
            for rcpt in &envelope.inbound {
                stmt.reset()?;
                stmt.bind((1, rcpt.user.as_str()))?;
                stmt.bind((2, envelope.id as i64))?;
                stmt.next()?;
            }
            Ok(())
        })
    }

    fn query(&self, addr: &Address) -> Result<Query, MailboxError> {
        if !addr.host.eq_ignore_ascii_case(&self.local_host) {
            return Ok(Query::NotLocal);
        }
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT 1 FROM mailboxes WHERE user = ?")?;
        stmt.bind((1, addr.user.as_str()))?;
        if stmt.next()? == State::Row {
            Ok(Query::FoundLocal)
        } else {
            Ok(Query::NotFoundLocal)
        }
    }

    fn dequeue(&self, host_count: usize) -> Result<(Batch, usize), MailboxError> {
        if host_count == 0 {
            return Ok((Batch::new(), 0));
        }
        let conn = self.conn.lock().unwrap();
        transaction(&conn, |conn| {
            // Walk (date_added, host) pairs in ascending order, taking each
            // time the smallest pair strictly greater than the last cutoff
            // whose host is not yet selected.
            let mut selected: Vec<String> = Vec::new();
            let mut cutoff: Option<(i64, String)> = None;

            while selected.len() < host_count {
                let found = match &cutoff {
                    None => {
                        let mut stmt = conn.prepare(
                            "SELECT date_added, host FROM queue
                             ORDER BY date_added, host LIMIT 1",
                        )?;
                        if stmt.next()? == State::Row {
                            Some((stmt.read::<i64, _>(0)?, stmt.read::<String, _>(1)?))
                        } else {
                            None
                        }
                    }
                    Some((ts, host)) => {
                        let sql = format!(
                            "SELECT date_added, host FROM queue
                             WHERE host NOT IN ({})
                               AND (date_added > ? OR (date_added = ? AND host > ?))
                             ORDER BY date_added, host LIMIT 1",
                            placeholders(selected.len())
                        );
                        let mut stmt = conn.prepare(&sql)?;
                        let mut index = 1;
                        for name in &selected {
                            stmt.bind((index, name.as_str()))?;
                            index += 1;
                        }
                        stmt.bind((index, *ts))?;
                        stmt.bind((index + 1, *ts))?;
                        stmt.bind((index + 2, host.as_str()))?;
                        if stmt.next()? == State::Row {
                            Some((stmt.read::<i64, _>(0)?, stmt.read::<String, _>(1)?))
                        } else {
                            None
                        }
                    }
                };

                match found {
                    Some((ts, host)) => {
                        selected.push(host.clone());
                        cutoff = Some((ts, host));
                    }
                    None => break,
                }
            }

            if selected.is_empty() {
                return Ok((Batch::new(), 0));
            }

            // Every row of a selected host joins the batch, not just the
            // seed rows.
            let sql = format!(
                "SELECT q.host, q.message_id, q.rcpt, q.attempts, m.sender, m.raw
                 FROM queue q JOIN messages m ON m.id = q.message_id
                 WHERE q.host IN ({})
                 ORDER BY q.host, q.message_id",
                placeholders(selected.len())
            );
            let mut stmt = conn.prepare(&sql)?;
            for (i, name) in selected.iter().enumerate() {
                stmt.bind((i + 1, name.as_str()))?;
            }

            let mut batch = Batch::new();
            while stmt.next()? == State::Row {
                let host = stmt.read::<String, _>(0)?;
                let message_id = stmt.read::<i64, _>(1)? as u64;
                let user = stmt.read::<String, _>(2)?;
                let attempts = stmt.read::<i64, _>(3)? as u32;
                let sender = stmt.read::<String, _>(4)?;
                let raw = stmt.read::<String, _>(5)?;

                let from = Address::parse(&sender).map_err(|_| {
                    MailboxError::Invariant(format!("unparseable stored sender: {sender}"))
                })?;

                let jobs = batch.entry(host).or_insert_with(Vec::new);
                match jobs.last_mut() {
                    Some(job) if job.message_id == message_id => job.rcpt.push(user),
                    _ => jobs.push(Job {
                        message_id,
                        from,
                        raw,
                        rcpt: vec![user],
                        // Report the post-lease count
                        attempts: attempts + 1,
                    }),
                }
            }
            drop(stmt);

            // The lease: rows picked up but never confirmed will reappear,
            // aged, while other hosts leapfrog them in the meantime.
            let sql = format!(
                "UPDATE queue SET date_added = ?, attempts = attempts + 1
                 WHERE host IN ({})",
                placeholders(selected.len())
            );
            let mut stmt = conn.prepare(&sql)?;
            stmt.bind((1, now_micros()))?;
            for (i, name) in selected.iter().enumerate() {
                stmt.bind((i + 2, name.as_str()))?;
            }
            stmt.next()?;

            Ok((batch, selected.len()))
        })
    }

    fn update(&self, resolutions: &[Resolution]) -> Result<(), MailboxError> {
        if resolutions.is_empty() {
            return Ok(());
        }
        let conn = self.conn.lock().unwrap();
        transaction(&conn, |conn| {
            for res in resolutions {
                match &res.outcome {
                    Outcome::Deferred(reason) => {
                        debug!(
                            host = %res.host,
                            id = res.message_id,
                            reason,
                            "delivery deferred, rows stay queued"
                        );
                        continue;
                    }
                    Outcome::Delivered => {}
                    Outcome::Failed(reason) => {
                        warn!(
                            host = %res.host,
                            id = res.message_id,
                            reason,
                            "delivery failed permanently"
                        );
                        let mut stmt = conn.prepare(
                            "INSERT INTO failures (host, message_id, rcpt, reason, failed_at)
                             VALUES (?, ?, ?, ?, ?)",
                        )?;
                        let now = now_micros();
                        for user in &res.rcpt {
                            stmt.reset()?;
                            stmt.bind((1, res.host.as_str()))?;
                            stmt.bind((2, res.message_id as i64))?;
                            stmt.bind((3, user.as_str()))?;
                            stmt.bind((4, reason.as_str()))?;
                            stmt.bind((5, now))?;
                            stmt.next()?;
                        }
                    }
                }

                let mut stmt = conn.prepare(
                    "DELETE FROM queue WHERE host = ? AND message_id = ? AND rcpt = ?",
                )?;
                for user in &res.rcpt {
                    stmt.reset()?;
                    stmt.bind((1, res.host.as_str()))?;
                    stmt.bind((2, res.message_id as i64))?;
                    stmt.bind((3, user.as_str()))?;
                    stmt.next()?;
                }
            }
            Ok(())
        })
    }
}
