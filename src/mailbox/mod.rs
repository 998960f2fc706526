//! Durable mail queue and local-inbox persistence
//!
//! The store is the only shared mutable state in the process. The protocol
//! engine and the delivery agent reach it exclusively through the [`Mailbox`]
//! trait, which is responsible for its own internal serialization.

use crate::smtp::address::Address;
use crate::smtp::envelope::Envelope;
use std::collections::HashMap;
use thiserror::Error;

pub mod sql;

pub use sql::SqlMailbox;

/// Classification of a recipient address at RCPT time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Query {
    /// Local domain, mailbox exists
    FoundLocal,
    /// Local domain, no such mailbox
    NotFoundLocal,
    /// Foreign domain
    NotLocal,
}

/// One unit of outbound work: a message and its recipients on one host.
///
/// Produced transiently by [`Mailbox::dequeue`]; it is a view over queue
/// rows, not a persisted entity.
#[derive(Debug, Clone)]
pub struct Job {
    /// Envelope id in the message store
    pub message_id: u64,
    /// Return-path for the outbound session
    pub from: Address,
    /// Raw message content
    pub raw: String,
    /// Recipient user-parts on the destination host
    pub rcpt: Vec<String>,
    /// Lease count after this dequeue
    pub attempts: u32,
}

/// Jobs keyed by destination host
pub type Batch = HashMap<String, Vec<Job>>;

/// Delivery outcome reported back through [`Mailbox::update`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Confirmed delivery, queue rows are removed
    Delivered,
    /// Permanent failure, queue rows are removed and the failure recorded
    Failed(String),
    /// Transient failure, queue rows stay for a later batch
    Deferred(String),
}

/// Resolution of one job after a delivery attempt
#[derive(Debug, Clone)]
pub struct Resolution {
    pub host: String,
    pub message_id: u64,
    pub rcpt: Vec<String>,
    pub outcome: Outcome,
}

#[derive(Error, Debug)]
pub enum MailboxError {
    #[error("database error: {0}")]
    Sqlite(#[from] sqlite::Error),

    #[error("store invariant violated: {0}")]
    Invariant(String),
}

/// The store contract consumed by the protocol engine and the agent.
pub trait Mailbox: Send + Sync {
    /// Return a monotonically increasing identifier that never repeats
    fn next_id(&self) -> Result<u64, MailboxError>;

    /// Persist a completed envelope as a single all-or-nothing unit:
    /// the message itself, one queue row per outbound recipient, and an
    /// inbox append per local recipient
    fn enqueue(&self, envelope: &Envelope) -> Result<(), MailboxError>;

    /// Classify a recipient address
    fn query(&self, addr: &Address) -> Result<Query, MailboxError>;

    /// Select up to `host_count` distinct destination hosts by
    /// oldest-backlog-first, lease every row of the selected hosts, and
    /// return the per-host jobs together with the number of hosts found
    fn dequeue(&self, host_count: usize) -> Result<(Batch, usize), MailboxError>;

    /// Resolve leased rows after delivery attempts; safe with an empty slice
    fn update(&self, resolutions: &[Resolution]) -> Result<(), MailboxError>;
}
