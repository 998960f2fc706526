//! # Tegami
//!
//! Tegami is a small mail transfer agent. It speaks the RFC 821 minimal
//! command set on the wire, stores accepted mail durably in SQLite, and
//! drains the outbound queue with a periodic delivery agent.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::thread;
//! use std::time::Duration;
//! use tegami::{Agent, AgentConfig, Config, SmtpCourier, SmtpServer, SqlMailbox};
//!
//! let config = Arc::new(Config::default());
//! let mailbox = Arc::new(SqlMailbox::open("mail.db", &config.hostname).unwrap());
//! mailbox.add_mailbox("postmaster").unwrap();
//!
//! // Drain the queue in the background.
//! let agent = Agent::new(
//!     mailbox.clone(),
//!     Arc::new(SmtpCourier::new(Duration::from_secs(30)).unwrap()),
//!     AgentConfig::default(),
//! );
//! thread::spawn(move || agent.run());
//!
//! // Accept mail until killed.
//! let server = SmtpServer::new(config, mailbox);
//! server.start().unwrap();
//! ```
//!
//! ## Supported SMTP commands
//!
//! - `HELO` / `EHLO` - Identify the sender
//! - `MAIL FROM` - Specify the sender's address
//! - `RCPT TO` - Specify the destination (multiple destinations are supported)
//! - `DATA` - Send the email body
//! - `RSET` - Reset the current transaction
//! - `NOOP` - Do nothing
//! - `VRFY` - Ask about a mailbox without committing to send
//! - `QUIT` - Close connection
//!
//! ## Notes
//!
//! - Only the "minimal implementation" defined in RFC 821 is implemented,
//!   plus `EHLO` and `VRFY`.
//! - Mail for local users lands in their inbox; mail for remote hosts is
//!   queued and forwarded when relaying is enabled.
//! - SMTP authentication is not supported.
//! - SSL/TLS is accepted as configuration but not negotiated yet.
//!
//! ## Size Limits
//!
//! The server enforces RFC 821 size limits:
//! - User names: 64 characters max
//! - Domain names: 64 characters max
//! - Paths: 256 characters max
//! - Command lines: 512 characters max
//! - Recipients: 100 max per message
//! - Message bodies: 10 MiB max

pub mod config;
pub mod deliver;
pub mod host;
pub mod mailbox;
pub mod smtp;

pub use config::Config;
pub use deliver::{Agent, AgentConfig, Courier, CourierError, SmtpCourier};
pub use host::{DigestError, Mailhost};
pub use mailbox::{Batch, Job, Mailbox, MailboxError, Outcome, Query, Resolution, SqlMailbox};
pub use smtp::{
    Action, Address, Dispatch, Envelope, Mode, Reply, SmtpError, SmtpLimits, SmtpServer,
    Transaction,
};
