//! Mail service mediating between transactions and the mailbox store

use crate::config::Config;
use crate::mailbox::{Mailbox, MailboxError, Query};
use crate::smtp::address::Address;
use crate::smtp::transaction::Transaction;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum DigestError {
    /// The assembled message failed header validation
    #[error("message is not RFC 2822 compliant")]
    Malformed,

    /// The transaction had no return path or no recipients
    #[error("transaction envelope is incomplete")]
    Incomplete,

    #[error(transparent)]
    Store(#[from] MailboxError),
}

/// Executes commands against the store and digests completed envelopes.
pub struct Mailhost {
    config: Arc<Config>,
    mailbox: Arc<dyn Mailbox>,
}

impl Mailhost {
    pub fn new(config: Arc<Config>, mailbox: Arc<dyn Mailbox>) -> Self {
        Self { config, mailbox }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Classify a recipient address for RCPT handling
    pub fn query(&self, addr: &Address) -> Result<Query, MailboxError> {
        self.mailbox.query(addr)
    }

    /// Accept a completed DATA payload: synthesize the trace header,
    /// validate, assign the queue id and enqueue.
    ///
    /// The caller resets the transaction only on success; a malformed
    /// message or a store failure leaves it intact for a client retry.
    pub fn digest(&self, txn: &Transaction, raw: String) -> Result<u64, DigestError> {
        let mut envelope = txn.assemble(raw).map_err(|_| DigestError::Incomplete)?;

        let client_id = txn.client_id.as_deref().unwrap_or("unknown");
        envelope.prepend_received(&self.config.hostname, client_id);

        if !headers_well_formed(&envelope.raw) {
            return Err(DigestError::Malformed);
        }

        envelope.id = self.mailbox.next_id()?;
        self.mailbox.enqueue(&envelope)?;

        info!(
            id = envelope.id,
            from = %envelope.from,
            inbound = envelope.inbound.len(),
            outbound = envelope.outbound.len(),
            "message accepted"
        );
        Ok(envelope.id)
    }
}

/// Check that the content starts with a syntactically valid header block.
///
/// Every line up to the first empty line (or end of input) must be either a
/// `Name: value` field or a whitespace-led continuation of the previous one.
fn headers_well_formed(raw: &str) -> bool {
    for line in raw.lines() {
        if line.is_empty() {
            return true; // blank separator, body follows
        }
        if line.starts_with(' ') || line.starts_with('\t') {
            continue; // folded continuation
        }
        match line.split_once(':') {
            Some((name, _)) if !name.is_empty() && !name.contains(' ') => {}
            _ => return false,
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mailbox::SqlMailbox;

    fn mailhost() -> (Mailhost, Arc<SqlMailbox>) {
        let config = Arc::new(Config {
            hostname: "local.example".to_string(),
            relay: true,
            ..Config::default()
        });
        let mailbox = Arc::new(SqlMailbox::open_in_memory("local.example").unwrap());
        mailbox.add_mailbox("bob").unwrap();
        (Mailhost::new(config, mailbox.clone()), mailbox)
    }

    fn transaction() -> Transaction {
        let mut txn = Transaction::new();
        txn.hello("client.example");
        txn.set_return_path(Address::new("jane", "widgets.example"));
        txn.add_local_rcpt(Address::new("bob", "local.example")).unwrap();
        txn
    }

    #[test]
    fn test_digest_enqueues() {
        let (host, mailbox) = mailhost();
        let txn = transaction();

        let id = host
            .digest(&txn, "Subject: Hi\r\n\r\nHello\r\n".to_string())
            .unwrap();
        assert_eq!(mailbox.inbox("bob").unwrap(), vec![id]);

        let raw = mailbox.message(id).unwrap().unwrap();
        assert!(raw.starts_with("Received: from client.example by local.example with SMTP; "));
        assert!(raw.contains("Subject: Hi\r\n"));
    }

    #[test]
    fn test_digest_empty_body() {
        let (host, mailbox) = mailhost();
        let txn = transaction();

        // A zero-length DATA payload is a valid message once the trace
        // header is prepended.
        let id = host.digest(&txn, String::new()).unwrap();
        let raw = mailbox.message(id).unwrap().unwrap();
        assert!(raw.starts_with("Received: "));
    }

    #[test]
    fn test_digest_malformed() {
        let (host, _) = mailhost();
        let txn = transaction();

        let result = host.digest(&txn, "this line is no header\r\n\r\nbody\r\n".to_string());
        assert!(matches!(result, Err(DigestError::Malformed)));
    }

    #[test]
    fn test_digest_incomplete() {
        let (host, _) = mailhost();
        let txn = Transaction::new();
        assert!(matches!(
            host.digest(&txn, String::new()),
            Err(DigestError::Incomplete)
        ));
    }

    #[test]
    fn test_headers_well_formed() {
        assert!(headers_well_formed(""));
        assert!(headers_well_formed("Subject: Hi\r\n\r\nbody\r\n"));
        assert!(headers_well_formed("Subject: Hi\r\n\tfolded line\r\n\r\nbody\r\n"));
        assert!(!headers_well_formed("no colon here\r\n\r\nbody\r\n"));
        assert!(!headers_well_formed("Bad Header: spaced name\r\n\r\n"));
        // Garbage after the blank separator is body, not headers
        assert!(headers_well_formed("Subject: Hi\r\n\r\nno colon here\r\n"));
    }
}
