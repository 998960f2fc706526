//! In-memory representation of one e-mail

use crate::smtp::address::Address;
use chrono::Utc;

/// One complete message as accepted at the end of DATA.
///
/// `inbound` recipients resolve to a local mailbox at enqueue time,
/// `outbound` recipients do not; the two lists are disjoint.
#[derive(Debug, Clone)]
pub struct Envelope {
    /// Queue identifier, assigned once by the store
    pub id: u64,
    /// Raw message content, headers and body
    pub raw: String,
    /// Return-path established by MAIL FROM
    pub from: Address,
    /// Recipients deliverable to a local mailbox
    pub inbound: Vec<Address>,
    /// Recipients that need outbound relay
    pub outbound: Vec<Address>,
}

impl Envelope {
    /// All recipients, inbound first, order-preserving
    pub fn rcpt(&self) -> impl Iterator<Item = &Address> {
        self.inbound.iter().chain(self.outbound.iter())
    }

    /// Prepend a synthesized header line to the raw content.
    ///
    /// Only valid before the body is fixed at DATA completion.
    pub fn prepend_header(&mut self, name: &str, value: &str) {
        self.raw.insert_str(0, &format!("{name}: {value}\r\n"));
    }

    /// Prepend the trace header recording receipt of this message
    pub fn prepend_received(&mut self, hostname: &str, client_id: &str) {
        let date = Utc::now().to_rfc2822();
        self.prepend_header(
            "Received",
            &format!("from {client_id} by {hostname} with SMTP; {date}"),
        );
    }
}
