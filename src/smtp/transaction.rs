//! SMTP transaction state management

use crate::smtp::address::Address;
use crate::smtp::envelope::Envelope;
use crate::smtp::error::{SmtpError, SmtpLimits};

/// Protocol states in strict ascending order.
///
/// Each mode names the command the transaction is ready for; a command
/// requiring mode `S` is rejected unless the current mode is at least `S`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Mode {
    /// Waiting for HELO/EHLO
    Helo,
    /// Greeting received, waiting for MAIL
    Mail,
    /// Return-path set, waiting for RCPT
    Rcpt,
    /// At least one recipient accepted, DATA may begin
    Data,
}

/// Per-connection protocol state machine holding the in-progress envelope.
#[derive(Debug)]
pub struct Transaction {
    /// Current mode
    pub mode: Mode,
    /// Client identity declared by HELO/EHLO
    pub client_id: Option<String>,
    /// Return-path from MAIL FROM
    pub from: Option<Address>,
    /// Recipients resolved to a local mailbox
    pub inbound: Vec<Address>,
    /// Recipients that will need outbound relay
    pub outbound: Vec<Address>,
}

impl Transaction {
    /// Create a fresh transaction, as on connection accept
    pub fn new() -> Self {
        Self {
            mode: Mode::Helo,
            client_id: None,
            from: None,
            inbound: Vec::new(),
            outbound: Vec::new(),
        }
    }

    /// Record the client identity from HELO/EHLO and discard any
    /// in-progress envelope
    pub fn hello(&mut self, client_id: &str) {
        self.client_id = Some(client_id.to_owned());
        self.from = None;
        self.inbound.clear();
        self.outbound.clear();
        self.mode = Mode::Mail;
    }

    /// Set the return-path, clearing recipients from any prior attempt
    pub fn set_return_path(&mut self, from: Address) {
        self.from = Some(from);
        self.inbound.clear();
        self.outbound.clear();
        self.mode = Mode::Rcpt;
    }

    /// Add a recipient resolvable to a local mailbox
    pub fn add_local_rcpt(&mut self, rcpt: Address) -> Result<(), SmtpError> {
        self.check_rcpt_count()?;
        self.inbound.push(rcpt);
        self.mode = Mode::Data;
        Ok(())
    }

    /// Add a recipient that will be relayed
    pub fn add_remote_rcpt(&mut self, rcpt: Address) -> Result<(), SmtpError> {
        self.check_rcpt_count()?;
        self.outbound.push(rcpt);
        self.mode = Mode::Data;
        Ok(())
    }

    fn check_rcpt_count(&self) -> Result<(), SmtpError> {
        if self.inbound.len() + self.outbound.len() >= SmtpLimits::MAX_RECIPIENTS {
            return Err(SmtpError::TooManyRecipients {
                max: SmtpLimits::MAX_RECIPIENTS,
            });
        }
        Ok(())
    }

    /// Discard the in-progress envelope.
    ///
    /// Mode returns to `Mail` if a greeting was already exchanged,
    /// otherwise it is unchanged.
    pub fn reset(&mut self) {
        self.from = None;
        self.inbound.clear();
        self.outbound.clear();
        if self.mode > Mode::Helo {
            self.mode = Mode::Mail;
        }
    }

    /// Assemble the completed envelope at the end of DATA.
    ///
    /// The queue id stays zero until the store assigns one.
    pub fn assemble(&self, raw: String) -> Result<Envelope, SmtpError> {
        let from = self.from.clone().ok_or(SmtpError::IncompleteEnvelope)?;
        if self.inbound.is_empty() && self.outbound.is_empty() {
            return Err(SmtpError::IncompleteEnvelope);
        }

        Ok(Envelope {
            id: 0,
            raw,
            from,
            inbound: self.inbound.clone(),
            outbound: self.outbound.clone(),
        })
    }
}

impl Default for Transaction {
    fn default() -> Self {
        Self::new()
    }
}
