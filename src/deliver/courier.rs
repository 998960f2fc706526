//! Outbound delivery: MX resolution and the SMTP push

use crate::mailbox::Job;
use hickory_resolver::Resolver;
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::error::ResolveErrorKind;
use lettre::address::Envelope;
use lettre::{Address, SmtpTransport, Transport};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum CourierError {
    /// The destination rejected the message for good; do not retry
    #[error("permanent delivery failure: {0}")]
    Permanent(String),

    /// The attempt failed for a reason worth retrying
    #[error("transient delivery failure: {0}")]
    Transient(String),
}

/// Pushes one job's message to one destination host.
pub trait Courier: Send + Sync {
    fn deliver(&self, host: &str, job: &Job) -> Result<(), CourierError>;
}

/// Real outbound SMTP courier: resolves the destination's mail exchangers
/// and relays the raw message over a plain SMTP session.
pub struct SmtpCourier {
    resolver: Resolver,
    timeout: Duration,
}

impl SmtpCourier {
    pub fn new(timeout: Duration) -> Result<Self, std::io::Error> {
        let resolver = Resolver::from_system_conf()
            .or_else(|_| Resolver::new(ResolverConfig::default(), ResolverOpts::default()))?;
        Ok(Self { resolver, timeout })
    }

    /// Mail-exchange targets in preference order; a host with no MX
    /// records is its own implicit target (RFC 5321 §5.1).
    fn mx_targets(&self, host: &str) -> Result<Vec<String>, CourierError> {
        match self.resolver.mx_lookup(host) {
            Ok(lookup) => {
                let mut records: Vec<(u16, String)> = lookup
                    .iter()
                    .map(|mx| (mx.preference(), mx.exchange().to_utf8()))
                    .collect();
                records.sort();
                if records.is_empty() {
                    return Ok(vec![host.to_string()]);
                }
                Ok(records
                    .into_iter()
                    .map(|(_, name)| name.trim_end_matches('.').to_string())
                    .collect())
            }
            Err(e) if matches!(e.kind(), ResolveErrorKind::NoRecordsFound { .. }) => {
                Ok(vec![host.to_string()])
            }
            Err(e) => Err(CourierError::Transient(format!(
                "MX lookup for {host} failed: {e}"
            ))),
        }
    }
}

impl Courier for SmtpCourier {
    fn deliver(&self, host: &str, job: &Job) -> Result<(), CourierError> {
        let from = Address::new(job.from.user.clone(), job.from.host.clone())
            .map_err(|e| CourierError::Permanent(format!("bad return path: {e}")))?;
        let rcpt = job
            .rcpt
            .iter()
            .map(|user| Address::new(user.clone(), host))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| CourierError::Permanent(format!("bad recipient: {e}")))?;
        let envelope = Envelope::new(Some(from), rcpt)
            .map_err(|e| CourierError::Permanent(format!("bad envelope: {e}")))?;

        let mut last_error = String::from("no delivery targets");
        for target in self.mx_targets(host)? {
            let mailer = SmtpTransport::builder_dangerous(target.as_str())
                .timeout(Some(self.timeout))
                .build();
            match mailer.send_raw(&envelope, job.raw.as_bytes()) {
                Ok(_) => return Ok(()),
                Err(e) if e.is_permanent() => {
                    return Err(CourierError::Permanent(format!("{target}: {e}")));
                }
                Err(e) => {
                    debug!(host, target = %target, error = %e, "delivery attempt failed");
                    last_error = format!("{target}: {e}");
                }
            }
        }

        Err(CourierError::Transient(last_error))
    }
}
