//! Runtime settings shared by the server and the delivery agent.

use std::time::Duration;

/// Server-wide configuration.
///
/// A single instance is built at startup and shared behind an `Arc`;
/// nothing mutates it after that.
#[derive(Debug, Clone)]
pub struct Config {
    /// Address the SMTP listener binds to
    pub listen: String,
    /// Name this host announces in greetings and Received headers
    pub hostname: String,
    /// Accept mail for non-local recipients and queue it for forwarding
    pub relay: bool,
    /// Advertise TLS readiness (no negotiation happens yet)
    pub tls: bool,
    /// How long a connection may sit idle before a 421 closes it
    pub idle_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:2525".to_string(),
            hostname: "localhost".to_string(),
            relay: false,
            tls: false,
            idle_timeout: Duration::from_secs(300),
        }
    }
}
