//! Periodic delivery agent draining the mail queue

use crate::mailbox::{Job, Mailbox, MailboxError, Outcome, Resolution};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

pub mod courier;

pub use courier::{Courier, CourierError, SmtpCourier};

/// Tuning for the delivery agent
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Interval between queue drains
    pub tick: Duration,
    /// Distinct destination hosts serviced per tick
    pub hosts_per_tick: usize,
    /// Cap on concurrent outbound host deliveries
    pub max_concurrent: usize,
    /// Lease count at which a transient failure becomes permanent
    pub max_attempts: u32,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(60),
            hosts_per_tick: 10,
            max_concurrent: 5,
            max_attempts: 5,
        }
    }
}

/// Drains the queue on a timer and fans out per-host delivery attempts.
pub struct Agent {
    mailbox: Arc<dyn Mailbox>,
    courier: Arc<dyn Courier>,
    config: AgentConfig,
}

impl Agent {
    pub fn new(mailbox: Arc<dyn Mailbox>, courier: Arc<dyn Courier>, config: AgentConfig) -> Self {
        Self {
            mailbox,
            courier,
            config,
        }
    }

    /// Run the agent loop until a store error makes it bail.
    ///
    /// Per-host delivery failures are resolved through the store and never
    /// end the loop; a dequeue or update failure does.
    pub fn run(&self) -> Result<(), MailboxError> {
        info!(
            tick = ?self.config.tick,
            hosts_per_tick = self.config.hosts_per_tick,
            "delivery agent started"
        );
        loop {
            thread::sleep(self.config.tick);
            self.tick()?;
        }
    }

    /// Drain one batch: dequeue, deliver host-by-host, resolve.
    pub fn tick(&self) -> Result<(), MailboxError> {
        let (batch, n) = self.mailbox.dequeue(self.config.hosts_per_tick)?;
        if n == 0 {
            return Ok(());
        }
        debug!(hosts = n, "dequeued delivery batch");

        let hosts: Vec<(String, Vec<Job>)> = batch.into_iter().collect();
        let mut resolutions = Vec::new();

        // Bounded fan-out: at most max_concurrent hosts in flight, the
        // rest of the batch waits its turn.
        for chunk in hosts.chunks(self.config.max_concurrent.max(1)) {
            thread::scope(|scope| {
                let handles: Vec<_> = chunk
                    .iter()
                    .map(|(host, jobs)| {
                        scope.spawn(move || self.deliver_host(host, jobs))
                    })
                    .collect();
                for handle in handles {
                    resolutions.extend(handle.join().unwrap_or_default());
                }
            });
        }

        self.mailbox.update(&resolutions)
    }

    /// Attempt every job queued for one host; failures here are isolated
    /// to this host's resolutions.
    fn deliver_host(&self, host: &str, jobs: &[Job]) -> Vec<Resolution> {
        jobs.iter()
            .map(|job| {
                let outcome = match self.courier.deliver(host, job) {
                    Ok(()) => {
                        info!(host, id = job.message_id, rcpt = job.rcpt.len(), "delivered");
                        Outcome::Delivered
                    }
                    Err(CourierError::Permanent(reason)) => Outcome::Failed(reason),
                    Err(CourierError::Transient(reason)) => {
                        if job.attempts >= self.config.max_attempts {
                            warn!(
                                host,
                                id = job.message_id,
                                attempts = job.attempts,
                                "retry limit reached, giving up"
                            );
                            Outcome::Failed(format!("retry limit reached: {reason}"))
                        } else {
                            Outcome::Deferred(reason)
                        }
                    }
                };
                Resolution {
                    host: host.to_string(),
                    message_id: job.message_id,
                    rcpt: job.rcpt.clone(),
                    outcome,
                }
            })
            .collect()
    }
}
