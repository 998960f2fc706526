//! E-mail address grammar

use crate::smtp::error::{SmtpError, SmtpLimits};
use regex::Regex;
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

/// Accepts `"Display Name" <user@host>` and `<user@host>`.
static ADDRESS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^(?:"(?P<name>[^"]*)"\s+)?<(?P<user>[^<>@\s]+)@(?P<host>[^<>@\s]+)>$"#)
        .expect("address pattern is valid")
});

/// One mailbox address as it appears on the wire.
///
/// Equality is structural; `to_string` round-trips through `parse`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Address {
    /// Optional display name, empty when absent
    pub name: String,
    /// Local part, before the `@`
    pub user: String,
    /// Destination host, after the `@`
    pub host: String,
}

impl Address {
    /// Create an address without a display name
    pub fn new(user: &str, host: &str) -> Self {
        Self {
            name: String::new(),
            user: user.to_owned(),
            host: host.to_owned(),
        }
    }

    /// Parse an address from its wire form, enforcing RFC 821 size limits
    pub fn parse(input: &str) -> Result<Self, SmtpError> {
        let input = input.trim();
        if input.len() > SmtpLimits::PATH_MAX_LENGTH {
            return Err(SmtpError::PathTooLong {
                max: SmtpLimits::PATH_MAX_LENGTH,
            });
        }

        let caps = ADDRESS_RE
            .captures(input)
            .ok_or_else(|| SmtpError::BadAddress(input.to_string()))?;

        let user = caps["user"].to_string();
        let host = caps["host"].to_string();
        if user.len() > SmtpLimits::USER_MAX_LENGTH {
            return Err(SmtpError::UserTooLong {
                max: SmtpLimits::USER_MAX_LENGTH,
            });
        }
        if host.len() > SmtpLimits::DOMAIN_MAX_LENGTH {
            return Err(SmtpError::DomainTooLong {
                max: SmtpLimits::DOMAIN_MAX_LENGTH,
            });
        }

        Ok(Self {
            name: caps.name("name").map_or(String::new(), |m| m.as_str().to_string()),
            user,
            host,
        })
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.name.is_empty() {
            write!(f, "<{}@{}>", self.user, self.host)
        } else {
            write!(f, "\"{}\" <{}@{}>", self.name, self.user, self.host)
        }
    }
}

impl FromStr for Address {
    type Err = SmtpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
