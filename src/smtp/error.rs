//! Error types for the SMTP listener

use crate::smtp::reply::Reply;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SmtpError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed address: {0}")]
    BadAddress(String),

    #[error("Line too long (max {max} characters)")]
    LineTooLong { max: usize },

    #[error("Path too long (max {max} characters)")]
    PathTooLong { max: usize },

    #[error("Too many recipients (max {max})")]
    TooManyRecipients { max: usize },

    #[error("Too much mail data (max {max} bytes)")]
    TooMuchData { max: usize },

    #[error("Domain name too long (max {max} characters)")]
    DomainTooLong { max: usize },

    #[error("User name too long (max {max} characters)")]
    UserTooLong { max: usize },

    #[error("Transaction is missing a return path or recipients")]
    IncompleteEnvelope,
}

/// SMTP size limits as defined in RFC 821
pub struct SmtpLimits;

impl SmtpLimits {
    /// Maximum length of a user name
    pub const USER_MAX_LENGTH: usize = 64;

    /// Maximum length of a domain name
    pub const DOMAIN_MAX_LENGTH: usize = 64;

    /// Maximum length of a path (reverse-path or forward-path)
    pub const PATH_MAX_LENGTH: usize = 256;

    /// Maximum length of a command line including CRLF
    pub const COMMAND_LINE_MAX_LENGTH: usize = 512;

    /// Maximum length of a reply line including CRLF
    pub const REPLY_LINE_MAX_LENGTH: usize = 512;

    /// Maximum length of a text line including CRLF
    pub const TEXT_LINE_MAX_LENGTH: usize = 1000;

    /// Maximum number of recipients per message
    pub const MAX_RECIPIENTS: usize = 100;

    /// Maximum total size of message data
    pub const MAX_DATA_SIZE: usize = 10 * 1024 * 1024; // 10MB
}

impl SmtpError {
    /// Map an error to the reply sent back over the wire.
    pub fn to_reply(&self) -> Reply {
        match self {
            SmtpError::Io(_) => Reply::new(421, "Service not available"),
            SmtpError::BadAddress(msg) => Reply::new(501, &format!("Syntax error: {msg}")),
            SmtpError::LineTooLong { max } => {
                Reply::new(500, &format!("Line too long (max {max} characters)"))
            }
            SmtpError::PathTooLong { max } => {
                Reply::new(501, &format!("Path too long (max {max} characters)"))
            }
            SmtpError::TooManyRecipients { max } => {
                Reply::new(552, &format!("Too many recipients (max {max})"))
            }
            SmtpError::TooMuchData { max } => {
                Reply::new(552, &format!("Too much mail data (max {max} bytes)"))
            }
            SmtpError::DomainTooLong { max } => {
                Reply::new(501, &format!("Domain name too long (max {max} characters)"))
            }
            SmtpError::UserTooLong { max } => {
                Reply::new(501, &format!("User name too long (max {max} characters)"))
            }
            SmtpError::IncompleteEnvelope => Reply::new(503, "Bad sequence of commands"),
        }
    }
}
