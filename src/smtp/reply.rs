//! SMTP reply handling

/// A status line sent back to the client, multi-line capable.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    /// The SMTP reply code (e.g., 250, 354, 502)
    pub code: u16,
    /// The human-readable text of the first line
    pub text: String,
    /// Continuation lines for multi-line replies (EHLO capabilities)
    pub lines: Option<Vec<String>>,
}

impl Reply {
    /// Create a new single-line reply
    pub fn new(code: u16, text: &str) -> Self {
        Self {
            code,
            text: text.to_string(),
            lines: None,
        }
    }

    /// Create a new multi-line reply
    pub fn new_multiline(code: u16, text: &str, lines: Vec<String>) -> Self {
        Self {
            code,
            text: text.to_owned(),
            lines: Some(lines),
        }
    }

    /// Connection greeting (220)
    pub fn greeting(hostname: &str) -> Self {
        Self::new(220, &format!("{hostname} ESMTP service ready"))
    }

    /// Success reply (250 OK)
    pub fn ok() -> Self {
        Self::new(250, "OK")
    }

    /// Success reply after a message was queued (250)
    pub fn queued(id: u64) -> Self {
        Self::new(250, &format!("OK: queued as {id}"))
    }

    /// HELO reply (250)
    pub fn helo(hostname: &str, client_id: &str) -> Self {
        Self::new(250, &format!("{hostname} Hello {client_id}"))
    }

    /// EHLO reply (250) advertising capabilities
    pub fn ehlo(hostname: &str, client_id: &str) -> Self {
        let capabilities = vec![
            "VRFY".to_owned(),
            format!("SIZE {}", super::error::SmtpLimits::MAX_DATA_SIZE),
        ];
        Self::new_multiline(
            250,
            &format!("{hostname} Hello {client_id}"),
            capabilities,
        )
    }

    /// Forwarding acknowledgement for a relayed recipient (251)
    pub fn will_forward() -> Self {
        Self::new(251, "User not local; will forward")
    }

    /// VRFY decline (252)
    pub fn cannot_vrfy() -> Self {
        Self::new(252, "Cannot VRFY user, but will accept message and attempt delivery")
    }

    /// DATA intermediate reply (354)
    pub fn data_start() -> Self {
        Self::new(354, "End data with <CR><LF>.<CR><LF>")
    }

    /// QUIT reply (221)
    pub fn quit(hostname: &str) -> Self {
        Self::new(221, &format!("{hostname} closing connection"))
    }

    /// Idle-timeout close (421)
    pub fn idle_timeout(hostname: &str) -> Self {
        Self::new(421, &format!("{hostname} closing connection due to inactivity"))
    }

    /// Unrecognized command or unparseable line (502)
    pub fn not_recognized() -> Self {
        Self::new(502, "Command not recognized")
    }

    /// Wrong command sequence (503)
    pub fn bad_sequence(text: &str) -> Self {
        Self::new(503, text)
    }

    /// Syntax error in parameters (501)
    pub fn syntax_error(text: &str) -> Self {
        Self::new(501, text)
    }

    /// Local recipient does not exist (550)
    pub fn no_mailbox() -> Self {
        Self::new(550, "No such user here")
    }

    /// Remote recipient and relaying is disabled (550)
    pub fn relay_denied() -> Self {
        Self::new(550, "Relaying denied")
    }

    /// DATA payload failed validation (550)
    pub fn malformed_message() -> Self {
        Self::new(550, "Message not RFC 2822 compliant")
    }

    /// Store failure during a command (451)
    pub fn processing_error() -> Self {
        Self::new(451, "Requested action aborted: error in processing")
    }

    /// Format the reply for sending over the wire
    pub fn format(&self) -> String {
        if let Some(ref lines) = self.lines {
            let mut result = format!("{}-{}\r\n", self.code, self.text);
            for (i, line) in lines.iter().enumerate() {
                if i == lines.len() - 1 {
                    // Last line uses space instead of dash
                    result.push_str(&format!("{} {}\r\n", self.code, line));
                } else {
                    result.push_str(&format!("{}-{}\r\n", self.code, line));
                }
            }
            result
        } else {
            format!("{} {}\r\n", self.code, self.text)
        }
    }

    /// Check if this is a positive completion reply (2xx)
    pub fn is_positive(&self) -> bool {
        (200..300).contains(&self.code)
    }

    /// Check if this is an error reply (4xx or 5xx)
    pub fn is_error(&self) -> bool {
        self.code >= 400
    }
}
