//! Command dispatch for the SMTP transaction engine
//!
//! The table is built once at server start and shared read-only across
//! every connection task; handlers mutate only the per-connection
//! transaction.

use crate::host::Mailhost;
use crate::mailbox::Query;
use crate::smtp::address::Address;
use crate::smtp::reply::Reply;
use crate::smtp::transaction::{Mode, Transaction};
use regex::Regex;
use std::collections::HashMap;
use std::sync::LazyLock;
use tracing::warn;

/// Request lines are a 4-letter word, optionally followed by one space and
/// a free-form parameter.
static LINE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<word>[A-Za-z]{4})(?: (?P<param>.*))?$").expect("line pattern is valid")
});

/// What the connection loop should do after a command
#[derive(Debug)]
pub enum Action {
    /// Send the reply and keep reading commands
    Reply(Reply),
    /// Send the interim reply, then collect the dot-terminated DATA block
    Data(Reply),
    /// Send the reply and end the connection loop
    Close(Reply),
}

type Handler = fn(&mut Transaction, Option<&str>, &Mailhost) -> Action;

struct Command {
    /// Lower bound on the transaction mode; below it the command is
    /// rejected with a stage-specific 503
    require: Mode,
    run: Handler,
}

/// Immutable mapping from command word to handler and state rules.
pub struct Dispatch {
    table: HashMap<&'static str, Command>,
}

impl Dispatch {
    /// Build the table; done once at server start
    pub fn new() -> Self {
        let mut table: HashMap<&'static str, Command> = HashMap::new();
        table.insert("HELO", Command { require: Mode::Helo, run: helo });
        table.insert("EHLO", Command { require: Mode::Helo, run: ehlo });
        table.insert("MAIL", Command { require: Mode::Mail, run: mail });
        table.insert("RCPT", Command { require: Mode::Rcpt, run: rcpt });
        table.insert("DATA", Command { require: Mode::Data, run: data });
        table.insert("RSET", Command { require: Mode::Helo, run: rset });
        table.insert("NOOP", Command { require: Mode::Helo, run: noop });
        table.insert("VRFY", Command { require: Mode::Helo, run: vrfy });
        table.insert("QUIT", Command { require: Mode::Helo, run: quit });
        Self { table }
    }

    /// Dispatch one request line.
    ///
    /// Lines that do not match the grammar, and grammatically valid words
    /// with no table entry, both yield the generic 502 without touching
    /// the transaction.
    pub fn handle(&self, line: &str, txn: &mut Transaction, host: &Mailhost) -> Action {
        let Some(caps) = LINE_RE.captures(line) else {
            return Action::Reply(Reply::not_recognized());
        };
        let word = caps["word"].to_ascii_uppercase();
        let param = caps.name("param").map(|m| m.as_str().trim()).filter(|p| !p.is_empty());

        let Some(command) = self.table.get(word.as_str()) else {
            return Action::Reply(Reply::not_recognized());
        };

        if txn.mode < command.require {
            return Action::Reply(Reply::bad_sequence(sequence_text(&word, txn.mode)));
        }

        (command.run)(txn, param, host)
    }
}

impl Default for Dispatch {
    fn default() -> Self {
        Self::new()
    }
}

/// Stage-specific text for a 503 rejection
fn sequence_text(word: &str, mode: Mode) -> &'static str {
    match (word, mode) {
        ("MAIL", Mode::Helo) | ("RCPT", Mode::Helo) | ("DATA", Mode::Helo) => "Say HELO first",
        ("RCPT", Mode::Mail) => "Need MAIL before RCPT",
        ("DATA", Mode::Mail) => "Need MAIL before DATA",
        ("DATA", Mode::Rcpt) => "Need RCPT before DATA",
        _ => "Bad sequence of commands",
    }
}

fn helo(txn: &mut Transaction, param: Option<&str>, host: &Mailhost) -> Action {
    let Some(client_id) = param else {
        return Action::Reply(Reply::syntax_error("HELO requires domain argument"));
    };
    txn.hello(client_id);
    Action::Reply(Reply::helo(&host.config().hostname, client_id))
}

fn ehlo(txn: &mut Transaction, param: Option<&str>, host: &Mailhost) -> Action {
    let Some(client_id) = param else {
        return Action::Reply(Reply::syntax_error("EHLO requires domain argument"));
    };
    txn.hello(client_id);
    Action::Reply(Reply::ehlo(&host.config().hostname, client_id))
}

fn mail(txn: &mut Transaction, param: Option<&str>, _host: &Mailhost) -> Action {
    if txn.mode >= Mode::Rcpt {
        return Action::Reply(Reply::bad_sequence("Nested MAIL command"));
    }
    let Some(rest) = param.and_then(|p| strip_prefix_ignore_case(p, "FROM:")) else {
        return Action::Reply(Reply::syntax_error("Syntax: MAIL FROM:<address>"));
    };
    match Address::parse(rest) {
        Ok(from) => {
            txn.set_return_path(from);
            Action::Reply(Reply::ok())
        }
        Err(err) => Action::Reply(err.to_reply()),
    }
}

fn rcpt(txn: &mut Transaction, param: Option<&str>, host: &Mailhost) -> Action {
    let Some(rest) = param.and_then(|p| strip_prefix_ignore_case(p, "TO:")) else {
        return Action::Reply(Reply::syntax_error("Syntax: RCPT TO:<address>"));
    };
    let addr = match Address::parse(rest) {
        Ok(addr) => addr,
        Err(err) => return Action::Reply(err.to_reply()),
    };

    match host.query(&addr) {
        Ok(Query::FoundLocal) => match txn.add_local_rcpt(addr) {
            Ok(()) => Action::Reply(Reply::ok()),
            Err(err) => Action::Reply(err.to_reply()),
        },
        Ok(Query::NotFoundLocal) => Action::Reply(Reply::no_mailbox()),
        Ok(Query::NotLocal) if host.config().relay => match txn.add_remote_rcpt(addr) {
            Ok(()) => Action::Reply(Reply::will_forward()),
            Err(err) => Action::Reply(err.to_reply()),
        },
        Ok(Query::NotLocal) => Action::Reply(Reply::relay_denied()),
        Err(err) => {
            warn!(error = %err, "mailbox query failed during RCPT");
            Action::Reply(Reply::processing_error())
        }
    }
}

fn data(_txn: &mut Transaction, param: Option<&str>, _host: &Mailhost) -> Action {
    if param.is_some() {
        return Action::Reply(Reply::syntax_error("DATA takes no argument"));
    }
    Action::Data(Reply::data_start())
}

fn rset(txn: &mut Transaction, _param: Option<&str>, _host: &Mailhost) -> Action {
    txn.reset();
    Action::Reply(Reply::ok())
}

fn noop(_txn: &mut Transaction, _param: Option<&str>, _host: &Mailhost) -> Action {
    Action::Reply(Reply::ok())
}

fn vrfy(_txn: &mut Transaction, _param: Option<&str>, _host: &Mailhost) -> Action {
    Action::Reply(Reply::cannot_vrfy())
}

fn quit(txn: &mut Transaction, _param: Option<&str>, host: &Mailhost) -> Action {
    txn.reset();
    Action::Close(Reply::quit(&host.config().hostname))
}

/// Strip an ASCII prefix case-insensitively.
///
/// Compares bytes, never slicing `input` mid-character; the input may
/// contain arbitrary multibyte text.
fn strip_prefix_ignore_case<'a>(input: &'a str, prefix: &str) -> Option<&'a str> {
    let head = input.as_bytes().get(..prefix.len())?;
    if head.eq_ignore_ascii_case(prefix.as_bytes()) {
        Some(input[prefix.len()..].trim())
    } else {
        None
    }
}
