//! End-to-end SMTP sessions against a live listener backed by SQLite

use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tegami::{Config, SmtpLimits, SmtpServer, SqlMailbox};

fn start_test_server(relay: bool) -> (String, Arc<SqlMailbox>) {
    start_test_server_with(Config {
        relay,
        ..test_config()
    })
}

fn test_config() -> Config {
    Config {
        hostname: "test.local".to_string(),
        idle_timeout: Duration::from_secs(5),
        ..Config::default()
    }
}

fn start_test_server_with(config: Config) -> (String, Arc<SqlMailbox>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap().to_string();

    let mailbox = Arc::new(SqlMailbox::open_in_memory("test.local").unwrap());
    mailbox.add_mailbox("bob").unwrap();

    let server = SmtpServer::new(Arc::new(config), mailbox.clone());
    thread::spawn(move || {
        if let Err(e) = server.start_with_listener(listener) {
            eprintln!("Error starting server: {e}");
        }
    });

    (addr, mailbox)
}

struct Session {
    stream: TcpStream,
    reader: BufReader<TcpStream>,
}

impl Session {
    fn connect(addr: &str) -> Self {
        let stream = TcpStream::connect(addr).unwrap();
        let reader = BufReader::new(stream.try_clone().unwrap());
        let mut session = Self { stream, reader };
        let greeting = session.read_reply();
        assert!(greeting.starts_with("220"), "greeting was {greeting:?}");
        session
    }

    fn read_reply(&mut self) -> String {
        let mut line = String::new();
        self.reader.read_line(&mut line).unwrap();
        line.trim().to_string()
    }

    /// Read a possibly multiline reply, returning every line.
    fn read_multiline(&mut self) -> Vec<String> {
        let mut lines = Vec::new();
        loop {
            let line = self.read_reply();
            let done = line.len() < 4 || line.as_bytes()[3] != b'-';
            lines.push(line);
            if done {
                break;
            }
        }
        lines
    }

    fn send(&mut self, command: &str) -> String {
        write!(self.stream, "{command}\r\n").unwrap();
        self.stream.flush().unwrap();
        self.read_reply()
    }

    fn send_raw(&mut self, text: &str) {
        write!(self.stream, "{text}").unwrap();
        self.stream.flush().unwrap();
    }
}

/// Extract the queue id from a "250 OK: queued as N" reply.
fn queued_id(reply: &str) -> u64 {
    reply
        .rsplit(' ')
        .next()
        .and_then(|n| n.parse().ok())
        .unwrap_or_else(|| panic!("no queue id in {reply:?}"))
}

#[test]
fn test_full_local_delivery_session() {
    let (addr, mailbox) = start_test_server(false);
    let mut session = Session::connect(&addr);

    assert!(session.send("HELO client.example").starts_with("250"));
    assert!(session.send("MAIL FROM:<jane@widgets.example>").starts_with("250"));
    assert!(session.send("RCPT TO:<bob@test.local>").starts_with("250"));
    assert!(session.send("DATA").starts_with("354"));

    session.send_raw("Subject: Greetings\r\n\r\nHi Bob\r\n");
    let reply = session.send(".");
    assert!(reply.starts_with("250"), "end of data got {reply:?}");

    let id = queued_id(&reply);
    assert_eq!(mailbox.inbox("bob").unwrap(), vec![id]);

    let stored = mailbox.message(id).unwrap().unwrap();
    assert!(stored.starts_with("Received: from client.example by test.local"));
    assert!(stored.contains("Subject: Greetings"));
    assert!(stored.ends_with("Hi Bob\r\n"));

    assert!(session.send("QUIT").starts_with("221"));
}

#[test]
fn test_ehlo_advertises_size() {
    let (addr, _mailbox) = start_test_server(false);
    let mut session = Session::connect(&addr);

    session.send_raw("EHLO client.example\r\n");
    let lines = session.read_multiline();
    assert!(lines.len() > 1, "EHLO reply was single-line: {lines:?}");
    assert!(lines[0].starts_with("250-"));
    assert!(lines.iter().any(|l| l.contains("SIZE")));
    assert!(lines.last().unwrap().starts_with("250 "));
}

#[test]
fn test_commands_out_of_order() {
    let (addr, _mailbox) = start_test_server(false);
    let mut session = Session::connect(&addr);

    assert!(session.send("MAIL FROM:<jane@widgets.example>").starts_with("503"));
    assert!(session.send("RCPT TO:<bob@test.local>").starts_with("503"));
    assert!(session.send("DATA").starts_with("503"));

    assert!(session.send("HELO client.example").starts_with("250"));
    assert!(session.send("RCPT TO:<bob@test.local>").starts_with("503"));
}

#[test]
fn test_unknown_command_is_502() {
    let (addr, _mailbox) = start_test_server(false);
    let mut session = Session::connect(&addr);

    assert!(session.send("EXPN staff").starts_with("502"));
    assert!(session.send("FOO").starts_with("502"));

    // State is untouched, the session still works.
    assert!(session.send("HELO client.example").starts_with("250"));
}

#[test]
fn test_command_line_length_limit() {
    let (addr, _mailbox) = start_test_server(false);
    let mut session = Session::connect(&addr);

    let long = "HELO ".to_string() + &"a".repeat(SmtpLimits::COMMAND_LINE_MAX_LENGTH);
    assert!(session.send(&long).starts_with("500"));

    // The connection survives an over-long line.
    assert!(session.send("HELO client.example").starts_with("250"));
}

#[test]
fn test_multibyte_parameter_keeps_connection_alive() {
    let (addr, _mailbox) = start_test_server(false);
    let mut session = Session::connect(&addr);

    session.send("HELO client.example");
    assert!(session.send("MAIL ééé").starts_with("501"));

    // The connection survives and the transaction is unharmed.
    assert!(session.send("MAIL FROM:<jane@widgets.example>").starts_with("250"));
    assert!(session.send("RCPT TO:<bob@test.local>").starts_with("250"));
}

#[test]
fn test_idle_connection_gets_421_and_close() {
    let (addr, _mailbox) = start_test_server_with(Config {
        idle_timeout: Duration::from_millis(100),
        ..test_config()
    });
    let mut session = Session::connect(&addr);

    // Send nothing; the server must time the read out on its own.
    let reply = session.read_reply();
    assert!(reply.starts_with("421"), "idle close got {reply:?}");

    // The server closed the socket after the 421.
    let mut rest = String::new();
    assert_eq!(session.reader.read_line(&mut rest).unwrap(), 0);
}

#[test]
fn test_data_over_size_limit_gets_552_and_reset() {
    let (addr, mailbox) = start_test_server(false);
    let mut session = Session::connect(&addr);

    session.send("HELO client.example");
    session.send("MAIL FROM:<jane@widgets.example>");
    session.send("RCPT TO:<bob@test.local>");
    assert!(session.send("DATA").starts_with("354"));

    // Stream comfortably past the cap; the server must keep consuming
    // and hold its reply until the terminator.
    let line = "a".repeat(64 * 1024) + "\r\n";
    let lines_needed = SmtpLimits::MAX_DATA_SIZE / line.len() + 2;
    for _ in 0..lines_needed {
        session.send_raw(&line);
    }
    assert!(session.send(".").starts_with("552"));
    assert!(mailbox.inbox("bob").unwrap().is_empty());

    // The transaction was reset, not left mid-envelope.
    assert!(session.send("DATA").starts_with("503"));
    assert!(session.send("MAIL FROM:<jane@widgets.example>").starts_with("250"));
}

#[test]
fn test_unknown_local_user_is_550() {
    let (addr, _mailbox) = start_test_server(false);
    let mut session = Session::connect(&addr);

    session.send("HELO client.example");
    session.send("MAIL FROM:<jane@widgets.example>");
    assert!(session.send("RCPT TO:<nobody@test.local>").starts_with("550"));
}

#[test]
fn test_relay_denied_without_flag() {
    let (addr, _mailbox) = start_test_server(false);
    let mut session = Session::connect(&addr);

    session.send("HELO client.example");
    session.send("MAIL FROM:<jane@widgets.example>");
    assert!(session.send("RCPT TO:<eve@gadgets.example>").starts_with("550"));
}

#[test]
fn test_relay_queues_remote_mail() {
    let (addr, mailbox) = start_test_server(true);
    let mut session = Session::connect(&addr);

    session.send("HELO client.example");
    session.send("MAIL FROM:<jane@widgets.example>");
    assert!(session.send("RCPT TO:<eve@gadgets.example>").starts_with("251"));
    assert!(session.send("DATA").starts_with("354"));

    session.send_raw("Subject: Outbound\r\n\r\nSee you\r\n");
    let reply = session.send(".");
    assert!(reply.starts_with("250"));

    assert_eq!(mailbox.queue_len().unwrap(), 1);
}

#[test]
fn test_dot_stuffing_is_removed() {
    let (addr, mailbox) = start_test_server(false);
    let mut session = Session::connect(&addr);

    session.send("HELO client.example");
    session.send("MAIL FROM:<jane@widgets.example>");
    session.send("RCPT TO:<bob@test.local>");
    session.send("DATA");

    session.send_raw("Subject: Dots\r\n\r\n..hidden\r\n.also\r\n");
    let reply = session.send(".");
    assert!(reply.starts_with("250"));

    let id = queued_id(&reply);
    let stored = mailbox.message(id).unwrap().unwrap();
    assert!(stored.contains(".hidden\r\n"));
    assert!(!stored.contains("..hidden"));
    assert!(stored.contains("also\r\n"));
}

#[test]
fn test_empty_body_is_accepted() {
    let (addr, mailbox) = start_test_server(false);
    let mut session = Session::connect(&addr);

    session.send("HELO client.example");
    session.send("MAIL FROM:<jane@widgets.example>");
    session.send("RCPT TO:<bob@test.local>");
    session.send("DATA");

    let reply = session.send(".");
    assert!(reply.starts_with("250"), "empty body got {reply:?}");
    assert_eq!(mailbox.inbox("bob").unwrap().len(), 1);
}

#[test]
fn test_malformed_headers_are_rejected() {
    let (addr, mailbox) = start_test_server(false);
    let mut session = Session::connect(&addr);

    session.send("HELO client.example");
    session.send("MAIL FROM:<jane@widgets.example>");
    session.send("RCPT TO:<bob@test.local>");
    session.send("DATA");

    session.send_raw("this is not a header line\r\n\r\nbody\r\n");
    assert!(session.send(".").starts_with("550"));
    assert!(mailbox.inbox("bob").unwrap().is_empty());

    // The envelope survives, a second DATA attempt can succeed.
    assert!(session.send("DATA").starts_with("354"));
    session.send_raw("Subject: Retry\r\n\r\nbody\r\n");
    assert!(session.send(".").starts_with("250"));
    assert_eq!(mailbox.inbox("bob").unwrap().len(), 1);
}

#[test]
fn test_rset_clears_envelope() {
    let (addr, _mailbox) = start_test_server(false);
    let mut session = Session::connect(&addr);

    session.send("HELO client.example");
    session.send("MAIL FROM:<jane@widgets.example>");
    session.send("RCPT TO:<bob@test.local>");
    assert!(session.send("RSET").starts_with("250"));

    // Back at the MAIL stage, not the HELO stage.
    assert!(session.send("DATA").starts_with("503"));
    assert!(session.send("MAIL FROM:<jane@widgets.example>").starts_with("250"));
}

#[test]
fn test_multiple_messages_per_connection() {
    let (addr, mailbox) = start_test_server(false);
    let mut session = Session::connect(&addr);

    session.send("HELO client.example");
    for n in 0..3 {
        assert!(session.send("MAIL FROM:<jane@widgets.example>").starts_with("250"));
        assert!(session.send("RCPT TO:<bob@test.local>").starts_with("250"));
        assert!(session.send("DATA").starts_with("354"));
        session.send_raw(&format!("Subject: Message {n}\r\n\r\nbody\r\n"));
        assert!(session.send(".").starts_with("250"));
    }

    assert_eq!(mailbox.inbox("bob").unwrap().len(), 3);
}

#[test]
fn test_vrfy_and_noop() {
    let (addr, _mailbox) = start_test_server(false);
    let mut session = Session::connect(&addr);

    assert!(session.send("NOOP").starts_with("250"));
    assert!(session.send("VRFY bob").starts_with("252"));
}
