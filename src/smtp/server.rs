//! SMTP listener and per-connection read/dispatch loop

use crate::config::Config;
use crate::host::{DigestError, Mailhost};
use crate::mailbox::Mailbox;
use crate::smtp::command::{Action, Dispatch};
use crate::smtp::error::{SmtpError, SmtpLimits};
use crate::smtp::reply::Reply;
use crate::smtp::transaction::Transaction;
use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;
use tracing::{debug, info, warn};

/// Accepts connections and runs one transaction loop per client.
pub struct SmtpServer {
    config: Arc<Config>,
    host: Arc<Mailhost>,
    dispatch: Arc<Dispatch>,
}

/// Result of collecting one DATA block
enum DataBlock {
    /// Raw content, dot-unstuffed; `true` when the size limit was hit
    Complete(String, bool),
    /// Client went away before the terminator
    Eof,
    /// No input arrived within the idle timeout
    TimedOut,
}

impl SmtpServer {
    pub fn new(config: Arc<Config>, mailbox: Arc<dyn Mailbox>) -> Self {
        Self {
            host: Arc::new(Mailhost::new(config.clone(), mailbox)),
            dispatch: Arc::new(Dispatch::new()),
            config,
        }
    }

    /// Bind the configured address and serve forever (blocking)
    pub fn start(&self) -> Result<(), SmtpError> {
        let listener = TcpListener::bind(&self.config.listen)?;
        self.start_with_listener(listener)
    }

    /// Serve on an existing listener (blocking)
    pub fn start_with_listener(&self, listener: TcpListener) -> Result<(), SmtpError> {
        info!(addr = %listener.local_addr()?, "SMTP server listening");

        for stream in listener.incoming() {
            match stream {
                Ok(stream) => {
                    let config = self.config.clone();
                    let host = self.host.clone();
                    let dispatch = self.dispatch.clone();
                    thread::spawn(move || {
                        if let Err(e) = handle_client(&config, &host, &dispatch, stream) {
                            warn!(error = %e, "client connection failed");
                        }
                    });
                }
                Err(e) => {
                    warn!(error = %e, "failed to accept connection");
                }
            }
        }

        Ok(())
    }
}

fn handle_client(
    config: &Config,
    host: &Mailhost,
    dispatch: &Dispatch,
    mut stream: TcpStream,
) -> Result<(), SmtpError> {
    let peer = stream.peer_addr()?;
    debug!(%peer, "accepted connection");

    stream.set_read_timeout(Some(config.idle_timeout))?;
    let mut reader = BufReader::new(stream.try_clone()?);

    send_reply(&mut stream, &Reply::greeting(&config.hostname))?;

    let mut txn = Transaction::new();
    let mut line_buffer = Vec::new();
    loop {
        line_buffer.clear();
        match reader.read_until(b'\n', &mut line_buffer) {
            Ok(0) => break, // connection closed
            Ok(_) => {}
            Err(e) if is_timeout(&e) => {
                let _ = send_reply(&mut stream, &Reply::idle_timeout(&config.hostname));
                debug!(%peer, "closing idle connection");
                break;
            }
            Err(e) => {
                warn!(%peer, error = %e, "error reading from client");
                break;
            }
        }

        let line = String::from_utf8_lossy(&line_buffer);
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line.len() > SmtpLimits::COMMAND_LINE_MAX_LENGTH {
            let err = SmtpError::LineTooLong {
                max: SmtpLimits::COMMAND_LINE_MAX_LENGTH,
            };
            send_reply(&mut stream, &err.to_reply())?;
            continue;
        }

        match dispatch.handle(line, &mut txn, host) {
            Action::Reply(reply) => send_reply(&mut stream, &reply)?,
            Action::Close(reply) => {
                send_reply(&mut stream, &reply)?;
                debug!(%peer, "connection closed by QUIT");
                break;
            }
            Action::Data(interim) => {
                send_reply(&mut stream, &interim)?;
                match read_data_block(&mut reader, &mut line_buffer)? {
                    DataBlock::Eof => break,
                    DataBlock::TimedOut => {
                        let _ = send_reply(&mut stream, &Reply::idle_timeout(&config.hostname));
                        break;
                    }
                    DataBlock::Complete(_, true) => {
                        let err = SmtpError::TooMuchData {
                            max: SmtpLimits::MAX_DATA_SIZE,
                        };
                        send_reply(&mut stream, &err.to_reply())?;
                        txn.reset();
                    }
                    DataBlock::Complete(raw, false) => match host.digest(&txn, raw) {
                        Ok(id) => {
                            txn.reset();
                            send_reply(&mut stream, &Reply::queued(id))?;
                        }
                        Err(DigestError::Malformed) | Err(DigestError::Incomplete) => {
                            // Transaction stays intact; the client may
                            // retry DATA or abandon with RSET.
                            send_reply(&mut stream, &Reply::malformed_message())?;
                        }
                        Err(DigestError::Store(e)) => {
                            warn!(%peer, error = %e, "store failure during DATA");
                            send_reply(&mut stream, &Reply::processing_error())?;
                        }
                    },
                }
            }
        }
    }

    Ok(())
}

/// Read lines up to the lone-dot terminator, removing the dot-stuffing
/// escape from lines that start with `.`.
fn read_data_block(
    reader: &mut BufReader<TcpStream>,
    line_buffer: &mut Vec<u8>,
) -> Result<DataBlock, SmtpError> {
    let mut raw = String::new();
    let mut overflow = false;

    loop {
        line_buffer.clear();
        match reader.read_until(b'\n', line_buffer) {
            Ok(0) => return Ok(DataBlock::Eof),
            Ok(_) => {}
            Err(e) if is_timeout(&e) => return Ok(DataBlock::TimedOut),
            Err(e) => return Err(e.into()),
        }

        let line = String::from_utf8_lossy(line_buffer);
        let line = line.trim_end_matches(['\r', '\n']);
        if line == "." {
            return Ok(DataBlock::Complete(raw, overflow));
        }

        // RFC 821 transparency: strip exactly one leading dot
        let line = line.strip_prefix('.').unwrap_or(line);
        if raw.len() + line.len() + 2 > SmtpLimits::MAX_DATA_SIZE {
            // Keep consuming until the terminator so the reply stays
            // in sync with the client.
            overflow = true;
            continue;
        }
        raw.push_str(line);
        raw.push_str("\r\n");
    }
}

fn send_reply(stream: &mut TcpStream, reply: &Reply) -> Result<(), SmtpError> {
    let formatted = reply.format();
    stream.write_all(formatted.as_bytes())?;
    stream.flush()?;
    Ok(())
}

fn is_timeout(e: &std::io::Error) -> bool {
    matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut)
}
