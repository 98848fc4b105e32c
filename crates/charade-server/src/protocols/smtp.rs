//! SMTP imposter server.
//!
//! Implements the verbs test doubles need: EHLO/HELO, MAIL FROM, RCPT TO
//! (multiple), DATA terminated by `\r\n.\r\n`, RSET, NOOP, QUIT. A
//! completed DATA is parsed into envelope + headers + text/html parts and
//! recorded as one request. DATA before sender and recipient is a 503;
//! unknown verbs are a 500.

use super::ServerHandle;
use crate::imposter::{engine, FaultAction, Imposter, ImposterError};
use crate::model::{NeutralRequest, SmtpRequest};
use crate::repository::Repository;
use std::net::SocketAddr;
#[cfg(unix)]
use std::os::fd::AsRawFd;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info};

pub(super) async fn start(
    imposter: Arc<Imposter>,
    repo: Arc<dyn Repository>,
) -> Result<ServerHandle, ImposterError> {
    let port = imposter.port();
    let addr = super::bind_addr(&imposter.config);
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| ImposterError::BindFailed(port, e.to_string()))?;
    info!(port, "smtp imposter listening");

    let cancel = CancellationToken::new();
    let tracker = TaskTracker::new();
    let accept_cancel = cancel.clone();
    let accept_tracker = tracker.clone();
    let accept_task = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = accept_cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let imposter = Arc::clone(&imposter);
                        let repo = Arc::clone(&repo);
                        let cancel = accept_cancel.clone();
                        accept_tracker.spawn(async move {
                            if let Err(e) = session(stream, peer, imposter, repo, cancel).await {
                                debug!("smtp session ended: {e}");
                            }
                        });
                    }
                    Err(e) => error!(port, "accept error: {e}"),
                }
            }
        }
    });

    Ok(ServerHandle::new(port, cancel, tracker, accept_task))
}

/// Strip `MAIL FROM:` / `RCPT TO:` decoration down to the address.
fn parse_smtp_address(argument: &str) -> String {
    let argument = argument.trim();
    let argument = argument
        .split_once(':')
        .map(|(_, rest)| rest)
        .unwrap_or(argument);
    argument
        .trim()
        .trim_start_matches('<')
        .trim_end_matches('>')
        .to_string()
}

struct Session {
    sender: Option<String>,
    recipients: Vec<String>,
}

impl Session {
    fn reset(&mut self) {
        self.sender = None;
        self.recipients.clear();
    }
}

async fn session(
    stream: TcpStream,
    peer: SocketAddr,
    imposter: Arc<Imposter>,
    repo: Arc<dyn Repository>,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    #[cfg(unix)]
    let fd = stream.as_raw_fd();
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    write_half
        .write_all(b"220 charade ESMTP service ready\r\n")
        .await?;

    let mut session = Session {
        sender: None,
        recipients: Vec::new(),
    };
    let mut line = String::new();

    loop {
        line.clear();
        let read = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            read = reader.read_line(&mut line) => read,
        };
        if read? == 0 {
            return Ok(());
        }
        let trimmed = line.trim_end_matches(['\r', '\n']);
        let (verb, argument) = trimmed
            .split_once(' ')
            .map(|(v, a)| (v.to_ascii_uppercase(), a))
            .unwrap_or_else(|| (trimmed.to_ascii_uppercase(), ""));

        match verb.as_str() {
            "EHLO" | "HELO" => {
                session.reset();
                write_half
                    .write_all(b"250 charade at your service\r\n")
                    .await?;
            }
            "MAIL" => {
                session.sender = Some(parse_smtp_address(argument));
                write_half.write_all(b"250 2.1.0 Ok\r\n").await?;
            }
            "RCPT" => {
                if session.sender.is_none() {
                    write_half
                        .write_all(b"503 5.5.1 bad sequence of commands\r\n")
                        .await?;
                } else {
                    session.recipients.push(parse_smtp_address(argument));
                    write_half.write_all(b"250 2.1.5 Ok\r\n").await?;
                }
            }
            "DATA" => {
                if session.sender.is_none() || session.recipients.is_empty() {
                    write_half
                        .write_all(b"503 5.5.1 bad sequence of commands\r\n")
                        .await?;
                    continue;
                }
                write_half
                    .write_all(b"354 end data with <CR><LF>.<CR><LF>\r\n")
                    .await?;
                let raw = read_data(&mut reader).await?;
                let message = parse_message(
                    &raw,
                    peer,
                    session.sender.take().unwrap_or_default(),
                    std::mem::take(&mut session.recipients),
                );

                let request = NeutralRequest::Smtp(message);
                match engine::handle_request(&imposter, &repo, &request).await {
                    engine::Outcome::Fault { fault } => {
                        match FaultAction::parse(&fault) {
                            FaultAction::Reset => {
                                #[cfg(unix)]
                                super::hijack_fault(fd, FaultAction::Reset);
                            }
                            FaultAction::RandomData => {
                                let _ = write_half
                                    .write_all(&super::random_close_payload())
                                    .await;
                            }
                            FaultAction::Close => {}
                        }
                        return Ok(());
                    }
                    engine::Outcome::ScriptFailure { .. } => {
                        // drop the session; other sessions are unaffected
                        return Ok(());
                    }
                    _ => {
                        write_half.write_all(b"250 2.0.0 Ok: queued\r\n").await?;
                    }
                }
            }
            "RSET" => {
                session.reset();
                write_half.write_all(b"250 2.0.0 Ok\r\n").await?;
            }
            "NOOP" => {
                write_half.write_all(b"250 2.0.0 Ok\r\n").await?;
            }
            "QUIT" => {
                write_half.write_all(b"221 2.0.0 Bye\r\n").await?;
                return Ok(());
            }
            _ => {
                write_half
                    .write_all(b"500 5.5.2 command unrecognized\r\n")
                    .await?;
            }
        }
    }
}

/// Read DATA lines until the lone-dot terminator, undoing dot-stuffing.
async fn read_data(reader: &mut BufReader<OwnedReadHalf>) -> std::io::Result<String> {
    let mut raw = String::new();
    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            return Ok(raw);
        }
        let content = line.trim_end_matches(['\r', '\n']);
        if content == "." {
            return Ok(raw);
        }
        let content = content.strip_prefix("..").map(|rest| format!(".{rest}"));
        match content {
            Some(unstuffed) => raw.push_str(&unstuffed),
            None => raw.push_str(line.trim_end_matches(['\r', '\n'])),
        }
        raw.push('\n');
    }
}

fn split_addresses(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|a| a.trim().to_string())
        .filter(|a| !a.is_empty())
        .collect()
}

/// Parse a received message into the neutral SMTP request: unfolded
/// headers, then text/html parts (one level of multipart/alternative).
fn parse_message(
    raw: &str,
    peer: SocketAddr,
    envelope_from: String,
    envelope_to: Vec<String>,
) -> SmtpRequest {
    let mut headers: Vec<(String, String)> = Vec::new();
    let mut body_start = 0;
    let lines: Vec<&str> = raw.lines().collect();

    for (i, line) in lines.iter().enumerate() {
        if line.is_empty() {
            body_start = i + 1;
            break;
        }
        if line.starts_with(' ') || line.starts_with('\t') {
            if let Some((_, value)) = headers.last_mut() {
                value.push(' ');
                value.push_str(line.trim());
            }
        } else if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
        body_start = i + 1;
    }

    let header = |name: &str| -> Option<&str> {
        headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    };

    let body = lines[body_start.min(lines.len())..].join("\n");
    let content_type = header("Content-Type").unwrap_or("text/plain").to_string();

    let (text, html) = if let Some(boundary) = content_type
        .split("boundary=")
        .nth(1)
        .map(|b| b.trim_matches('"').trim().to_string())
    {
        let mut text = String::new();
        let mut html = String::new();
        for part in body.split(&format!("--{boundary}")) {
            let Some((part_headers, part_body)) = part.trim_start_matches('\n').split_once("\n\n")
            else {
                continue;
            };
            let part_body = part_body.trim().to_string();
            if part_headers.to_ascii_lowercase().contains("text/html") {
                html = part_body;
            } else if part_headers.to_ascii_lowercase().contains("text/plain") {
                text = part_body;
            }
        }
        (text, html)
    } else if content_type.contains("text/html") {
        (String::new(), body.trim().to_string())
    } else {
        (body.trim().to_string(), String::new())
    };

    SmtpRequest {
        request_from: peer.to_string(),
        envelope_from,
        envelope_to,
        from: header("From").unwrap_or_default().to_string(),
        to: header("To").map(split_addresses).unwrap_or_default(),
        cc: header("Cc").map(split_addresses).unwrap_or_default(),
        bcc: header("Bcc").map(split_addresses).unwrap_or_default(),
        subject: header("Subject").unwrap_or_default().to_string(),
        references: header("References")
            .map(|v| v.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default(),
        in_reply_to: header("In-Reply-To")
            .map(|v| v.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default(),
        text,
        html,
        attachments: Vec::new(),
        timestamp: chrono::Utc::now().to_rfc3339(),
    }
}
