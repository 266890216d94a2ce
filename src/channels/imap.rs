//! Source mailbox over raw IMAP with implicit TLS.
//!
//! The protocol client is blocking and runs inside `spawn_blocking`; the
//! async session moves it in and out of the blocking pool per command.

use std::io::{BufRead, BufReader, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use secrecy::ExposeSecret;
use tracing::{debug, info, warn};

use crate::channels::{FetchedMessage, MailboxConnector, MailboxSession};
use crate::config::ImapConfig;
use crate::error::MailboxError;

type TlsStream = rustls::StreamOwned<rustls::ClientConnection, TcpStream>;

static INTERNALDATE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"INTERNALDATE "([^"]+)""#).unwrap());
static FETCH_UID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bUID (\d+)").unwrap());

// ── Connector ───────────────────────────────────────────────────────

/// Connects to the configured inbox.
pub struct ImapConnector {
    config: ImapConfig,
    tls: Arc<rustls::ClientConfig>,
}

impl ImapConnector {
    pub fn new(config: &ImapConfig) -> Self {
        let mut root_store = rustls::RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let tls = Arc::new(
            rustls::ClientConfig::builder()
                .with_root_certificates(root_store)
                .with_no_client_auth(),
        );
        Self {
            config: config.clone(),
            tls,
        }
    }
}

#[async_trait]
impl MailboxConnector for ImapConnector {
    async fn connect(&self) -> Result<Box<dyn MailboxSession>, MailboxError> {
        let config = self.config.clone();
        let tls = Arc::clone(&self.tls);
        let client = tokio::task::spawn_blocking(move || open(&config, tls))
            .await
            .map_err(|e| MailboxError::Protocol(format!("IMAP connect task failed: {e}")))??;
        info!(host = %self.config.host, "IMAP session opened");
        Ok(Box::new(ImapSession {
            client: Some(client),
        }))
    }
}

/// TCP, TLS, greeting, LOGIN, SELECT INBOX.
fn open(
    config: &ImapConfig,
    tls: Arc<rustls::ClientConfig>,
) -> Result<ImapClient<TlsStream>, MailboxError> {
    let connect_err = |reason: String| MailboxError::Connect {
        host: config.host.clone(),
        reason,
    };

    let addrs = (config.host.as_str(), config.port)
        .to_socket_addrs()
        .map_err(|e| connect_err(format!("DNS lookup failed: {e}")))?;
    let mut tcp = None;
    let mut last_err = None;
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, config.timeout) {
            Ok(stream) => {
                tcp = Some(stream);
                break;
            }
            Err(e) => last_err = Some(e),
        }
    }
    let tcp = tcp.ok_or_else(|| {
        connect_err(match last_err {
            Some(e) => e.to_string(),
            None => "no addresses resolved".into(),
        })
    })?;
    tcp.set_read_timeout(Some(config.timeout))?;
    tcp.set_write_timeout(Some(config.timeout))?;

    let server_name = rustls::pki_types::ServerName::try_from(config.host.clone())
        .map_err(|e| connect_err(format!("invalid server name: {e}")))?;
    let conn = rustls::ClientConnection::new(tls, server_name)
        .map_err(|e| connect_err(format!("TLS setup failed: {e}")))?;

    let mut client = ImapClient::new(
        rustls::StreamOwned::new(conn, tcp),
        config.max_message_bytes,
    );
    client.greeting().map_err(|e| connect_err(e.to_string()))?;
    client.login(&config.username, config.password.expose_secret())?;
    client.select_inbox()?;
    Ok(client)
}

// ── Session ─────────────────────────────────────────────────────────

struct ImapSession {
    client: Option<ImapClient<TlsStream>>,
}

impl ImapSession {
    /// Run one blocking client operation on the blocking pool.
    async fn run<T, F>(&mut self, op: F) -> Result<T, MailboxError>
    where
        T: Send + 'static,
        F: FnOnce(&mut ImapClient<TlsStream>) -> Result<T, MailboxError> + Send + 'static,
    {
        let mut client = self.client.take().ok_or(MailboxError::Closed)?;
        let (client, result) = tokio::task::spawn_blocking(move || {
            let result = op(&mut client);
            (client, result)
        })
        .await
        .map_err(|e| MailboxError::Protocol(format!("IMAP task failed: {e}")))?;
        self.client = Some(client);
        result
    }
}

#[async_trait]
impl MailboxSession for ImapSession {
    async fn list(&mut self) -> Result<Vec<u32>, MailboxError> {
        self.run(|c| c.search_all()).await
    }

    async fn fetch(&mut self, uid: u32) -> Result<FetchedMessage, MailboxError> {
        self.run(move |c| c.fetch(uid)).await
    }

    async fn mark_seen(&mut self, uid: u32) -> Result<(), MailboxError> {
        self.run(move |c| c.mark_seen(uid)).await
    }

    async fn logout(&mut self) -> Result<(), MailboxError> {
        let result = self.run(|c| c.logout()).await;
        self.client = None;
        result
    }
}

impl Drop for ImapSession {
    fn drop(&mut self) {
        if let Some(mut client) = self.client.take() {
            client.send_logout();
        }
    }
}

// ── Protocol client ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Ok,
    No,
    Bad,
}

/// One untagged response, literals pulled out of the line.
#[derive(Debug)]
struct Untagged {
    text: String,
    literals: Vec<Vec<u8>>,
    /// Size of a literal that was over the limit and discarded.
    oversized: Option<usize>,
}

/// One logical line as read off the wire.
struct Line {
    text: String,
    literals: Vec<Vec<u8>>,
    oversized: Option<usize>,
}

#[derive(Debug)]
struct Response {
    untagged: Vec<Untagged>,
    status: Status,
    /// Text after the status word of the tagged line.
    detail: String,
}

/// Minimal IMAP4rev1 client over any byte stream.
struct ImapClient<S: Read + Write> {
    stream: BufReader<S>,
    next_tag: u32,
    max_literal: usize,
}

impl<S: Read + Write> ImapClient<S> {
    fn new(stream: S, max_literal: usize) -> Self {
        Self {
            stream: BufReader::new(stream),
            next_tag: 1,
            max_literal,
        }
    }

    fn greeting(&mut self) -> Result<(), MailboxError> {
        let line = self.read_response_line()?.text;
        if line.starts_with("* OK") || line.starts_with("* PREAUTH") {
            Ok(())
        } else {
            Err(MailboxError::Protocol(format!("unexpected greeting: {line}")))
        }
    }

    fn login(&mut self, user: &str, password: &str) -> Result<(), MailboxError> {
        let resp = self.command(&format!("LOGIN {} {}", quote(user), quote(password)))?;
        if resp.status != Status::Ok {
            return Err(MailboxError::AuthFailed {
                user: user.to_string(),
                reason: resp.detail,
            });
        }
        Ok(())
    }

    fn select_inbox(&mut self) -> Result<(), MailboxError> {
        self.command_ok("SELECT INBOX").map(|_| ())
    }

    fn search_all(&mut self) -> Result<Vec<u32>, MailboxError> {
        let resp = self.command_ok("UID SEARCH ALL")?;
        let mut uids: Vec<u32> = resp
            .untagged
            .iter()
            .filter_map(|u| u.text.strip_prefix("* SEARCH"))
            .flat_map(|rest| rest.split_whitespace())
            .filter_map(|n| n.parse().ok())
            .collect();
        uids.sort_unstable();
        uids.dedup();
        Ok(uids)
    }

    fn fetch(&mut self, uid: u32) -> Result<FetchedMessage, MailboxError> {
        let fetch_err = |reason: String| MailboxError::Fetch { uid, reason };

        let resp = self.command(&format!("UID FETCH {uid} (INTERNALDATE BODY.PEEK[])"))?;
        if resp.status != Status::Ok {
            return Err(fetch_err(resp.detail));
        }

        let item = resp
            .untagged
            .into_iter()
            .filter(|u| {
                u.text.contains(" FETCH ") && (!u.literals.is_empty() || u.oversized.is_some())
            })
            .find(|u| match FETCH_UID.captures(&u.text) {
                Some(caps) => caps[1].parse::<u32>().ok() == Some(uid),
                None => true,
            })
            .ok_or_else(|| fetch_err("no message body in response".into()))?;
        if let Some(len) = item.oversized {
            return Err(fetch_err(format!(
                "message of {len} bytes exceeds the {} byte limit",
                self.max_literal
            )));
        }

        let date = INTERNALDATE
            .captures(&item.text)
            .map(|caps| caps[1].to_string())
            .ok_or_else(|| fetch_err("no INTERNALDATE in response".into()))?;
        let received_at = parse_internaldate(&date)
            .ok_or_else(|| fetch_err(format!("unparseable INTERNALDATE {date:?}")))?;

        let raw = item
            .literals
            .into_iter()
            .next()
            .ok_or_else(|| fetch_err("no message body in response".into()))?;

        debug!(uid, bytes = raw.len(), %received_at, "Fetched message");
        Ok(FetchedMessage {
            uid,
            raw,
            received_at,
        })
    }

    fn mark_seen(&mut self, uid: u32) -> Result<(), MailboxError> {
        self.command_ok(&format!("UID STORE {uid} +FLAGS.SILENT (\\Seen)"))
            .map(|_| ())
    }

    fn logout(&mut self) -> Result<(), MailboxError> {
        self.command("LOGOUT").map(|_| ())
    }

    /// Fire-and-forget LOGOUT for sessions dropped without one.
    fn send_logout(&mut self) {
        let tag = self.tag();
        let stream = self.stream.get_mut();
        if let Err(e) = stream
            .write_all(format!("{tag} LOGOUT\r\n").as_bytes())
            .and_then(|_| stream.flush())
        {
            warn!(error = %e, "IMAP logout on drop failed");
        }
    }

    fn tag(&mut self) -> String {
        let tag = format!("A{}", self.next_tag);
        self.next_tag += 1;
        tag
    }

    fn command_ok(&mut self, cmd: &str) -> Result<Response, MailboxError> {
        let resp = self.command(cmd)?;
        match resp.status {
            Status::Ok => Ok(resp),
            status => Err(MailboxError::Protocol(format!(
                "{} failed ({status:?}): {}",
                cmd.split_whitespace().take(2).collect::<Vec<_>>().join(" "),
                resp.detail
            ))),
        }
    }

    /// Send one tagged command and collect everything up to its completion.
    fn command(&mut self, cmd: &str) -> Result<Response, MailboxError> {
        let tag = self.tag();
        let stream = self.stream.get_mut();
        stream.write_all(format!("{tag} {cmd}\r\n").as_bytes())?;
        stream.flush()?;

        let prefix = format!("{tag} ");
        let mut untagged = Vec::new();
        loop {
            let Line {
                text,
                literals,
                oversized,
            } = self.read_response_line()?;
            if let Some(rest) = text.strip_prefix(&prefix) {
                let (word, detail) = rest.split_once(' ').unwrap_or((rest, ""));
                let status = match word.to_ascii_uppercase().as_str() {
                    "OK" => Status::Ok,
                    "NO" => Status::No,
                    "BAD" => Status::Bad,
                    _ => {
                        return Err(MailboxError::Protocol(format!(
                            "bad tagged response: {text}"
                        )));
                    }
                };
                return Ok(Response {
                    untagged,
                    status,
                    detail: detail.to_string(),
                });
            }
            if text.starts_with('+') {
                return Err(MailboxError::Protocol(format!(
                    "unexpected continuation request: {text}"
                )));
            }
            untagged.push(Untagged {
                text,
                literals,
                oversized,
            });
        }
    }

    /// One logical response line. `{n}` literals are read exactly and
    /// returned separately; the line text keeps the `{n}` markers. Literals
    /// over the size limit are drained from the stream and dropped.
    fn read_response_line(&mut self) -> Result<Line, MailboxError> {
        let mut text = String::new();
        let mut literals = Vec::new();
        let mut oversized = None;
        loop {
            let mut line = Vec::new();
            if self.stream.read_until(b'\n', &mut line)? == 0 {
                return Err(MailboxError::Closed);
            }
            let line = String::from_utf8_lossy(&line);
            let line = line.trim_end_matches(['\r', '\n']);
            text.push_str(line);
            match literal_len(line) {
                Some(len) if len > self.max_literal => {
                    warn!(len, limit = self.max_literal, "Discarding oversized literal");
                    let drained = std::io::copy(
                        &mut (&mut self.stream).take(len as u64),
                        &mut std::io::sink(),
                    )?;
                    if drained < len as u64 {
                        return Err(MailboxError::Closed);
                    }
                    oversized = Some(len);
                }
                Some(len) => {
                    let mut literal = vec![0u8; len];
                    self.stream.read_exact(&mut literal)?;
                    literals.push(literal);
                }
                None => {
                    return Ok(Line {
                        text,
                        literals,
                        oversized,
                    });
                }
            }
        }
    }
}

/// Length of a `{n}` literal announced at the end of a line.
fn literal_len(line: &str) -> Option<usize> {
    let rest = line.strip_suffix('}')?;
    let open = rest.rfind('{')?;
    rest[open + 1..].trim_end_matches('+').parse().ok()
}

/// IMAP quoted string.
fn quote(s: &str) -> String {
    format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
}

/// `"17-Jul-1996 02:44:25 -0700"`, day possibly space-padded.
fn parse_internaldate(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_str(s.trim(), "%d-%b-%Y %H:%M:%S %z")
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use chrono::TimeZone;

    use super::*;

    /// Canned server bytes in, client bytes captured.
    struct Scripted {
        input: Cursor<Vec<u8>>,
        output: Vec<u8>,
    }

    impl Read for Scripted {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            self.input.read(buf)
        }
    }

    impl Write for Scripted {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.output.extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn client(server: &[u8]) -> ImapClient<Scripted> {
        client_with_limit(server, 1024)
    }

    fn client_with_limit(server: &[u8], max_literal: usize) -> ImapClient<Scripted> {
        ImapClient::new(
            Scripted {
                input: Cursor::new(server.to_vec()),
                output: Vec::new(),
            },
            max_literal,
        )
    }

    fn sent(client: &ImapClient<Scripted>) -> String {
        String::from_utf8(client.stream.get_ref().output.clone()).unwrap()
    }

    #[test]
    fn login_and_select() {
        let mut c = client(
            b"* OK IMAP4rev1 ready\r\n\
A1 OK LOGIN completed\r\n\
* 3 EXISTS\r\n\
A2 OK [READ-WRITE] SELECT completed\r\n",
        );
        c.greeting().unwrap();
        c.login("relay@x.com", "p\"w").unwrap();
        c.select_inbox().unwrap();
        assert_eq!(
            sent(&c),
            "A1 LOGIN \"relay@x.com\" \"p\\\"w\"\r\nA2 SELECT INBOX\r\n"
        );
    }

    #[test]
    fn login_rejected_is_auth_failure() {
        let mut c = client(b"A1 NO [AUTHENTICATIONFAILED] Invalid credentials\r\n");
        let err = c.login("relay@x.com", "bad").unwrap_err();
        assert!(matches!(err, MailboxError::AuthFailed { .. }));
    }

    #[test]
    fn search_returns_sorted_uids() {
        let mut c = client(b"* SEARCH 7 3 12\r\nA1 OK SEARCH completed\r\n");
        assert_eq!(c.search_all().unwrap(), vec![3, 7, 12]);
        assert_eq!(sent(&c), "A1 UID SEARCH ALL\r\n");
    }

    #[test]
    fn search_empty_inbox() {
        let mut c = client(b"* SEARCH\r\nA1 OK SEARCH completed\r\n");
        assert!(c.search_all().unwrap().is_empty());
    }

    #[test]
    fn fetch_reads_exact_literal() {
        let body = b"Subject: hi\r\n\r\nline one\r\nA1 OK not a tag\r\n";
        let mut server = format!(
            "* 1 FETCH (UID 42 INTERNALDATE \"17-Jul-2026 02:44:25 -0700\" BODY[] {{{}}}\r\n",
            body.len()
        )
        .into_bytes();
        server.extend_from_slice(body);
        server.extend_from_slice(b")\r\nA1 OK FETCH completed\r\n");

        let mut c = client(&server);
        let msg = c.fetch(42).unwrap();
        assert_eq!(msg.uid, 42);
        assert_eq!(msg.raw, body);
        assert_eq!(
            msg.received_at,
            Utc.with_ymd_and_hms(2026, 7, 17, 9, 44, 25).unwrap()
        );
        assert_eq!(sent(&c), "A1 UID FETCH 42 (INTERNALDATE BODY.PEEK[])\r\n");
    }

    #[test]
    fn fetch_date_after_body() {
        let mut server = b"* 1 FETCH (UID 5 BODY[] {4}\r\nabcd INTERNALDATE \" 1-Feb-2026 00:00:00 +0000\")\r\n".to_vec();
        server.extend_from_slice(b"A1 OK done\r\n");
        let mut c = client(&server);
        let msg = c.fetch(5).unwrap();
        assert_eq!(msg.raw, b"abcd");
        assert_eq!(
            msg.received_at,
            Utc.with_ymd_and_hms(2026, 2, 1, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn fetch_without_body_fails() {
        let mut c = client(b"A1 OK FETCH completed\r\n");
        assert!(matches!(
            c.fetch(9).unwrap_err(),
            MailboxError::Fetch { uid: 9, .. }
        ));
    }

    #[test]
    fn oversized_body_fails_only_that_fetch() {
        let mut server = b"* 1 FETCH (UID 8 INTERNALDATE \" 1-Feb-2026 00:00:00 +0000\" BODY[] {40}\r\n".to_vec();
        server.extend_from_slice(&[b'x'; 40]);
        server.extend_from_slice(b")\r\nA1 OK FETCH completed\r\n");
        server.extend_from_slice(b"* SEARCH 8\r\nA2 OK SEARCH completed\r\n");

        let mut c = client_with_limit(&server, 16);
        let err = c.fetch(8).unwrap_err();
        assert!(matches!(err, MailboxError::Fetch { uid: 8, ref reason } if reason.contains("40 bytes")));
        // The stream stays in step for the next command.
        assert_eq!(c.search_all().unwrap(), vec![8]);
    }

    #[test]
    fn truncated_oversized_literal_is_closed() {
        let mut server = b"* 1 FETCH (UID 8 BODY[] {40}\r\n".to_vec();
        server.extend_from_slice(&[b'x'; 10]);
        let mut c = client_with_limit(&server, 16);
        assert!(matches!(c.fetch(8), Err(MailboxError::Closed)));
    }

    #[test]
    fn closed_stream_is_reported() {
        let mut c = client(b"");
        assert!(matches!(c.search_all(), Err(MailboxError::Closed)));
    }

    #[test]
    fn store_seen_command() {
        let mut c = client(b"A1 OK STORE completed\r\n");
        c.mark_seen(3).unwrap();
        assert_eq!(sent(&c), "A1 UID STORE 3 +FLAGS.SILENT (\\Seen)\r\n");
    }

    #[test]
    fn literal_length_parsing() {
        assert_eq!(literal_len("* 1 FETCH (BODY[] {123}"), Some(123));
        assert_eq!(literal_len("* 1 FETCH (BODY[] {12+}"), Some(12));
        assert_eq!(literal_len("* OK done"), None);
        assert_eq!(literal_len("* OK {abc}"), None);
    }
}
