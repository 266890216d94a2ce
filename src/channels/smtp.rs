//! Outbound transport: STARTTLS submission through lettre.
//!
//! One SMTP connection is held per pass. Each send walks MAIL, RCPT and DATA
//! itself so a refusal is known by its stage: only a refused RCPT concerns a
//! single recipient.

use std::time::Duration;

use async_trait::async_trait;
use lettre::address::Address;
use lettre::transport::smtp::authentication::{Credentials, Mechanism};
use lettre::transport::smtp::client::{SmtpConnection, TlsParameters};
use lettre::transport::smtp::commands::{Data, Mail, Rcpt, Rset};
use lettre::transport::smtp::extension::{ClientId, Extension, MailBodyParameter, MailParameter};
use secrecy::ExposeSecret;
use tracing::{debug, info, warn};

use crate::channels::{OutboundSession, OutboundTransport};
use crate::config::SmtpConfig;
use crate::error::DeliveryError;

const MECHANISMS: &[Mechanism] = &[Mechanism::Plain, Mechanism::Login];

// ── Transport ───────────────────────────────────────────────────────

/// Sends pre-rendered messages with the SMTP login as envelope sender.
#[derive(Clone)]
pub struct SmtpOutbound {
    host: String,
    port: u16,
    credentials: Credentials,
    envelope_from: Address,
    timeout: Duration,
    /// STARTTLS parameters; `None` only against local plaintext servers.
    tls: Option<TlsParameters>,
}

impl SmtpOutbound {
    pub fn new(config: &SmtpConfig) -> Result<Self, DeliveryError> {
        let envelope_from: Address =
            config
                .username
                .parse()
                .map_err(|e: lettre::address::AddressError| DeliveryError::InvalidAddress {
                    address: config.username.clone(),
                    reason: e.to_string(),
                })?;

        let tls = TlsParameters::new(config.host.clone())
            .map_err(|e| DeliveryError::SessionLost(format!("SMTP TLS setup failed: {e}")))?;

        Ok(Self {
            host: config.host.clone(),
            port: config.port,
            credentials: Credentials::new(
                config.username.clone(),
                config.password.expose_secret().to_string(),
            ),
            envelope_from,
            timeout: config.timeout,
            tls: Some(tls),
        })
    }

    /// Greeting, EHLO, STARTTLS, AUTH.
    fn open(&self) -> Result<SmtpClient, DeliveryError> {
        let hello = ClientId::default();
        let mut conn = SmtpConnection::connect(
            (self.host.as_str(), self.port),
            Some(self.timeout),
            &hello,
            None,
            None,
        )
        .map_err(|e| stage_error("greeting", e, self.timeout))?;
        if let Some(tls) = &self.tls {
            conn.starttls(tls, &hello)
                .map_err(|e| stage_error("STARTTLS", e, self.timeout))?;
        }
        conn.auth(MECHANISMS, &self.credentials)
            .map_err(|e| stage_error("AUTH", e, self.timeout))?;
        Ok(SmtpClient {
            conn,
            envelope_from: self.envelope_from.clone(),
            timeout: self.timeout,
        })
    }
}

#[async_trait]
impl OutboundTransport for SmtpOutbound {
    async fn connect(&self) -> Result<Box<dyn OutboundSession>, DeliveryError> {
        let outbound = self.clone();
        let client = tokio::task::spawn_blocking(move || outbound.open())
            .await
            .map_err(|e| DeliveryError::SessionLost(format!("SMTP task failed: {e}")))??;
        info!(host = %self.host, "SMTP session opened");
        Ok(Box::new(SmtpSession {
            client: Some(client),
        }))
    }
}

// ── Session ─────────────────────────────────────────────────────────

struct SmtpSession {
    client: Option<SmtpClient>,
}

impl SmtpSession {
    /// Run one blocking client operation on the blocking pool.
    async fn run<T, F>(&mut self, op: F) -> Result<T, DeliveryError>
    where
        T: Send + 'static,
        F: FnOnce(&mut SmtpClient) -> Result<T, DeliveryError> + Send + 'static,
    {
        let mut client = self
            .client
            .take()
            .ok_or_else(|| DeliveryError::SessionLost("SMTP session closed".into()))?;
        let (client, result) = tokio::task::spawn_blocking(move || {
            let result = op(&mut client);
            (client, result)
        })
        .await
        .map_err(|e| DeliveryError::SessionLost(format!("SMTP task failed: {e}")))?;
        self.client = Some(client);
        result
    }
}

#[async_trait]
impl OutboundSession for SmtpSession {
    async fn send(&mut self, to: &str, message: &[u8]) -> Result<(), DeliveryError> {
        let to_addr: Address = to.parse().map_err(|e: lettre::address::AddressError| {
            DeliveryError::InvalidAddress {
                address: to.to_string(),
                reason: e.to_string(),
            }
        })?;
        let body = message.to_vec();
        self.run(move |c| c.send(&to_addr, &body)).await
    }

    async fn quit(&mut self) -> Result<(), DeliveryError> {
        let result = self.run(|c| c.quit()).await;
        self.client = None;
        result
    }
}

impl Drop for SmtpSession {
    fn drop(&mut self) {
        if let Some(mut client) = self.client.take() {
            client.conn.abort();
        }
    }
}

// ── Protocol steps ──────────────────────────────────────────────────

struct SmtpClient {
    conn: SmtpConnection,
    envelope_from: Address,
    timeout: Duration,
}

impl SmtpClient {
    fn send(&mut self, to: &Address, body: &[u8]) -> Result<(), DeliveryError> {
        let timeout = self.timeout;
        let mut params = Vec::new();
        if !body.is_ascii() && self.conn.server_info().supports_feature(Extension::EightBitMime) {
            params.push(MailParameter::Body(MailBodyParameter::EightBitMime));
        }
        self.conn
            .command(Mail::new(Some(self.envelope_from.clone()), params))
            .map_err(|e| stage_error("MAIL FROM", e, timeout))?;

        if let Err(e) = self.conn.command(Rcpt::new(to.clone(), vec![])) {
            if !is_refusal(&e) || closes_session(&e) {
                return Err(stage_error("RCPT TO", e, timeout));
            }
            self.conn
                .command(Rset)
                .map_err(|e| stage_error("RSET", e, timeout))?;
            return Err(DeliveryError::Rejected {
                recipient: to.to_string(),
                reason: e.to_string(),
            });
        }

        self.conn
            .command(Data)
            .map_err(|e| stage_error("DATA", e, timeout))?;
        let response = self
            .conn
            .message(body)
            .map_err(|e| stage_error("message content", e, timeout))?;
        debug!(to = %to, code = %response.code(), "SMTP accepted");
        Ok(())
    }

    fn quit(&mut self) -> Result<(), DeliveryError> {
        let timeout = self.timeout;
        self.conn
            .quit()
            .map(|_| ())
            .map_err(|e| stage_error("QUIT", e, timeout))
    }
}

/// The server answered with a 4xx or 5xx reply.
fn is_refusal(e: &lettre::transport::smtp::Error) -> bool {
    e.is_permanent() || e.is_transient()
}

/// 421: the server is closing the channel.
fn closes_session(e: &lettre::transport::smtp::Error) -> bool {
    e.status().is_some_and(|code| code.to_string() == "421")
}

fn stage_error(
    stage: &'static str,
    e: lettre::transport::smtp::Error,
    timeout: Duration,
) -> DeliveryError {
    if is_refusal(&e) {
        warn!(stage, error = %e, "SMTP server refused");
        DeliveryError::Refused {
            stage,
            reason: e.to_string(),
        }
    } else if e.is_timeout() {
        DeliveryError::Timeout(timeout)
    } else {
        DeliveryError::SessionLost(format!("{stage}: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use std::io::{BufRead, BufReader, Write};
    use std::net::TcpListener;
    use std::thread::JoinHandle;

    use secrecy::SecretString;

    use super::*;

    fn config(username: &str) -> SmtpConfig {
        SmtpConfig {
            host: "smtp.example.com".into(),
            port: 587,
            username: username.into(),
            password: SecretString::from("pw"),
            timeout: Duration::from_secs(5),
        }
    }

    /// Canned replies over a local socket: the greeting, then one reply per
    /// client command. Message content after a 354 is read up to the final
    /// dot before the next reply. Returns every line the client sent.
    fn scripted_server(greeting: &'static str, replies: Vec<&'static str>) -> (u16, JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = std::thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            stream
                .set_read_timeout(Some(Duration::from_secs(5)))
                .unwrap();
            let mut writer = stream.try_clone().unwrap();
            let mut reader = BufReader::new(stream);
            let mut seen = Vec::new();
            writer.write_all(greeting.as_bytes()).unwrap();

            let mut in_data = false;
            for reply in replies {
                loop {
                    let mut line = String::new();
                    if reader.read_line(&mut line).unwrap_or(0) == 0 {
                        return seen;
                    }
                    let line = line.trim_end().to_string();
                    let done = !in_data || line == ".";
                    if !in_data {
                        seen.push(line);
                    }
                    if done {
                        break;
                    }
                }
                in_data = reply.starts_with("354");
                writer.write_all(reply.as_bytes()).unwrap();
            }
            seen
        });
        (port, handle)
    }

    fn plaintext(port: u16) -> SmtpOutbound {
        let mut outbound = SmtpOutbound::new(&config("relay@example.com")).unwrap();
        outbound.host = "127.0.0.1".into();
        outbound.port = port;
        outbound.tls = None;
        outbound
    }

    const EHLO: &str = "250-localhost\r\n250 AUTH PLAIN LOGIN\r\n";
    const AUTH_OK: &str = "235 2.7.0 Authentication successful\r\n";

    #[test]
    fn builds_without_connecting() {
        let outbound = SmtpOutbound::new(&config("relay@example.com")).unwrap();
        assert_eq!(outbound.envelope_from.to_string(), "relay@example.com");
    }

    #[test]
    fn login_must_be_an_address() {
        assert!(matches!(
            SmtpOutbound::new(&config("not an address")),
            Err(DeliveryError::InvalidAddress { .. })
        ));
    }

    #[tokio::test]
    async fn refused_greeting_is_not_recipient_local() {
        let (port, server) = scripted_server("421 4.7.0 Try again later\r\n", vec![]);
        let err = plaintext(port).connect().await.err().unwrap();
        assert!(matches!(err, DeliveryError::Refused { stage: "greeting", .. }));
        assert!(!err.is_recipient_local());
        server.join().unwrap();
    }

    #[tokio::test]
    async fn refused_sender_is_not_recipient_local() {
        let (port, server) = scripted_server(
            "220 localhost ESMTP\r\n",
            vec![EHLO, AUTH_OK, "550 5.4.5 Daily sending quota exceeded\r\n"],
        );
        let mut session = plaintext(port).connect().await.unwrap();
        let err = session.send("a@x.com", b"Subject: x\r\n\r\nhi\r\n").await.unwrap_err();
        assert!(matches!(err, DeliveryError::Refused { stage: "MAIL FROM", .. }));
        assert!(!err.is_recipient_local());
        drop(session);
        server.join().unwrap();
    }

    #[tokio::test]
    async fn refused_recipient_resets_and_session_continues() {
        let (port, server) = scripted_server(
            "220 localhost ESMTP\r\n",
            vec![
                EHLO,
                AUTH_OK,
                "250 2.1.0 Ok\r\n",
                "550 5.1.1 No such user\r\n",
                "250 2.0.0 Ok\r\n",
                "250 2.1.0 Ok\r\n",
                "250 2.1.5 Ok\r\n",
                "354 End data with <CR><LF>.<CR><LF>\r\n",
                "250 2.0.0 Ok: queued\r\n",
                "221 2.0.0 Bye\r\n",
            ],
        );
        let mut session = plaintext(port).connect().await.unwrap();

        let err = session.send("gone@x.com", b"Subject: x\r\n\r\nhi\r\n").await.unwrap_err();
        assert!(matches!(err, DeliveryError::Rejected { ref recipient, .. } if recipient == "gone@x.com"));
        assert!(err.is_recipient_local());

        session.send("b@x.com", b"Subject: x\r\n\r\nhi\r\n").await.unwrap();
        session.quit().await.unwrap();

        let seen = server.join().unwrap();
        let commands: Vec<&str> = seen
            .iter()
            .skip(2)
            .map(|l| l.split([':', ' ']).next().unwrap_or(""))
            .collect();
        assert_eq!(
            commands,
            vec!["MAIL", "RCPT", "RSET", "MAIL", "RCPT", "DATA", "QUIT"]
        );
    }

    #[tokio::test]
    async fn closing_reply_at_recipient_is_not_recipient_local() {
        let (port, server) = scripted_server(
            "220 localhost ESMTP\r\n",
            vec![
                EHLO,
                AUTH_OK,
                "250 2.1.0 Ok\r\n",
                "421 4.3.2 Shutting down\r\n",
            ],
        );
        let mut session = plaintext(port).connect().await.unwrap();
        let err = session.send("a@x.com", b"Subject: x\r\n\r\nhi\r\n").await.unwrap_err();
        assert!(matches!(err, DeliveryError::Refused { stage: "RCPT TO", .. }));
        drop(session);
        server.join().unwrap();
    }

    #[tokio::test]
    async fn malformed_recipient_is_local_failure() {
        let (port, server) = scripted_server("220 localhost ESMTP\r\n", vec![EHLO, AUTH_OK]);
        let mut session = plaintext(port).connect().await.unwrap();
        let err = session.send("nobody", b"Subject: x\r\n\r\n").await.unwrap_err();
        assert!(matches!(err, DeliveryError::InvalidAddress { .. }));
        assert!(err.is_recipient_local());
        drop(session);
        server.join().unwrap();
    }
}
