//! Email transport — raw IMAP over TLS for fetching, lettre for sending.

use std::io::Write as IoWrite;
use std::net::TcpStream;
use std::time::Duration;

use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use mail_parser::MessageParser;
use secrecy::{ExposeSecret, SecretString};
use uuid::Uuid;

use crate::error::ChannelError;

// ── Configuration ───────────────────────────────────────────────────

/// Email transport configuration, built from environment variables.
#[derive(Debug, Clone)]
pub struct EmailConfig {
    pub imap_host: String,
    pub imap_port: u16,
    pub smtp_host: String,
    pub smtp_port: u16,
    pub username: String,
    pub password: SecretString,
    pub from_address: String,
    pub poll_interval_secs: u64,
    pub allowed_senders: Vec<String>,
}

impl EmailConfig {
    /// Build config from environment variables.
    /// Returns `None` if `EMAIL_IMAP_HOST` is not set (mail disabled).
    pub fn from_env() -> Option<Self> {
        let imap_host = std::env::var("EMAIL_IMAP_HOST").ok()?;

        let imap_port: u16 = std::env::var("EMAIL_IMAP_PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(993);

        let smtp_host =
            std::env::var("EMAIL_SMTP_HOST").unwrap_or_else(|_| imap_host.replace("imap", "smtp"));

        let smtp_port: u16 = std::env::var("EMAIL_SMTP_PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(587);

        let username = std::env::var("EMAIL_USERNAME").unwrap_or_default();
        let password = SecretString::from(std::env::var("EMAIL_PASSWORD").unwrap_or_default());
        let from_address = std::env::var("EMAIL_FROM_ADDRESS").unwrap_or_else(|_| username.clone());

        let poll_interval_secs: u64 = std::env::var("EMAIL_POLL_INTERVAL_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(60);

        let allowed_senders: Vec<String> = std::env::var("EMAIL_ALLOWED_SENDERS")
            .unwrap_or_default()
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        Some(Self {
            imap_host,
            imap_port,
            smtp_host,
            smtp_port,
            username,
            password,
            from_address,
            poll_interval_secs,
            allowed_senders,
        })
    }
}

/// Check if a sender email is in the allowlist.
///
/// - Empty list → deny all
/// - `*` in list → allow all
/// - `@domain.com` or `domain.com` → domain match
/// - `user@domain.com` → exact email match
pub fn is_sender_allowed(allowed: &[String], email: &str) -> bool {
    if allowed.is_empty() {
        return false;
    }
    if allowed.iter().any(|a| a == "*") {
        return true;
    }
    let email_lower = email.to_lowercase();
    allowed.iter().any(|a| {
        if a.starts_with('@') {
            email_lower.ends_with(&a.to_lowercase())
        } else if a.contains('@') {
            a.eq_ignore_ascii_case(email)
        } else {
            email_lower.ends_with(&format!("@{}", a.to_lowercase()))
        }
    })
}

// ── Outbound ────────────────────────────────────────────────────────

/// Generate a Message-ID for an outgoing reply: `<uuid@from-domain>`.
pub fn make_reply_message_id(from_address: &str) -> String {
    let domain = from_address.rsplit('@').next().unwrap_or("localhost");
    format!("<{}@{}>", Uuid::new_v4(), domain)
}

/// Send a reply via SMTP with threading headers set (blocking — run in
/// `spawn_blocking`).
///
/// `in_reply_to` is the Message-ID the reply threads under; it is used for
/// both In-Reply-To and References so mail clients file the reply in the
/// same thread as the original.
pub fn send_reply(
    config: &EmailConfig,
    to: &str,
    subject: &str,
    body: &str,
    message_id: &str,
    in_reply_to: &str,
) -> Result<(), ChannelError> {
    let creds = Credentials::new(
        config.username.clone(),
        config.password.expose_secret().to_string(),
    );

    let transport = SmtpTransport::relay(&config.smtp_host)
        .map_err(|e| ChannelError::SendFailed {
            name: "smtp".into(),
            reason: format!("SMTP relay error: {e}"),
        })?
        .port(config.smtp_port)
        .credentials(creds)
        .build();

    let email = Message::builder()
        .from(config.from_address.parse().map_err(|e| {
            ChannelError::SendFailed {
                name: "smtp".into(),
                reason: format!("Invalid from address: {e}"),
            }
        })?)
        .to(to.parse().map_err(|e| ChannelError::SendFailed {
            name: "smtp".into(),
            reason: format!("Invalid to address: {e}"),
        })?)
        .subject(subject)
        .message_id(Some(message_id.to_string()))
        .in_reply_to(in_reply_to.to_string())
        .references(in_reply_to.to_string())
        .body(body.to_string())
        .map_err(|e| ChannelError::SendFailed {
            name: "smtp".into(),
            reason: format!("Failed to build email: {e}"),
        })?;

    transport.send(&email).map_err(|e| ChannelError::SendFailed {
        name: "smtp".into(),
        reason: format!("SMTP send failed: {e}"),
    })?;

    tracing::info!("Reply sent to {to}");
    Ok(())
}

// ── Inbound ─────────────────────────────────────────────────────────

/// An email fetched from the mailbox, decoded to plain strings.
#[derive(Debug, Clone)]
pub struct FetchedEmail {
    /// IMAP sequence id, used to flag the message \Seen after processing.
    pub uid: String,
    pub message_id: String,
    pub in_reply_to: Option<String>,
    pub sender: String,
    pub subject: String,
    pub body: String,
}

/// Error type for IMAP operations.
pub type ImapError = Box<dyn std::error::Error + Send + Sync>;

/// An established IMAP session over TLS.
struct ImapSession {
    tls: rustls::StreamOwned<rustls::ClientConnection, TcpStream>,
    tag_counter: u32,
}

impl ImapSession {
    /// Connect, negotiate TLS, log in, and select INBOX.
    fn open(config: &EmailConfig) -> Result<Self, ImapError> {
        use std::sync::Arc as StdArc;

        let tcp = TcpStream::connect((&*config.imap_host, config.imap_port))?;
        tcp.set_read_timeout(Some(Duration::from_secs(30)))?;

        let mut root_store = rustls::RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let tls_config = StdArc::new(
            rustls::ClientConfig::builder()
                .with_root_certificates(root_store)
                .with_no_client_auth(),
        );
        let server_name: rustls::pki_types::ServerName<'_> =
            rustls::pki_types::ServerName::try_from(config.imap_host.clone())?;
        let conn = rustls::ClientConnection::new(tls_config, server_name)?;
        let tls = rustls::StreamOwned::new(conn, tcp);

        let mut session = Self { tls, tag_counter: 0 };

        let _greeting = session.read_line()?;

        let login_resp = session.send_cmd(&format!(
            "LOGIN \"{}\" \"{}\"",
            config.username,
            config.password.expose_secret()
        ))?;
        if !login_resp.last().is_some_and(|l| l.contains("OK")) {
            return Err("IMAP login failed".into());
        }

        let _select = session.send_cmd("SELECT \"INBOX\"")?;
        Ok(session)
    }

    fn read_line(&mut self) -> Result<String, ImapError> {
        let mut buf = Vec::new();
        loop {
            let mut byte = [0u8; 1];
            match std::io::Read::read(&mut self.tls, &mut byte) {
                Ok(0) => return Err("IMAP connection closed".into()),
                Ok(_) => {
                    buf.push(byte[0]);
                    if buf.ends_with(b"\r\n") {
                        return Ok(String::from_utf8_lossy(&buf).to_string());
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Send a tagged command and collect response lines up to the tag line.
    fn send_cmd(&mut self, cmd: &str) -> Result<Vec<String>, ImapError> {
        self.tag_counter += 1;
        let tag = format!("A{}", self.tag_counter);
        let full = format!("{tag} {cmd}\r\n");
        IoWrite::write_all(&mut self.tls, full.as_bytes())?;
        IoWrite::flush(&mut self.tls)?;
        let mut lines = Vec::new();
        loop {
            let line = self.read_line()?;
            let done = line.starts_with(&tag);
            lines.push(line);
            if done {
                break;
            }
        }
        Ok(lines)
    }

    fn logout(&mut self) {
        let _ = self.send_cmd("LOGOUT");
    }
}

/// Fetch unseen emails (blocking — run in `spawn_blocking`).
///
/// Uses BODY.PEEK so fetching does not flip the \Seen flag; the poller
/// marks messages seen explicitly only after they are fully processed, so a
/// crash mid-processing leaves the message to be retried on the next cycle.
pub fn fetch_unseen_imap(config: &EmailConfig) -> Result<Vec<FetchedEmail>, ImapError> {
    let mut session = ImapSession::open(config)?;

    let search_resp = session.send_cmd("SEARCH UNSEEN")?;
    let mut uids: Vec<String> = Vec::new();
    for line in &search_resp {
        if line.starts_with("* SEARCH") {
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() > 2 {
                uids.extend(parts[2..].iter().map(|s| s.to_string()));
            }
        }
    }

    let mut results = Vec::new();
    for uid in &uids {
        let fetch_resp = session.send_cmd(&format!("FETCH {uid} (BODY.PEEK[])"))?;

        let raw: String = fetch_resp
            .iter()
            .skip(1)
            .take(fetch_resp.len().saturating_sub(2))
            .cloned()
            .collect();

        if let Some(parsed) = MessageParser::default().parse(raw.as_bytes()) {
            let sender = parsed
                .from()
                .and_then(|addr| addr.first())
                .and_then(|a| a.address())
                .map(|s| s.to_string())
                .unwrap_or_else(|| "unknown".into());
            let subject = parsed.subject().unwrap_or("(no subject)").to_string();
            let body = extract_text(&parsed);
            let message_id = parsed
                .message_id()
                .map(|s| s.to_string())
                .unwrap_or_else(|| format!("gen-{}", Uuid::new_v4()));
            let in_reply_to = parsed.in_reply_to().as_text().map(|s| s.to_string());

            results.push(FetchedEmail {
                uid: uid.clone(),
                message_id,
                in_reply_to,
                sender,
                subject,
                body,
            });
        }
    }

    session.logout();
    Ok(results)
}

/// Flag the given messages \Seen (blocking — run in `spawn_blocking`).
pub fn mark_seen_imap(config: &EmailConfig, uids: &[String]) -> Result<(), ImapError> {
    if uids.is_empty() {
        return Ok(());
    }

    let mut session = ImapSession::open(config)?;
    for uid in uids {
        let _ = session.send_cmd(&format!("STORE {uid} +FLAGS (\\Seen)"));
    }
    session.logout();
    Ok(())
}

/// Extract readable text from a parsed email.
fn extract_text(parsed: &mail_parser::Message) -> String {
    if let Some(text) = parsed.body_text(0) {
        return text.to_string();
    }
    if let Some(html) = parsed.body_html(0) {
        return strip_html(html.as_ref());
    }
    "(no readable content)".to_string()
}

/// Strip HTML tags from content (basic).
pub fn strip_html(html: &str) -> String {
    let mut result = String::new();
    let mut in_tag = false;
    for ch in html.chars() {
        match ch {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if !in_tag => result.push(ch),
            _ => {}
        }
    }
    result.split_whitespace().collect::<Vec<_>>().join(" ")
}

// ── Tests ───────────────────────────────────────────────────────────
