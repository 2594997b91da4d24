use std::time::Duration;

use async_trait::async_trait;
use lettre::message::{Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message as LettreMessage, Tokio1Executor};
use rand::Rng;
use thiserror::Error;
use tracing::warn;

use crate::config::AppConfig;
use crate::render::RenderedMessage;
use crate::shutdown::ShutdownSignal;

const MAX_SEND_ATTEMPTS: u32 = 5;
const MAX_OPEN_ATTEMPTS: u32 = 10;
const BASE_BACKOFF: Duration = Duration::from_millis(500);
const MAX_BACKOFF: Duration = Duration::from_secs(30);
const SHUTDOWN_POLL_SLICE: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport connection failed: {0}")]
    Connect(String),
    #[error("transient transport error: {0}")]
    Transient(String),
    /// The transport reported the server end hung up on an established
    /// connection. Distinguished from a generic [`Self::Transient`]
    /// because §4.4 calls this out specifically: the connection manager
    /// must close and reopen before retrying rather than just sleeping.
    #[error("server disconnected: {0}")]
    Disconnected(String),
}

/// Per-recipient outcome of a single send attempt (C4 -> C7 handoff per
/// §4.4/§4.7). Every message built by [`crate::render`] carries exactly
/// one recipient, so "message-level" and "recipient-level" failures
/// mostly coincide here; the split is kept because the worker's state
/// machine (§4.7) routes them to different terminal `SendResult`s:
/// `Rejected` for a message the transport could never have delivered to
/// anyone (bad headers, empty body), `Blocked` for a refusal that's a
/// property of this one address (SMTP "recipient refused", SES
/// `MessageRejected`).
#[derive(Debug, Clone)]
pub enum SendOutcome {
    Accepted { esp_message_id: Option<String> },
    Rejected(String),
    Blocked(String),
}

/// A live connection to a mail sending backend (C4). One instance is
/// owned by exactly one [`ConnectionManager`] at a time; `max_messages`
/// governs how many sends it may serve before the manager recycles it
/// (§4.4, §5 "Transport connections: not shared").
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, message: &RenderedMessage) -> Result<SendOutcome, TransportError>;
}

/// Builds a fresh [`Transport`] connection on demand. Each sender
/// worker holds its own [`ConnectionManager`] backed by a shared,
/// stateless factory — the factory just knows how to dial the
/// configured backend; the connection it produces belongs to one
/// worker alone.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn open(&self) -> Result<Box<dyn Transport>, TransportError>;
}

pub struct SmtpTransportFactory {
    host: String,
    port: Option<u16>,
    credentials: Option<Credentials>,
}

impl SmtpTransportFactory {
    pub fn new(cfg: &AppConfig) -> Result<Self, TransportError> {
        let host = cfg
            .smtp_host
            .clone()
            .ok_or_else(|| TransportError::Connect("smtp_host is not configured".into()))?;

        let credentials = match (&cfg.smtp_username, &cfg.smtp_password) {
            (Some(user), Some(pass)) => Some(Credentials::new(user.clone(), pass.clone())),
            _ => None,
        };

        Ok(SmtpTransportFactory { host, port: cfg.smtp_port, credentials })
    }
}

#[async_trait]
impl TransportFactory for SmtpTransportFactory {
    async fn open(&self) -> Result<Box<dyn Transport>, TransportError> {
        let mut builder =
            AsyncSmtpTransport::<Tokio1Executor>::relay(&self.host).map_err(|e| TransportError::Connect(e.to_string()))?;

        if let Some(credentials) = &self.credentials {
            builder = builder.credentials(credentials.clone());
        }
        if let Some(port) = self.port {
            builder = builder.port(port);
        }

        Ok(Box::new(SmtpTransport { transport: builder.build() }))
    }
}

pub struct SmtpTransport {
    transport: AsyncSmtpTransport<Tokio1Executor>,
}

#[async_trait]
impl Transport for SmtpTransport {
    async fn send(&self, rendered: &RenderedMessage) -> Result<SendOutcome, TransportError> {
        let message = match build_lettre_message(rendered) {
            Ok(message) => message,
            Err(reason) => return Ok(SendOutcome::Rejected(reason)),
        };

        match self.transport.send(message).await {
            Ok(_) => Ok(SendOutcome::Accepted { esp_message_id: None }),
            Err(err) if err.is_permanent() => Ok(SendOutcome::Blocked(err.to_string())),
            Err(err) if looks_like_disconnect(&err.to_string()) => Err(TransportError::Disconnected(err.to_string())),
            Err(err) => Err(TransportError::Transient(err.to_string())),
        }
    }
}

/// lettre's SMTP error has no dedicated "server hung up" variant; this
/// matches the substrings its `Display` impl actually produces for a
/// dropped connection rather than guessing at a structured code.
fn looks_like_disconnect(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("disconnect") || lower.contains("connection closed") || lower.contains("broken pipe")
}

/// Builds the outgoing lettre message. Any failure here (malformed
/// header, no body at all) is a property of the message build, not of
/// this one delivery attempt, so the caller reports it as `Rejected`.
/// A *permanent* SMTP response after submission (§4.4's "recipients
/// refused") is what maps to `Blocked` instead.
fn build_lettre_message(rendered: &RenderedMessage) -> Result<LettreMessage, String> {
    let from: Mailbox = rendered.from_header.parse().map_err(|e| format!("invalid From header: {e}"))?;
    let to: Mailbox = rendered.to.parse().map_err(|e| format!("invalid To header: {e}"))?;

    let mut builder = LettreMessage::builder().from(from).to(to).subject(rendered.subject.clone());

    if let Some(reply_to) = &rendered.reply_to_header {
        let reply_to: Mailbox = reply_to.parse().map_err(|e| format!("invalid Reply-To header: {e}"))?;
        builder = builder.reply_to(reply_to);
    }

    let message = match (&rendered.html_body, &rendered.text_body) {
        (Some(html), Some(text)) => builder
            .multipart(MultiPart::alternative_plain_html(text.clone(), html.clone()))
            .map_err(|e| e.to_string())?,
        (Some(html), None) => builder.singlepart(SinglePart::html(html.clone())).map_err(|e| e.to_string())?,
        (None, Some(text)) => builder.singlepart(SinglePart::plain(text.clone())).map_err(|e| e.to_string())?,
        (None, None) => return Err("message has neither html nor text body".into()),
    };

    Ok(message)
}

/// SES HTTP transactional API factory. The underlying `aws_sdk_sesv2`
/// client is cheap to clone (an `Arc` around its inner state), so
/// `open()` just hands each connection manager its own handle to the
/// same client rather than re-resolving AWS credentials every time.
pub struct HttpApiTransportFactory {
    client: aws_sdk_sesv2::Client,
    tracking_config_set: Option<String>,
}

impl HttpApiTransportFactory {
    pub async fn new(cfg: &AppConfig) -> Result<Self, TransportError> {
        let mut loader = aws_config::from_env();
        if let Some(region) = &cfg.aws_region {
            loader = loader.region(aws_sdk_sesv2::config::Region::new(region.clone()));
        }
        let aws_cfg = loader.load().await;

        Ok(HttpApiTransportFactory {
            client: aws_sdk_sesv2::Client::new(&aws_cfg),
            tracking_config_set: cfg.aws_ses_tracking_config_set.clone(),
        })
    }
}

#[async_trait]
impl TransportFactory for HttpApiTransportFactory {
    async fn open(&self) -> Result<Box<dyn Transport>, TransportError> {
        Ok(Box::new(HttpApiTransport {
            client: self.client.clone(),
            tracking_config_set: self.tracking_config_set.clone(),
        }))
    }
}

/// SES HTTP transactional API, one `SendEmail` call per recipient so
/// that the resulting message id can be tied back to a single
/// `send_record` for event reconciliation (C10).
pub struct HttpApiTransport {
    client: aws_sdk_sesv2::Client,
    tracking_config_set: Option<String>,
}

#[async_trait]
impl Transport for HttpApiTransport {
    async fn send(&self, rendered: &RenderedMessage) -> Result<SendOutcome, TransportError> {
        use aws_sdk_sesv2::types::{Body, Content, Destination, EmailContent, Message};

        let to_content = |s: &str| Content::builder().data(s).charset("UTF-8").build().map_err(|e| e.to_string());

        let subject = match to_content(&rendered.subject) {
            Ok(content) => content,
            Err(reason) => return Ok(SendOutcome::Rejected(reason)),
        };

        let mut body_builder = Body::builder();
        if let Some(html) = &rendered.html_body {
            match to_content(html) {
                Ok(content) => body_builder = body_builder.html(content),
                Err(reason) => return Ok(SendOutcome::Rejected(reason)),
            }
        }
        if let Some(text) = &rendered.text_body {
            match to_content(text) {
                Ok(content) => body_builder = body_builder.text(content),
                Err(reason) => return Ok(SendOutcome::Rejected(reason)),
            }
        }

        let message = Message::builder().subject(subject).body(body_builder.build()).build();
        let content = EmailContent::builder().simple(message).build();
        let destination = Destination::builder().to_addresses(rendered.to.clone()).build();

        let result = self
            .client
            .send_email()
            .from_email_address(rendered.from_header.clone())
            .destination(destination)
            .set_configuration_set_name(self.tracking_config_set.clone())
            .content(content)
            .send()
            .await;

        match result {
            Ok(output) => Ok(SendOutcome::Accepted {
                esp_message_id: output.message_id().map(str::to_owned),
            }),
            Err(err) if is_disconnect_sdk_error(&err) => Err(TransportError::Disconnected(err.to_string())),
            Err(err) if is_transient_sdk_error(&err) => Err(TransportError::Transient(err.to_string())),
            Err(err) => Ok(SendOutcome::Blocked(err.to_string())),
        }
    }
}

fn is_transient_sdk_error<E>(err: &aws_sdk_sesv2::error::SdkError<E>) -> bool {
    matches!(err, aws_sdk_sesv2::error::SdkError::TimeoutError(_) | aws_sdk_sesv2::error::SdkError::ResponseError(_))
}

fn is_disconnect_sdk_error<E>(err: &aws_sdk_sesv2::error::SdkError<E>) -> bool {
    matches!(err, aws_sdk_sesv2::error::SdkError::DispatchFailure(_))
}

/// Waits out `duration` in small slices so a shutdown signalled mid-wait
/// is observed promptly instead of after the full backoff elapses.
/// Returns `Err(())` if shutdown fired before the wait completed.
async fn wait_or_shutdown(duration: Duration, shutdown: &ShutdownSignal) -> Result<(), ()> {
    let mut remaining = duration;

    while remaining > Duration::ZERO {
        if shutdown.is_set() {
            return Err(());
        }
        let step = remaining.min(SHUTDOWN_POLL_SLICE);
        tokio::time::sleep(step).await;
        remaining = remaining.saturating_sub(step);
    }

    if shutdown.is_set() {
        Err(())
    } else {
        Ok(())
    }
}

fn backoff_for_attempt(attempt: u32) -> Duration {
    let jitter: f64 = rand::thread_rng().gen_range(0.5..1.5);
    (BASE_BACKOFF * 2u32.pow(attempt.saturating_sub(1))).mul_f64(jitter).min(MAX_BACKOFF)
}

/// Owns exactly one [`Transport`] connection end to end (C4): opens it
/// with reconnect-with-backoff, recycles it once `max_messages` sends
/// have gone through, and retries transport-level errors with
/// randomized exponential backoff. Never shared between workers — each
/// sender constructs its own from the shared [`TransportFactory`]
/// (§5 "Transport connections: not shared; each sender owns one").
pub struct ConnectionManager {
    factory: std::sync::Arc<dyn TransportFactory>,
    max_messages: u32,
    current: Option<Box<dyn Transport>>,
    messages_sent: u32,
}

impl ConnectionManager {
    pub fn new(factory: std::sync::Arc<dyn TransportFactory>, max_messages: u32) -> Self {
        ConnectionManager { factory, max_messages, current: None, messages_sent: 0 }
    }

    /// Establishes a connection, resetting the reuse counter. Retries
    /// with randomized exponential backoff (capped at 30s, bounded
    /// attempts) on failure; short-circuits to the shutdown path if
    /// `shutdown` fires during a wait (§4.4).
    pub async fn open(&mut self, shutdown: &ShutdownSignal) -> Result<(), TransportError> {
        let mut attempt = 0;

        loop {
            match self.factory.open().await {
                Ok(transport) => {
                    self.current = Some(transport);
                    self.messages_sent = 0;
                    return Ok(());
                }
                Err(err) if attempt + 1 >= MAX_OPEN_ATTEMPTS => {
                    self.current = None;
                    return Err(err);
                }
                Err(err) => {
                    attempt += 1;
                    warn!(attempt, %err, "failed to open transport connection, retrying");
                    if wait_or_shutdown(backoff_for_attempt(attempt), shutdown).await.is_err() {
                        return Err(TransportError::Connect("shutdown requested while reconnecting".into()));
                    }
                }
            }
        }
    }

    pub fn close(&mut self) {
        self.current = None;
    }

    /// Sends one message (§4.4): recycles the connection first if the
    /// reuse cap has been hit, then retries transient failures up to
    /// five attempts with randomized exponential backoff. A
    /// `Disconnected` error closes and reopens before the next retry
    /// rather than merely sleeping; other recipient-level refusals
    /// never reach here — the [`Transport`] impl maps those to
    /// `Ok(SendOutcome::Blocked)`/`Ok(SendOutcome::Rejected)` instead.
    pub async fn send(&mut self, message: &RenderedMessage, shutdown: &ShutdownSignal) -> Result<SendOutcome, TransportError> {
        if self.current.is_none() || self.messages_sent >= self.max_messages {
            self.close();
            self.open(shutdown).await?;
        }

        let mut attempt = 0;

        loop {
            let transport = self.current.as_deref().expect("connection established above");

            match transport.send(message).await {
                Ok(outcome) => {
                    self.messages_sent += 1;
                    return Ok(outcome);
                }
                Err(TransportError::Disconnected(reason)) if attempt + 1 < MAX_SEND_ATTEMPTS => {
                    attempt += 1;
                    warn!(attempt, reason, "server disconnected, reopening connection before retry");
                    self.close();
                    self.open(shutdown).await?;
                }
                Err(err) if attempt + 1 >= MAX_SEND_ATTEMPTS => return Err(err),
                Err(err) => {
                    attempt += 1;
                    warn!(attempt, %err, "transient send error, retrying after backoff");
                    if wait_or_shutdown(backoff_for_attempt(attempt), shutdown).await.is_err() {
                        return Err(err);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    struct FlakyTransport {
        fail_times: u32,
        attempts: AtomicU32,
    }

    #[async_trait]
    impl Transport for FlakyTransport {
        async fn send(&self, _message: &RenderedMessage) -> Result<SendOutcome, TransportError> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
            if attempt < self.fail_times {
                Err(TransportError::Transient("connection reset".into()))
            } else {
                Ok(SendOutcome::Accepted { esp_message_id: Some("msg-1".into()) })
            }
        }
    }

    struct FlakyFactory {
        fail_times: u32,
        attempts: Arc<AtomicU32>,
    }

    #[async_trait]
    impl TransportFactory for FlakyFactory {
        async fn open(&self) -> Result<Box<dyn Transport>, TransportError> {
            Ok(Box::new(FlakyTransport { fail_times: self.fail_times, attempts: AtomicU32::new(0) }))
        }
    }

    struct CountingOpensFactory {
        opens: Arc<AtomicU32>,
    }

    #[async_trait]
    impl TransportFactory for CountingOpensFactory {
        async fn open(&self) -> Result<Box<dyn Transport>, TransportError> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(FlakyTransport { fail_times: 0, attempts: AtomicU32::new(0) }))
        }
    }

    struct AlwaysDisconnects;

    #[async_trait]
    impl Transport for AlwaysDisconnects {
        async fn send(&self, _message: &RenderedMessage) -> Result<SendOutcome, TransportError> {
            Err(TransportError::Disconnected("server hung up".into()))
        }
    }

    struct DisconnectingFactory {
        opens: Arc<AtomicU32>,
    }

    #[async_trait]
    impl TransportFactory for DisconnectingFactory {
        async fn open(&self) -> Result<Box<dyn Transport>, TransportError> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(AlwaysDisconnects))
        }
    }

    fn sample_message() -> RenderedMessage {
        RenderedMessage {
            from_header: "hello@acme.test".into(),
            reply_to_header: None,
            to: "a@x".into(),
            subject: "Hi".into(),
            html_body: None,
            text_body: Some("Hello".into()),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_failures_until_success() {
        let attempts = Arc::new(AtomicU32::new(0));
        let factory = Arc::new(FlakyFactory { fail_times: 2, attempts: attempts.clone() });
        let mut manager = ConnectionManager::new(factory, 500);
        let shutdown = ShutdownSignal::new();

        let outcome = manager.send(&sample_message(), &shutdown).await.unwrap();
        assert!(matches!(outcome, SendOutcome::Accepted { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_attempts() {
        let attempts = Arc::new(AtomicU32::new(0));
        let factory = Arc::new(FlakyFactory { fail_times: u32::MAX, attempts });
        let mut manager = ConnectionManager::new(factory, 500);
        let shutdown = ShutdownSignal::new();

        let result = manager.send(&sample_message(), &shutdown).await;
        assert!(matches!(result, Err(TransportError::Transient(_))));
    }

    #[tokio::test]
    async fn recycles_connection_once_reuse_cap_is_hit() {
        let opens = Arc::new(AtomicU32::new(0));
        let factory = Arc::new(CountingOpensFactory { opens: opens.clone() });
        let mut manager = ConnectionManager::new(factory, 2);
        let shutdown = ShutdownSignal::new();

        manager.send(&sample_message(), &shutdown).await.unwrap();
        manager.send(&sample_message(), &shutdown).await.unwrap();
        assert_eq!(opens.load(Ordering::SeqCst), 1);

        manager.send(&sample_message(), &shutdown).await.unwrap();
        assert_eq!(opens.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_closes_and_reopens_before_retrying() {
        let opens = Arc::new(AtomicU32::new(0));
        let factory = Arc::new(DisconnectingFactory { opens: opens.clone() });
        let mut manager = ConnectionManager::new(factory, 500);
        let shutdown = ShutdownSignal::new();

        let result = manager.send(&sample_message(), &shutdown).await;
        assert!(matches!(result, Err(TransportError::Disconnected(_))));
        assert_eq!(opens.load(Ordering::SeqCst), MAX_SEND_ATTEMPTS);
    }

    #[test]
    fn build_lettre_message_rejects_bodyless_messages() {
        let mut message = sample_message();
        message.text_body = None;
        assert!(build_lettre_message(&message).is_err());
    }
}
