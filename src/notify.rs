//! `NotificationSink` — the email gateway the cleanse orchestrator calls
//! after exporting a report. The real SMTP client is out of scope (§1); this
//! module owns the trait boundary plus a thin `lettre` adapter and a no-op
//! sink for tests/local runs.

use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};

use crate::errors::Error;

#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn send_report(&self, url: &str) -> Result<(), Error>;
    async fn send_test(&self, addr: &str) -> Result<(), Error>;
}

pub struct SmtpNotificationSink {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: String,
    to: Vec<String>,
}

impl SmtpNotificationSink {
    pub fn new(relay: &str, username: &str, password: &str, from: impl Into<String>, to: Vec<String>) -> Result<Self, Error> {
        let transport = if username.is_empty() {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(relay).build()
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::relay(relay)
                .map_err(|err| Error::InputInvalid(format!("invalid smtp relay {relay}: {err}")))?
                .credentials(Credentials::new(username.to_string(), password.to_string()))
                .build()
        };
        Ok(Self { transport, from: from.into(), to })
    }

    async fn send(&self, to: &str, subject: &str, body: String) -> Result<(), Error> {
        let message = Message::builder()
            .from(self.from.parse().map_err(|err| Error::InputInvalid(format!("invalid from address: {err}")))?)
            .to(to.parse().map_err(|err| Error::InputInvalid(format!("invalid to address: {err}")))?)
            .subject(subject)
            .header(ContentType::TEXT_PLAIN)
            .body(body)
            .map_err(|err| Error::InputInvalid(format!("could not build message: {err}")))?;

        self.transport.send(message).await.map_err(|err| Error::TransientIo { message: err.to_string(), attempts: 1 })?;
        Ok(())
    }
}

#[async_trait]
impl NotificationSink for SmtpNotificationSink {
    async fn send_report(&self, url: &str) -> Result<(), Error> {
        let body = format!("The cleanse analysis report is ready: {url}");
        for recipient in &self.to {
            self.send(recipient, "Cleanse analysis report", body.clone()).await?;
        }
        Ok(())
    }

    async fn send_test(&self, addr: &str) -> Result<(), Error> {
        self.send(addr, "Test notification", "This is a test notification from the ingestion platform.".to_string()).await
    }
}

/// Records sends in memory instead of delivering them; used in tests and
/// for local development without an SMTP relay configured.
#[derive(Default)]
pub struct NullNotificationSink {
    pub sent: std::sync::Mutex<Vec<String>>,
}

#[async_trait]
impl NotificationSink for NullNotificationSink {
    async fn send_report(&self, url: &str) -> Result<(), Error> {
        self.sent.lock().expect("null notification sink mutex poisoned").push(format!("report:{url}"));
        Ok(())
    }

    async fn send_test(&self, addr: &str) -> Result<(), Error> {
        self.sent.lock().expect("null notification sink mutex poisoned").push(format!("test:{addr}"));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn null_sink_records_every_send() {
        let sink = NullNotificationSink::default();
        sink.send_report("https://example.com/report.zip").await.unwrap();
        sink.send_test("ops@example.com").await.unwrap();
        let sent = sink.sent.lock().unwrap();
        assert_eq!(sent.len(), 2);
    }
}
