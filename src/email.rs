//! Email collaborator interface.
//!
//! The production sender lives outside this service; the core only needs a
//! dispatch seam. [`LogEmailSender`] logs and records sends so the digest
//! job is fully testable.

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailMessage {
    pub to: String,
    pub subject: String,
    pub text_body: String,
    pub html_body: String,
}

#[async_trait]
pub trait EmailSender: Send + Sync {
    async fn send(&self, message: &EmailMessage) -> Result<()>;
}

/// Default sender: logs the dispatch and keeps the message in memory.
#[derive(Default)]
pub struct LogEmailSender {
    sent: Mutex<Vec<EmailMessage>>,
}

impl LogEmailSender {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<EmailMessage> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl EmailSender for LogEmailSender {
    async fn send(&self, message: &EmailMessage) -> Result<()> {
        info!(to = %message.to, subject = %message.subject, "Dispatching email");
        self.sent.lock().push(message.clone());
        Ok(())
    }
}
