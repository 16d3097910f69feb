// src/utils/notify.rs: completion report delivery

use std::path::PathBuf;
use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::{Attachment, Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use log::info;
use crate::config::defs::PipelineError;


#[derive(Debug, Clone, PartialEq)]
pub struct Report {
    pub sender: String,
    pub sender_password: String,
    pub recipient: String,
    pub subject: String,
    pub body: String,
    pub attachments: Vec<PathBuf>,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, report: &Report) -> Result<(), PipelineError>;
}


/// Sends over an implicit-TLS SMTP relay, authenticating as the sender.
pub struct SmtpNotifier {
    relay: String,
    port: u16,
}

impl SmtpNotifier {
    pub fn new(relay: &str, port: u16) -> Self {
        SmtpNotifier { relay: relay.to_string(), port }
    }
}

fn notification_err(e: impl std::fmt::Display) -> PipelineError {
    PipelineError::Notification(e.to_string())
}

/// Builds the MIME message with every attachment as application/octet-stream.
pub fn build_message(report: &Report) -> Result<Message, PipelineError> {
    let from: Mailbox = report.sender.parse().map_err(notification_err)?;
    let to: Mailbox = report.recipient.parse().map_err(notification_err)?;
    let octet_stream = ContentType::parse("application/octet-stream").map_err(notification_err)?;

    let mut parts = MultiPart::mixed().singlepart(SinglePart::plain(report.body.clone()));
    for path in &report.attachments {
        let content = std::fs::read(path)
            .map_err(|e| PipelineError::Notification(format!("cannot attach {}: {}", path.display(), e)))?;
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "attachment".to_string());
        parts = parts.singlepart(Attachment::new(filename).body(content, octet_stream.clone()));
    }

    Message::builder()
        .from(from)
        .to(to)
        .subject(report.subject.clone())
        .multipart(parts)
        .map_err(notification_err)
}

#[async_trait]
impl Notifier for SmtpNotifier {
    async fn send(&self, report: &Report) -> Result<(), PipelineError> {
        let mailer = SmtpTransport::relay(&self.relay)
            .map_err(notification_err)?
            .port(self.port)
            .credentials(Credentials::new(report.sender.clone(), report.sender_password.clone()))
            .build();

        // Attachment reads and the SMTP exchange both block
        let owned = report.clone();
        tokio::task::spawn_blocking(move || -> Result<(), PipelineError> {
            let message = build_message(&owned)?;
            mailer.send(&message).map_err(notification_err)?;
            Ok(())
        })
        .await
        .map_err(notification_err)??;
        info!("Report sent to {}", report.recipient);
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    fn report(attachments: Vec<PathBuf>) -> Report {
        Report {
            sender: "pipeline@lab.org".to_string(),
            sender_password: "secret".to_string(),
            recipient: "user@lab.org".to_string(),
            subject: "RNA-seq analysis results".to_string(),
            body: "attached".to_string(),
            attachments,
        }
    }

    #[test]
    fn test_build_message_with_attachment() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("count.csv");
        std::fs::write(&path, ",s1\ngeneA,5\n")?;
        let message = build_message(&report(vec![path]))?;
        let raw = String::from_utf8(message.formatted())?;
        assert!(raw.contains("Subject: RNA-seq analysis results"));
        assert!(raw.contains("count.csv"));
        Ok(())
    }

    #[test]
    fn test_build_message_errors() {
        let missing = build_message(&report(vec![PathBuf::from("/nonexistent/count.csv")]));
        assert!(matches!(missing, Err(PipelineError::Notification(_))));

        let mut bad = report(Vec::new());
        bad.recipient = "not an address".to_string();
        assert!(build_message(&bad).is_err());
    }

    #[tokio::test]
    async fn test_send_reads_attachments_off_the_runtime() {
        // The missing attachment fails message assembly before any connection is made
        let notifier = SmtpNotifier::new("127.0.0.1", 1);
        let err = notifier
            .send(&report(vec![PathBuf::from("/nonexistent/de_results.csv")]))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Notification(ref msg) if msg.contains("cannot attach")));
    }
}
