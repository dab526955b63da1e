use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use rusqlite::{params, Connection};
use strata_scheduler::{DeliveryError, Mailer, OutboundEmail};
use tracing::debug;
use uuid::Uuid;

/// Hands email off to an SQLite outbox table drained by a separate sender.
///
/// A message counts as delivered once it is committed to the outbox.
pub struct OutboxMailer {
    conn: Mutex<Connection>,
    sender: String,
}

impl OutboxMailer {
    pub fn open(path: impl AsRef<Path>, sender: &str) -> rusqlite::Result<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        Self::with_connection(conn, sender)
    }

    pub fn with_connection(conn: Connection, sender: &str) -> rusqlite::Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS outbox (
                id               TEXT    NOT NULL PRIMARY KEY,
                sender           TEXT    NOT NULL,
                recipients       TEXT    NOT NULL,   -- JSON array
                subject          TEXT    NOT NULL,
                html_body        TEXT    NOT NULL,
                attachment_name  TEXT,
                attachment_type  TEXT,
                attachment       BLOB,
                created_at       TEXT    NOT NULL,
                sent_at          TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_outbox_pending ON outbox (sent_at, created_at);",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
            sender: sender.to_string(),
        })
    }
}

#[async_trait]
impl Mailer for OutboxMailer {
    async fn send(&self, email: &OutboundEmail) -> Result<(), DeliveryError> {
        if email.recipients.is_empty() {
            return Err(DeliveryError("no recipients".to_string()));
        }
        let recipients = serde_json::to_string(&email.recipients)
            .map_err(|e| DeliveryError(e.to_string()))?;
        let id = Uuid::new_v4().to_string();
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO outbox
             (id, sender, recipients, subject, html_body,
              attachment_name, attachment_type, attachment, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                id,
                self.sender,
                recipients,
                email.subject,
                email.html_body,
                email.attachment.as_ref().map(|a| a.filename.as_str()),
                email.attachment.as_ref().map(|a| a.content_type.as_str()),
                email.attachment.as_ref().map(|a| a.data.as_slice()),
                Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true),
            ],
        )
        .map_err(|e| DeliveryError(format!("outbox insert failed: {e}")))?;
        debug!(outbox_id = %id, subject = %email.subject, "email queued");
        Ok(())
    }
}

/// Stand-in used while `mail.outbox_path` is unset. Every hand-off fails,
/// which the worker records on the run.
pub struct UnconfiguredMailer;

#[async_trait]
impl Mailer for UnconfiguredMailer {
    async fn send(&self, _email: &OutboundEmail) -> Result<(), DeliveryError> {
        Err(DeliveryError("mail.outbox_path is not configured".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_scheduler::Attachment;

    fn email(recipients: Vec<String>) -> OutboundEmail {
        OutboundEmail {
            recipients,
            subject: "Strata Report: Sales (2 rows)".into(),
            html_body: "<p>2 rows returned.</p>".into(),
            attachment: Some(Attachment {
                filename: "Sales.csv".into(),
                content_type: "text/csv".into(),
                data: b"a,b\r\n".to_vec(),
            }),
        }
    }

    #[tokio::test]
    async fn queues_message_with_attachment() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("outbox.db");
        let mailer = OutboxMailer::open(&path, "strata@localhost").unwrap();
        mailer.send(&email(vec!["ops@example.com".into()])).await.unwrap();

        let conn = Connection::open(&path).unwrap();
        let (recipients, name, data, sent_at): (String, String, Vec<u8>, Option<String>) = conn
            .query_row(
                "SELECT recipients, attachment_name, attachment, sent_at FROM outbox",
                [],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
            )
            .unwrap();
        assert_eq!(recipients, r#"["ops@example.com"]"#);
        assert_eq!(name, "Sales.csv");
        assert_eq!(data, b"a,b\r\n");
        assert_eq!(sent_at, None);
    }

    #[tokio::test]
    async fn empty_recipient_list_is_refused() {
        let mailer =
            OutboxMailer::with_connection(Connection::open_in_memory().unwrap(), "x@y").unwrap();
        assert!(mailer.send(&email(vec![])).await.is_err());
    }

    #[tokio::test]
    async fn unconfigured_mailer_always_fails() {
        let err = UnconfiguredMailer.send(&email(vec!["a@b".into()])).await.unwrap_err();
        assert!(err.0.contains("outbox_path"));
    }
}
