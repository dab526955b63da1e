//! Contracts for the systems the worker drives but does not own: report
//! execution, result caching/export, and email delivery.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{DeliveryError, ExecutionError, ExportError};

/// Columns plus rows of JSON scalars.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TabularResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<serde_json::Value>>,
}

impl TabularResult {
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }
}

/// Render one cell for display. `null` becomes an empty string.
pub fn cell_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Null => String::new(),
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Runs a report with bound parameters and returns its result.
///
/// May take seconds to minutes; the worker applies its own timeout.
#[async_trait]
pub trait ReportExecutor: Send + Sync {
    async fn execute(
        &self,
        report_id: &str,
        parameters: &BTreeMap<String, String>,
    ) -> Result<TabularResult, ExecutionError>;
}

/// A file attached to an outgoing email.
#[derive(Debug, Clone, PartialEq)]
pub struct Attachment {
    pub filename: String,
    pub content_type: String,
    pub data: Vec<u8>,
}

/// Persists finished results and renders them for delivery.
#[async_trait]
pub trait ResultExporter: Send + Sync {
    /// Store `result` for later retrieval; returns an opaque cache handle.
    async fn write_cache(&self, run_id: &str, result: &TabularResult) -> Result<String, ExportError>;

    /// Render `result` as an email attachment.
    fn render_attachment(
        &self,
        report_name: &str,
        result: &TabularResult,
    ) -> Result<Attachment, ExportError>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutboundEmail {
    pub recipients: Vec<String>,
    pub subject: String,
    pub html_body: String,
    pub attachment: Option<Attachment>,
}

/// Email transport.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, email: &OutboundEmail) -> Result<(), DeliveryError>;
}
