use std::path::PathBuf;

use async_trait::async_trait;
use strata_scheduler::{collaborators::cell_text, Attachment, ExportError, ResultExporter, TabularResult};

/// Caches results as JSON files and renders CSV attachments.
///
/// Layout: `<directory>/<first two chars of run id>/<run id>.json`. The cache
/// handle is the file path.
pub struct FileResultExporter {
    directory: PathBuf,
}

impl FileResultExporter {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    fn cache_path(&self, run_id: &str) -> PathBuf {
        let shard = run_id.get(..2).unwrap_or(run_id);
        self.directory.join(shard).join(format!("{run_id}.json"))
    }
}

#[async_trait]
impl ResultExporter for FileResultExporter {
    async fn write_cache(&self, run_id: &str, result: &TabularResult) -> Result<String, ExportError> {
        let path = self.cache_path(run_id);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ExportError(format!("create {}: {e}", parent.display())))?;
        }
        let body = serde_json::to_vec(result).map_err(|e| ExportError(e.to_string()))?;
        tokio::fs::write(&path, body)
            .await
            .map_err(|e| ExportError(format!("write {}: {e}", path.display())))?;
        Ok(path.display().to_string())
    }

    fn render_attachment(
        &self,
        report_name: &str,
        result: &TabularResult,
    ) -> Result<Attachment, ExportError> {
        Ok(Attachment {
            filename: format!("{}.csv", file_stem(report_name)),
            content_type: "text/csv".to_string(),
            data: to_csv(result).into_bytes(),
        })
    }
}

/// RFC 4180 CSV with CRLF line endings.
fn to_csv(result: &TabularResult) -> String {
    let mut out = String::new();
    let header: Vec<String> = result.columns.iter().map(|c| csv_field(c)).collect();
    out.push_str(&header.join(","));
    out.push_str("\r\n");
    for row in &result.rows {
        let fields: Vec<String> = row.iter().map(|v| csv_field(&cell_text(v))).collect();
        out.push_str(&fields.join(","));
        out.push_str("\r\n");
    }
    out
}

fn csv_field(s: &str) -> String {
    if s.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}

fn file_stem(name: &str) -> String {
    let stem: String = name
        .trim()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect();
    if stem.is_empty() {
        "report".to_string()
    } else {
        stem
    }
}
