use crate::collaborators::{cell_text, Attachment, OutboundEmail, TabularResult};

/// Build the notification for a finished run.
///
/// Results with `1..=max_inline_rows` rows are rendered as an inline HTML
/// table; larger results only point at the attachment.
pub fn compose_report_email(
    subject_prefix: &str,
    report_name: &str,
    recipients: &[String],
    result: &TabularResult,
    max_inline_rows: u32,
    attachment: Option<Attachment>,
) -> OutboundEmail {
    let row_count = result.row_count();
    let subject = format!("{subject_prefix}: {report_name} ({row_count} rows)");

    let mut body = Vec::new();
    body.push(format!("<h2>{}</h2>", escape_html(report_name)));
    body.push(format!(
        "<p>{row_count} row{} returned.</p>",
        if row_count == 1 { "" } else { "s" }
    ));

    if row_count > 0 && row_count <= max_inline_rows as usize {
        body.push(render_table(result));
    } else if row_count > max_inline_rows as usize {
        body.push(format!(
            "<p>Results exceed {max_inline_rows} rows. See the attached file.</p>"
        ));
    }
    body.push("<p><small>Sent by Strata Reporting</small></p>".to_string());

    OutboundEmail {
        recipients: recipients.to_vec(),
        subject,
        html_body: body.join("\n"),
        attachment,
    }
}

fn render_table(result: &TabularResult) -> String {
    let mut html = String::from(
        "<table border='1' cellpadding='4' cellspacing='0' style='border-collapse:collapse;'>\n<thead><tr>",
    );
    for col in &result.columns {
        html.push_str(&format!(
            "<th style='background:#f0f0f0;padding:4px 8px;'>{}</th>",
            escape_html(col)
        ));
    }
    html.push_str("</tr></thead>\n<tbody>\n");
    for row in &result.rows {
        html.push_str("<tr>");
        for cell in row {
            html.push_str(&format!(
                "<td style='padding:4px 8px;'>{}</td>",
                escape_html(&cell_text(cell))
            ));
        }
        html.push_str("</tr>\n");
    }
    html.push_str("</tbody></table>");
    html
}

fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn result(rows: usize) -> TabularResult {
        TabularResult {
            columns: vec!["region".to_string(), "total".to_string()],
            rows: (0..rows).map(|i| vec![json!(format!("r{i}")), json!(i)]).collect(),
        }
    }

    #[test]
    fn small_result_is_inlined() {
        let email = compose_report_email(
            "Strata Report",
            "Sales",
            &["a@example.com".to_string()],
            &result(3),
            100,
            None,
        );
        assert_eq!(email.subject, "Strata Report: Sales (3 rows)");
        assert!(email.html_body.contains("<table"));
        assert!(email.html_body.contains("<td style='padding:4px 8px;'>r2</td>"));
    }

    #[test]
    fn large_result_points_at_attachment() {
        let email = compose_report_email("Strata Report", "Sales", &[], &result(5), 4, None);
        assert!(!email.html_body.contains("<table"));
        assert!(email.html_body.contains("Results exceed 4 rows"));
    }

    #[test]
    fn single_row_wording_and_empty_result() {
        let one = compose_report_email("P", "R", &[], &result(1), 10, None);
        assert!(one.html_body.contains("<p>1 row returned.</p>"));
        let none = compose_report_email("P", "R", &[], &result(0), 10, None);
        assert!(none.html_body.contains("<p>0 rows returned.</p>"));
        assert!(!none.html_body.contains("<table"));
    }

    #[test]
    fn cells_and_titles_are_escaped() {
        let result = TabularResult {
            columns: vec!["a<b".to_string()],
            rows: vec![vec![json!("<script>")], vec![json!(null)]],
        };
        let email = compose_report_email("P", "Tom & Jerry", &[], &result, 10, None);
        assert!(email.html_body.contains("<h2>Tom &amp; Jerry</h2>"));
        assert!(email.html_body.contains("a&lt;b"));
        assert!(email.html_body.contains("&lt;script&gt;"));
        assert!(email.html_body.contains("<td style='padding:4px 8px;'></td>"));
    }
}
