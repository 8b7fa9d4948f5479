//! Output formats for a final result

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};
use crate::evaluate::FinalResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Structured data
    #[default]
    Json,
    /// Tabular
    Csv,
    /// Markup
    Html,
    Prose,
    Text,
}

impl OutputFormat {
    pub fn all() -> [OutputFormat; 5] {
        [
            OutputFormat::Json,
            OutputFormat::Csv,
            OutputFormat::Html,
            OutputFormat::Prose,
            OutputFormat::Text,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OutputFormat::Json => "json",
            OutputFormat::Csv => "csv",
            OutputFormat::Html => "html",
            OutputFormat::Prose => "prose",
            OutputFormat::Text => "text",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            OutputFormat::Json => "json",
            OutputFormat::Csv => "csv",
            OutputFormat::Html => "html",
            OutputFormat::Prose => "md",
            OutputFormat::Text => "txt",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            OutputFormat::Json => "application/json",
            OutputFormat::Csv => "text/csv",
            OutputFormat::Html => "text/html; charset=utf-8",
            OutputFormat::Prose => "text/markdown; charset=utf-8",
            OutputFormat::Text => "text/plain; charset=utf-8",
        }
    }

    /// Serialize `result` in this format
    pub fn render(&self, result: &FinalResult) -> Result<String> {
        match self {
            OutputFormat::Json => Ok(serde_json::to_string_pretty(result)?),
            OutputFormat::Csv => Ok(render_csv(result)),
            OutputFormat::Html => Ok(render_html(result)),
            OutputFormat::Prose => Ok(render_prose(result)),
            OutputFormat::Text => Ok(render_text(result)),
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutputFormat {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "json" => Ok(OutputFormat::Json),
            "csv" => Ok(OutputFormat::Csv),
            "html" => Ok(OutputFormat::Html),
            "prose" | "markdown" | "md" => Ok(OutputFormat::Prose),
            "text" | "txt" => Ok(OutputFormat::Text),
            other => Err(PipelineError::invalid(format!("unknown output format: {}", other))),
        }
    }
}

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

fn escape_html(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}

/// One row per fact: section, name, value
fn render_csv(result: &FinalResult) -> String {
    let mut rows: Vec<[String; 3]> = vec![
        ["summary".into(), "overall_score".into(), format!("{:.3}", result.summary.overall_score)],
        ["summary".into(), "confidence".into(), format!("{:.3}", result.summary.confidence)],
        [
            "summary".into(),
            "validation_passed".into(),
            result.summary.validation_passed.to_string(),
        ],
    ];
    for validation in &result.validations {
        rows.push([
            "validation".into(),
            validation.validator.to_string(),
            format!("{} ({:.3})", if validation.passed { "pass" } else { "fail" }, validation.score),
        ]);
    }
    for evaluation in &result.evaluations {
        rows.push([
            "evaluation".into(),
            evaluation.evaluator.to_string(),
            format!("{:.3}", evaluation.overall),
        ]);
    }
    for finding in &result.summary.key_findings {
        rows.push(["finding".into(), String::new(), finding.clone()]);
    }
    for rec in &result.recommendations {
        rows.push([
            "recommendation".into(),
            format!("{:?}", rec.priority).to_lowercase(),
            rec.text.clone(),
        ]);
    }

    let mut out = String::from("section,name,value\n");
    for row in rows {
        let fields: Vec<String> = row.iter().map(|f| csv_field(f)).collect();
        out.push_str(&fields.join(","));
        out.push('\n');
    }
    out
}

fn render_html(result: &FinalResult) -> String {
    let mut out = String::new();
    out.push_str("<!DOCTYPE html>\n<html>\n<head><meta charset=\"utf-8\">");
    out.push_str(&format!(
        "<title>Report {}</title></head>\n<body>\n",
        escape_html(&result.content_id)
    ));
    out.push_str(&format!(
        "<h1>Report {}</h1>\n<p>{}</p>\n",
        escape_html(&result.content_id),
        escape_html(&result.summary.text)
    ));

    out.push_str("<h2>Key findings</h2>\n<ul>\n");
    for finding in &result.summary.key_findings {
        out.push_str(&format!("<li>{}</li>\n", escape_html(finding)));
    }
    out.push_str("</ul>\n");

    out.push_str("<h2>Scores</h2>\n<table>\n<tr><th>Evaluator</th><th>Score</th><th>Rank</th></tr>\n");
    for evaluation in &result.evaluations {
        out.push_str(&format!(
            "<tr><td>{}</td><td>{:.2}</td><td>{}</td></tr>\n",
            evaluation.evaluator, evaluation.overall, evaluation.rank
        ));
    }
    out.push_str("</table>\n");

    out.push_str("<h2>Recommendations</h2>\n<ol>\n");
    for rec in &result.recommendations {
        out.push_str(&format!(
            "<li class=\"{:?}\">{}</li>\n",
            rec.priority,
            escape_html(&rec.text)
        ));
    }
    out.push_str("</ol>\n</body>\n</html>\n");
    out
}

fn render_prose(result: &FinalResult) -> String {
    let mut out = format!("# Report: {}\n\n", result.content_id);
    out.push_str(&format!(
        "The analysis reached an overall score of {:.0}% with {:.0}% confidence, and validation {}.\n\n",
        result.summary.overall_score * 100.0,
        result.summary.confidence * 100.0,
        if result.summary.validation_passed {
            "passed"
        } else {
            "did not pass"
        }
    ));
    if !result.synthesized.summary.is_empty() {
        out.push_str(&result.synthesized.summary);
        out.push_str("\n\n");
    }
    if !result.summary.key_findings.is_empty() {
        out.push_str("## Key findings\n\n");
        for finding in &result.summary.key_findings {
            out.push_str(&format!("- {}\n", finding));
        }
        out.push('\n');
    }
    if !result.recommendations.is_empty() {
        out.push_str("## Recommendations\n\n");
        for (i, rec) in result.recommendations.iter().enumerate() {
            out.push_str(&format!("{}. **{:?}**: {}\n", i + 1, rec.priority, rec.text));
        }
    }
    out
}

fn render_text(result: &FinalResult) -> String {
    let mut out = String::new();
    out.push_str(&format!("\n  Docswarm Report: {}\n  {}\n\n", result.content_id, "=".repeat(40)));
    out.push_str(&format!("  Overall score:    {:.1}%\n", result.summary.overall_score * 100.0));
    out.push_str(&format!("  Confidence:       {:.1}%\n", result.summary.confidence * 100.0));
    out.push_str(&format!(
        "  Validation:       {}\n",
        if result.summary.validation_passed { "PASS" } else { "FAIL" }
    ));
    out.push_str(&format!("  Chunk results:    {}\n", result.results.len()));
    out.push_str(&format!(
        "  Generated:        {}\n\n",
        result.created_at.format("%Y-%m-%d %H:%M:%S UTC")
    ));
    for finding in &result.summary.key_findings {
        out.push_str(&format!("  * {}\n", finding));
    }
    if !result.recommendations.is_empty() {
        out.push('\n');
    }
    for rec in &result.recommendations {
        out.push_str(&format!("  [{:?}] {}\n", rec.priority, rec.text));
    }
    out
}
