//! Output formatting for run summaries and store reports (table, JSON, markdown, CSV).

use crate::config::OutputFormat;
use crate::progress::RunSummary;
use crate::store::{ProgressRecord, ProvinceStats};

/// Formats reports for output.
pub struct Formatter {
    format: OutputFormat,
}

impl Formatter {
    /// Creates a new formatter.
    pub fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Formats the summary of a backfill run.
    pub fn format_summary(&self, summary: &RunSummary) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(summary).unwrap_or_else(|_| "{}".to_string()),
            OutputFormat::Table => self.table_summary(summary),
            OutputFormat::Markdown => self.markdown_summary(summary),
            OutputFormat::Csv => self.csv_summary(summary),
        }
    }

    /// Formats per-province coverage.
    pub fn format_stats(&self, stats: &[ProvinceStats]) -> String {
        if stats.is_empty() {
            return match self.format {
                OutputFormat::Json => "[]".to_string(),
                OutputFormat::Csv => Self::STATS_HEADER.to_string(),
                _ => "No stores found.".to_string(),
            };
        }

        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(stats).unwrap_or_else(|_| "[]".to_string()),
            OutputFormat::Table => self.table_stats(stats),
            OutputFormat::Markdown => self.markdown_stats(stats),
            OutputFormat::Csv => self.csv_stats(stats),
        }
    }

    /// Formats discovery progress records.
    pub fn format_progress(&self, records: &[ProgressRecord]) -> String {
        if records.is_empty() {
            return match self.format {
                OutputFormat::Json => "[]".to_string(),
                OutputFormat::Csv => Self::PROGRESS_HEADER.to_string(),
                _ => "No progress records found.".to_string(),
            };
        }

        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(records).unwrap_or_else(|_| "[]".to_string()),
            OutputFormat::Table => self.table_progress(records),
            OutputFormat::Markdown => self.markdown_progress(records),
            OutputFormat::Csv => self.csv_progress(records),
        }
    }

    // Table formatting

    fn table_summary(&self, summary: &RunSummary) -> String {
        let rows = summary.rows();
        let width = rows.iter().map(|(label, _)| label.len()).max().unwrap_or(0);

        let mut lines = vec![format!("Backfill summary ({})", summary.field), String::new()];
        for (label, value) in rows {
            lines.push(format!("{:<width$}  {}", label, value));
        }
        lines.join("\n")
    }

    fn table_stats(&self, stats: &[ProvinceStats]) -> String {
        let province_width = stats.iter().map(|s| s.province.chars().count()).max().unwrap_or(0).max(8);

        let mut lines = Vec::new();
        lines.push(format!(
            "{:<province_width$}  {:>8}  {:>10}  {:>13}  {:>13}",
            "Province", "Total", "With image", "Missing image", "With geometry"
        ));
        lines.push(format!(
            "{:-<province_width$}  {:->8}  {:->10}  {:->13}  {:->13}",
            "", "", "", "", ""
        ));

        for s in stats {
            lines.push(format!(
                "{:<province_width$}  {:>8}  {:>10}  {:>13}  {:>13}",
                s.province, s.total, s.with_image, s.missing_image, s.with_geometry
            ));
        }

        let total: i64 = stats.iter().map(|s| s.total).sum();
        let missing: i64 = stats.iter().map(|s| s.missing_image).sum();
        lines.push(String::new());
        lines.push(format!("Total: {} stores, {} missing an image", total, missing));

        lines.join("\n")
    }

    fn table_progress(&self, records: &[ProgressRecord]) -> String {
        let mut lines = Vec::new();
        lines.push(format!(
            "{:<20}  {:<20}  {:<20}  {:<8}  {:<19}  {}",
            "Province", "District", "Keyword", "Status", "Updated", "Last place id"
        ));
        lines.push(format!("{:-<20}  {:-<20}  {:-<20}  {:-<8}  {:-<19}  {:-<13}", "", "", "", "", "", ""));

        for r in records {
            lines.push(format!(
                "{:<20}  {:<20}  {:<20}  {:<8}  {:<19}  {}",
                Self::truncate(&r.province, 20),
                Self::truncate(&r.district, 20),
                Self::truncate(&r.keyword, 20),
                r.status,
                r.updated_at.format("%Y-%m-%d %H:%M:%S"),
                r.last_place_id.as_deref().unwrap_or("-")
            ));
        }

        lines.push(String::new());
        lines.push(format!("Total: {} records", records.len()));

        lines.join("\n")
    }

    // Markdown formatting

    fn markdown_summary(&self, summary: &RunSummary) -> String {
        let mut lines = vec![format!("## Backfill summary ({})", summary.field), String::new()];
        for (label, value) in summary.rows() {
            lines.push(format!("- **{}:** {}", label, value));
        }
        lines.join("\n")
    }

    fn markdown_stats(&self, stats: &[ProvinceStats]) -> String {
        let mut lines = Vec::new();
        lines.push("| Province | Total | With image | Missing image | With geometry |".to_string());
        lines.push("|----------|-------|------------|---------------|---------------|".to_string());

        for s in stats {
            lines.push(format!(
                "| {} | {} | {} | {} | {} |",
                s.province, s.total, s.with_image, s.missing_image, s.with_geometry
            ));
        }

        lines.push(String::new());
        lines.push(format!("*{} provinces*", stats.len()));
        lines.join("\n")
    }

    fn markdown_progress(&self, records: &[ProgressRecord]) -> String {
        let mut lines = Vec::new();
        lines.push("| Province | District | Keyword | Status | Updated |".to_string());
        lines.push("|----------|----------|---------|--------|---------|".to_string());

        for r in records {
            lines.push(format!(
                "| {} | {} | {} | {} | {} |",
                r.province,
                r.district,
                r.keyword,
                r.status,
                r.updated_at.format("%Y-%m-%d %H:%M:%S")
            ));
        }

        lines.push(String::new());
        lines.push(format!("*{} records*", records.len()));
        lines.join("\n")
    }

    // CSV formatting

    const STATS_HEADER: &'static str = "province,total,with_image,missing_image,with_geometry";
    const PROGRESS_HEADER: &'static str = "province,district,keyword,status,last_place_id,updated_at";

    fn csv_summary(&self, summary: &RunSummary) -> String {
        let mut lines = vec!["metric,value".to_string()];
        for (label, value) in summary.rows() {
            lines.push(format!("{},{}", Self::csv_escape(label), Self::csv_escape(&value)));
        }
        lines.join("\n")
    }

    fn csv_stats(&self, stats: &[ProvinceStats]) -> String {
        let mut lines = vec![Self::STATS_HEADER.to_string()];
        for s in stats {
            lines.push(format!(
                "{},{},{},{},{}",
                Self::csv_escape(&s.province),
                s.total,
                s.with_image,
                s.missing_image,
                s.with_geometry
            ));
        }
        lines.join("\n")
    }

    fn csv_progress(&self, records: &[ProgressRecord]) -> String {
        let mut lines = vec![Self::PROGRESS_HEADER.to_string()];
        for r in records {
            lines.push(format!(
                "{},{},{},{},{},{}",
                Self::csv_escape(&r.province),
                Self::csv_escape(&r.district),
                Self::csv_escape(&r.keyword),
                r.status,
                r.last_place_id.as_deref().map(Self::csv_escape).unwrap_or_default(),
                r.updated_at.format("%Y-%m-%dT%H:%M:%S")
            ));
        }
        lines.join("\n")
    }

    fn csv_escape(s: &str) -> String {
        if s.contains(',') || s.contains('"') || s.contains('\n') {
            format!("\"{}\"", s.replace('"', "\"\""))
        } else {
            s.to_string()
        }
    }

    fn truncate(s: &str, width: usize) -> String {
        if s.chars().count() > width {
            let head: String = s.chars().take(width - 3).collect();
            format!("{}...", head)
        } else {
            s.to_string()
        }
    }
}
