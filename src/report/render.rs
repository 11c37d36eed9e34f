//! Plain-text rendering of a window report.

use super::{Report, ReportKind};
use crate::model::format_duration_secs;

/// Render a report as the operator-facing text summary.
pub fn render_text(report: &Report) -> String {
    let mut out = String::new();
    let title = match report.kind {
        ReportKind::Scheduled => "EVENT ANALYSIS REPORT",
        ReportKind::Correction => "EVENT ANALYSIS REPORT (CORRECTION)",
    };
    out.push_str(&format!("=== {title} ===\n"));
    out.push_str(&format!(
        "Window: {} .. {}\n",
        report.window.start.format("%Y-%m-%d %H:%M UTC"),
        report.window.end.format("%Y-%m-%d %H:%M UTC"),
    ));
    out.push_str(&format!(
        "Generated: {}\n\n",
        report.generated_at.format("%Y-%m-%d %H:%M:%S UTC")
    ));

    out.push_str(&format!("Classified events: {}\n", report.total));
    if report.failed > 0 {
        out.push_str(&format!("Failed (dead-lettered): {}\n", report.failed));
    }
    match (report.previous_total, report.change_rate_pct) {
        (Some(prev), Some(rate)) => {
            out.push_str(&format!(
                "Previous window: {prev} ({}{:.1}% change)\n",
                if rate >= 0.0 { "+" } else { "" },
                rate
            ));
        }
        (Some(prev), None) => {
            out.push_str(&format!("Previous window: {prev}\n"));
        }
        _ => {}
    }

    out.push_str("\n-- Categories --\n");
    for (category, count) in &report.category_counts {
        out.push_str(&format!("  {category:<14} {count}\n"));
    }

    out.push_str("\n-- Severity --\n");
    for (tier, count) in &report.severity_counts {
        out.push_str(&format!("  {tier:<14} {count}\n"));
    }

    if !report.top_hosts.is_empty() {
        out.push_str("\n-- Top hosts --\n");
        for (host, count) in &report.top_hosts {
            out.push_str(&format!("  {host:<24} {count}\n"));
        }
    }

    if !report.top_patterns.is_empty() {
        out.push_str("\n-- Top patterns --\n");
        for (pattern, count) in &report.top_patterns {
            out.push_str(&format!("  {count:>4}x  {pattern}\n"));
        }
    }

    if let Some(hour) = report.peak_hour {
        out.push_str(&format!("\nPeak hour: {hour:02}:00 UTC\n"));
    }
    if let Some(avg) = report.avg_duration_secs {
        out.push_str(&format!("Average duration: {}\n", format_duration_secs(avg)));
    }
    if let Some(max) = report.max_duration_secs {
        out.push_str(&format!("Longest duration: {}\n", format_duration_secs(max)));
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Category, SeverityTier};
    use crate::report::Window;
    use chrono::{TimeZone, Utc};
    use std::collections::BTreeMap;
    use uuid::Uuid;

    fn sample_report() -> Report {
        let mut category_counts: BTreeMap<String, u64> = Category::ALL
            .iter()
            .map(|c| (c.to_string(), 0))
            .collect();
        category_counts.insert("fault".to_string(), 3);
        let severity_counts = SeverityTier::ALL
            .iter()
            .map(|t| (t.to_string(), 1))
            .collect();
        Report {
            id: Uuid::new_v4(),
            kind: ReportKind::Scheduled,
            window: Window::new(
                Utc.with_ymd_and_hms(2026, 3, 2, 10, 0, 0).unwrap(),
                Utc.with_ymd_and_hms(2026, 3, 2, 11, 0, 0).unwrap(),
            ),
            total: 3,
            category_counts,
            severity_counts,
            contributing: Vec::new(),
            top_hosts: vec![("db01".to_string(), 2)],
            top_patterns: vec![("disk sda# full".to_string(), 2)],
            peak_hour: Some(10),
            avg_duration_secs: Some(2_700),
            max_duration_secs: Some(5_400),
            previous_total: Some(2),
            change_rate_pct: Some(50.0),
            failed: 1,
            generated_at: Utc.with_ymd_and_hms(2026, 3, 2, 11, 2, 0).unwrap(),
        }
    }

    #[test]
    fn test_render_contains_sections() {
        let text = render_text(&sample_report());
        assert!(text.contains("EVENT ANALYSIS REPORT"));
        assert!(text.contains("Classified events: 3"));
        assert!(text.contains("Failed (dead-lettered): 1"));
        assert!(text.contains("Previous window: 2 (+50.0% change)"));
        assert!(text.contains("db01"));
        assert!(text.contains("disk sda# full"));
        assert!(text.contains("Peak hour: 10:00 UTC"));
        assert!(text.contains("Average duration: 45m"));
    }

    #[test]
    fn test_correction_title() {
        let mut report = sample_report();
        report.kind = ReportKind::Correction;
        let text = render_text(&report);
        assert!(text.contains("(CORRECTION)"));
    }

    #[test]
    fn test_zero_report_renders_without_optional_sections() {
        let mut report = sample_report();
        report.total = 0;
        report.failed = 0;
        report.top_hosts.clear();
        report.top_patterns.clear();
        report.peak_hour = None;
        report.avg_duration_secs = None;
        report.max_duration_secs = None;
        report.previous_total = None;
        report.change_rate_pct = None;
        let text = render_text(&report);
        assert!(text.contains("Classified events: 0"));
        assert!(!text.contains("Top hosts"));
        assert!(!text.contains("Peak hour"));
        assert!(!text.contains("dead-lettered"));
    }
}
