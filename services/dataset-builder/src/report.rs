//! Plain-text split summaries printed at the end of a run.

use dataset::SplitReport;

/// One summary line per split, followed by one line per failed batch.
pub fn render(report: &SplitReport) -> String {
    let mut out = format!(
        "{:<10} batches {}/{}  examples {}  degraded slots {}",
        report.split.as_str(),
        report.batches.len(),
        report.requested,
        report.examples(),
        report.degraded_slots(),
    );
    for failure in &report.failures {
        out.push_str(&format!("\n  batch {:06} failed: {}", failure.batch_idx, failure.error));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use dataset::{BatchFailure, BatchSummary};
    use nowcasting_common::SplitName;

    #[test]
    fn test_render_lists_failures() {
        let report = SplitReport {
            split: SplitName::Test,
            requested: 2,
            batches: vec![BatchSummary {
                split: SplitName::Test,
                batch_idx: 0,
                requested: 8,
                produced: 7,
                redraws: 2,
                failures: Vec::new(),
            }],
            failures: vec![BatchFailure {
                batch_idx: 1,
                error: "Storage error: gone".into(),
            }],
        };

        let text = render(&report);
        assert!(text.starts_with("test       batches 1/2  examples 7  degraded slots 0"));
        assert!(text.ends_with("batch 000001 failed: Storage error: gone"));
    }
}
