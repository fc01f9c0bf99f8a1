//! Comparison report and its markdown rendering (report.md).

use crate::metric::Metric;
use crate::segment::Segment;
use std::fmt;

/// Part of the data a test outcome was computed over.
#[derive(Debug, Clone, PartialEq)]
pub enum OutcomeScope {
    /// Rule without a segment.
    Whole,
    /// Rule restricted to a segment.
    Segment(Segment),
    /// Probe rows no rule selected.
    Complement,
}

impl From<Option<&Segment>> for OutcomeScope {
    fn from(segment: Option<&Segment>) -> Self {
        match segment {
            Some(segment) => OutcomeScope::Segment(segment.clone()),
            None => OutcomeScope::Whole,
        }
    }
}

impl fmt::Display for OutcomeScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutcomeScope::Whole => f.write_str("ALL"),
            OutcomeScope::Segment(segment) => write!(f, "{}", segment),
            OutcomeScope::Complement => f.write_str("COMPLEMENT OF SEGMENTS"),
        }
    }
}

/// Outcome of a single metric test.
#[derive(Debug, Clone, PartialEq)]
pub struct TestOutcome {
    pub metric: Metric,
    pub scope: OutcomeScope,
    /// Value computed from the probe data.
    pub value: f64,
    /// Value computed from the reference data.
    pub reference: f64,
    /// Relative difference, `|value - reference| / reference`.
    pub diff: f64,
}

impl TestOutcome {
    /// Passing iff the relative difference is within the tolerance (inclusive).
    pub fn is_passing(&self) -> bool {
        self.diff <= self.metric.tolerance()
    }
}

/// All outcomes of one validation run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Report {
    outcomes: Vec<TestOutcome>,
}

impl Report {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an outcome.
    pub fn add_test(&mut self, outcome: TestOutcome) {
        self.outcomes.push(outcome);
    }

    /// Outcomes in evaluation order.
    pub fn outcomes(&self) -> &[TestOutcome] {
        &self.outcomes
    }

    /// Outcomes that did not pass.
    pub fn failed(&self) -> impl Iterator<Item = &TestOutcome> {
        self.outcomes.iter().filter(|o| !o.is_passing())
    }

    /// True when every outcome passed. An empty report passes.
    pub fn is_passing(&self) -> bool {
        self.outcomes.iter().all(TestOutcome::is_passing)
    }

    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    /// Render the report as markdown.
    pub fn render_markdown(&self) -> String {
        let mut report = String::new();

        report.push_str("# Flow Comparison Report\n\n");

        let failed = self.failed().count();
        report.push_str(&format!("- **Tests**: {}\n", self.outcomes.len()));
        report.push_str(&format!("- **Failed**: {}\n", failed));
        report.push_str(&format!(
            "- **Verdict**: {}\n\n",
            if self.is_passing() { "PASS" } else { "FAIL" }
        ));

        if self.outcomes.is_empty() {
            report.push_str("No tests were evaluated.\n");
            return report;
        }

        report.push_str("| Metric | Segment | Value | Reference | Diff | Tolerance | Result |\n");
        report.push_str("|--------|---------|-------|-----------|------|-----------|--------|\n");
        for outcome in &self.outcomes {
            report.push_str(&format!(
                "| {} | {} | {} | {} | {:.4} | {:.4} | {} |\n",
                outcome.metric.kind(),
                outcome.scope,
                format_value(outcome.value),
                format_value(outcome.reference),
                outcome.diff,
                outcome.metric.tolerance(),
                if outcome.is_passing() { "pass" } else { "FAIL" },
            ));
        }

        if failed > 0 {
            report.push_str("\n## Failed Tests\n\n");
            for outcome in self.failed() {
                report.push_str(&format!(
                    "- {} over {}: {} vs {} (diff {:.4} > {:.4})\n",
                    outcome.metric.kind(),
                    outcome.scope,
                    format_value(outcome.value),
                    format_value(outcome.reference),
                    outcome.diff,
                    outcome.metric.tolerance(),
                ));
            }
        }

        report
    }
}

fn format_value(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{:.3}", value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metric::MetricKind;
    use crate::segment::SubnetSegment;

    fn make_outcome(kind: MetricKind, tolerance: f64, value: f64, reference: f64) -> TestOutcome {
        TestOutcome {
            metric: Metric::new(kind, tolerance).unwrap(),
            scope: OutcomeScope::Whole,
            value,
            reference,
            diff: (value - reference).abs() / reference,
        }
    }

    // ===========================================
    // Outcomes
    // ===========================================

    #[test]
    fn test_outcome_boundary_is_passing() {
        let outcome = make_outcome(MetricKind::Packets, 0.5, 150.0, 100.0);
        assert_eq!(outcome.diff, 0.5);
        assert!(outcome.is_passing());
    }

    #[test]
    fn test_outcome_above_tolerance_fails() {
        let outcome = make_outcome(MetricKind::Packets, 0.1, 150.0, 100.0);
        assert!(!outcome.is_passing());
    }

    #[test]
    fn test_scope_display() {
        assert_eq!(OutcomeScope::Whole.to_string(), "ALL");
        assert_eq!(OutcomeScope::Complement.to_string(), "COMPLEMENT OF SEGMENTS");
        let segment = Segment::from(SubnetSegment::parse(Some("10.0.0.0/8"), None, false).unwrap());
        assert_eq!(OutcomeScope::from(Some(&segment)).to_string(), "10.0.0.0/8 -> ANY");
    }

    // ===========================================
    // Report
    // ===========================================

    #[test]
    fn test_empty_report_passes() {
        let report = Report::new();
        assert!(report.is_passing());
        assert!(report.render_markdown().contains("No tests were evaluated."));
    }

    #[test]
    fn test_report_verdict() {
        let mut report = Report::new();
        report.add_test(make_outcome(MetricKind::Packets, 0.0, 100.0, 100.0));
        assert!(report.is_passing());

        report.add_test(make_outcome(MetricKind::Bytes, 0.0, 90.0, 100.0));
        assert!(!report.is_passing());
        assert_eq!(report.failed().count(), 1);
        assert_eq!(report.len(), 2);
    }

    #[test]
    fn test_render_markdown_table() {
        let mut report = Report::new();
        report.add_test(make_outcome(MetricKind::Packets, 0.0, 100.0, 100.0));
        report.add_test(make_outcome(MetricKind::Pps, 0.05, 9.5, 10.0));

        let md = report.render_markdown();
        assert!(md.starts_with("# Flow Comparison Report\n"));
        assert!(md.contains("- **Verdict**: PASS"));
        assert!(md.contains("| PACKETS | ALL | 100 | 100 | 0.0000 | 0.0000 | pass |"));
        assert!(md.contains("| PACKETS / S | ALL | 9.500 | 10 | 0.0500 | 0.0500 | pass |"));
        assert!(!md.contains("## Failed Tests"));
    }

    #[test]
    fn test_render_markdown_lists_failures() {
        let mut report = Report::new();
        report.add_test(make_outcome(MetricKind::Flows, 0.1, 50.0, 100.0));

        let md = report.render_markdown();
        assert!(md.contains("- **Verdict**: FAIL"));
        assert!(md.contains("## Failed Tests"));
        assert!(md.contains("- FLOWS over ALL: 50 vs 100 (diff 0.5000 > 0.1000)"));
    }
}
