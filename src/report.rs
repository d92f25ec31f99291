//! Result aggregation and the failure/incomplete summary table.

use crate::config::{ConfigurationSet, TestConfiguration};
use crate::orchestrator::{Outcome, TestResult};

/// One failed or incomplete result, joined to its configuration label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SummaryRow {
    /// `file/point`.
    pub test: String,
    /// Human-readable configuration.
    pub configuration: String,
    /// `failed (<kind>)` or `incomplete`.
    pub outcome: String,
    /// Failure message or unmet assumption.
    pub detail: String,
}

/// Aggregated results of a run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Summary {
    /// Passed points.
    pub passed: usize,
    /// Failed points.
    pub failed: usize,
    /// Incomplete points.
    pub incomplete: usize,
    /// Failed rows first, then incomplete rows, each in execution order.
    pub rows: Vec<SummaryRow>,
}

impl Summary {
    /// Partition `results` and label every row that needs attention.
    pub fn summarize(results: &[TestResult], configurations: &ConfigurationSet) -> Self {
        let mut summary = Self::default();
        let mut incomplete_rows = Vec::new();

        for result in results {
            let configuration = configurations.get(&result.configuration_key).map_or_else(
                || format!("<unbound:{}>", result.configuration_key),
                TestConfiguration::label,
            );
            let row = |outcome: String, detail: &str| SummaryRow {
                test: result.test_name.clone(),
                configuration: configuration.clone(),
                outcome,
                detail: detail.to_owned(),
            };

            match &result.outcome {
                Outcome::Passed => summary.passed += 1,
                Outcome::Failed { kind, message } => {
                    summary.failed += 1;
                    summary.rows.push(row(format!("failed ({kind})"), message));
                }
                Outcome::Incomplete { reason } => {
                    summary.incomplete += 1;
                    incomplete_rows.push(row("incomplete".to_owned(), reason));
                }
            }
        }

        summary.rows.extend(incomplete_rows);
        summary
    }

    /// Total number of results.
    pub const fn total(&self) -> usize {
        self.passed + self.failed + self.incomplete
    }

    /// Process exit code: non-zero iff anything failed.
    pub const fn exit_code(&self) -> i32 {
        if self.failed > 0 {
            1
        } else {
            0
        }
    }

    /// Render the single success line or the attention table.
    pub fn render(&self) -> String {
        if self.rows.is_empty() {
            return format!("All {} test points passed.\n", self.passed);
        }

        let headers = ["Test", "Configuration", "Outcome", "Detail"];
        let cells: Vec<[&str; 4]> = self
            .rows
            .iter()
            .map(|row| {
                [
                    row.test.as_str(),
                    row.configuration.as_str(),
                    row.outcome.as_str(),
                    row.detail.as_str(),
                ]
            })
            .collect();

        let mut widths = headers.map(str::len);
        for line in &cells {
            for (width, cell) in widths.iter_mut().zip(line) {
                *width = (*width).max(cell.chars().count());
            }
        }

        let rule: Vec<String> = widths.iter().map(|w| "-".repeat(*w)).collect();
        let rule: Vec<&str> = rule.iter().map(String::as_str).collect();

        let mut lines = vec![
            format!(
                "{} passed, {} failed, {} incomplete",
                self.passed, self.failed, self.incomplete
            ),
            table_line(&headers, &widths),
            table_line(&rule, &widths),
        ];
        lines.extend(cells.iter().map(|line| table_line(line, &widths)));
        lines.push(String::new());
        lines.join("\n")
    }
}

fn table_line(cells: &[&str], widths: &[usize]) -> String {
    let padded: Vec<String> = cells
        .iter()
        .zip(widths)
        .map(|(cell, width)| format!("{cell:<width$}"))
        .collect();
    padded.join(" | ").trim_end().to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigKey;
    use crate::orchestrator::FailureKind;

    fn result(test: &str, key: usize, outcome: Outcome) -> TestResult {
        TestResult {
            test_name: test.to_owned(),
            configuration_key: ConfigKey::nth(key),
            outcome,
        }
    }

    #[test]
    fn test_all_passed_is_one_line() {
        let results = vec![
            result("tVideoinput/verifyVideoinputObj", 1, Outcome::Passed),
            result("tVideoinput/verifySelectedSource", 1, Outcome::Passed),
        ];
        let summary = Summary::summarize(&results, &ConfigurationSet::default());
        assert_eq!(summary.render(), "All 2 test points passed.\n");
        assert_eq!(summary.exit_code(), 0);
    }

    #[test]
    fn test_failed_rows_before_incomplete() {
        let results = vec![
            result(
                "tAcquisition/verifyRegionOfInterest",
                1,
                Outcome::Incomplete {
                    reason: "ROI not supported".to_owned(),
                },
            ),
            result("tAcquisition/verifySnapshot", 1, Outcome::Passed),
            result(
                "tAcquisition/verifyStreaming",
                2,
                Outcome::Failed {
                    kind: FailureKind::Timeout,
                    message: "timed out".to_owned(),
                },
            ),
        ];
        let summary = Summary::summarize(&results, &ConfigurationSet::default());
        assert_eq!((summary.passed, summary.failed, summary.incomplete), (1, 1, 1));
        assert_eq!(summary.total(), 3);
        assert_eq!(summary.exit_code(), 1);
        assert_eq!(summary.rows[0].test, "tAcquisition/verifyStreaming");
        assert_eq!(summary.rows[0].outcome, "failed (timeout)");
        assert_eq!(summary.rows[0].configuration, "<unbound:cfg-2>");
        assert_eq!(summary.rows[1].outcome, "incomplete");

        let table = summary.render();
        let lines: Vec<&str> = table.lines().collect();
        assert_eq!(lines[0], "1 passed, 1 failed, 1 incomplete");
        assert!(lines[1].starts_with("Test"));
        assert!(lines[3].contains("verifyStreaming"));
        assert!(lines[4].contains("ROI not supported"));
        assert!(table.ends_with('\n'));
        assert_eq!(lines.len(), 5);
        let divider = lines[1].find('|');
        assert!(divider.is_some());
        assert_eq!(lines[3].find('|'), divider);
        assert!(lines[2].chars().all(|c| c == '-' || c == ' ' || c == '|'));
    }

    #[test]
    fn test_incomplete_alone_exits_zero() {
        let results = vec![result(
            "tFormats/verifyFormatSnapshot",
            1,
            Outcome::Incomplete {
                reason: "no pixel format bound".to_owned(),
            },
        )];
        let summary = Summary::summarize(&results, &ConfigurationSet::default());
        assert_eq!(summary.exit_code(), 0);
        assert!(summary.render().contains("incomplete"));
    }
}
