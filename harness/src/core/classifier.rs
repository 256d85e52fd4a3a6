//! Deterministic classification of the test step into a run outcome.
//!
//! Precedence, highest first:
//! 1. the test step ran past the run budget: `TimedOut`;
//! 2. a valid results document exists: its score (`Completed`) or its
//!    `error` (`TestFailed`), whatever the exit code;
//! 3. no valid document after a failed pre-test script: `TestFailed`;
//! 4. no valid document otherwise: `InfrastructureError`.

use serde_json::{Map, Value};

use crate::core::result::{Outcome, TestReport, parse_test_report};

/// What the isolation runner observed around the test step.
#[derive(Debug, Clone, Default)]
pub struct TestStepObservation {
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    /// Exit code of the pre-test script when it ran and failed.
    pub pre_test_failure: Option<Option<i32>>,
    /// Raw results file contents, `None` if the file was absent.
    pub results: Option<Vec<u8>>,
}

/// Outcome plus the metadata to attach to the run result.
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub outcome: Outcome,
    pub metadata: Map<String, Value>,
    /// Parsed report, kept so callers can persist the raw document.
    pub report: Option<TestReport>,
}

pub fn classify_test_step(observation: &TestStepObservation) -> Classification {
    if observation.timed_out {
        return Classification {
            outcome: Outcome::TimedOut {
                reason: "test step exceeded the run budget".to_string(),
            },
            metadata: Map::new(),
            report: None,
        };
    }

    let parse_error = match observation.results.as_deref().map(parse_test_report) {
        Some(Ok(report)) => return classify_report(report),
        Some(Err(err)) => Some(err),
        None => None,
    };

    let missing = match &parse_error {
        Some(err) => format!("results file invalid ({err})"),
        None => "results file missing".to_string(),
    };

    if let Some(pre_test_exit) = observation.pre_test_failure {
        return Classification {
            outcome: Outcome::TestFailed {
                reason: format!(
                    "{missing} after pre-test script failed (exit {})",
                    describe_exit(pre_test_exit)
                ),
            },
            metadata: Map::new(),
            report: None,
        };
    }

    Classification {
        outcome: Outcome::InfrastructureError {
            reason: format!(
                "{missing}; test step exited {}",
                describe_exit(observation.exit_code)
            ),
        },
        metadata: Map::new(),
        report: None,
    }
}

fn classify_report(report: TestReport) -> Classification {
    let outcome = match &report.error {
        Some(message) => Outcome::TestFailed {
            reason: format!("test reported a fatal error: {message}"),
        },
        None => Outcome::Completed {
            score: report.score,
        },
    };
    Classification {
        outcome,
        metadata: report.metadata.clone(),
        report: Some(report),
    }
}

fn describe_exit(code: Option<i32>) -> String {
    code.map_or_else(|| "by signal".to_string(), |code| code.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::RunStatus;

    fn observe(exit_code: Option<i32>, results: Option<&str>) -> TestStepObservation {
        TestStepObservation {
            exit_code,
            timed_out: false,
            pre_test_failure: None,
            results: results.map(|body| body.as_bytes().to_vec()),
        }
    }

    #[test]
    fn valid_results_complete_with_score() {
        let classification = classify_test_step(&observe(
            Some(0),
            Some(r#"{"score": 87, "metadata": {"notes": "partial"}}"#),
        ));
        assert_eq!(classification.outcome.status(), RunStatus::Completed);
        assert_eq!(classification.outcome.score().map(|s| s.value()), Some(87));
        assert_eq!(classification.metadata["notes"], "partial");
    }

    #[test]
    fn results_file_takes_precedence_over_exit_code() {
        let classification = classify_test_step(&observe(
            Some(1),
            Some(r#"{"score": 40, "metadata": {}}"#),
        ));
        assert_eq!(classification.outcome.status(), RunStatus::Completed);
    }

    #[test]
    fn missing_results_with_nonzero_exit_is_infrastructure() {
        let classification = classify_test_step(&observe(Some(2), None));
        assert_eq!(
            classification.outcome.status(),
            RunStatus::InfrastructureError
        );
        assert!(
            classification
                .outcome
                .reason()
                .is_some_and(|reason| reason.contains("exited 2"))
        );
    }

    #[test]
    fn malformed_results_is_infrastructure() {
        let classification = classify_test_step(&observe(Some(0), Some("{\"score\": ")));
        assert_eq!(
            classification.outcome.status(),
            RunStatus::InfrastructureError
        );
    }

    #[test]
    fn reported_error_is_test_failed() {
        let classification = classify_test_step(&observe(
            Some(0),
            Some(r#"{"score": 0, "metadata": {}, "error": "fixture missing"}"#),
        ));
        assert_eq!(classification.outcome.status(), RunStatus::TestFailed);
        assert!(classification.outcome.score().is_none());
    }

    #[test]
    fn pre_test_failure_without_results_is_test_failed() {
        let mut observation = observe(Some(1), None);
        observation.pre_test_failure = Some(Some(3));
        let classification = classify_test_step(&observation);
        assert_eq!(classification.outcome.status(), RunStatus::TestFailed);
    }

    #[test]
    fn pre_test_failure_with_results_still_scores() {
        let mut observation = observe(Some(0), Some(r#"{"score": 70, "metadata": {}}"#));
        observation.pre_test_failure = Some(Some(3));
        let classification = classify_test_step(&observation);
        assert_eq!(classification.outcome.status(), RunStatus::Completed);
    }

    #[test]
    fn timeout_wins_over_results() {
        let mut observation = observe(None, Some(r#"{"score": 90, "metadata": {}}"#));
        observation.timed_out = true;
        let classification = classify_test_step(&observation);
        assert_eq!(classification.outcome.status(), RunStatus::TimedOut);
        assert!(classification.outcome.score().is_none());
    }
}
