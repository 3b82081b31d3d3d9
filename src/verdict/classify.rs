/// Render outcome classification
///
/// verdict = f(evidence). The exit code alone is never trusted: a renderer
/// can exit 0 after printing errors, or without writing the artifact.
use crate::config::types::{RenderError, RenderFailure, RenderOutcome};
use std::path::Path;
use std::time::Duration;

const GENERIC_FAILURE_HINT: &str = "Render failed. See logs for details.";
const MISSING_ARTIFACT_HINT: &str = "Render succeeded but output image not found.";

/// Everything observed about one finished renderer process
#[derive(Debug, Clone)]
pub struct RenderEvidence<'a> {
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub timed_out: bool,
    pub deadline: Duration,
    /// Output lines carrying an error marker, from the whole stream
    pub error_lines: &'a [String],
    pub artifact_path: &'a Path,
    pub artifact_exists: bool,
}

#[derive(Debug, Clone)]
pub struct OutcomeClassifier {
    error_markers: Vec<String>,
}

impl OutcomeClassifier {
    pub fn new(error_markers: &[String]) -> Self {
        Self {
            error_markers: error_markers
                .iter()
                .filter(|m| !m.is_empty())
                .cloned()
                .collect(),
        }
    }

    pub fn is_error_line(&self, line: &str) -> bool {
        self.error_markers.iter().any(|m| line.contains(m.as_str()))
    }

    /// Classify a finished render. Precedence: timeout, abnormal exit,
    /// error marker, missing artifact.
    pub fn classify(&self, evidence: &RenderEvidence<'_>) -> RenderOutcome {
        let error_lines = evidence.error_lines;

        let error = if evidence.timed_out {
            Some(RenderError::Timeout {
                deadline: evidence.deadline,
            })
        } else if let Some(signal) = evidence.signal {
            Some(RenderError::Signaled { signal })
        } else if evidence.exit_code != Some(0) {
            Some(RenderError::NonZeroExit {
                code: evidence.exit_code.unwrap_or(-1),
            })
        } else if !error_lines.is_empty() {
            Some(RenderError::ErrorMarkerInOutput)
        } else if !evidence.artifact_exists {
            Some(RenderError::MissingArtifact {
                path: evidence.artifact_path.to_path_buf(),
            })
        } else {
            None
        };

        match error {
            None => RenderOutcome::Done(evidence.artifact_path.to_path_buf()),
            Some(error) => {
                let excerpt = if !error_lines.is_empty() {
                    error_lines.join("\n")
                } else if matches!(error, RenderError::MissingArtifact { .. }) {
                    MISSING_ARTIFACT_HINT.to_string()
                } else {
                    GENERIC_FAILURE_HINT.to_string()
                };
                RenderOutcome::Failed(RenderFailure { error, excerpt })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn classifier() -> OutcomeClassifier {
        OutcomeClassifier::new(&["Error:".to_string()])
    }

    fn flagged(output: &str) -> Vec<String> {
        let classifier = classifier();
        output
            .lines()
            .filter(|line| classifier.is_error_line(line))
            .map(str::to_string)
            .collect()
    }

    fn evidence<'a>(artifact: &'a Path, error_lines: &'a [String]) -> RenderEvidence<'a> {
        RenderEvidence {
            exit_code: Some(0),
            signal: None,
            timed_out: false,
            deadline: Duration::from_secs(60),
            error_lines,
            artifact_path: artifact,
            artifact_exists: true,
        }
    }

    #[test]
    fn clean_exit_with_artifact_is_done() {
        let artifact = PathBuf::from("/out/scene0001.png");
        let lines = flagged("Saved: /out/scene0001.png\n");
        let outcome = classifier().classify(&evidence(&artifact, &lines));
        assert_eq!(outcome, RenderOutcome::Done(artifact));
    }

    #[test]
    fn error_marker_fails_despite_exit_zero() {
        let artifact = PathBuf::from("/out/scene0001.png");
        let output = "Fra:1 Mem:12M\nError: Cannot read file\nBlender quit\n";
        let lines = flagged(output);
        let outcome = classifier().classify(&evidence(&artifact, &lines));

        let failure = outcome.failure().unwrap();
        assert_eq!(failure.error, RenderError::ErrorMarkerInOutput);
        assert_eq!(failure.excerpt, "Error: Cannot read file");
    }

    #[test]
    fn missing_artifact_fails_despite_clean_exit() {
        let artifact = PathBuf::from("/out/scene0001.png");
        let lines = flagged("Blender quit\n");
        let mut ev = evidence(&artifact, &lines);
        ev.artifact_exists = false;

        let failure = classifier().classify(&ev).failure().cloned().unwrap();
        assert_eq!(failure.error, RenderError::MissingArtifact { path: artifact });
        assert_eq!(failure.excerpt, MISSING_ARTIFACT_HINT);
    }

    #[test]
    fn non_zero_exit_uses_generic_hint_without_markers() {
        let artifact = PathBuf::from("/out/scene0001.png");
        let lines = flagged("segfault\n");
        let mut ev = evidence(&artifact, &lines);
        ev.exit_code = Some(139);

        let failure = classifier().classify(&ev).failure().cloned().unwrap();
        assert_eq!(failure.error, RenderError::NonZeroExit { code: 139 });
        assert_eq!(failure.excerpt, GENERIC_FAILURE_HINT);
    }

    #[test]
    fn timeout_takes_precedence() {
        let artifact = PathBuf::from("/out/scene0001.png");
        let lines = flagged("Error: still going\n");
        let mut ev = evidence(&artifact, &lines);
        ev.timed_out = true;
        ev.exit_code = None;
        ev.signal = Some(9);

        let failure = classifier().classify(&ev).failure().cloned().unwrap();
        assert_eq!(
            failure.error,
            RenderError::Timeout {
                deadline: Duration::from_secs(60)
            }
        );
        assert_eq!(failure.excerpt, "Error: still going");
    }

    #[test]
    fn markers_match_anywhere_in_line() {
        let c = classifier();
        assert!(c.is_error_line("Fra:1 Error: out of memory"));
        assert!(!c.is_error_line("error: lowercase is not a marker"));
        assert!(!OutcomeClassifier::new(&[String::new()]).is_error_line("anything"));
    }

    #[test]
    fn killed_by_signal_is_distinct_from_exit_code() {
        let artifact = PathBuf::from("/out/scene0001.png");
        let lines = flagged("");
        let mut ev = evidence(&artifact, &lines);
        ev.exit_code = None;
        ev.signal = Some(11);

        let outcome = classifier().classify(&ev);
        assert_eq!(
            outcome.failure().unwrap().error,
            RenderError::Signaled { signal: 11 }
        );
    }
}
