//! Deterministic checks run inside the sandbox after a patch is applied:
//! lint over the changed files, then the affected tests.

use std::collections::BTreeSet;

use tracing::{info, warn};

use minion_graphs::{AffectedTests, FileId};

use crate::config::GatesSection;
use crate::error::SandboxError;
use crate::sandbox::{CommandRunner, ExecOutput, shell_quote};
use crate::types::{GateKind, GateOutcome, GateResult, tail_chars};

/// Characters of stdout and stderr kept from a failing test run.
const TEST_STDOUT_TAIL: usize = 1500;
const TEST_STDERR_TAIL: usize = 500;

#[derive(Debug, Clone)]
pub struct GateRunner {
    gates: GatesSection,
    diagnostic_limit: usize,
}

impl GateRunner {
    pub fn new(gates: GatesSection, diagnostic_limit: usize) -> Self {
        Self {
            gates,
            diagnostic_limit,
        }
    }

    /// Changed files the lint command applies to.
    pub fn lintable<'a>(&self, files: &'a BTreeSet<FileId>) -> Vec<&'a FileId> {
        files
            .iter()
            .filter(|f| {
                f.extension()
                    .is_some_and(|ext| self.gates.lint_extensions.iter().any(|e| e == ext))
            })
            .collect()
    }

    pub fn lint_command(&self, files: &[&FileId]) -> String {
        expand(&self.gates.lint_command, "{files}", files)
    }

    pub fn test_command(&self, tests: &AffectedTests) -> String {
        match tests {
            AffectedTests::Selected(set) => {
                let files: Vec<&FileId> = set.iter().collect();
                expand(&self.gates.test_command, "{tests}", &files)
            }
            AffectedTests::FullSuite { .. } => self.gates.full_suite_command.clone(),
        }
    }

    /// Gate 1. Passes trivially when no changed file is lintable.
    pub async fn lint(
        &self,
        runner: &dyn CommandRunner,
        changed: &BTreeSet<FileId>,
    ) -> Result<GateResult, SandboxError> {
        let files = self.lintable(changed);
        if files.is_empty() {
            info!("No lintable files changed, lint gate skipped");
            return Ok(GateResult {
                kind: GateKind::Lint,
                outcome: GateOutcome::Passed,
                diagnostic: "no lintable files changed".to_string(),
                command: String::new(),
                exit_code: None,
                elapsed_ms: 0,
            });
        }

        let command = self.lint_command(&files);
        let out = runner.run(&command, self.gates.lint_timeout()).await?;
        let outcome = outcome_of(&out, &[0]);
        let diagnostic = self.trim(&format!("{}{}", out.stdout, out.stderr), 0);
        Ok(self.finish(GateKind::Lint, command, &out, outcome, diagnostic))
    }

    /// Gate 2.
    pub async fn test(
        &self,
        runner: &dyn CommandRunner,
        tests: &AffectedTests,
    ) -> Result<GateResult, SandboxError> {
        let command = self.test_command(tests);
        if let AffectedTests::FullSuite { reason } = tests {
            info!(%reason, "Running the full test suite");
        }
        let out = runner.run(&command, self.gates.test_timeout()).await?;
        let outcome = outcome_of(&out, &self.gates.test_pass_exit_codes);
        let diagnostic = self.trim(&out.stdout, TEST_STDOUT_TAIL)
            + &self.trim(&out.stderr, TEST_STDERR_TAIL);
        let diagnostic = tail_chars(&diagnostic, self.diagnostic_limit).to_string();
        Ok(self.finish(GateKind::Test, command, &out, outcome, diagnostic))
    }

    fn finish(
        &self,
        kind: GateKind,
        command: String,
        out: &ExecOutput,
        outcome: GateOutcome,
        diagnostic: String,
    ) -> GateResult {
        let diagnostic = match outcome {
            GateOutcome::TimedOut => format!(
                "{kind} gate timed out after {}s\n{diagnostic}",
                match kind {
                    GateKind::Lint => self.gates.lint_timeout_secs,
                    GateKind::Test => self.gates.test_timeout_secs,
                }
            ),
            _ => diagnostic,
        };
        match outcome {
            GateOutcome::Passed => info!(gate = %kind, elapsed_ms = out.elapsed_ms, "Gate passed"),
            _ => warn!(
                gate = %kind,
                exit_code = out.exit_code,
                timed_out = out.timed_out,
                "Gate failed"
            ),
        }
        GateResult {
            kind,
            outcome,
            diagnostic,
            command,
            exit_code: Some(out.exit_code),
            elapsed_ms: out.elapsed_ms,
        }
    }

    /// Keep the last `tail` characters (0 = the diagnostic limit).
    fn trim(&self, text: &str, tail: usize) -> String {
        let limit = if tail == 0 {
            self.diagnostic_limit
        } else {
            tail.min(self.diagnostic_limit)
        };
        tail_chars(text.trim_end(), limit).to_string()
    }
}

fn outcome_of(out: &ExecOutput, pass_codes: &[i32]) -> GateOutcome {
    if out.timed_out {
        GateOutcome::TimedOut
    } else if pass_codes.contains(&out.exit_code) {
        GateOutcome::Passed
    } else {
        GateOutcome::Failed
    }
}

/// Substitute `placeholder` with the quoted file list, or append the list
/// when the template has no placeholder.
fn expand(template: &str, placeholder: &str, files: &[&FileId]) -> String {
    let list = files
        .iter()
        .map(|f| shell_quote(f.as_str()))
        .collect::<Vec<_>>()
        .join(" ");
    if template.contains(placeholder) {
        template.replace(placeholder, &list)
    } else {
        format!("{template} {list}")
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use minion_graphs::FullSuiteReason;

    use super::*;

    /// Replays one canned output and records the commands it saw.
    struct Canned {
        out: ExecOutput,
        seen: Mutex<Vec<String>>,
    }

    impl Canned {
        fn new(exit_code: i32, stdout: &str, stderr: &str, timed_out: bool) -> Self {
            Self {
                out: ExecOutput {
                    exit_code,
                    stdout: stdout.into(),
                    stderr: stderr.into(),
                    timed_out,
                    elapsed_ms: 3,
                },
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait::async_trait]
    impl CommandRunner for Canned {
        async fn run(&self, command: &str, _timeout: Duration) -> Result<ExecOutput, SandboxError> {
            self.seen.lock().unwrap().push(command.to_string());
            Ok(self.out.clone())
        }
    }

    fn runner() -> GateRunner {
        GateRunner::new(GatesSection::default(), 2000)
    }

    fn files(paths: &[&str]) -> BTreeSet<FileId> {
        paths.iter().map(|p| FileId::new(*p)).collect()
    }

    #[tokio::test]
    async fn lint_runs_only_on_python_files() {
        let canned = Canned::new(0, "", "", false);
        let result = runner()
            .lint(&canned, &files(&["app/cart.py", "README.md"]))
            .await
            .unwrap();
        assert!(result.passed());
        let seen = canned.seen.lock().unwrap();
        assert_eq!(seen.as_slice(), ["ruff check --output-format=concise app/cart.py"]);
    }

    #[tokio::test]
    async fn lint_without_lintable_files_passes_without_running() {
        let canned = Canned::new(1, "", "", false);
        let result = runner().lint(&canned, &files(&["docs/a.md"])).await.unwrap();
        assert!(result.passed());
        assert!(canned.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn lint_failure_carries_diagnostics() {
        let canned = Canned::new(1, "app/cart.py:3:1: F401 unused import\n", "", false);
        let result = runner().lint(&canned, &files(&["app/cart.py"])).await.unwrap();
        assert_eq!(result.outcome, GateOutcome::Failed);
        assert!(result.diagnostic.contains("F401"));
        assert_eq!(result.exit_code, Some(1));
    }

    #[tokio::test]
    async fn selected_tests_are_passed_to_the_command() {
        let canned = Canned::new(0, "2 passed", "", false);
        let tests = AffectedTests::Selected(files(&["tests/test_cart.py", "tests/test_b.py"]));
        let result = runner().test(&canned, &tests).await.unwrap();
        assert!(result.passed());
        assert_eq!(
            result.command,
            "python -m pytest -q --tb=short --no-header tests/test_b.py tests/test_cart.py"
        );
    }

    #[tokio::test]
    async fn full_suite_uses_its_own_command() {
        let canned = Canned::new(5, "no tests ran", "", false);
        let tests = AffectedTests::FullSuite {
            reason: FullSuiteReason::NoTestsSelected,
        };
        let result = runner().test(&canned, &tests).await.unwrap();
        assert!(result.passed());
        assert_eq!(result.command, "python -m pytest -q --tb=short --no-header");
    }

    #[tokio::test]
    async fn test_failure_keeps_output_tails() {
        let stdout = format!("{}FAILED tests/test_cart.py::test_total", "x".repeat(5000));
        let canned = Canned::new(1, &stdout, "warning", false);
        let tests = AffectedTests::Selected(files(&["tests/test_cart.py"]));
        let result = runner().test(&canned, &tests).await.unwrap();
        assert_eq!(result.outcome, GateOutcome::Failed);
        assert!(result.diagnostic.contains("FAILED tests/test_cart.py::test_total"));
        assert!(result.diagnostic.ends_with("warning"));
        assert!(result.diagnostic.chars().count() <= TEST_STDOUT_TAIL + TEST_STDERR_TAIL);
    }

    #[tokio::test]
    async fn timeouts_count_as_failures() {
        let canned = Canned::new(124, "", "", true);
        let tests = AffectedTests::Selected(files(&["tests/test_cart.py"]));
        let result = runner().test(&canned, &tests).await.unwrap();
        assert_eq!(result.outcome, GateOutcome::TimedOut);
        assert!(!result.passed());
        assert!(result.diagnostic.starts_with("test gate timed out after 300s"));
    }

    #[test]
    fn templates_without_placeholder_get_files_appended() {
        let list = [&FileId::new("a b.py")];
        assert_eq!(expand("flake8", "{files}", &list), "flake8 'a b.py'");
    }
}
