//! Smoke checks for the verification tooling itself.
//!
//! A broken test runner is worse than no test runner: it creates false
//! corrective pressure on every retry loop downstream. The probe must pass
//! once per orchestration run before the first dispatch.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tokio::fs;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::ToolingConfig;
use crate::error::{ConductorError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmokeCheck {
    TestRunner,
    Linter,
    TypeChecker,
}

impl std::fmt::Display for SmokeCheck {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::TestRunner => "test runner",
            Self::Linter => "linter",
            Self::TypeChecker => "type checker",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone)]
pub struct SmokeResult {
    pub check: SmokeCheck,
    pub passed: bool,
    pub output: String,
    pub duration_ms: u64,
}

#[derive(Debug, Clone)]
pub struct HealthReport {
    pub checks: Vec<SmokeResult>,
}

impl HealthReport {
    pub fn all_passed(&self) -> bool {
        !self.checks.is_empty() && self.checks.iter().all(|c| c.passed)
    }
}

pub struct HealthProbe {
    config: ToolingConfig,
}

impl HealthProbe {
    pub fn new(config: ToolingConfig) -> Self {
        Self { config }
    }

    /// Runs the three smoke checks against synthetic known-good input in an
    /// isolated scratch directory. Failures are aggregated into one fatal
    /// error naming every broken check.
    pub async fn verify_healthy(&self, work_dir: &Path) -> Result<HealthReport> {
        let scratch = self.prepare_scratch(work_dir).await?;

        let mut checks = Vec::with_capacity(3);
        checks.push(
            self.run_check(SmokeCheck::TestRunner, &self.config.test_cmd, &scratch)
                .await,
        );
        checks.push(
            self.run_check(SmokeCheck::Linter, &self.config.lint_cmd, &scratch)
                .await,
        );
        checks.push(
            self.run_check(SmokeCheck::TypeChecker, &self.config.typecheck_cmd, &scratch)
                .await,
        );

        let _ = fs::remove_dir_all(&scratch).await;

        let report = HealthReport { checks };
        if report.all_passed() {
            info!("Verification tooling healthy");
            Ok(report)
        } else {
            let failures: Vec<String> = report
                .checks
                .iter()
                .filter(|c| !c.passed)
                .map(|c| format!("{}: {}", c.check, first_line(&c.output)))
                .collect();
            Err(ConductorError::InstrumentationBroken { failures })
        }
    }

    /// Writes a file any honest tool accepts: the check is about the tool,
    /// not the content.
    async fn prepare_scratch(&self, work_dir: &Path) -> Result<PathBuf> {
        let scratch = work_dir.join(".conductor-probe");
        fs::create_dir_all(&scratch).await?;
        fs::write(scratch.join("known_good.txt"), "probe input\n").await?;
        Ok(scratch)
    }

    async fn run_check(&self, check: SmokeCheck, cmd: &str, scratch: &Path) -> SmokeResult {
        debug!(check = %check, cmd = %cmd, "Running smoke check");
        let started = Instant::now();

        let output = tokio::time::timeout(
            Duration::from_secs(self.config.smoke_timeout_secs),
            Command::new("sh")
                .arg("-c")
                .arg(cmd)
                .current_dir(scratch)
                .output(),
        )
        .await;

        let duration_ms = started.elapsed().as_millis() as u64;
        match output {
            Ok(Ok(out)) if out.status.success() => SmokeResult {
                check,
                passed: true,
                output: String::new(),
                duration_ms,
            },
            Ok(Ok(out)) => {
                let stderr = String::from_utf8_lossy(&out.stderr);
                warn!(check = %check, stderr = %stderr, "Smoke check failed");
                SmokeResult {
                    check,
                    passed: false,
                    output: format!(
                        "exit {}: {}",
                        out.status.code().unwrap_or(-1),
                        stderr.trim()
                    ),
                    duration_ms,
                }
            }
            Ok(Err(e)) => SmokeResult {
                check,
                passed: false,
                output: format!("failed to spawn: {}", e),
                duration_ms,
            },
            Err(_) => SmokeResult {
                check,
                passed: false,
                output: format!("timed out after {}s", self.config.smoke_timeout_secs),
                duration_ms,
            },
        }
    }
}

fn first_line(text: &str) -> &str {
    text.lines().next().unwrap_or("")
}
