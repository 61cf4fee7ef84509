//! Running one configured tool against one staged file

use std::path::Path;
use std::time::Duration;

use tracing::{debug, warn};

use super::target::Target;
use crate::config::{PipelineConfig, SuccessRule, ToolConfig};
use crate::core::models::{now_millis, FileId, ResultId, ToolResult};
use crate::runner::{CommandSpec, ProcessError, RunLimits, RunOutcome, Runner};

const RETRY_BACKOFF: Duration = Duration::from_millis(200);

/// Whether an outcome counts as success under a tool's rule
pub fn passed(rule: SuccessRule, outcome: &RunOutcome) -> bool {
    match rule {
        SuccessRule::ExitZero => outcome.is_success(),
        SuccessRule::Completed => outcome.completed(),
    }
}

/// Run `tool` against `target`, retrying on resource exhaustion, and build
/// the result to record. Failures end up inside the result.
pub async fn run_tool(
    runner: &dyn Runner,
    tool: &ToolConfig,
    target: &Target,
    tests_dir: Option<&Path>,
    settings: &PipelineConfig,
    file: FileId,
) -> ToolResult {
    let rendered = target.render(&tool.command, tests_dir);
    let outcome = match CommandSpec::from_vec(&rendered) {
        Some(cmd) => {
            let cmd = cmd.with_work_dir(&target.dir);
            let mut limits = RunLimits::new(tool.timeout.unwrap_or_else(|| settings.tool_timeout()));
            if let Some(memory_mb) = settings.memory_limit_mb {
                limits = limits.with_memory_mb(memory_mb);
            }
            run_with_retries(runner, &cmd, &limits, settings.start_retries).await
        }
        None => RunOutcome::failed(ProcessError::Start {
            program: tool.name.clone(),
            message: "empty command".into(),
        }),
    };

    let error = if passed(tool.success, &outcome) {
        None
    } else {
        outcome.error.as_ref().map(ProcessError::to_tool_error)
    };
    debug!(
        "{} on file {} finished in {} ms (exit {:?})",
        tool.name, file, outcome.elapsed_ms, outcome.exit_code
    );

    ToolResult {
        id: ResultId::new(),
        file,
        tool: tool.name.clone(),
        stdout: outcome.stdout,
        stderr: outcome.stderr,
        error,
        time: now_millis(),
    }
}

async fn run_with_retries(
    runner: &dyn Runner,
    cmd: &CommandSpec,
    limits: &RunLimits,
    retries: u32,
) -> RunOutcome {
    let mut attempt = 0;
    loop {
        let outcome = runner.run(cmd, limits, None).await;
        match &outcome.error {
            Some(e) if e.is_retryable() && attempt < retries => {
                attempt += 1;
                warn!("{} (attempt {}/{}), retrying", e, attempt, retries);
                tokio::time::sleep(RETRY_BACKOFF * attempt).await;
            }
            _ => return outcome,
        }
    }
}
