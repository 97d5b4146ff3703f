//! Local command invoker.
//!
//! Runs the runner's command template as a child process of convoy itself.
//! It's the simplest backend and needs nothing beyond a shell.
//!
//! # Characteristics
//!
//! | Feature | Support |
//! |---------|---------|
//! | Isolation | None (shared filesystem and network) |
//! | Resource limits | Not enforced |
//! | Results | Trailing JSON line on stdout |
//! | Parallel execution | Yes, one process per invocation |
//!
//! # Example Configuration
//!
//! ```toml
//! [[runners]]
//! name = "laptop"
//! max_concurrent_jobs = 2
//!
//! [runners.backend]
//! type = "local"
//! command = "./ci/run-suite.sh {test_suite} {environment} {shard_index} {total_shards}"
//! working_dir = "~/src/project"
//! shell = "/bin/bash"
//! ```
//!
//! Placeholder values are shell-quoted before substitution, so a suite
//! name can never inject shell syntax. The same values are exported as
//! `CONVOY_*` environment variables.

use std::process::Stdio;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::{
    CompletionReport, CompletionSender, InvocationPayload, InvokeError, InvokeResult, Invoker,
    RunnerCallback, parse_results,
};
use crate::config::{LocalBackendConfig, RunnerBackend};
use crate::model::Runner;

/// Invoker for `local` runners.
pub struct LocalInvoker {
    completions: CompletionSender,
}

impl LocalInvoker {
    pub fn new(completions: CompletionSender) -> Self {
        Self { completions }
    }
}

/// Substitutes `{placeholder}`s in `template` with shell-quoted payload values.
///
/// ```
/// use convoy::invoker::InvocationPayload;
/// use convoy::invoker::local::render_command;
///
/// let payload = InvocationPayload::new("e1", "api tests", "staging", "http://cb");
/// assert_eq!(
///     render_command("run {test_suite} --env {environment}", &payload),
///     "run 'api tests' --env staging"
/// );
/// ```
pub fn render_command(template: &str, payload: &InvocationPayload) -> String {
    let optional = |value: Option<String>| value.unwrap_or_default();
    let values = [
        ("{execution_id}", payload.execution_id.clone()),
        ("{test_suite}", payload.test_suite.clone()),
        ("{environment}", payload.environment.clone()),
        ("{callback_address}", payload.callback_address.clone()),
        ("{shard_index}", optional(payload.shard_index.map(|i| i.to_string()))),
        ("{total_shards}", optional(payload.total_shards.map(|t| t.to_string()))),
        ("{parent_id}", optional(payload.parent_execution_id.clone())),
    ];

    let mut rendered = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find('{') {
        rendered.push_str(&rest[..start]);
        let tail = &rest[start..];
        match values.iter().find(|(placeholder, _)| tail.starts_with(placeholder)) {
            Some((placeholder, value)) => {
                if !value.is_empty() {
                    rendered.push_str(&shell_words::quote(value));
                }
                rest = &tail[placeholder.len()..];
            }
            None => {
                rendered.push('{');
                rest = &tail[1..];
            }
        }
    }
    rendered.push_str(rest);
    rendered
}

#[async_trait]
impl Invoker for LocalInvoker {
    async fn trigger(&self, runner: &Runner, payload: &InvocationPayload) -> InvokeResult<()> {
        let RunnerBackend::Local(config) = &runner.backend else {
            return Err(InvokeError::Misconfigured(format!(
                "runner {} is not a local runner",
                runner.name
            )));
        };

        let mut process = build_process(config, payload)?;
        let child = process
            .spawn()
            .map_err(|e| InvokeError::Launch(format!("{}: {e}", config.shell)))?;

        debug!(
            runner = %runner.name,
            execution_id = %payload.execution_id,
            pid = child.id(),
            "local command started"
        );
        let id = payload.execution_id.clone();
        if self.completions.send(RunnerCallback::Started(id.clone())).is_err() {
            debug!(execution_id = %id, "callback receiver closed, dropping start notice");
        }

        let completions = self.completions.clone();
        tokio::spawn(async move {
            let report = match child.wait_with_output().await {
                Ok(output) => {
                    let stdout = String::from_utf8_lossy(&output.stdout);
                    let results = parse_results(&stdout);
                    if output.status.success() {
                        CompletionReport::completed(&id, results)
                    } else {
                        let stderr = String::from_utf8_lossy(&output.stderr);
                        let detail = stderr
                            .lines()
                            .rev()
                            .map(str::trim)
                            .find(|l| !l.is_empty())
                            .map(str::to_string)
                            .unwrap_or_else(|| format!("command exited with {}", output.status));
                        CompletionReport {
                            results,
                            ..CompletionReport::failed(&id, detail)
                        }
                    }
                }
                Err(e) => {
                    warn!(execution_id = %id, error = %e, "lost local command");
                    CompletionReport::failed(&id, format!("failed to wait for command: {e}"))
                }
            };
            if completions.send(RunnerCallback::Finished(report)).is_err() {
                debug!(execution_id = %id, "callback receiver closed, dropping completion");
            }
        });

        Ok(())
    }
}

fn build_process(
    config: &LocalBackendConfig,
    payload: &InvocationPayload,
) -> InvokeResult<tokio::process::Command> {
    let command = render_command(&config.command, payload);

    let mut process = tokio::process::Command::new(&config.shell);
    process.arg("-c").arg(&command);

    if let Some(dir) = &config.working_dir {
        let expanded = shellexpand::full(dir)
            .map_err(|e| InvokeError::Misconfigured(format!("working_dir {dir:?}: {e}")))?;
        process.current_dir(expanded.as_ref());
    }

    for (key, value) in &config.env {
        process.env(key, value);
    }
    for (key, value) in payload.env_vars() {
        process.env(key, value);
    }

    process.stdin(Stdio::null());
    process.stdout(Stdio::piped());
    process.stderr(Stdio::piped());

    Ok(process)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::invoker::completion_channel;
    use crate::model::ReportedStatus;
    use crate::test_support::local_runner_with;

    fn local(command: &str) -> Runner {
        local_runner_with(
            "local",
            LocalBackendConfig {
                command: command.to_string(),
                working_dir: None,
                env: HashMap::new(),
                shell: "/bin/sh".to_string(),
            },
        )
    }

    async fn finished(rx: &mut crate::invoker::CompletionReceiver) -> CompletionReport {
        loop {
            match rx.recv().await.expect("channel closed") {
                RunnerCallback::Started(_) => continue,
                RunnerCallback::Finished(report) => return report,
            }
        }
    }

    #[test]
    fn test_render_quotes_and_blanks_missing_values() {
        let payload = InvocationPayload::new("e1", "unit; rm -rf /", "ci", "http://cb");
        let rendered = render_command("run {test_suite} [{shard_index}]", &payload);
        assert_eq!(rendered, "run 'unit; rm -rf /' []");

        let shard = InvocationPayload::new("s1", "unit", "ci", "http://cb").shard("p1", 0, 3);
        assert_eq!(
            render_command("{shard_index}/{total_shards} of {parent_id}", &shard),
            "0/3 of p1"
        );
    }

    #[tokio::test]
    async fn test_successful_command_reports_results() {
        let (tx, mut rx) = completion_channel();
        let invoker = LocalInvoker::new(tx);
        let runner = local(r#"echo running; echo '{"total": 4, "passed": 3, "skipped": 1}'"#);
        let payload = InvocationPayload::new("e1", "unit", "ci", "http://cb");

        invoker.trigger(&runner, &payload).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), RunnerCallback::Started("e1".into()));

        let report = finished(&mut rx).await;
        assert_eq!(report.id, "e1");
        assert_eq!(report.status, ReportedStatus::Completed);
        let results = report.results.unwrap();
        assert_eq!(results.total, 4);
        assert_eq!(results.skipped, 1);
    }

    #[tokio::test]
    async fn test_failing_command_reports_stderr() {
        let (tx, mut rx) = completion_channel();
        let invoker = LocalInvoker::new(tx);
        let runner = local("echo 'database unreachable' >&2; exit 3");
        let payload = InvocationPayload::new("e2", "integration", "ci", "http://cb");

        invoker.trigger(&runner, &payload).await.unwrap();
        let report = finished(&mut rx).await;
        assert_eq!(report.status, ReportedStatus::Failed);
        assert_eq!(report.error_message.as_deref(), Some("database unreachable"));
    }

    #[tokio::test]
    async fn test_placeholders_and_env_reach_the_command() {
        let (tx, mut rx) = completion_channel();
        let invoker = LocalInvoker::new(tx);
        let runner = local(r#"test {test_suite} = "a b" && test "$CONVOY_ENVIRONMENT" = staging"#);
        let payload = InvocationPayload::new("e3", "a b", "staging", "http://cb");

        invoker.trigger(&runner, &payload).await.unwrap();
        assert_eq!(finished(&mut rx).await.status, ReportedStatus::Completed);
    }

    #[tokio::test]
    async fn test_closed_receiver_does_not_fail_trigger() {
        let (tx, rx) = completion_channel();
        drop(rx);
        let invoker = LocalInvoker::new(tx);
        let runner = local("true");
        let payload = InvocationPayload::new("e5", "unit", "ci", "http://cb");

        invoker.trigger(&runner, &payload).await.unwrap();
        // Let the waiter task finish and hit the closed channel.
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        invoker.trigger(&runner, &payload).await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_shell_fails_to_launch() {
        let (tx, _rx) = completion_channel();
        let invoker = LocalInvoker::new(tx);
        let runner = local_runner_with(
            "broken",
            LocalBackendConfig {
                command: "true".into(),
                working_dir: None,
                env: HashMap::new(),
                shell: "/nonexistent/shell".into(),
            },
        );
        let payload = InvocationPayload::new("e4", "unit", "ci", "http://cb");

        let err = invoker.trigger(&runner, &payload).await.unwrap_err();
        assert!(matches!(err, InvokeError::Launch(_)));
    }
}
