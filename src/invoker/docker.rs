//! Docker container invoker.
//!
//! Each invocation gets a fresh container from the runner's image. The
//! container receives the payload as `CONVOY_*` environment variables, and
//! the allocation's CPU and memory become the container's limits. When the
//! container exits its exit code decides the completion status, the last
//! JSON line of its stdout (if any) becomes the results, and the container is
//! removed.
//!
//! # Example Configuration
//!
//! ```toml
//! [[runners]]
//! name = "docker-large"
//! max_concurrent_jobs = 4
//!
//! [runners.backend]
//! type = "docker"
//! image = "ghcr.io/acme/test-runner:latest"
//! command = ["sh", "-c", "pytest -q tests/$CONVOY_TEST_SUITE"]
//! network_mode = "bridge"
//! ```

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    Config as ContainerConfig, CreateContainerOptions, LogOutput, LogsOptions,
    RemoveContainerOptions, StartContainerOptions, WaitContainerOptions,
};
use futures::StreamExt;
use tracing::{debug, warn};

use super::{
    CompletionReport, CompletionSender, InvocationPayload, InvokeError, InvokeResult, Invoker,
    RunnerCallback, parse_results,
};
use crate::config::{DockerBackendConfig, RunnerBackend};
use crate::model::Runner;

/// Lines of container output inspected for a results line.
const RESULT_TAIL_LINES: &str = "50";

/// Invoker for `docker` runners.
pub struct DockerInvoker {
    completions: CompletionSender,
}

impl DockerInvoker {
    pub fn new(completions: CompletionSender) -> Self {
        Self { completions }
    }
}

fn connect(config: &DockerBackendConfig) -> InvokeResult<Docker> {
    match &config.docker_host {
        Some(host) => Docker::connect_with_http(host, 120, bollard::API_DEFAULT_VERSION),
        None => Docker::connect_with_local_defaults(),
    }
    .map_err(|e| InvokeError::Connection(e.to_string()))
}

/// Container name for a work item. Docker names allow `[a-zA-Z0-9_.-]`.
fn container_name(execution_id: &str) -> String {
    let safe: String = execution_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || "_.-".contains(c) { c } else { '-' })
        .collect();
    format!("convoy-{safe}")
}

fn container_config(config: &DockerBackendConfig, payload: &InvocationPayload) -> ContainerConfig<String> {
    let mut env: Vec<String> = config.env.iter().map(|(k, v)| format!("{k}={v}")).collect();
    env.extend(payload.env_vars().into_iter().map(|(k, v)| format!("{k}={v}")));

    let mut host_config = bollard::models::HostConfig {
        network_mode: Some(config.network_mode.clone()),
        ..Default::default()
    };
    if let Some(cpu) = payload.cpu_percent {
        // 100% is one core.
        host_config.nano_cpus = Some((cpu / 100.0 * 1_000_000_000.0) as i64);
    }
    if let Some(memory_mb) = payload.memory_mb {
        host_config.memory = Some((memory_mb * 1024 * 1024) as i64);
    }

    ContainerConfig {
        image: Some(config.image.clone()),
        cmd: (!config.command.is_empty()).then(|| config.command.clone()),
        env: Some(env),
        host_config: Some(host_config),
        ..Default::default()
    }
}

#[async_trait]
impl Invoker for DockerInvoker {
    async fn trigger(&self, runner: &Runner, payload: &InvocationPayload) -> InvokeResult<()> {
        let RunnerBackend::Docker(config) = &runner.backend else {
            return Err(InvokeError::Misconfigured(format!(
                "runner {} is not a docker runner",
                runner.name
            )));
        };
        let docker = connect(config)?;
        let name = container_name(&payload.execution_id);

        let options = CreateContainerOptions {
            name: name.as_str(),
            platform: None,
        };
        let created = docker
            .create_container(Some(options), container_config(config, payload))
            .await
            .map_err(|e| InvokeError::Launch(e.to_string()))?;
        let container_id = created.id;

        if let Err(e) = docker
            .start_container(&container_id, None::<StartContainerOptions<String>>)
            .await
        {
            remove(&docker, &container_id).await;
            return Err(InvokeError::Launch(e.to_string()));
        }

        debug!(
            runner = %runner.name,
            execution_id = %payload.execution_id,
            container = %name,
            "container started"
        );
        let id = payload.execution_id.clone();
        if self.completions.send(RunnerCallback::Started(id.clone())).is_err() {
            debug!(execution_id = %id, "callback receiver closed, dropping start notice");
        }

        let completions = self.completions.clone();
        tokio::spawn(async move {
            let report = await_exit(&docker, &container_id, &id).await;
            remove(&docker, &container_id).await;
            if completions.send(RunnerCallback::Finished(report)).is_err() {
                debug!(execution_id = %id, "callback receiver closed, dropping completion");
            }
        });

        Ok(())
    }
}

async fn await_exit(docker: &Docker, container_id: &str, id: &str) -> CompletionReport {
    let mut wait = docker.wait_container(container_id, None::<WaitContainerOptions<String>>);
    let exit_code = match wait.next().await {
        Some(Ok(response)) => response.status_code,
        // Non-zero exits surface as an error carrying the code.
        Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => code,
        Some(Err(e)) => {
            warn!(execution_id = %id, error = %e, "lost container");
            return CompletionReport::failed(id, format!("failed to wait for container: {e}"));
        }
        None => {
            return CompletionReport::failed(id, "container wait ended without a status");
        }
    };

    let (stdout, stderr) = tail_logs(docker, container_id).await;
    let results = parse_results(&stdout);
    if exit_code == 0 {
        return CompletionReport::completed(id, results);
    }

    let detail = stderr
        .lines()
        .rev()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| format!("container exited with code {exit_code}"));
    CompletionReport {
        results,
        ..CompletionReport::failed(id, detail)
    }
}

async fn tail_logs(docker: &Docker, container_id: &str) -> (String, String) {
    let options = LogsOptions::<String> {
        stdout: true,
        stderr: true,
        tail: RESULT_TAIL_LINES.to_string(),
        ..Default::default()
    };
    let mut stream = docker.logs(container_id, Some(options));
    let mut stdout = String::new();
    let mut stderr = String::new();
    while let Some(chunk) = stream.next().await {
        match chunk {
            Ok(LogOutput::StdOut { message }) => stdout.push_str(&String::from_utf8_lossy(&message)),
            Ok(LogOutput::StdErr { message }) => stderr.push_str(&String::from_utf8_lossy(&message)),
            Ok(_) => {}
            Err(e) => {
                debug!(container = %container_id, error = %e, "log stream ended");
                break;
            }
        }
    }
    (stdout, stderr)
}

async fn remove(docker: &Docker, container_id: &str) {
    let options = RemoveContainerOptions {
        force: true,
        ..Default::default()
    };
    if let Err(e) = docker.remove_container(container_id, Some(options)).await {
        debug!(container = %container_id, error = %e, "container removal failed");
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::invoker::completion_channel;
    use crate::test_support::local_runner;

    fn backend() -> DockerBackendConfig {
        DockerBackendConfig {
            image: "python:3.12-slim".into(),
            command: vec!["pytest".into(), "-q".into()],
            env: HashMap::from([("PYTHONDONTWRITEBYTECODE".to_string(), "1".to_string())]),
            network_mode: "host".into(),
            docker_host: None,
        }
    }

    #[test]
    fn test_container_name_is_sanitized() {
        assert_eq!(container_name("abc-123"), "convoy-abc-123");
        assert_eq!(container_name("p1/shard:2"), "convoy-p1-shard-2");
    }

    #[test]
    fn test_container_config_carries_env_and_limits() {
        let payload = InvocationPayload::new("e1", "ui", "staging", "http://cb").resources(150.0, 512);
        let config = container_config(&backend(), &payload);

        assert_eq!(config.image.as_deref(), Some("python:3.12-slim"));
        assert_eq!(config.cmd, Some(vec!["pytest".to_string(), "-q".to_string()]));
        let env = config.env.unwrap();
        assert!(env.contains(&"PYTHONDONTWRITEBYTECODE=1".to_string()));
        assert!(env.contains(&"CONVOY_TEST_SUITE=ui".to_string()));

        let host = config.host_config.unwrap();
        assert_eq!(host.network_mode.as_deref(), Some("host"));
        assert_eq!(host.nano_cpus, Some(1_500_000_000));
        assert_eq!(host.memory, Some(512 * 1024 * 1024));
    }

    #[test]
    fn test_empty_command_keeps_image_default() {
        let mut backend = backend();
        backend.command.clear();
        let payload = InvocationPayload::new("e1", "ui", "staging", "http://cb");
        let config = container_config(&backend, &payload);
        assert!(config.cmd.is_none());
        assert!(config.host_config.unwrap().nano_cpus.is_none());
    }

    #[tokio::test]
    async fn test_rejects_non_docker_runner() {
        let (tx, _rx) = completion_channel();
        let invoker = DockerInvoker::new(tx);
        let payload = InvocationPayload::new("e1", "ui", "staging", "http://cb");
        let err = invoker.trigger(&local_runner("r", 1), &payload).await.unwrap_err();
        assert!(matches!(err, InvokeError::Misconfigured(_)));
    }
}
