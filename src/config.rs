//! Configuration loading and schema definitions for convoy.
//!
//! This module provides types and functions for loading convoy configuration
//! from TOML files or strings. The configuration schema defines scheduler
//! cadence, resource defaults, the runners and load balancing rules
//! registered at startup, and reporting.

pub mod schema;

pub use schema::*;

use std::collections::HashSet;
use std::path::Path;

use anyhow::{Context, Result, bail};

use crate::balancer::RulePattern;

/// Loads convoy configuration from a TOML file.
///
/// # Errors
///
/// Returns an error if:
/// - The file cannot be read (e.g., doesn't exist or permission denied)
/// - The file contains invalid TOML syntax
/// - The configuration doesn't match the expected schema
///
/// # Example
///
/// ```no_run
/// use convoy::config::load_config;
/// use std::path::Path;
///
/// let config = load_config(Path::new("convoy.toml"))?;
/// println!("Runners: {}", config.runners.len());
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    Ok(config)
}

/// Loads convoy configuration from a TOML string.
///
/// # Example
///
/// ```
/// use convoy::config::load_config_str;
///
/// let config = load_config_str(r#"
///     [convoy]
///     scheduler_interval_secs = 2
/// "#)?;
///
/// assert_eq!(config.convoy.scheduler_interval_secs, 2);
/// assert!(config.runners.is_empty());
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config_str(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).context("Failed to parse config")?;

    Ok(config)
}

impl Config {
    /// Checks constraints the schema can't express.
    ///
    /// # Errors
    ///
    /// Returns the first violation found: zero intervals, a non-positive
    /// timeout multiplier, duplicate or empty runner names, runners without
    /// job slots or capacity, or rule patterns that don't compile.
    pub fn validate(&self) -> Result<()> {
        let c = &self.convoy;
        for (name, value) in [
            ("scheduler_interval_secs", c.scheduler_interval_secs),
            ("timeout_sweep_interval_secs", c.timeout_sweep_interval_secs),
            ("monitor_interval_secs", c.monitor_interval_secs),
            ("coordination_interval_secs", c.coordination_interval_secs),
        ] {
            if value == 0 {
                bail!("convoy.{name} must be greater than zero");
            }
        }
        if c.timeout_multiplier <= 0.0 {
            bail!("convoy.timeout_multiplier must be positive");
        }
        if self.parallel.max_shards == 0 {
            bail!("parallel.max_shards must be greater than zero");
        }

        let mut names = HashSet::new();
        for runner in &self.runners {
            if runner.name.trim().is_empty() {
                bail!("runner names must not be empty");
            }
            if !names.insert(runner.name.as_str()) {
                bail!("duplicate runner name: {}", runner.name);
            }
            if runner.max_concurrent_jobs == 0 {
                bail!("runner {}: max_concurrent_jobs must be at least 1", runner.name);
            }
            if runner.capabilities.max_cpu_percent <= 0.0 || runner.capabilities.max_memory_mb == 0 {
                bail!("runner {}: capabilities must be positive", runner.name);
            }
        }

        for rule in &self.rules {
            for pattern in [&rule.suite_pattern, &rule.env_pattern].into_iter().flatten() {
                RulePattern::parse(pattern)
                    .with_context(|| format!("rule {}: invalid pattern {pattern:?}", rule.name))?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        [convoy]
        scheduler_interval_secs = 2
        callback_address = "http://convoy.internal/callbacks"

        [parallel]
        shard_timeout_secs = 3600

        [[runners]]
        name = "local-1"
        max_concurrent_jobs = 2
        priority = 80

        [runners.capabilities]
        max_cpu_percent = 200
        max_memory_mb = 8192

        [runners.backend]
        type = "local"
        command = "echo {test_suite}"

        [[runners]]
        name = "docker-1"

        [runners.backend]
        type = "docker"
        image = "python:3.12-slim"

        [[rules]]
        name = "ui-on-docker"
        rule_type = "resource-based"
        suite_pattern = "ui-*"
        runner_type = "docker"
        priority = 10
    "#;

    #[test]
    fn test_load_sample_config() {
        let config = load_config_str(SAMPLE).unwrap();

        assert_eq!(config.convoy.scheduler_interval_secs, 2);
        assert_eq!(config.convoy.timeout_floor_secs, 1800);
        assert_eq!(config.parallel.shard_timeout_secs, 3600);
        assert_eq!(config.parallel.stuck_after_secs, 600);
        assert_eq!(config.runners.len(), 2);
        assert_eq!(config.runners[0].capabilities.max_cpu_percent, 200.0);
        assert_eq!(config.runners[1].max_concurrent_jobs, 5);
        assert!(matches!(config.runners[1].backend, RunnerBackend::Docker(_)));
        assert_eq!(config.rules[0].rule_type, crate::model::RuleType::ResourceBased);
        assert!(config.rules[0].active);
        config.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_duplicate_runner_names() {
        let config = load_config_str(
            r#"
            [[runners]]
            name = "dup"
            [runners.backend]
            type = "local"
            command = "true"

            [[runners]]
            name = "dup"
            [runners.backend]
            type = "local"
            command = "true"
            "#,
        )
        .unwrap();

        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate runner name"));
    }

    #[test]
    fn test_validate_rejects_bad_rule_pattern() {
        let config = load_config_str(
            r#"
            [[rules]]
            name = "broken"
            rule_type = "round-robin"
            env_pattern = "regex:(unclosed"
            "#,
        )
        .unwrap();

        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unknown_backend_type_fails_to_parse() {
        let result = load_config_str(
            r#"
            [[runners]]
            name = "k8s"
            [runners.backend]
            type = "kubernetes"
            "#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_load_config_reports_missing_file() {
        let err = load_config(Path::new("/nonexistent/convoy.toml")).unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }
}
