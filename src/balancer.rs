//! Runner selection.
//!
//! The balancer is pure: given the eligible runners for one execution, the
//! configured rules and current allocation usage, it picks a runner. It never
//! touches the store, and the same inputs always produce the same choice.
//!
//! # Strategy
//!
//! | Situation | Choice |
//! |-----------|--------|
//! | No eligible runner | `None`, retried next pass |
//! | One eligible runner | That runner |
//! | Matching `priority-based` rule | Highest runner priority |
//! | Matching `resource-based` rule | Lowest load (`cpu + memory / 1024`) |
//! | Matching `round-robin` / `custom` rule, or no rule | Highest priority, then fewest jobs |
//!
//! Only the highest-priority active rule whose patterns match applies. A rule
//! with a `runner_type` filter narrows the candidates first; if that leaves
//! nothing, the next matching rule is tried.

use std::cmp::Ordering;
use std::collections::HashMap;

use regex::Regex;
use tracing::{debug, warn};

use crate::model::{Execution, LoadBalancingRule, RuleType, Runner};
use crate::resources::RunnerUsage;

/// A compiled suite or environment filter.
///
/// Plain values are globs where `*` matches any run of characters and `?`
/// matches one. Values prefixed with `regex:` are regular expressions. Both
/// must match the whole input.
///
/// ```
/// use convoy::balancer::RulePattern;
///
/// let glob = RulePattern::parse("ui-*").unwrap();
/// assert!(glob.matches("ui-checkout"));
/// assert!(!glob.matches("api-ui-checkout"));
///
/// let re = RulePattern::parse("regex:^prod(-eu|-us)?$").unwrap();
/// assert!(re.matches("prod-eu"));
/// assert!(!re.matches("production"));
/// ```
#[derive(Debug, Clone)]
pub struct RulePattern {
    regex: Regex,
}

impl RulePattern {
    pub fn parse(pattern: &str) -> Result<Self, regex::Error> {
        let source = match pattern.strip_prefix("regex:") {
            Some(expr) => format!("^(?:{expr})$"),
            None => glob_to_regex(pattern),
        };
        Ok(Self {
            regex: Regex::new(&source)?,
        })
    }

    pub fn matches(&self, value: &str) -> bool {
        self.regex.is_match(value)
    }
}

fn glob_to_regex(glob: &str) -> String {
    let mut out = String::with_capacity(glob.len() + 8);
    out.push('^');
    for ch in glob.chars() {
        match ch {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            other => out.push_str(&regex::escape(other.encode_utf8(&mut [0; 4]))),
        }
    }
    out.push('$');
    out
}

/// A rule with its patterns compiled.
///
/// Built once per scheduling pass from the configured rules. A rule whose
/// pattern fails to compile never matches.
#[derive(Debug, Clone)]
pub struct CompiledRule {
    pub rule: LoadBalancingRule,
    suite: Option<RulePattern>,
    env: Option<RulePattern>,
    valid: bool,
}

impl CompiledRule {
    pub fn new(rule: LoadBalancingRule) -> Self {
        let mut valid = true;
        let mut compile = |pattern: Option<&str>| {
            let pattern = pattern?;
            match RulePattern::parse(pattern) {
                Ok(compiled) => Some(compiled),
                Err(e) => {
                    warn!(rule = %rule.name, pattern = %pattern, error = %e, "ignoring rule with invalid pattern");
                    valid = false;
                    None
                }
            }
        };
        let suite = compile(rule.suite_pattern.as_deref());
        let env = compile(rule.env_pattern.as_deref());

        Self {
            rule,
            suite,
            env,
            valid,
        }
    }

    pub fn compile_all(rules: &[LoadBalancingRule]) -> Vec<Self> {
        rules.iter().cloned().map(Self::new).collect()
    }

    /// Returns `true` if the rule is active and its patterns accept `execution`.
    pub fn matches(&self, execution: &Execution) -> bool {
        self.rule.active
            && self.valid
            && self.suite.as_ref().is_none_or(|p| p.matches(&execution.test_suite))
            && self.env.as_ref().is_none_or(|p| p.matches(&execution.environment))
    }
}

/// Picks one runner among eligible candidates.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoadBalancer;

impl LoadBalancer {
    pub fn new() -> Self {
        Self
    }

    /// Selects a runner for `execution`.
    ///
    /// `eligible` must be in registration order; every ordering below is a
    /// stable sort on top of it. `usage` maps runner id to the CPU and memory
    /// held by its active allocations; missing entries count as idle.
    pub fn select(
        &self,
        eligible: &[Runner],
        execution: &Execution,
        rules: &[CompiledRule],
        usage: &HashMap<String, RunnerUsage>,
    ) -> Option<Runner> {
        match eligible {
            [] => return None,
            [only] => return Some(only.clone()),
            _ => {}
        }

        let mut matching: Vec<&LoadBalancingRule> =
            rules.iter().filter(|r| r.matches(execution)).map(|r| &r.rule).collect();
        matching.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.sequence.cmp(&b.sequence)));

        for rule in matching {
            let candidates: Vec<&Runner> = eligible
                .iter()
                .filter(|r| rule.runner_type.is_none_or(|t| t == r.runner_type()))
                .collect();
            if candidates.is_empty() {
                debug!(rule = %rule.name, "rule leaves no candidates, trying next");
                continue;
            }
            debug!(rule = %rule.name, execution_id = %execution.id, "applying load balancing rule");
            return pick(candidates, rule.rule_type, usage).cloned();
        }

        pick(eligible.iter().collect(), RuleType::RoundRobin, usage).cloned()
    }
}

fn pick<'a>(
    mut candidates: Vec<&'a Runner>,
    strategy: RuleType,
    usage: &HashMap<String, RunnerUsage>,
) -> Option<&'a Runner> {
    match strategy {
        RuleType::PriorityBased => {
            candidates.sort_by(|a, b| b.priority.cmp(&a.priority));
        }
        RuleType::ResourceBased => {
            let load = |r: &Runner| usage.get(&r.id).map(RunnerUsage::load_score).unwrap_or(0.0);
            candidates.sort_by(|a, b| load(*a).total_cmp(&load(*b)));
        }
        RuleType::RoundRobin | RuleType::Custom => {
            candidates.sort_by(|a, b| by_priority_then_jobs(a, b));
        }
    }
    candidates.first().copied()
}

fn by_priority_then_jobs(a: &Runner, b: &Runner) -> Ordering {
    b.priority
        .cmp(&a.priority)
        .then(a.current_jobs.cmp(&b.current_jobs))
}
