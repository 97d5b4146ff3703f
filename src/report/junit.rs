//! JUnit XML report generation.
//!
//! Generates JUnit XML format test reports, which are the de facto standard
//! for CI/CD systems. Each finished execution or parallel run becomes one
//! `<testsuite>`; the file is rewritten after every finish, so it always
//! holds everything finished so far.
//!
//! Runners report counts, not individual passing tests, so only failed tests
//! appear as `<testcase>` elements. A run that failed without naming any
//! failed test (a crash, a timeout, a stuck shard) gets one `<error>` case.
//!
//! # Format
//!
//! ```xml
//! <?xml version="1.0" encoding="UTF-8"?>
//! <testsuites tests="30" failures="1" errors="0" time="12.400">
//!   <testsuite name="e2e" id="p1" tests="30" failures="1" errors="0" skipped="0" time="12.400">
//!     <properties>
//!       <property name="environment" value="staging"/>
//!       <property name="status" value="failed"/>
//!     </properties>
//!     <testcase classname="tests.test_billing" name="test_refund">
//!       <failure message="assert 402 == 200" type="AssertionError"/>
//!     </testcase>
//!   </testsuite>
//! </testsuites>
//! ```
//!
//! # Example
//!
//! ```
//! use convoy::report::JUnitReporter;
//!
//! let reporter = JUnitReporter::new("test-results/junit.xml".into());
//! ```

use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;
use quick_xml::Writer;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, Event as XmlEvent};

use super::Reporter;
use crate::coordinator::aggregate::AggregatedResult;
use crate::events::Event;
use crate::model::{Execution, FailedTest, Shard, TestResults};

/// One `<testsuite>` element.
#[derive(Debug, Clone, PartialEq)]
struct SuiteRecord {
    id: String,
    name: String,
    environment: String,
    status: String,
    results: TestResults,
    /// `(case name, message)` for runs that failed without naming tests.
    errors: Vec<(String, String)>,
    time_secs: f64,
}

impl From<&Execution> for SuiteRecord {
    fn from(execution: &Execution) -> Self {
        let results = execution.results.clone().unwrap_or_default();
        let mut errors = Vec::new();
        if execution.status != crate::model::ExecutionStatus::Completed && results.failed_tests.is_empty() {
            let message = execution
                .error_message
                .clone()
                .unwrap_or_else(|| format!("execution {}", execution.status));
            errors.push((execution.test_suite.clone(), message));
        }
        let start = execution.started_at.or(execution.assigned_at).unwrap_or(execution.queued_at);
        let time_secs = execution
            .completed_at
            .map(|end| (end - start).num_milliseconds() as f64 / 1000.0)
            .unwrap_or_default();

        Self {
            id: execution.id.clone(),
            name: execution.test_suite.clone(),
            environment: execution.environment.clone(),
            status: execution.status.to_string(),
            results,
            errors,
            time_secs,
        }
    }
}

impl From<&AggregatedResult> for SuiteRecord {
    fn from(result: &AggregatedResult) -> Self {
        let errors = result
            .shard_errors
            .iter()
            .filter(|e| {
                !result
                    .totals
                    .failed_tests
                    .iter()
                    .any(|t| t.shard_index == Some(e.shard_index))
            })
            .map(|e| (format!("shard-{}", e.shard_index), e.message.clone()))
            .collect();

        Self {
            id: result.parent_id.clone(),
            name: result.test_suite.clone(),
            environment: result.environment.clone(),
            status: result.status.to_string(),
            results: result.totals.clone(),
            errors,
            time_secs: result.duration().num_milliseconds() as f64 / 1000.0,
        }
    }
}

/// Reporter that generates JUnit XML test reports.
///
/// Parent directories are created automatically if they don't exist.
pub struct JUnitReporter {
    output_path: PathBuf,
    suites: Mutex<Vec<SuiteRecord>>,
}

impl JUnitReporter {
    /// Creates a new JUnit reporter that writes to the given path.
    pub fn new(output_path: PathBuf) -> Self {
        Self {
            output_path,
            suites: Mutex::new(Vec::new()),
        }
    }

    fn record(&self, suite: SuiteRecord) {
        let xml = {
            let mut suites = self.suites.lock().unwrap_or_else(|e| e.into_inner());
            suites.push(suite);
            generate_xml(&suites)
        };

        match xml {
            Ok(xml) => {
                if let Some(parent) = self.output_path.parent()
                    && !parent.as_os_str().is_empty()
                    && !parent.exists()
                    && let Err(e) = std::fs::create_dir_all(parent)
                {
                    tracing::error!("Failed to create output directory: {}", e);
                    return;
                }

                if let Err(e) = std::fs::write(&self.output_path, xml) {
                    tracing::error!("Failed to write JUnit XML: {}", e);
                } else {
                    tracing::info!("JUnit XML written to: {}", self.output_path.display());
                }
            }
            Err(e) => {
                tracing::error!("Failed to generate JUnit XML: {}", e);
            }
        }
    }
}

#[async_trait]
impl Reporter for JUnitReporter {
    async fn on_execution_queued(&self, _execution: &Execution) {}

    async fn on_execution_assigned(&self, _execution: &Execution) {}

    async fn on_execution_finished(&self, execution: &Execution) {
        self.record(SuiteRecord::from(execution));
    }

    async fn on_parallel_started(&self, _parent_id: &str, _total_shards: u32) {}

    async fn on_shard_finished(&self, _shard: &Shard) {}

    async fn on_parallel_finished(&self, result: &AggregatedResult) {
        self.record(SuiteRecord::from(result));
    }

    async fn on_resource_event(&self, _event: &Event) {}
}

fn generate_xml(suites: &[SuiteRecord]) -> anyhow::Result<String> {
    let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
    writer.write_event(XmlEvent::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;

    let tests: u64 = suites.iter().map(|s| s.results.total.max(s.errors.len() as u64)).sum();
    let failures: u64 = suites.iter().map(|s| s.results.failed).sum();
    let errors: usize = suites.iter().map(|s| s.errors.len()).sum();
    let time: f64 = suites.iter().map(|s| s.time_secs).sum();

    let mut testsuites = BytesStart::new("testsuites");
    testsuites.push_attribute(("tests", tests.to_string().as_str()));
    testsuites.push_attribute(("failures", failures.to_string().as_str()));
    testsuites.push_attribute(("errors", errors.to_string().as_str()));
    testsuites.push_attribute(("time", format!("{:.3}", time).as_str()));
    writer.write_event(XmlEvent::Start(testsuites))?;

    for suite in suites {
        write_testsuite(&mut writer, suite)?;
    }

    writer.write_event(XmlEvent::End(BytesEnd::new("testsuites")))?;
    Ok(String::from_utf8(writer.into_inner())?)
}

fn write_testsuite<W: std::io::Write>(writer: &mut Writer<W>, suite: &SuiteRecord) -> anyhow::Result<()> {
    let results = &suite.results;
    let mut testsuite = BytesStart::new("testsuite");
    testsuite.push_attribute(("name", sanitize(&suite.name).as_str()));
    testsuite.push_attribute(("id", suite.id.as_str()));
    testsuite.push_attribute(("tests", results.total.max(suite.errors.len() as u64).to_string().as_str()));
    testsuite.push_attribute(("failures", results.failed.to_string().as_str()));
    testsuite.push_attribute(("errors", suite.errors.len().to_string().as_str()));
    testsuite.push_attribute(("skipped", results.skipped.to_string().as_str()));
    testsuite.push_attribute(("time", format!("{:.3}", suite.time_secs).as_str()));
    writer.write_event(XmlEvent::Start(testsuite))?;

    writer.write_event(XmlEvent::Start(BytesStart::new("properties")))?;
    for (name, value) in [("environment", &suite.environment), ("status", &suite.status)] {
        let mut property = BytesStart::new("property");
        property.push_attribute(("name", name));
        property.push_attribute(("value", sanitize(value).as_str()));
        writer.write_event(XmlEvent::Empty(property))?;
    }
    writer.write_event(XmlEvent::End(BytesEnd::new("properties")))?;

    for test in &results.failed_tests {
        write_failed_test(writer, &suite.name, test)?;
    }
    for (name, message) in &suite.errors {
        let mut testcase = BytesStart::new("testcase");
        testcase.push_attribute(("classname", sanitize(&suite.name).as_str()));
        testcase.push_attribute(("name", sanitize(name).as_str()));
        writer.write_event(XmlEvent::Start(testcase))?;

        let mut error = BytesStart::new("error");
        error.push_attribute(("message", sanitize(message).as_str()));
        error.push_attribute(("type", "Error"));
        writer.write_event(XmlEvent::Empty(error))?;

        writer.write_event(XmlEvent::End(BytesEnd::new("testcase")))?;
    }

    writer.write_event(XmlEvent::End(BytesEnd::new("testsuite")))?;
    Ok(())
}

fn write_failed_test<W: std::io::Write>(writer: &mut Writer<W>, suite: &str, test: &FailedTest) -> anyhow::Result<()> {
    let (classname, name) = parse_test_id(&test.name, suite);

    let mut testcase = BytesStart::new("testcase");
    testcase.push_attribute(("classname", sanitize(&classname).as_str()));
    testcase.push_attribute(("name", sanitize(&name).as_str()));
    if let Some(index) = test.shard_index {
        testcase.push_attribute(("shard", index.to_string().as_str()));
    }
    writer.write_event(XmlEvent::Start(testcase))?;

    let mut failure = BytesStart::new("failure");
    if let Some(message) = &test.message {
        failure.push_attribute(("message", sanitize(message).as_str()));
    }
    failure.push_attribute(("type", "AssertionError"));
    writer.write_event(XmlEvent::Empty(failure))?;

    writer.write_event(XmlEvent::End(BytesEnd::new("testcase")))?;
    Ok(())
}

/// Splits a test id into classname and name. Ids without a `::` separator
/// are filed under the suite.
fn parse_test_id(id: &str, suite: &str) -> (String, String) {
    // tests/test_foo.py::TestClass::test_method
    // tests::module::test_name
    if let Some(idx) = id.rfind("::") {
        let classname = id[..idx]
            .replace("::", ".")
            .replace('/', ".")
            .replace(".py", "")
            .replace(".rs", "");
        (classname, id[idx + 2..].to_string())
    } else {
        (suite.to_string(), id.to_string())
    }
}

/// Drops characters XML 1.0 can't carry. Escaping is left to the writer.
fn sanitize(s: &str) -> String {
    s.chars()
        .filter(|c| matches!(c, '\t' | '\n' | '\r' | ' '..='\u{D7FF}' | '\u{E000}'..='\u{FFFD}'))
        .collect()
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::coordinator::aggregate::{ParallelStatus, ShardError};
    use crate::model::ExecutionStatus;
    use crate::test_support::execution;

    fn finished(status: ExecutionStatus, results: Option<TestResults>, error: Option<&str>) -> Execution {
        let mut exec = execution("api", 50);
        exec.status = status;
        exec.results = results;
        exec.error_message = error.map(str::to_string);
        exec.started_at = Some(exec.queued_at);
        exec.completed_at = Some(exec.queued_at + chrono::Duration::milliseconds(1500));
        exec
    }

    #[test]
    fn test_parse_test_id() {
        assert_eq!(
            parse_test_id("tests/test_foo.py::TestClass::test_method", "api"),
            ("tests.test_foo.TestClass".to_string(), "test_method".to_string())
        );
        assert_eq!(
            parse_test_id("tests::module::test_name", "api"),
            ("tests.module".to_string(), "test_name".to_string())
        );
        assert_eq!(
            parse_test_id("simple_test", "api"),
            ("api".to_string(), "simple_test".to_string())
        );
    }

    #[test]
    fn test_failed_tests_become_failure_cases() {
        let results = TestResults {
            total: 4,
            passed: 3,
            failed: 1,
            skipped: 0,
            failed_tests: vec![FailedTest {
                name: "tests/test_auth.py::test_login".into(),
                message: Some("expected <200>".into()),
                shard_index: None,
            }],
        };
        let exec = finished(ExecutionStatus::Failed, Some(results), Some("1 failed"));
        let xml = generate_xml(&[SuiteRecord::from(&exec)]).unwrap();

        assert!(xml.contains(r#"<testsuite name="api""#));
        assert!(xml.contains(r#"tests="4" failures="1" errors="0""#));
        assert!(xml.contains(r#"time="1.500""#));
        assert!(xml.contains(r#"classname="tests.test_auth" name="test_login""#));
        assert!(xml.contains(r#"message="expected &lt;200&gt;""#));
        assert!(xml.contains(r#"<property name="status" value="failed"/>"#));
    }

    #[test]
    fn test_timeout_without_results_is_an_error_case() {
        let exec = finished(ExecutionStatus::Timeout, None, None);
        let xml = generate_xml(&[SuiteRecord::from(&exec)]).unwrap();
        assert!(xml.contains(r#"errors="1""#));
        assert!(xml.contains(r#"<error message="execution timeout" type="Error"/>"#));
    }

    #[test]
    fn test_shard_errors_without_named_failures() {
        let now = Utc::now();
        let result = AggregatedResult {
            parent_id: "p1".into(),
            test_suite: "e2e".into(),
            environment: "staging".into(),
            status: ParallelStatus::Failed,
            total_shards: 2,
            completed_shards: 1,
            failed_shards: 1,
            totals: TestResults {
                total: 5,
                passed: 5,
                ..Default::default()
            },
            shard_errors: vec![ShardError {
                shard_index: 1,
                message: "stuck: no shard progress for 600s".into(),
            }],
            started_at: now,
            finished_at: now,
        };
        let record = SuiteRecord::from(&result);
        assert_eq!(record.errors, vec![("shard-1".to_string(), "stuck: no shard progress for 600s".to_string())]);
        let xml = generate_xml(&[record]).unwrap();
        assert!(xml.contains(r#"id="p1""#));
    }

    #[tokio::test]
    async fn test_reporter_writes_every_finished_run() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("junit.xml");
        let reporter = JUnitReporter::new(path.clone());

        reporter
            .on_execution_finished(&finished(ExecutionStatus::Completed, None, None))
            .await;
        reporter
            .on_execution_finished(&finished(ExecutionStatus::Failed, None, Some("exit 1")))
            .await;

        let xml = std::fs::read_to_string(&path).unwrap();
        assert_eq!(xml.matches("<testsuite ").count(), 2);
        assert!(xml.contains(r#"<error message="exit 1" type="Error"/>"#));
    }
}
