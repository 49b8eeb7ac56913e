//! Verdicts and aggregate results for one submission.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::script::ProblemSpec;
use crate::util::size::size_to_string;

pub mod exec;

pub use exec::{Evaluation, Evaluator};

/// Per-test verdict classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Verdict {
    Ok,
    CompileError,
    WrongAnswer,
    TimeLimitExceeded,
    MemoryLimitExceeded,
    RuntimeError,
    SandboxError,
    OutputLimitExceeded,
}

impl Verdict {
    pub fn code(&self) -> &'static str {
        match self {
            Verdict::Ok => "OK",
            Verdict::CompileError => "CE",
            Verdict::WrongAnswer => "WA",
            Verdict::TimeLimitExceeded => "TLE",
            Verdict::MemoryLimitExceeded => "MLE",
            Verdict::RuntimeError => "RE",
            Verdict::SandboxError => "SE",
            Verdict::OutputLimitExceeded => "OLE",
        }
    }

    pub fn describe(&self) -> &'static str {
        match self {
            Verdict::Ok => "passed",
            Verdict::CompileError => "compilation error",
            Verdict::WrongAnswer => "wrong answer",
            Verdict::TimeLimitExceeded => "time limit exceeded",
            Verdict::MemoryLimitExceeded => "memory limit exceeded",
            Verdict::RuntimeError => "runtime error",
            Verdict::SandboxError => "sandbox error",
            Verdict::OutputLimitExceeded => "output limit exceeded",
        }
    }

    pub fn from_code(code: &str) -> Option<Verdict> {
        Some(match code {
            "OK" => Verdict::Ok,
            "CE" => Verdict::CompileError,
            "WA" => Verdict::WrongAnswer,
            "TLE" => Verdict::TimeLimitExceeded,
            "MLE" => Verdict::MemoryLimitExceeded,
            "RE" => Verdict::RuntimeError,
            "SE" => Verdict::SandboxError,
            "OLE" => Verdict::OutputLimitExceeded,
            _ => return None,
        })
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Outcome of one test.
#[derive(Debug, Clone, PartialEq)]
pub struct TestResult {
    pub test_name: String,
    pub grade: bool,
    pub ret_code: Option<i64>,
    /// CPU seconds.
    pub time: Option<f64>,
    /// Peak memory in bytes.
    pub memory: Option<f64>,
    /// Verdict classifier; always present when `grade` is false.
    pub info: Option<String>,
}

impl TestResult {
    pub fn failed(test_name: impl Into<String>, verdict: Verdict) -> TestResult {
        TestResult {
            test_name: test_name.into(),
            grade: false,
            ret_code: None,
            time: None,
            memory: None,
            info: Some(verdict.code().to_string()),
        }
    }

    pub fn verdict(&self) -> Option<Verdict> {
        self.info.as_deref().and_then(Verdict::from_code)
    }
}

/// Aggregate result of one submission.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SubmissionResult {
    pub points: i64,
    /// Diagnostic shown next to the result table, typically compiler output.
    pub info: Option<String>,
    /// Verbose worker log for the `debug` payload.
    pub debug: Option<String>,
    pub test_results: Vec<TestResult>,
}

impl SubmissionResult {
    /// Zero-point result with every test marked `CE`.
    pub fn compile_error(spec: &ProblemSpec, info: Option<String>) -> SubmissionResult {
        SubmissionResult {
            points: 0,
            info,
            debug: None,
            test_results: spec
                .tests
                .iter()
                .map(|t| TestResult::failed(&t.test_name, Verdict::CompileError))
                .collect(),
        }
    }

    pub fn score_percent(&self) -> f64 {
        if self.test_results.is_empty() {
            0.0
        } else {
            100.0 * self.points as f64 / self.test_results.len() as f64
        }
    }

    pub fn first_failure(&self) -> Option<&TestResult> {
        self.test_results.iter().find(|t| !t.grade)
    }

    /// A result worth keeping around in debug mode: anything the student
    /// cannot have caused alone.
    pub fn anomalous(&self) -> bool {
        self.test_results.iter().any(|t| {
            matches!(
                t.verdict(),
                Some(Verdict::SandboxError) | Some(Verdict::CompileError)
            )
        })
    }
}

impl fmt::Display for SubmissionResult {
    /// ANSI table for the submission log.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.test_results.is_empty() {
            writeln!(f, "+-----------------------+")?;
            writeln!(f, "|   compilation error   |")?;
            write!(f, "+-----------------------+")?;
        } else {
            writeln!(f, "+------+------+------------+-----+-----+")?;
            writeln!(f, "| name | time |   memory   | ret | res |")?;
            writeln!(f, "+------+------+------------+-----+-----+")?;
            for test in &self.test_results {
                let color = match (test.grade, test.verdict()) {
                    (true, _) => 65,
                    (false, Some(Verdict::SandboxError)) => 173,
                    _ => 131,
                };
                let memory = size_to_string(test.memory.unwrap_or(0.0))
                    .unwrap_or_else(|| "?".into());
                writeln!(
                    f,
                    "|\x1b[48;5;{}m\x1b[38;5;232m {:>4} | {:.2} | {:>10} | {:>3} \x1b[0m| {:>3} |",
                    color,
                    test.test_name,
                    test.time.unwrap_or(0.0),
                    memory,
                    test.ret_code.unwrap_or(-1),
                    test.info.as_deref().unwrap_or(""),
                )?;
            }
            writeln!(f, "+------+------+------------+-----+-----+")?;
            writeln!(f, "| {} |", center(&format!("points: {}", self.points), 37))?;
            write!(f, "+---------------------------------------+")?;
        }
        Ok(())
    }
}

fn center(text: &str, width: usize) -> String {
    if text.len() >= width {
        return text.to_string();
    }
    let left = (width - text.len()) / 2;
    let right = width - text.len() - left;
    format!("{}{}{}", " ".repeat(left), text, " ".repeat(right))
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    fn passed(name: &str) -> TestResult {
        TestResult {
            test_name: name.into(),
            grade: true,
            ret_code: Some(0),
            time: Some(0.1),
            memory: Some(1024.0),
            info: Some("OK".into()),
        }
    }

    #[test]
    fn points_count_passed_tests() {
        let result = SubmissionResult {
            points: 2,
            info: None,
            debug: None,
            test_results: vec![
                passed("1"),
                TestResult::failed("2", Verdict::WrongAnswer),
                passed("3"),
            ],
        };
        assert_eq!(
            result.points,
            result.test_results.iter().filter(|t| t.grade).count() as i64
        );
        assert!((result.score_percent() - 200.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn empty_result_scores_zero() {
        assert_eq!(SubmissionResult::default().score_percent(), 0.0);
    }

    #[test]
    fn compile_error_marks_every_test() {
        let spec = crate::script::parse_script("TST 1\nTST 2\n", "p").unwrap();
        let result = SubmissionResult::compile_error(&spec, Some("gcc: nope".into()));
        assert_eq!(result.points, 0);
        assert_eq!(result.test_results.len(), 2);
        assert!(result
            .test_results
            .iter()
            .all(|t| !t.grade && t.info.as_deref() == Some("CE")));
        assert!(result.anomalous());
    }

    #[test]
    fn failed_tests_carry_a_classifier() {
        let t = TestResult::failed("9", Verdict::TimeLimitExceeded);
        assert!(!t.grade);
        assert_eq!(t.info.as_deref(), Some("TLE"));
        assert_eq!(t.verdict(), Some(Verdict::TimeLimitExceeded));
    }

    #[test]
    fn display_renders_a_table() {
        let result = SubmissionResult {
            points: 1,
            info: None,
            debug: None,
            test_results: vec![passed("1")],
        };
        let table = result.to_string();
        assert!(table.contains("points: 1"));
        assert!(table.contains("\x1b[48;5;65m"));
    }
}
