//! Parser for the STOS problem script (`script.txt`).
//!
//! The script is line-oriented: each non-empty, non-comment line is a command
//! followed by whitespace-separated arguments. `TST n` opens a test block;
//! the `T*` and `J*` commands that follow modify that test until the next
//! `TST`. `AH`/`AS` declare auxiliary files staged for compilation, and the
//! `C*` family carries compilation directives that the compile image
//! interprets on its own.

use std::collections::BTreeMap;

use err_derive::Error;
use serde::{Deserialize, Serialize};
use tracing::warn;

pub const DEFAULT_TIME_LIMIT: f64 = 2.0;
pub const DEFAULT_MEMORY_LIMIT: u64 = 256 * 1024 * 1024;

/// Resource envelope and judge configuration of a single test.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestSpec {
    pub test_name: String,
    /// CPU time limit in seconds, always positive.
    pub time_limit: f64,
    /// Memory limit in bytes, always positive.
    pub total_memory_limit: u64,
    pub stack_size_limit: Option<u64>,
    #[serde(default)]
    pub judge: JudgeConfig,
}

impl TestSpec {
    /// A test with default limits and judge configuration.
    pub fn named(test_name: impl Into<String>) -> TestSpec {
        TestSpec {
            test_name: test_name.into(),
            time_limit: DEFAULT_TIME_LIMIT,
            total_memory_limit: DEFAULT_MEMORY_LIMIT,
            stack_size_limit: None,
            judge: JudgeConfig::default(),
        }
    }
}

/// How the judge container should compare a test's output.
///
/// The worker records the configuration verbatim and hands it to the judge
/// image; tolerance semantics live there.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JudgeKind {
    #[default]
    Exact,
    Numeric,
    Unordered,
    UnorderedNumeric,
}

impl JudgeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JudgeKind::Exact => "exact",
            JudgeKind::Numeric => "numeric",
            JudgeKind::Unordered => "unordered",
            JudgeKind::UnorderedNumeric => "unordered_numeric",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct JudgeConfig {
    pub kind: JudgeKind,
    /// Raw arguments after the judge command, e.g. a numeric tolerance.
    pub args: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuxKind {
    Header,
    Source,
}

/// An auxiliary file to stage next to the student sources before compiling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuxFile {
    pub name: String,
    pub kind: AuxKind,
}

/// A problem as consumed by the evaluator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProblemSpec {
    pub id: String,
    /// Tests in evaluation order (ascending script index).
    pub tests: Vec<TestSpec>,
    #[serde(default)]
    pub aux_files: Vec<AuxFile>,
    /// Raw `C`/`CU`/`CO` lines, for the compile image.
    #[serde(default)]
    pub compile_directives: Vec<String>,
}

impl ProblemSpec {
    pub fn empty(id: impl Into<String>) -> ProblemSpec {
        ProblemSpec {
            id: id.into(),
            tests: Vec::new(),
            aux_files: Vec::new(),
            compile_directives: Vec::new(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ScriptError {
    #[error(display = "line {}: `{}` expects a numeric argument, got `{}`", line, command, value)]
    BadNumber {
        line: usize,
        command: String,
        value: String,
    },

    #[error(display = "line {}: `{}` requires an argument", line, command)]
    MissingArgument { line: usize, command: String },

    #[error(display = "line {}: `{}` must set a positive limit", line, command)]
    NonPositiveLimit { line: usize, command: String },

    #[error(display = "line {}: `{}` appears outside of a `TST` block", line, command)]
    NoCurrentTest { line: usize, command: String },
}

/// Parses a problem script into a normalized [`ProblemSpec`].
///
/// Unknown commands are ignored with a warning; malformed numbers fail the
/// whole parse. Test indices need not be contiguous: the result is sorted
/// ascending by index, and a repeated index replaces the earlier block.
pub fn parse_script(script: &str, problem_id: &str) -> Result<ProblemSpec, ScriptError> {
    let mut tests: BTreeMap<u64, TestSpec> = BTreeMap::new();
    let mut aux_files = Vec::new();
    let mut compile_directives = Vec::new();
    let mut current: Option<u64> = None;

    for (idx, raw_line) in script.lines().enumerate() {
        let line_no = idx + 1;
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut tokens = line.split_whitespace();
        let command = tokens.next().expect("non-empty line has a first token");
        let args: Vec<&str> = tokens.collect();

        match command {
            "C" | "CU" | "CO" => compile_directives.push(line.to_string()),
            "TST" => {
                let index = parse_number::<u64>(line_no, command, args.first().copied())?;
                if tests.contains_key(&index) {
                    warn!(line = line_no, index, "duplicate test index, later block wins");
                }
                tests.insert(index, TestSpec::named(index.to_string()));
                current = Some(index);
            }
            "T" => {
                let limit = parse_number::<f64>(line_no, command, args.first().copied())?;
                if !(limit > 0.0) {
                    return Err(ScriptError::NonPositiveLimit {
                        line: line_no,
                        command: command.into(),
                    });
                }
                current_test(&mut tests, current, line_no, command)?.time_limit = limit;
            }
            "TN" => {
                let limit = parse_number::<u64>(line_no, command, args.first().copied())?;
                if limit == 0 {
                    return Err(ScriptError::NonPositiveLimit {
                        line: line_no,
                        command: command.into(),
                    });
                }
                current_test(&mut tests, current, line_no, command)?.total_memory_limit = limit;
            }
            "TS" => {
                let limit = parse_number::<u64>(line_no, command, args.first().copied())?;
                current_test(&mut tests, current, line_no, command)?.stack_size_limit = Some(limit);
            }
            "J" | "JN" | "JUB" | "JUN" => {
                let kind = match command {
                    "J" => JudgeKind::Exact,
                    "JN" => JudgeKind::Numeric,
                    "JUB" => JudgeKind::Unordered,
                    _ => JudgeKind::UnorderedNumeric,
                };
                current_test(&mut tests, current, line_no, command)?.judge = JudgeConfig {
                    kind,
                    args: args.iter().map(|s| s.to_string()).collect(),
                };
            }
            "AH" | "ADDHDR" => aux_files.push(AuxFile {
                name: required_arg(line_no, command, args.first().copied())?,
                kind: AuxKind::Header,
            }),
            "AS" | "ADDSRC" => aux_files.push(AuxFile {
                name: required_arg(line_no, command, args.first().copied())?,
                kind: AuxKind::Source,
            }),
            unknown => {
                warn!(line = line_no, command = unknown, "ignoring unknown script command");
            }
        }
    }

    Ok(ProblemSpec {
        id: problem_id.to_string(),
        tests: tests.into_values().collect(),
        aux_files,
        compile_directives,
    })
}

fn parse_number<T: std::str::FromStr>(
    line: usize,
    command: &str,
    arg: Option<&str>,
) -> Result<T, ScriptError> {
    let value = arg.ok_or_else(|| ScriptError::MissingArgument {
        line,
        command: command.into(),
    })?;
    value.parse().map_err(|_| ScriptError::BadNumber {
        line,
        command: command.into(),
        value: value.into(),
    })
}

fn required_arg(line: usize, command: &str, arg: Option<&str>) -> Result<String, ScriptError> {
    arg.map(str::to_string).ok_or_else(|| ScriptError::MissingArgument {
        line,
        command: command.into(),
    })
}

fn current_test<'a>(
    tests: &'a mut BTreeMap<u64, TestSpec>,
    current: Option<u64>,
    line: usize,
    command: &str,
) -> Result<&'a mut TestSpec, ScriptError> {
    let index = current.ok_or_else(|| ScriptError::NoCurrentTest {
        line,
        command: command.into(),
    })?;
    Ok(tests
        .get_mut(&index)
        .expect("current test index always present in map"))
}
