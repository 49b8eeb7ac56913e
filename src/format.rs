//! Formatting a submission result into the three UI payloads.
//!
//! The UI expects `result` (machine-readable key/value lines), `info` (an
//! HTML verdict table plus the compiler output) and `debug` (the worker log
//! as HTML). ANSI colors in the captured text are translated to inline HTML
//! spans; see [`crate::util::ansi`].

use std::fmt::Write;

use itertools::Itertools;

use crate::client::UiResultPayload;
use crate::tester::{SubmissionResult, TestResult, Verdict};
use crate::util::ansi::{ansi_to_html, escape_html};
use crate::util::size::size_to_string;

const TABLE_STYLE: &str = "
<style>
    table {
        border-collapse: collapse;
        border: 1px solid #202020;
        border-radius: 5px;
        overflow: hidden;
    }
    th {
        border: 1px solid #202020;
        padding: 3px 10px;
        background-color: #d8d8d8;
        max-width: 350px;
        text-align: center;
    }
    td {
        border-left: 1px solid #202020;
        border-right: 1px solid #202020;
        padding: 3px 10px;
        max-width: 350px;
        white-space: nowrap;
        overflow: hidden;
        text-align: right;
    }
    tbody tr:nth-child(even) { filter: brightness(90%); }
    .success { background-color: #6fb65d; }
    .failure { background-color: #b65d62; }
    .eerror { background-color: #e69c53; }
</style>
";

/// Produces all three payloads for one result.
pub fn format_payload(result: &SubmissionResult) -> UiResultPayload {
    UiResultPayload {
        result: format_result(result),
        info: format_info(result),
        debug: format_debug(result),
    }
}

/// The machine-readable `result` payload, exactly four lines.
fn format_result(result: &SubmissionResult) -> String {
    format!(
        "result={:.1}\ninfoformat=html\ndebugformat=html\ninfo={}\n",
        result.score_percent(),
        summary_line(result)
    )
}

/// One-line summary derived from the first failing test, if any.
fn summary_line(result: &SubmissionResult) -> String {
    match result.first_failure() {
        None if result.test_results.is_empty() => "No tests executed".to_string(),
        None => "All tests passed".to_string(),
        Some(failure) => match failure.verdict() {
            Some(Verdict::CompileError) => "Compilation error".to_string(),
            Some(verdict) => format!("{} on test {}", verdict.describe(), failure.test_name),
            None => format!("failed on test {}", failure.test_name),
        },
    }
}

/// The human-readable `info` payload: verdict table plus compiler output.
fn format_info(result: &SubmissionResult) -> String {
    let mut html = String::from(TABLE_STYLE);
    write!(html, "<b>Score:</b> {:.2}%\n<br>\n<br>\n", result.score_percent()).unwrap();

    if !result.test_results.is_empty() {
        let rows = result.test_results.iter().map(format_row).join("\n        ");
        write!(
            html,
            "\n<div style=\"background-color: #202020; border-radius: 5px; width: fit-content;\">\n    \
             <table>\n        <tr>\n            <th>Name</th>\n            <th>Verdict</th>\n            \
             <th>Time [s]</th>\n            <th>Memory</th>\n            <th>Code</th>\n        </tr>\n        \
             {}\n    </table>\n</div>\n",
            rows
        )
        .unwrap();
    }

    if let Some(info) = &result.info {
        write!(
            html,
            "<pre style='font-family: monospace;'>{}</pre>",
            ansi_to_html(info)
        )
        .unwrap();
    }
    html
}

fn format_row(test: &TestResult) -> String {
    let class = match (test.grade, test.verdict()) {
        (true, _) => "success",
        (false, Some(Verdict::SandboxError)) | (false, Some(Verdict::CompileError)) => "eerror",
        _ => "failure",
    };
    let verdict = test.info.as_deref().unwrap_or("");
    let time = test.time.map(|t| format!("{:.2}", t)).unwrap_or_default();
    let memory = test
        .memory
        .and_then(size_to_string)
        .unwrap_or_default();
    let code = test
        .ret_code
        .filter(|c| *c >= 0)
        .map(|c| c.to_string())
        .unwrap_or_default();
    format!(
        "<tr class='{}'><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td></tr>",
        class,
        escape_html(&test.test_name),
        escape_html(verdict),
        time,
        memory,
        code,
    )
}

/// The `debug` payload: the captured worker log as HTML.
fn format_debug(result: &SubmissionResult) -> String {
    match &result.debug {
        Some(debug) => format!(
            "<pre style='font-family: monospace;'>{}</pre>",
            ansi_to_html(debug)
        ),
        None => String::new(),
    }
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
            time: Some(0.25),
            memory: Some(2048.0),
            info: Some("OK".into()),
        }
    }

    #[test]
    fn result_payload_has_exactly_the_contract_lines() {
        let result = SubmissionResult {
            points: 2,
            info: None,
            debug: None,
            test_results: vec![passed("1"), passed("2")],
        };
        assert_eq!(
            format_result(&result),
            "result=100.0\ninfoformat=html\ndebugformat=html\ninfo=All tests passed\n"
        );
    }

    #[test]
    fn zero_tests_score_zero() {
        let result = SubmissionResult::default();
        assert!(format_result(&result).starts_with("result=0.0\n"));
    }

    #[test]
    fn summary_names_the_first_failing_test() {
        let result = SubmissionResult {
            points: 1,
            info: None,
            debug: None,
            test_results: vec![
                passed("1"),
                TestResult::failed("2", Verdict::TimeLimitExceeded),
                TestResult::failed("3", Verdict::WrongAnswer),
            ],
        };
        assert_eq!(summary_line(&result), "time limit exceeded on test 2");
    }

    #[test]
    fn compile_errors_summarize_without_a_test_name() {
        let spec = crate::script::parse_script("TST 1\n", "p").unwrap();
        let result = SubmissionResult::compile_error(&spec, Some("boom".into()));
        assert_eq!(summary_line(&result), "Compilation error");
    }

    #[test]
    fn info_table_colors_rows_by_verdict() {
        let result = SubmissionResult {
            points: 1,
            info: Some("gcc finished".into()),
            debug: None,
            test_results: vec![
                passed("1"),
                TestResult::failed("2", Verdict::WrongAnswer),
                TestResult::failed("3", Verdict::SandboxError),
            ],
        };
        let html = format_info(&result);
        assert!(html.contains("<tr class='success'><td>1</td><td>OK</td>"));
        assert!(html.contains("<tr class='failure'><td>2</td><td>WA</td>"));
        assert!(html.contains("<tr class='eerror'><td>3</td><td>SE</td>"));
        assert!(html.contains("gcc finished"));
        assert!(html.contains("<b>Score:</b> 33.33%"));
    }

    #[test]
    fn test_names_are_html_escaped() {
        let mut t = passed("<x>");
        t.info = Some("OK".into());
        let result = SubmissionResult {
            points: 1,
            info: None,
            debug: None,
            test_results: vec![t],
        };
        assert!(format_info(&result).contains("<td>&lt;x&gt;</td>"));
    }

    #[test]
    fn debug_payload_translates_ansi() {
        let result = SubmissionResult {
            debug: Some("\x1b[31mERROR\x1b[0m failed".into()),
            ..Default::default()
        };
        let html = format_debug(&result);
        assert!(html.starts_with("<pre"));
        assert!(html.contains("<span style=\"color:#cd0000;\">ERROR</span>"));
        assert_eq!(format_debug(&SubmissionResult::default()), "");
    }
}
