//! Typed messages exchanged with the UI.

use std::path::PathBuf;

use reqwest::header::HeaderMap;

use super::err::ClientError;
use crate::script::ProblemSpec;

pub const SUBMISSION_ID_HEADER: &str = "X-Server-Id";
pub const PARAM_HEADER: &str = "X-Param";

/// Result of one queue poll.
#[derive(Debug)]
pub enum PollResult {
    /// Queue empty (HTTP 404).
    Empty,
    Hit(QueueHit),
}

#[derive(Debug, Clone)]
pub struct QueueHit {
    pub submission_id: String,
    pub problem_id: String,
    pub student_id: String,
    /// Where the submission archive was saved.
    pub archive_path: PathBuf,
}

/// One unit of work, as assembled by the adapter.
#[derive(Debug, Clone)]
pub struct Submission {
    pub id: String,
    /// Image used for the compile stage of this submission's language.
    pub comp_image: String,
    /// Entry-point file, when the language requires one.
    pub mainfile: Option<String>,
    pub submitted_by: Option<String>,
    pub problem_specification: ProblemSpec,
}

/// The three text payloads the UI consumes for one verdict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UiResultPayload {
    pub result: String,
    pub info: String,
    pub debug: String,
}

/// Extracts `(submission_id, problem_id, student_id)` from a queue hit's
/// response headers.
pub(super) fn parse_poll_headers(headers: &HeaderMap) -> Result<(String, String, String), ClientError> {
    let submission_id = header_str(headers, SUBMISSION_ID_HEADER)?;
    let param = header_str(headers, PARAM_HEADER)?;
    let (problem_id, student_id) = param.split_once(';').ok_or_else(|| {
        ClientError::protocol(format!("malformed {} header: `{}`", PARAM_HEADER, param))
    })?;
    if problem_id.is_empty() {
        return Err(ClientError::protocol(format!(
            "empty problem id in {} header",
            PARAM_HEADER
        )));
    }
    Ok((
        submission_id.to_string(),
        problem_id.to_string(),
        student_id.to_string(),
    ))
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Result<&'a str, ClientError> {
    headers
        .get(name)
        .ok_or_else(|| ClientError::protocol(format!("missing {} header", name)))?
        .to_str()
        .map_err(|_| ClientError::protocol(format!("non-text {} header", name)))
}
