//! HTTP client against the UI.
//!
//! Four operations: queue polling, problem file listing, file download and
//! result reporting, plus best-effort status notifications. Every call
//! carries the two-phase `(connect, read)` timeout from the configuration.
//! The client never retries on its own.

pub mod err;
pub mod model;

pub use err::ClientError;
pub use model::{PollResult, QueueHit, Submission, UiResultPayload};

use std::path::Path;
use std::time::Duration;

use reqwest::StatusCode;
use tokio::io::AsyncWriteExt;
use tokio_stream::StreamExt;
use tracing::debug;

use crate::config::WorkerConfig;

pub struct UiClient {
    http: reqwest::Client,
    base: String,
    max_file_bytes: u64,
}

impl UiClient {
    pub fn new(cfg: &WorkerConfig) -> Result<UiClient, ClientError> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs_f64(cfg.http_connect_timeout))
            .read_timeout(Duration::from_secs_f64(cfg.http_read_timeout))
            .build()?;
        Ok(UiClient {
            http,
            base: cfg.gui_base().to_string(),
            max_file_bytes: cfg.max_file_bytes,
        })
    }

    fn queue_endpoint(&self, queue: &str) -> String {
        format!("{}/queue/{}/submission", self.base, queue)
    }

    fn problem_list_endpoint(&self, problem_id: &str) -> String {
        format!("{}/filesystem/problem/{}", self.base, problem_id)
    }

    fn problem_file_endpoint(&self, problem_id: &str, name: &str) -> String {
        format!("{}/filesystem/problem/{}/{}", self.base, problem_id, name)
    }

    fn result_endpoint(&self, submission_id: &str) -> String {
        format!("{}/result/{}", self.base, submission_id)
    }

    fn status_endpoint(&self, submission_id: &str) -> String {
        format!("{}/status/{}", self.base, submission_id)
    }

    /// Performs one poll against `queue`, streaming a hit's archive to
    /// `dest`. HTTP 404 means the queue is empty.
    pub async fn poll_queue(&self, queue: &str, dest: &Path) -> Result<PollResult, ClientError> {
        let resp = self.http.get(self.queue_endpoint(queue)).send().await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(PollResult::Empty);
        }
        let resp = resp.error_for_status()?;

        let (submission_id, problem_id, student_id) = model::parse_poll_headers(resp.headers())?;
        let size = self.stream_to_file(resp, dest).await?;
        debug!(queue, submission_id, size, "queue hit downloaded");

        Ok(PollResult::Hit(QueueHit {
            submission_id,
            problem_id,
            student_id,
            archive_path: dest.to_path_buf(),
        }))
    }

    /// Lists the files of a problem. Each response line names one file;
    /// anything after a `:` on the line is listing metadata and dropped.
    pub async fn list_problem_files(&self, problem_id: &str) -> Result<Vec<String>, ClientError> {
        let body = self
            .http
            .get(self.problem_list_endpoint(problem_id))
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        Ok(body
            .lines()
            .filter_map(|line| {
                let name = line.split(':').next().unwrap_or(line).trim();
                (!name.is_empty()).then(|| name.to_string())
            })
            .collect())
    }

    pub async fn get_problem_file(
        &self,
        problem_id: &str,
        name: &str,
        dest: &Path,
    ) -> Result<(), ClientError> {
        let resp = self
            .http
            .get(self.problem_file_endpoint(problem_id, name))
            .send()
            .await?
            .error_for_status()?;
        let size = self.stream_to_file(resp, dest).await?;
        debug!(problem_id, name, size, "problem file downloaded");
        Ok(())
    }

    /// Reports a verdict. Returns the UI's response body, which callers are
    /// free to ignore.
    pub async fn post_result(
        &self,
        submission_id: &str,
        payload: &UiResultPayload,
    ) -> Result<String, ClientError> {
        let resp = self
            .http
            .post(self.result_endpoint(submission_id))
            .form(&[
                ("result", payload.result.as_str()),
                ("info", payload.info.as_str()),
                ("debug", payload.debug.as_str()),
            ])
            .send()
            .await?
            .error_for_status()?;
        Ok(resp.text().await?)
    }

    /// Posts a progress message for a submission. Best-effort: callers log
    /// failures and move on.
    pub async fn post_status(&self, submission_id: &str, message: &str) -> Result<(), ClientError> {
        self.http
            .post(self.status_endpoint(submission_id))
            .form(&[("info", message)])
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    /// Streams a response body into `dest`, enforcing the download cap both
    /// on the declared length and on the actual byte count. A body exactly
    /// at the cap passes; one byte more fails.
    async fn stream_to_file(&self, resp: reqwest::Response, dest: &Path) -> Result<u64, ClientError> {
        if let Some(declared) = resp.content_length() {
            if declared > self.max_file_bytes {
                return Err(ClientError::TooLarge(self.max_file_bytes));
            }
        }
        let mut file = tokio::fs::File::create(dest).await?;
        let mut body = resp.bytes_stream();
        let mut downloaded: u64 = 0;
        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            downloaded += chunk.len() as u64;
            if downloaded > self.max_file_bytes {
                drop(file);
                let _ = tokio::fs::remove_file(dest).await;
                return Err(ClientError::TooLarge(self.max_file_bytes));
            }
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        Ok(downloaded)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn client() -> UiClient {
        UiClient {
            http: reqwest::Client::new(),
            base: "http://gui.local".into(),
            max_file_bytes: 1024,
        }
    }

    #[test]
    fn endpoints_follow_the_contract() {
        let c = client();
        assert_eq!(c.queue_endpoint("cpp"), "http://gui.local/queue/cpp/submission");
        assert_eq!(
            c.problem_list_endpoint("p-3"),
            "http://gui.local/filesystem/problem/p-3"
        );
        assert_eq!(
            c.problem_file_endpoint("p-3", "t1.in"),
            "http://gui.local/filesystem/problem/p-3/t1.in"
        );
        assert_eq!(c.result_endpoint("s-17"), "http://gui.local/result/s-17");
        assert_eq!(c.status_endpoint("s-17"), "http://gui.local/status/s-17");
    }
}
