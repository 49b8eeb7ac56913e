//! Per-submission log capability.
//!
//! Process-level diagnostics go through `tracing`; the submission log is a
//! separate concern because its contents become the UI's `debug` payload.
//! The sink is handed to the components that work on a submission instead of
//! living in a global, so one submission's log never bleeds into another's.
//! Two flavors: file-only, and file plus stderr mirror.

use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

use tokio::io::AsyncWriteExt;

const BOLD: &str = "\x1b[1m";
const RED: &str = "\x1b[31m";
const YELLOW: &str = "\x1b[33m";
const RESET: &str = "\x1b[0m";

pub struct LogSink {
    file: Option<tokio::sync::Mutex<tokio::fs::File>>,
    buffer: Mutex<String>,
    mirror_stderr: bool,
}

impl LogSink {
    pub async fn file_only(path: &Path) -> std::io::Result<LogSink> {
        Ok(LogSink {
            file: Some(tokio::sync::Mutex::new(
                tokio::fs::File::create(path).await?,
            )),
            buffer: Mutex::new(String::new()),
            mirror_stderr: false,
        })
    }

    pub async fn with_stderr(path: &Path) -> std::io::Result<LogSink> {
        let mut sink = LogSink::file_only(path).await?;
        sink.mirror_stderr = true;
        Ok(sink)
    }

    /// Buffer-only sink, for tests and for submissions that failed before a
    /// workspace existed.
    pub fn memory_only() -> LogSink {
        LogSink {
            file: None,
            buffer: Mutex::new(String::new()),
            mirror_stderr: false,
        }
    }

    pub async fn info(&self, message: impl AsRef<str>) {
        self.write_line(format!("INFO  {}", message.as_ref())).await;
    }

    pub async fn warn(&self, message: impl AsRef<str>) {
        self.write_line(format!("{}WARN{}  {}", YELLOW, RESET, message.as_ref()))
            .await;
    }

    pub async fn error(&self, message: impl AsRef<str>) {
        self.write_line(format!("{}ERROR{} {}", RED, RESET, message.as_ref()))
            .await;
    }

    /// Emphasized subject, e.g. the worker name, in an info line.
    pub fn bold(text: &str) -> String {
        format!("{}{}{}", BOLD, text, RESET)
    }

    /// Writes a preformatted block (such as a result table) verbatim.
    pub async fn raw(&self, block: impl AsRef<str>) {
        for line in block.as_ref().lines() {
            self.write_line(line.to_string()).await;
        }
    }

    async fn write_line(&self, line: String) {
        {
            let mut buffer = self.buffer.lock().expect("log buffer lock poisoned");
            buffer.push_str(&line);
            buffer.push('\n');
        }
        if self.mirror_stderr {
            let _ = writeln!(std::io::stderr(), "{}", line);
        }
        if let Some(file) = &self.file {
            let mut file = file.lock().await;
            let _ = file.write_all(line.as_bytes()).await;
            let _ = file.write_all(b"\n").await;
        }
    }

    /// The collected log, cut off at `cap` characters with a truncation
    /// notice. Whole lines only.
    pub fn contents_capped(&self, cap: usize) -> String {
        let buffer = self.buffer.lock().expect("log buffer lock poisoned");
        if buffer.chars().count() <= cap {
            return buffer.clone();
        }
        let mut out = String::new();
        for line in buffer.lines() {
            if out.chars().count() + line.chars().count() > cap {
                break;
            }
            out.push_str(line);
            out.push('\n');
        }
        out.push_str("... log truncated ...\n");
        out
    }
}
