use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use futures::{StreamExt, stream};
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};

/// Line not yet parsed; undecodable bytes stay a per-line error
type RawLine = Result<String, IoError>;

use super::error::IoError;
use super::parse::RawFeedRecord;
use super::source::{FeedSource, FeedStream};
use crate::domain::FeedRecord;

/// Parse one JSON line; the line number is only used in error messages
fn parse_line(line_no: u64, line: &str) -> Result<FeedRecord, IoError> {
    let value: serde_json::Value =
        serde_json::from_str(line).map_err(|e| IoError::Malformed {
            line: line_no,
            reason: e.to_string(),
        })?;
    if !value.is_object() {
        return Err(IoError::Malformed {
            line: line_no,
            reason: "expected a JSON object".to_string(),
        });
    }
    RawFeedRecord::from_json(value)?.parse()
}

/// JSON-lines feed file; blank lines do not count as records
pub struct JsonlFeedSource {
    path: PathBuf,
}

impl JsonlFeedSource {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    async fn open_reader(&self) -> Result<BufReader<File>, IoError> {
        let file = File::open(&self.path).await?;
        Ok(BufReader::new(file))
    }
}

/// Read one physical line; `None` at end of file
async fn read_line(reader: &mut BufReader<File>, line_no: u64) -> Result<Option<RawLine>, IoError> {
    let mut buf = Vec::new();
    if reader.read_until(b'\n', &mut buf).await? == 0 {
        return Ok(None);
    }
    if buf.last() == Some(&b'\n') {
        buf.pop();
        if buf.last() == Some(&b'\r') {
            buf.pop();
        }
    }
    let line = String::from_utf8(buf).map_err(|e| IoError::Malformed {
        line: line_no,
        reason: format!("invalid UTF-8: {}", e.utf8_error()),
    });
    Ok(Some(line))
}

fn is_blank(line: &RawLine) -> bool {
    matches!(line, Ok(text) if text.trim().is_empty())
}

#[async_trait]
impl FeedSource for JsonlFeedSource {
    async fn count_total(&self) -> Result<u64, IoError> {
        let mut reader = self.open_reader().await?;
        let mut total = 0;
        let mut line_no = 0;
        while let Some(line) = read_line(&mut reader, line_no + 1).await? {
            line_no += 1;
            if !is_blank(&line) {
                total += 1;
            }
        }
        Ok(total)
    }

    async fn open_from(&self, skip: u64) -> Result<FeedStream, IoError> {
        let reader = self.open_reader().await?;

        // State is (reader, physical line number); a read error ends the stream
        let raw = stream::unfold((Some(reader), 0u64), |(reader, line_no)| async move {
            let mut reader = reader?;
            let line_no = line_no + 1;
            match read_line(&mut reader, line_no).await {
                Ok(Some(line)) => Some((Ok((line_no, line)), (Some(reader), line_no))),
                Ok(None) => None,
                Err(e) => Some((Err(e), (None, line_no))),
            }
        });

        let records = raw
            .filter(|item| {
                let keep = !matches!(item, Ok((_, line)) if is_blank(line));
                async move { keep }
            })
            .skip(skip as usize)
            .map(|item| {
                item.and_then(|(line_no, line)| line.and_then(|text| parse_line(line_no, &text)))
            });

        Ok(Box::pin(records))
    }

    fn describe(&self) -> String {
        format!("jsonl:{}", self.path.display())
    }
}

/// In-memory JSON-lines feed, handy for tests and embedding
#[derive(Clone)]
pub struct MemoryFeedSource {
    lines: Arc<Vec<String>>,
}

impl MemoryFeedSource {
    /// Build from raw lines (blank lines are ignored like in files)
    pub fn from_lines<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let lines = lines
            .into_iter()
            .map(Into::into)
            .filter(|l: &String| !l.trim().is_empty())
            .collect();
        Self {
            lines: Arc::new(lines),
        }
    }

    /// Build from JSON values, one per record
    pub fn from_values(values: impl IntoIterator<Item = serde_json::Value>) -> Self {
        Self::from_lines(values.into_iter().map(|v| v.to_string()))
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

#[async_trait]
impl FeedSource for MemoryFeedSource {
    async fn count_total(&self) -> Result<u64, IoError> {
        Ok(self.lines.len() as u64)
    }

    async fn open_from(&self, skip: u64) -> Result<FeedStream, IoError> {
        let lines = Arc::clone(&self.lines);
        let start = (skip as usize).min(lines.len());
        let records = stream::iter(start..lines.len())
            .map(move |i| parse_line(i as u64 + 1, &lines[i]));
        Ok(Box::pin(records))
    }

    fn describe(&self) -> String {
        format!("memory:{} lines", self.lines.len())
    }
}
