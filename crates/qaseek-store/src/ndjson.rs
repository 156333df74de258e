//! Canonical NDJSON file reader.
//!
//! Each line is one record:
//! `{"asin", "question", "answer", "questionType", "answerType", "answerTime", "unixTime"}`,
//! optionally with an `id`. Only `id`, `asin`, `question` and `answer` are read.

use futures::stream::{self, StreamExt};
use qaseek_core::{CanonicalRecord, RawRecord, RecordError, RecordSource, RecordStream, StoreError};
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::debug;

/// Record source over NDJSON files.
///
/// The collection name passed to [`RecordSource::scan`] is a file path,
/// resolved against the base directory. Lines are read one at a time, so
/// `page_size` has no effect.
#[derive(Debug, Clone)]
pub struct NdjsonSource {
    base_dir: PathBuf,
}

impl Default for NdjsonSource {
    fn default() -> Self {
        Self::new(".")
    }
}

impl NdjsonSource {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    fn resolve(&self, collection: &str) -> PathBuf {
        self.base_dir.join(collection)
    }
}

enum ReadState {
    Closed(PathBuf),
    Open {
        path: PathBuf,
        reader: BufReader<File>,
        buf: Vec<u8>,
        line_no: usize,
    },
    Done,
}

fn io_error(path: &Path, e: &std::io::Error) -> RecordError {
    let err = if e.kind() == std::io::ErrorKind::NotFound {
        StoreError::NotFound(path.display().to_string())
    } else {
        StoreError::Io(format!("{}: {e}", path.display()))
    };
    RecordError::Source(err)
}

fn parse_line(bytes: &[u8], line_no: usize) -> Result<CanonicalRecord, RecordError> {
    let line = std::str::from_utf8(bytes).map_err(|_| RecordError::Rejected {
        id: None,
        reason: format!("line {line_no}: invalid UTF-8"),
    })?;
    let raw: RawRecord = serde_json::from_str(line).map_err(|e| RecordError::Rejected {
        id: None,
        reason: format!("line {line_no}: {e}"),
    })?;
    raw.into_canonical()
}

async fn next_item(
    state: ReadState,
) -> Option<(Result<CanonicalRecord, RecordError>, ReadState)> {
    let (mut reader, mut buf, mut line_no, path) = match state {
        ReadState::Done => return None,
        ReadState::Closed(path) => match File::open(&path).await {
            Ok(file) => {
                debug!("Reading records from {}", path.display());
                (BufReader::new(file), Vec::new(), 0, path)
            }
            Err(e) => return Some((Err(io_error(&path, &e)), ReadState::Done)),
        },
        ReadState::Open {
            path,
            reader,
            buf,
            line_no,
        } => (reader, buf, line_no, path),
    };

    // Lines are decoded one at a time so a bad encoding only rejects its own line
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => return None,
            Ok(_) => {
                line_no += 1;
                if buf.iter().all(u8::is_ascii_whitespace) {
                    continue;
                }
                let item = parse_line(&buf, line_no);
                let next = ReadState::Open {
                    path,
                    reader,
                    buf,
                    line_no,
                };
                return Some((item, next));
            }
            Err(e) => return Some((Err(io_error(&path, &e)), ReadState::Done)),
        }
    }
}

impl RecordSource for NdjsonSource {
    fn scan<'a>(&'a self, collection: &'a str, _page_size: usize) -> RecordStream<'a> {
        stream::unfold(ReadState::Closed(self.resolve(collection)), next_item).boxed()
    }
}
