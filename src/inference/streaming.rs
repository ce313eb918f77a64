//! SSE streaming response accumulator for `streamGenerateContent`.
//!
//! Reads a byte stream in chunks of arbitrary size, reconstructs `\n`
//! delimited lines, parses each `data:` line as a [`StreamEnvelope`], and
//! reports accumulated text through a [`ResponseSink`].
//!
//! Malformed records are reported and skipped; only transport failures end
//! the stream early. Cancellation is checked before every chunk read (and
//! races the read itself) and after every processed line.

use futures::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;

use super::errors::QueryError;
use super::types::StreamEnvelope;

/// Prefix marking a relevant event-stream record.
const DATA_PREFIX: &str = "data: ";

/// Payload that ends the stream.
const DONE_SENTINEL: &str = "[DONE]";

// ─── Callbacks ───────────────────────────────────────────────────────────────

/// Outward callbacks for one query.
///
/// Called on whatever task drives the stream. Implementations that update a
/// UI must redirect to their UI thread themselves.
pub trait ResponseSink: Send + Sync {
    /// The first non-empty text fragment arrived. Called at most once per query.
    fn on_response_start(&self);

    /// The accumulated text so far. `is_complete` is `true` exactly once,
    /// with the final text, when the stream finished with content.
    fn on_response_updated(&self, text: &str, is_complete: bool);

    /// A user-facing error message.
    fn on_error(&self, message: &str);
}

/// How a stream ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamOutcome {
    /// The stream finished with this full text.
    Completed(String),
    /// The stream finished without any text. `on_error` has been called.
    Empty,
    /// Cancelled mid-flight. No callback has been made for the cancellation.
    Cancelled,
}

// ─── Line reconstruction ─────────────────────────────────────────────────────

/// Reassembles lines from arbitrary byte chunks.
///
/// Bytes are buffered raw and decoded one complete line at a time, so a
/// multi-byte character split across chunks decodes intact.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn push(&mut self, chunk: &[u8]) {
        self.pending.extend_from_slice(chunk);
    }

    /// Pop the next complete line, without its `\n`.
    pub fn next_line(&mut self) -> Option<String> {
        let end = self.pending.iter().position(|b| *b == b'\n')?;
        let line: Vec<u8> = self.pending.drain(..=end).collect();
        Some(String::from_utf8_lossy(&line[..end]).into_owned())
    }

    /// Take a trailing unterminated line, if any.
    pub fn take_remainder(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.pending);
        Some(String::from_utf8_lossy(&rest).into_owned())
    }
}

// ─── Accumulator ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LineResult {
    Continue,
    Done,
}

/// Per-query accumulation state.
struct StreamAccumulator<'a> {
    sink: &'a dyn ResponseSink,
    text: String,
    started: bool,
    malformed: usize,
}

impl<'a> StreamAccumulator<'a> {
    fn new(sink: &'a dyn ResponseSink) -> Self {
        Self {
            sink,
            text: String::new(),
            started: false,
            malformed: 0,
        }
    }

    fn process_line(&mut self, line: &str) -> LineResult {
        let line = line.trim();
        let Some(payload) = line.strip_prefix(DATA_PREFIX) else {
            return LineResult::Continue; // comments, event names, blank separators
        };
        let payload = payload.trim();

        if payload == DONE_SENTINEL {
            return LineResult::Done;
        }

        let envelope: StreamEnvelope = match serde_json::from_str(payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                self.malformed += 1;
                tracing::warn!(error = %e, bytes = payload.len(), "malformed stream record");
                let err = QueryError::MalformedFragment {
                    reason: e.to_string(),
                };
                self.sink.on_error(&err.to_string());
                return LineResult::Continue;
            }
        };

        if let Some(fragment) = envelope.first_candidate_text() {
            if !self.started {
                self.started = true;
                self.sink.on_response_start();
            }
            self.text.push_str(&fragment);
            self.sink.on_response_updated(&self.text, false);
        }

        LineResult::Continue
    }

    fn finish(self) -> StreamOutcome {
        tracing::debug!(
            chars = self.text.chars().count(),
            malformed = self.malformed,
            "stream finished"
        );

        if self.text.is_empty() {
            self.sink.on_error(&QueryError::EmptyResponse.to_string());
            return StreamOutcome::Empty;
        }

        self.sink.on_response_updated(&self.text, true);
        StreamOutcome::Completed(self.text)
    }
}

// ─── Driver ──────────────────────────────────────────────────────────────────

/// Drive a byte stream to completion, reporting progress through `sink`.
///
/// Returns `Err` only for a transport failure while reading; partial text is
/// discarded in that case and no callback is made (the caller reports it).
pub async fn accumulate<S, B, E>(
    stream: S,
    cancel: &CancellationToken,
    sink: &dyn ResponseSink,
) -> Result<StreamOutcome, QueryError>
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
    E: Into<QueryError>,
{
    let mut stream = std::pin::pin!(stream);
    let mut lines = LineBuffer::default();
    let mut acc = StreamAccumulator::new(sink);

    loop {
        if cancel.is_cancelled() {
            return Ok(StreamOutcome::Cancelled);
        }

        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(StreamOutcome::Cancelled),
            next = stream.next() => next,
        };

        match next {
            Some(Ok(chunk)) => {
                lines.push(chunk.as_ref());
                while let Some(line) = lines.next_line() {
                    let result = acc.process_line(&line);
                    if cancel.is_cancelled() {
                        return Ok(StreamOutcome::Cancelled);
                    }
                    if result == LineResult::Done {
                        return Ok(acc.finish());
                    }
                }
            }
            Some(Err(e)) => {
                let err: QueryError = e.into();
                tracing::warn!(error = %err, "stream read failed");
                return Err(err);
            }
            None => {
                if let Some(rest) = lines.take_remainder() {
                    acc.process_line(&rest);
                    if cancel.is_cancelled() {
                        return Ok(StreamOutcome::Cancelled);
                    }
                }
                return Ok(acc.finish());
            }
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
