//! Shared streaming utilities for provider adapters
//!
//! Decoders split raw body bytes into payload lines; [`UpstreamLines`] drives
//! a response body under the request's cancellation token and the iteration
//! cap, so every adapter reads upstream the same way.

use super::LlmError;
use futures::{Stream, StreamExt};
use std::collections::VecDeque;
use std::pin::Pin;
use tokio_util::sync::CancellationToken;

/// Server-Sent Events (SSE) decoder
///
/// Buffers incoming bytes and extracts complete SSE `data:` payloads.
/// Handles edge cases like:
/// - Events split across multiple chunks
/// - Multiple events in a single chunk
/// - Final event without trailing newline
///
/// # Example
/// ```
/// use chatpipe::llm::streaming::SseDecoder;
///
/// let mut decoder = SseDecoder::new();
///
/// let payloads = decoder.push(b"data: {\"text\":\"hello\"}\n\n");
/// assert_eq!(payloads, vec!["{\"text\":\"hello\"}"]);
///
/// // Split event
/// assert!(decoder.push(b"data: {\"text\"").is_empty());
/// assert_eq!(decoder.push(b":\"world\"}\n\n"), vec!["{\"text\":\"world\"}"]);
///
/// // No trailing newline
/// decoder.push(b"data: [DONE]");
/// assert_eq!(decoder.finish(), vec!["[DONE]"]);
/// ```
#[derive(Debug, Default)]
pub struct SseDecoder {
    lines: LineBuffer,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push incoming bytes and extract complete SSE `data:` payloads
    ///
    /// Incomplete events remain buffered for the next `push()` or `finish()`.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.lines
            .push(bytes)
            .into_iter()
            .filter_map(|line| data_payload(&line))
            .collect()
    }

    /// Flush any remaining buffered content
    pub fn finish(&mut self) -> Vec<String> {
        self.lines
            .take_rest()
            .lines()
            .filter_map(|l| data_payload(l.trim()))
            .collect()
    }
}

/// Raw byte buffer split on `\n`
///
/// Lines are decoded only once complete, so a multi-byte character split
/// across network reads is reassembled before UTF-8 decoding.
#[derive(Debug, Default)]
struct LineBuffer {
    bytes: Vec<u8>,
}

impl LineBuffer {
    fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.bytes.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(newline_pos) = self.bytes.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.bytes.drain(..=newline_pos).collect();
            lines.push(String::from_utf8_lossy(&line).trim().to_string());
        }
        lines
    }

    fn take_rest(&mut self) -> String {
        let rest = String::from_utf8_lossy(&self.bytes).into_owned();
        self.bytes.clear();
        rest
    }
}

fn data_payload(line: &str) -> Option<String> {
    if line.is_empty() {
        return None;
    }
    line.strip_prefix("data:").map(|p| p.trim().to_string())
}

/// Newline-delimited JSON decoder (Ollama)
#[derive(Debug, Default)]
pub struct NdjsonDecoder {
    lines: LineBuffer,
}

impl NdjsonDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.lines
            .push(bytes)
            .into_iter()
            .filter(|line| !line.is_empty())
            .collect()
    }

    pub fn finish(&mut self) -> Vec<String> {
        let rest = self.lines.take_rest().trim().to_string();
        if rest.is_empty() {
            Vec::new()
        } else {
            vec![rest]
        }
    }
}

enum Decoder {
    Sse(SseDecoder),
    Ndjson(NdjsonDecoder),
}

impl Decoder {
    fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        match self {
            Decoder::Sse(d) => d.push(bytes),
            Decoder::Ndjson(d) => d.push(bytes),
        }
    }

    fn finish(&mut self) -> Vec<String> {
        match self {
            Decoder::Sse(d) => d.finish(),
            Decoder::Ndjson(d) => d.finish(),
        }
    }
}

/// Why an [`UpstreamLines`] reader stopped yielding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    EndOfStream,
    Cancelled,
    IterationCap,
}

type ByteStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>, reqwest::Error>> + Send>>;

/// Line-oriented reader over an upstream response body
pub struct UpstreamLines {
    body: ByteStream,
    decoder: Decoder,
    pending: VecDeque<String>,
    iterations: usize,
    max_iterations: usize,
    body_done: bool,
    stop: Option<StopReason>,
}

impl UpstreamLines {
    /// Read `data:` payloads from an SSE body
    pub fn sse(response: reqwest::Response, max_iterations: usize) -> Self {
        Self::from_stream(bytes_of(response), Decoder::Sse(SseDecoder::new()), max_iterations)
    }

    /// Read JSON lines from an NDJSON body
    pub fn ndjson(response: reqwest::Response, max_iterations: usize) -> Self {
        Self::from_stream(
            bytes_of(response),
            Decoder::Ndjson(NdjsonDecoder::new()),
            max_iterations,
        )
    }

    fn from_stream(body: ByteStream, decoder: Decoder, max_iterations: usize) -> Self {
        Self {
            body,
            decoder,
            pending: VecDeque::new(),
            iterations: 0,
            max_iterations,
            body_done: false,
            stop: None,
        }
    }

    /// Next payload line, `Ok(None)` once the stream stopped for any reason
    pub async fn next(&mut self, cancel: &CancellationToken) -> Result<Option<String>, LlmError> {
        loop {
            if self.stop.is_some() {
                return Ok(None);
            }
            if cancel.is_cancelled() {
                self.stop = Some(StopReason::Cancelled);
                return Ok(None);
            }
            if let Some(line) = self.pending.pop_front() {
                self.iterations += 1;
                if self.iterations > self.max_iterations {
                    tracing::warn!(
                        "Upstream stream exceeded {} iterations, stopping",
                        self.max_iterations
                    );
                    self.stop = Some(StopReason::IterationCap);
                    return Ok(None);
                }
                return Ok(Some(line));
            }
            if self.body_done {
                self.stop = Some(StopReason::EndOfStream);
                return Ok(None);
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    self.stop = Some(StopReason::Cancelled);
                    return Ok(None);
                }
                chunk = self.body.next() => match chunk {
                    Some(Ok(bytes)) => {
                        let lines = self.decoder.push(&bytes);
                        self.pending.extend(lines);
                    }
                    Some(Err(e)) => return Err(LlmError::from_reqwest(e)),
                    None => {
                        self.body_done = true;
                        let rest = self.decoder.finish();
                        self.pending.extend(rest);
                    }
                },
            }
        }
    }

    /// Mark the stream finished (a terminal event was seen)
    pub fn stop(&mut self) {
        self.stop.get_or_insert(StopReason::EndOfStream);
    }

    pub fn stop_reason(&self) -> Option<StopReason> {
        self.stop
    }
}

fn bytes_of(response: reqwest::Response) -> ByteStream {
    Box::pin(response.bytes_stream().map(|r| r.map(|b| b.to_vec())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;
    use proptest::prelude::*;

    fn lines_from(chunks: Vec<&'static str>, decoder: Decoder, max: usize) -> UpstreamLines {
        let body: ByteStream = Box::pin(stream::iter(
            chunks
                .into_iter()
                .map(|c| Ok::<_, reqwest::Error>(c.as_bytes().to_vec())),
        ));
        UpstreamLines::from_stream(body, decoder, max)
    }

    #[test]
    fn test_single_complete_event() {
        let mut decoder = SseDecoder::new();
        let payloads = decoder.push(b"data: {\"hello\":\"world\"}\n\n");
        assert_eq!(payloads, vec!["{\"hello\":\"world\"}"]);
    }

    #[test]
    fn test_multiple_events_in_one_chunk() {
        let mut decoder = SseDecoder::new();
        let payloads = decoder.push(b"data: {\"a\":1}\n\ndata: {\"b\":2}\n\n");
        assert_eq!(payloads, vec!["{\"a\":1}", "{\"b\":2}"]);
    }

    #[test]
    fn test_event_split_across_chunks() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.push(b"data: {\"text\":\"hel").is_empty());
        assert_eq!(decoder.push(b"lo\"}\n\n"), vec!["{\"text\":\"hello\"}"]);
    }

    #[test]
    fn test_non_data_lines_ignored() {
        let mut decoder = SseDecoder::new();
        let payloads =
            decoder.push(b": keep-alive\nevent: content_block_delta\ndata: {\"x\":1}\n\n");
        assert_eq!(payloads, vec!["{\"x\":1}"]);
    }

    #[test]
    fn test_finish_clears_buffer() {
        let mut decoder = SseDecoder::new();
        decoder.push(b"data: {\"a\":1}");
        assert_eq!(decoder.finish(), vec!["{\"a\":1}"]);
        assert!(decoder.finish().is_empty());
    }

    #[test]
    fn test_invalid_utf8_is_lossy_not_fatal() {
        let mut decoder = SseDecoder::new();
        let payloads = decoder.push(b"data: {\"text\":\"\xFF\"}\n");
        assert_eq!(payloads.len(), 1);
    }

    #[test]
    fn test_multibyte_char_split_across_chunks() {
        let bytes = "data: {\"text\":\"你好\"}\n\n".as_bytes();
        let split = bytes.iter().position(|&b| b >= 0x80).unwrap() + 1;
        let mut decoder = SseDecoder::new();
        assert!(decoder.push(&bytes[..split]).is_empty());
        assert_eq!(decoder.push(&bytes[split..]), vec!["{\"text\":\"你好\"}"]);
    }

    proptest! {
        #[test]
        fn prop_chunking_does_not_change_payloads(
            texts in prop::collection::vec("[a-z 你好é]{0,12}", 1..6),
            cuts in prop::collection::vec(any::<prop::sample::Index>(), 0..8),
        ) {
            let body: String = texts
                .iter()
                .map(|t| format!("data: {t}\n\n"))
                .collect();
            let bytes = body.as_bytes();

            let mut whole = SseDecoder::new();
            let mut expected = whole.push(bytes);
            expected.extend(whole.finish());

            let mut points: Vec<usize> = cuts.iter().map(|i| i.index(bytes.len() + 1)).collect();
            points.sort_unstable();
            let mut chunked = SseDecoder::new();
            let mut actual = Vec::new();
            let mut start = 0;
            for point in points {
                actual.extend(chunked.push(&bytes[start..point]));
                start = point;
            }
            actual.extend(chunked.push(&bytes[start..]));
            actual.extend(chunked.finish());

            prop_assert_eq!(actual, expected);
        }
    }

    #[test]
    fn test_ndjson_lines() {
        let mut decoder = NdjsonDecoder::new();
        assert_eq!(decoder.push(b"{\"a\":1}\n{\"b\""), vec!["{\"a\":1}"]);
        assert!(decoder.push(b":2}").is_empty());
        assert_eq!(decoder.finish(), vec!["{\"b\":2}"]);
    }

    #[tokio::test]
    async fn test_upstream_lines_reads_to_end() {
        let mut lines = lines_from(
            vec!["data: a\n\nda", "ta: b\n\n", "data: c"],
            Decoder::Sse(SseDecoder::new()),
            100,
        );
        let cancel = CancellationToken::new();
        let mut seen = Vec::new();
        while let Some(line) = lines.next(&cancel).await.unwrap() {
            seen.push(line);
        }
        assert_eq!(seen, vec!["a", "b", "c"]);
        assert_eq!(lines.stop_reason(), Some(StopReason::EndOfStream));
    }

    #[tokio::test]
    async fn test_upstream_lines_iteration_cap_is_graceful() {
        let mut lines = lines_from(
            vec!["data: 1\n\ndata: 2\n\ndata: 3\n\n"],
            Decoder::Sse(SseDecoder::new()),
            2,
        );
        let cancel = CancellationToken::new();
        assert_eq!(lines.next(&cancel).await.unwrap().as_deref(), Some("1"));
        assert_eq!(lines.next(&cancel).await.unwrap().as_deref(), Some("2"));
        assert_eq!(lines.next(&cancel).await.unwrap(), None);
        assert_eq!(lines.stop_reason(), Some(StopReason::IterationCap));
    }

    #[tokio::test]
    async fn test_upstream_lines_stops_on_cancel() {
        let body: ByteStream = Box::pin(stream::pending::<Result<Vec<u8>, reqwest::Error>>());
        let mut lines = UpstreamLines::from_stream(body, Decoder::Sse(SseDecoder::new()), 10);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            trigger.cancel();
        });
        let started = std::time::Instant::now();
        assert_eq!(lines.next(&cancel).await.unwrap(), None);
        assert_eq!(lines.stop_reason(), Some(StopReason::Cancelled));
        assert!(started.elapsed() < std::time::Duration::from_millis(500));
    }
}
