//! Event decoder: byte chunks in, typed records out
//!
//! The job writes one record per line, each carrying [`RECORD_PREFIX`]
//! followed by a JSON object. Anything else on the wire (comment lines,
//! keepalive padding, blank lines) is skipped. A record that fails to parse
//! is dropped with a warning and the sequence keeps going.

use crate::record::{RawRecord, Record};
use async_stream::stream;
use futures::StreamExt;
use tokio_stream::Stream;

/// Textual prefix marking a record line
pub const RECORD_PREFIX: &str = "data:";

/// Decode a chunked byte stream into records.
///
/// The returned sequence ends when the source ends or yields an error; the
/// error is passed through as the final item.
pub fn decode_records<S, B, E>(source: S) -> impl Stream<Item = Result<Record, E>>
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
{
    stream! {
        let mut source = Box::pin(source);
        let mut framer = LineFramer::default();

        while let Some(chunk) = source.next().await {
            match chunk {
                Ok(bytes) => {
                    for line in framer.push(bytes.as_ref()) {
                        if let Some(record) = parse_line(&line) {
                            yield Ok(record);
                        }
                    }
                }
                Err(e) => {
                    yield Err(e);
                    return;
                }
            }
        }

        if let Some(line) = framer.finish() {
            if let Some(record) = parse_line(&line) {
                yield Ok(record);
            }
        }
    }
}

/// Parse a single line; `None` for non-record lines and malformed payloads.
pub fn parse_line(line: &str) -> Option<Record> {
    let payload = line.strip_prefix(RECORD_PREFIX)?;
    let payload = payload.strip_prefix(' ').unwrap_or(payload);
    if payload.trim().is_empty() {
        return None;
    }

    let raw = match serde_json::from_str::<RawRecord>(payload) {
        Ok(raw) => raw,
        Err(e) => {
            tracing::warn!("Dropping malformed record: {}", e);
            return None;
        }
    };

    match Record::from_raw(raw) {
        Ok(record) => Some(record),
        Err(e) => {
            tracing::warn!("Dropping record with invalid payload: {}", e);
            None
        }
    }
}

/// Splits a byte stream into complete lines, buffering partial ones.
#[derive(Debug, Default)]
struct LineFramer {
    buffer: Vec<u8>,
}

impl LineFramer {
    fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(bytes);

        let mut lines = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            lines.push(Self::to_line(&line[..line.len() - 1]));
        }
        lines
    }

    fn finish(&mut self) -> Option<String> {
        if self.buffer.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.buffer);
        Some(Self::to_line(&rest))
    }

    fn to_line(bytes: &[u8]) -> String {
        let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
        String::from_utf8_lossy(bytes).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Event;

    async fn decode(chunks: Vec<&str>) -> Vec<Result<Record, String>> {
        let source = futures::stream::iter(
            chunks
                .into_iter()
                .map(|c| Ok::<_, String>(c.as_bytes().to_vec()))
                .collect::<Vec<_>>(),
        );
        decode_records(source).collect().await
    }

    fn events(items: Vec<Result<Record, String>>) -> Vec<Event> {
        items.into_iter().map(|r| r.unwrap().event).collect()
    }

    #[tokio::test]
    async fn test_decodes_records_split_across_chunks() {
        let items = decode(vec![
            "data: {\"type\":\"text_st",
            "art\",\"index\":0}\ndata: {\"type\":\"text_delta\",\"index\":1,",
            "\"content\":\"hi\"}\n",
        ])
        .await;
        assert_eq!(
            events(items),
            vec![Event::TextStart, Event::TextDelta { content: "hi".into() }]
        );
    }

    #[tokio::test]
    async fn test_ignores_lines_without_prefix() {
        let items = decode(vec![
            ": keepalive\n\nevent: ping\ndata: {\"type\":\"done\"}\n",
        ])
        .await;
        assert_eq!(events(items), vec![Event::Done]);
    }

    #[tokio::test]
    async fn test_malformed_record_does_not_end_stream() {
        let items = decode(vec![
            "data: {\"type\":\"text_start\"}\n",
            "data: {not json\n",
            "data: {\"type\":\"tool_use_start\"}\n",
            "data: {\"type\":\"done\"}\n",
        ])
        .await;
        assert_eq!(events(items), vec![Event::TextStart, Event::Done]);
    }

    #[tokio::test]
    async fn test_crlf_and_trailing_line() {
        let items = decode(vec!["data: {\"type\":\"text_start\"}\r\n", "data: {\"type\":\"done\"}"]).await;
        assert_eq!(events(items), vec![Event::TextStart, Event::Done]);
    }

    #[tokio::test]
    async fn test_multibyte_split_across_chunks() {
        let line = "data: {\"type\":\"text_delta\",\"content\":\"héllo\"}\n";
        let bytes = line.as_bytes();
        let split = line.find('é').unwrap() + 1;
        let source = futures::stream::iter(vec![
            Ok::<_, String>(bytes[..split].to_vec()),
            Ok(bytes[split..].to_vec()),
        ]);
        let items: Vec<_> = decode_records(source).collect().await;
        assert_eq!(
            events(items),
            vec![Event::TextDelta { content: "héllo".into() }]
        );
    }

    #[tokio::test]
    async fn test_source_error_is_final_item() {
        let source = futures::stream::iter(vec![
            Ok(b"data: {\"type\":\"text_start\"}\n".to_vec()),
            Err("reset".to_string()),
            Ok(b"data: {\"type\":\"done\"}\n".to_vec()),
        ]);
        let items: Vec<_> = decode_records(source).collect().await;
        assert_eq!(items.len(), 2);
        assert!(items[0].is_ok());
        assert_eq!(items[1].as_ref().unwrap_err(), "reset");
    }

    #[test]
    fn test_parse_line_accepts_prefix_without_space() {
        let r = parse_line("data:{\"type\":\"keepalive\"}").unwrap();
        assert_eq!(r.event, Event::Keepalive);
        assert!(parse_line("data: ").is_none());
        assert!(parse_line("{\"type\":\"done\"}").is_none());
    }
}
