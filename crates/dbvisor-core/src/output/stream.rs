use super::OutputMultiplexer;
use super::multiplexer::decode_line;
use anyhow::Result;
use std::sync::Arc;
use tokio::io::AsyncRead;
use tokio_stream::StreamExt;
use tokio_util::bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, FramedRead};
use tracing::{debug, warn};

/// Splits console output into lines.
///
/// Invalid UTF-8 is replaced rather than rejected and `\r\n` endings are trimmed. A line
/// longer than `max_line_length` is emitted in pieces so a child that never prints a
/// newline cannot grow the buffer without bound. Pieces end on a character boundary, but
/// a console message that straddles two pieces is not matched by a watcher.
#[derive(Debug, Clone)]
pub struct ConsoleLineCodec {
    max_line_length: usize,
}

impl ConsoleLineCodec {
    pub fn new(max_line_length: usize) -> Self {
        Self {
            max_line_length: max_line_length.max(1),
        }
    }
}

impl Default for ConsoleLineCodec {
    fn default() -> Self {
        Self::new(64 * 1024)
    }
}

impl Decoder for ConsoleLineCodec {
    type Item = String;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(pos) = src.iter().position(|b| *b == b'\n') {
            let line = decode_line(&src[..pos]);
            src.advance(pos + 1);
            return Ok(Some(line));
        }

        if src.len() >= self.max_line_length {
            let chunk = src.split_to(char_boundary(src, self.max_line_length));
            return Ok(Some(decode_line(&chunk)));
        }

        Ok(None)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(line) = self.decode(src)? {
            return Ok(Some(line));
        }

        if src.is_empty() {
            return Ok(None);
        }

        let rest = src.split();
        Ok(Some(decode_line(&rest)))
    }
}

/// Largest split point `<= max` that does not cut a UTF-8 sequence in two. Falls back to
/// `max` when no boundary is found within one sequence length.
fn char_boundary(bytes: &[u8], max: usize) -> usize {
    let is_continuation = |b: u8| b & 0b1100_0000 == 0b1000_0000;
    (max.saturating_sub(3)..=max)
        .rev()
        .take_while(|&at| at > 0)
        .find(|&at| bytes.get(at).is_none_or(|b| !is_continuation(*b)))
        .unwrap_or(max)
}

/// Reads `io` line by line into `out` until EOF. Returns the number of lines forwarded.
///
/// Sink failures are logged and do not stop the pump: the child must never block on a
/// full pipe because one consumer misbehaves.
pub async fn pump<R: AsyncRead + Unpin>(io: R, out: Arc<OutputMultiplexer>) -> usize {
    let mut frames = FramedRead::with_capacity(io, ConsoleLineCodec::default(), 8 * 1024);
    let mut lines = 0;

    while let Some(frame) = frames.next().await {
        match frame {
            Ok(line) => {
                lines += 1;
                if let Err(e) = out.write_line(&line) {
                    warn!(stream = %out.stream(), "Output sink failure: {e}");
                }
            }
            Err(e) => {
                warn!(stream = %out.stream(), "Stopped reading console output: {e}");
                break;
            }
        }
    }

    debug!(stream = %out.stream(), lines, "Console stream closed");
    lines
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::{OutputSink, RollingLogBuffer, StreamKind};

    #[tokio::test]
    async fn test_pump_forwards_lines_in_order() {
        let mux = Arc::new(OutputMultiplexer::new(StreamKind::Stdout));
        let buffer = Arc::new(RollingLogBuffer::new(10));
        mux.add_sink(buffer.clone());

        let input: &[u8] = b"first\r\nsecond\n\nlast without newline";
        let lines = pump(input, mux).await;

        assert_eq!(lines, 4);
        assert_eq!(
            buffer.recent_lines(),
            vec!["first", "second", "", "last without newline"]
        );
    }

    #[tokio::test]
    async fn test_pump_survives_failing_sink() {
        let mux = Arc::new(OutputMultiplexer::new(StreamKind::Stderr));
        let buffer = Arc::new(RollingLogBuffer::new(10));
        mux.add_sink(Arc::new(|_: &str| -> anyhow::Result<()> {
            Err(anyhow::anyhow!("broken"))
        }));
        mux.add_sink(buffer.clone());

        let input: &[u8] = b"a\nb\nc\n";
        assert_eq!(pump(input, mux).await, 3);
        assert_eq!(buffer.contents(), "a\nb\nc");
    }

    #[test]
    fn test_codec_splits_overlong_lines() {
        let mut codec = ConsoleLineCodec::new(4);
        let mut buf = BytesMut::from(&b"abcdefg\n"[..]);

        assert_eq!(codec.decode(&mut buf).unwrap().as_deref(), Some("abcdefg"));

        let mut buf = BytesMut::from(&b"abcdefg"[..]);
        assert_eq!(codec.decode(&mut buf).unwrap().as_deref(), Some("abcd"));
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        assert_eq!(codec.decode_eof(&mut buf).unwrap().as_deref(), Some("efg"));
        assert_eq!(codec.decode_eof(&mut buf).unwrap(), None);
    }

    #[test]
    fn test_overlong_split_keeps_characters_whole() {
        // "é" is two bytes, a cut at 4 would land inside the second one
        let mut codec = ConsoleLineCodec::new(4);
        let mut buf = BytesMut::from("aéé".as_bytes());

        assert_eq!(codec.decode(&mut buf).unwrap().as_deref(), Some("aé"));
        assert_eq!(codec.decode_eof(&mut buf).unwrap().as_deref(), Some("é"));
    }

    #[test]
    fn test_watcher_sees_split_stream() {
        let mux = OutputMultiplexer::new(StreamKind::Stdout);
        let watcher = Arc::new(crate::output::ConsoleMessageWatcher::new("ready").unwrap());
        let sink: Arc<dyn OutputSink> = watcher.clone();
        mux.add_sink(sink);

        mux.write(b"rea").unwrap();
        assert!(!watcher.has_seen_it());
        mux.write(b"dy\n").unwrap();
        assert!(watcher.has_seen_it());
    }
}
