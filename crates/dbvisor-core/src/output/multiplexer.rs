use super::{OutputSink, StreamKind};
use crate::error::MultiplexError;
use std::sync::{Arc, Mutex, PoisonError};

/// Fans one console stream out to any number of sinks.
///
/// Every write reaches every sink registered at the time of the write. Sink failures are
/// collected and returned together once all sinks were called.
pub struct OutputMultiplexer {
    stream: StreamKind,
    sinks: Mutex<Vec<Arc<dyn OutputSink>>>,
    pending: Mutex<Vec<u8>>,
}

impl OutputMultiplexer {
    pub fn new(stream: StreamKind) -> Self {
        Self {
            stream,
            sinks: Mutex::new(Vec::new()),
            pending: Mutex::new(Vec::new()),
        }
    }

    pub fn stream(&self) -> StreamKind {
        self.stream
    }

    pub fn add_sink(&self, sink: Arc<dyn OutputSink>) {
        self.sinks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(sink);
    }

    /// Removes a sink previously added. Returns `false` if it was not registered.
    pub fn remove_sink(&self, sink: &Arc<dyn OutputSink>) -> bool {
        let mut sinks = self.sinks.lock().unwrap_or_else(PoisonError::into_inner);
        let before = sinks.len();
        sinks.retain(|s| !same_sink(s, sink));
        sinks.len() != before
    }

    pub fn sink_count(&self) -> usize {
        self.sinks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn write_line(&self, line: &str) -> Result<(), MultiplexError> {
        // Sinks are called on a snapshot so a slow sink never holds the list lock.
        let sinks = self
            .sinks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        let failures: Vec<anyhow::Error> = sinks
            .iter()
            .filter_map(|sink| sink.consume(line).err())
            .collect();

        if failures.is_empty() {
            Ok(())
        } else {
            Err(MultiplexError {
                attempted: sinks.len(),
                failures,
            })
        }
    }

    /// Writes raw bytes. Complete lines are forwarded immediately, a trailing partial line
    /// waits for the next newline or [`flush`](Self::flush).
    pub fn write(&self, bytes: &[u8]) -> Result<(), MultiplexError> {
        let lines = {
            let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
            pending.extend_from_slice(bytes);

            let mut lines = Vec::new();
            while let Some(pos) = pending.iter().position(|b| *b == b'\n') {
                let raw: Vec<u8> = pending.drain(..=pos).collect();
                lines.push(decode_line(&raw[..raw.len() - 1]));
            }
            lines
        };

        self.write_lines(lines)
    }

    /// Forwards any buffered partial line
    pub fn flush(&self) -> Result<(), MultiplexError> {
        let rest = std::mem::take(&mut *self.pending.lock().unwrap_or_else(PoisonError::into_inner));
        if rest.is_empty() {
            return Ok(());
        }
        self.write_line(&decode_line(&rest))
    }

    fn write_lines(&self, lines: Vec<String>) -> Result<(), MultiplexError> {
        let mut aggregated: Option<MultiplexError> = None;
        for line in lines {
            if let Err(e) = self.write_line(&line) {
                match aggregated.as_mut() {
                    Some(agg) => agg.merge(e),
                    None => aggregated = Some(e),
                }
            }
        }
        aggregated.map_or(Ok(()), Err)
    }
}

fn same_sink(a: &Arc<dyn OutputSink>, b: &Arc<dyn OutputSink>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

pub(crate) fn decode_line(raw: &[u8]) -> String {
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    String::from_utf8_lossy(raw).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::RollingLogBuffer;

    struct Recording(Mutex<Vec<String>>);

    impl OutputSink for Recording {
        fn consume(&self, line: &str) -> anyhow::Result<()> {
            self.0.lock().unwrap().push(line.to_string());
            Ok(())
        }
    }

    struct Failing;

    impl OutputSink for Failing {
        fn consume(&self, line: &str) -> anyhow::Result<()> {
            Err(anyhow::anyhow!("cannot take {line}"))
        }
    }

    #[test]
    fn test_failing_sink_does_not_starve_others() {
        let mux = OutputMultiplexer::new(StreamKind::Stdout);
        let recording = Arc::new(Recording(Mutex::new(Vec::new())));
        mux.add_sink(Arc::new(Failing));
        mux.add_sink(recording.clone());

        for i in 0..4 {
            let err = mux.write_line(&format!("line {i}")).unwrap_err();
            assert_eq!(err.failures.len(), 1);
            assert_eq!(err.attempted, 2);
        }

        assert_eq!(
            *recording.0.lock().unwrap(),
            vec!["line 0", "line 1", "line 2", "line 3"]
        );
    }

    #[test]
    fn test_write_bytes_aggregates_one_failure_per_line() {
        let mux = OutputMultiplexer::new(StreamKind::Stderr);
        let recording = Arc::new(Recording(Mutex::new(Vec::new())));
        mux.add_sink(Arc::new(Failing));
        mux.add_sink(recording.clone());

        let err = mux.write(b"one\r\ntwo\nthree\npartial").unwrap_err();
        assert_eq!(err.failures.len(), 3);
        assert_eq!(*recording.0.lock().unwrap(), vec!["one", "two", "three"]);

        let err = mux.flush().unwrap_err();
        assert_eq!(err.failures.len(), 1);
        assert_eq!(recording.0.lock().unwrap().last().unwrap(), "partial");
        assert!(mux.flush().is_ok());
    }

    #[test]
    fn test_add_and_remove_sinks() {
        let mux = OutputMultiplexer::new(StreamKind::Stdout);
        let buffer = Arc::new(RollingLogBuffer::new(10));
        let sink: Arc<dyn OutputSink> = buffer.clone();

        mux.add_sink(sink.clone());
        assert_eq!(mux.sink_count(), 1);
        mux.write_line("seen").unwrap();

        assert!(mux.remove_sink(&sink));
        assert!(!mux.remove_sink(&sink));
        mux.write_line("not seen").unwrap();

        assert_eq!(buffer.contents(), "seen");
    }

    #[test]
    fn test_closure_sink() {
        let mux = OutputMultiplexer::new(StreamKind::Stdout);
        let seen = Arc::new(Mutex::new(0usize));
        let counter = seen.clone();
        mux.add_sink(Arc::new(move |_line: &str| -> anyhow::Result<()> {
            *counter.lock().unwrap() += 1;
            Ok(())
        }));

        mux.write(b"a\nb\n").unwrap();
        assert_eq!(*seen.lock().unwrap(), 2);
    }

    #[test]
    fn test_invalid_utf8_is_replaced() {
        let mux = OutputMultiplexer::new(StreamKind::Stdout);
        let buffer = Arc::new(RollingLogBuffer::new(10));
        mux.add_sink(buffer.clone());

        mux.write(b"caf\xe9\n").unwrap();
        assert_eq!(buffer.contents(), "caf\u{fffd}");
    }
}
