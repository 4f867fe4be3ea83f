use std::fmt;

/// Which standard stream a line came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamKind::Stdout => f.write_str("stdout"),
            StreamKind::Stderr => f.write_str("stderr"),
        }
    }
}

/// Consumer of console lines.
///
/// Sinks are called from the output pump tasks, one line at a time and in the order the
/// child wrote them. A failing sink does not stop the others from receiving the line.
pub trait OutputSink: Send + Sync {
    fn consume(&self, line: &str) -> anyhow::Result<()>;
}

impl<F> OutputSink for F
where
    F: Fn(&str) -> anyhow::Result<()> + Send + Sync,
{
    fn consume(&self, line: &str) -> anyhow::Result<()> {
        self(line)
    }
}
