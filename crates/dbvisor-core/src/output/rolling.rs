use super::OutputSink;
use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

/// Keeps the last `capacity` console lines for diagnostics
#[derive(Debug)]
pub struct RollingLogBuffer {
    capacity: usize,
    lines: Mutex<VecDeque<String>>,
}

impl RollingLogBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            lines: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn push_line(&self, line: &str) {
        let mut lines = self.lines.lock().unwrap_or_else(PoisonError::into_inner);
        if lines.len() == self.capacity {
            lines.pop_front();
        }
        lines.push_back(line.to_owned());
    }

    pub fn recent_lines(&self) -> Vec<String> {
        let lines = self.lines.lock().unwrap_or_else(PoisonError::into_inner);
        lines.iter().cloned().collect()
    }

    /// Buffered lines joined with `\n`
    pub fn contents(&self) -> String {
        let lines = self.lines.lock().unwrap_or_else(PoisonError::into_inner);
        let mut out = String::new();
        for (i, line) in lines.iter().enumerate() {
            if i > 0 {
                out.push('\n');
            }
            out.push_str(line);
        }
        out
    }
}

impl OutputSink for RollingLogBuffer {
    fn consume(&self, line: &str) -> anyhow::Result<()> {
        self.push_line(line);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keeps_only_the_tail() {
        let buffer = RollingLogBuffer::new(3);
        for i in 1..=5 {
            buffer.push_line(&format!("line {i}"));
        }
        assert_eq!(buffer.recent_lines(), vec!["line 3", "line 4", "line 5"]);
        assert_eq!(buffer.contents(), "line 3\nline 4\nline 5");
    }

    #[test]
    fn test_empty_buffer() {
        let buffer = RollingLogBuffer::new(10);
        assert_eq!(buffer.contents(), "");
        assert!(buffer.recent_lines().is_empty());
    }

    #[test]
    fn test_zero_capacity_keeps_one_line() {
        let buffer = RollingLogBuffer::new(0);
        buffer.push_line("a");
        buffer.push_line("b");
        assert_eq!(buffer.capacity(), 1);
        assert_eq!(buffer.contents(), "b");
    }
}
