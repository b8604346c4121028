use std::collections::VecDeque;

/// Bounded, line-oriented capture of a transfer tool's output.
///
/// Holds at most `capacity` bytes (counting one separator per line). When a
/// new line would exceed the ceiling the oldest lines are evicted first.
#[derive(Debug, Clone)]
pub struct OutputBuffer {
    lines: VecDeque<String>,
    bytes: usize,
    capacity: usize,
    evicted: u64,
}

impl OutputBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::new(),
            bytes: 0,
            capacity: capacity.max(1),
            evicted: 0,
        }
    }

    pub fn push_line(&mut self, line: &str) {
        let line = tail_within(line, self.capacity - 1);
        self.bytes += line.len() + 1;
        self.lines.push_back(line.to_string());

        while self.bytes > self.capacity {
            match self.lines.pop_front() {
                Some(old) => {
                    self.bytes -= old.len() + 1;
                    self.evicted += 1;
                }
                None => break,
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn len_bytes(&self) -> usize {
        self.bytes
    }

    /// Lines dropped so far to stay under the ceiling.
    pub fn evicted(&self) -> u64 {
        self.evicted
    }

    /// The last `n` non-blank lines, oldest first, joined by newlines.
    pub fn tail(&self, n: usize) -> String {
        let mut tail: Vec<&str> = self
            .lines
            .iter()
            .rev()
            .map(String::as_str)
            .filter(|l| !l.trim().is_empty())
            .take(n)
            .collect();
        tail.reverse();
        tail.join("\n")
    }

    /// Everything retained, with a marker when older output was dropped.
    pub fn contents(&self) -> String {
        let mut out = String::with_capacity(self.bytes + 64);
        if self.evicted > 0 {
            out.push_str(&format!("[{} earlier lines truncated]\n", self.evicted));
        }
        for line in &self.lines {
            out.push_str(line);
            out.push('\n');
        }
        out
    }
}

/// Longest suffix of `s` no larger than `max` bytes, cut on a char boundary.
fn tail_within(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut start = s.len() - max;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    &s[start..]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evicts_oldest_lines_past_capacity() {
        let mut buf = OutputBuffer::new(16);
        buf.push_line("aaaa"); // 5
        buf.push_line("bbbb"); // 10
        buf.push_line("cccc"); // 15
        buf.push_line("dddd"); // 20 -> evict aaaa

        assert_eq!(buf.evicted(), 1);
        assert!(buf.len_bytes() <= 16);
        assert_eq!(buf.contents(), "[1 earlier lines truncated]\nbbbb\ncccc\ndddd\n");
    }

    #[test]
    fn oversized_line_keeps_its_tail() {
        let mut buf = OutputBuffer::new(8);
        buf.push_line("0123456789abcdef");
        assert_eq!(buf.tail(1), "9abcdef");
        assert!(buf.len_bytes() <= 8);
    }

    #[test]
    fn oversized_multibyte_line_is_cut_on_char_boundary() {
        let mut buf = OutputBuffer::new(6);
        buf.push_line("ééééé");
        let tail = buf.tail(1);
        assert!(tail.len() <= 5);
        assert!(tail.chars().all(|c| c == 'é'));
    }

    #[test]
    fn tail_skips_blank_lines() {
        let mut buf = OutputBuffer::new(1024);
        for line in ["one", "", "two", "  ", "three"] {
            buf.push_line(line);
        }
        assert_eq!(buf.tail(2), "two\nthree");
        assert_eq!(buf.tail(10), "one\ntwo\nthree");
    }

    #[test]
    fn empty_buffer_has_no_contents() {
        let buf = OutputBuffer::new(32);
        assert!(buf.is_empty());
        assert_eq!(buf.contents(), "");
        assert_eq!(buf.tail(5), "");
    }
}
