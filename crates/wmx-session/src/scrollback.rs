//! Capped scrollback buffer.
//!
//! Accumulates a session's output as text, most-recent `cap` characters
//! kept, oldest trimmed from the front at a char boundary. Kept as one
//! contiguous `String`: trimming is O(n) in the worst case but the cap is
//! small enough (100k chars) that this never shows up in practice.

/// Default scrollback cap in characters.
pub const DEFAULT_SCROLLBACK_CHARS: usize = 100_000;

#[derive(Debug)]
pub struct Scrollback {
    text: String,
    chars: usize,
    cap: usize,
}

impl Scrollback {
    pub fn new(cap: usize) -> Self {
        Self {
            text: String::new(),
            chars: 0,
            cap,
        }
    }

    /// Append raw PTY bytes, lossily decoded as UTF-8.
    pub fn append_bytes(&mut self, data: &[u8]) {
        self.append(&String::from_utf8_lossy(data));
    }

    pub fn append(&mut self, s: &str) {
        self.text.push_str(s);
        self.chars += s.chars().count();

        if self.chars > self.cap {
            let excess = self.chars - self.cap;
            let cut = self
                .text
                .char_indices()
                .nth(excess)
                .map(|(idx, _)| idx)
                .unwrap_or(self.text.len());
            self.text.drain(..cut);
            self.chars = self.cap;
        }
    }

    pub fn contents(&self) -> &str {
        &self.text
    }

    pub fn char_count(&self) -> usize {
        self.chars
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn under_cap_keeps_everything() {
        let mut sb = Scrollback::new(10);
        sb.append("hello");
        assert_eq!(sb.contents(), "hello");
        assert_eq!(sb.char_count(), 5);
    }

    #[test]
    fn over_cap_trims_oldest() {
        let mut sb = Scrollback::new(5);
        sb.append("abcdefgh");
        assert_eq!(sb.contents(), "defgh");
        assert_eq!(sb.char_count(), 5);

        sb.append("ij");
        assert_eq!(sb.contents(), "fghij");
    }

    #[test]
    fn trims_at_char_boundaries() {
        let mut sb = Scrollback::new(3);
        sb.append("日本語テスト");
        assert_eq!(sb.contents(), "テスト");
        assert_eq!(sb.char_count(), 3);
    }

    #[test]
    fn lossy_bytes_append() {
        let mut sb = Scrollback::new(100);
        sb.append_bytes(b"ok \xff done");
        assert!(sb.contents().starts_with("ok "));
        assert!(sb.contents().ends_with(" done"));
    }
}
