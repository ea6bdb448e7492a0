//! Incremental text segmentation.
//!
//! A segment is one non-whitespace token together with the whole whitespace
//! run that follows it. The run is only committed once the next token has
//! started, because until then more whitespace could still arrive. This makes
//! the output independent of how the text was split into increments.

use kokoro_mcp_common::error::SessionError;

/// A committed unit of text, ready for synthesis.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    text: String,
}

impl Segment {
    /// Create a segment from already-committed text.
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }

    /// The segment text, including its trailing whitespace.
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Consume the segment and return its text.
    pub fn into_text(self) -> String {
        self.text
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scan {
    /// Before the first token (only whitespace seen)
    Leading,
    /// Inside a token
    Token,
    /// Inside the whitespace run after a token
    Gap,
}

/// Splits an incrementally fed text stream into [`Segment`]s.
#[derive(Debug)]
pub struct TextSegmenter {
    buffer: String,
    /// Byte offset up to which `buffer` has already been scanned.
    cursor: usize,
    scan: Scan,
    closed: bool,
}

impl Default for TextSegmenter {
    fn default() -> Self {
        Self::new()
    }
}

impl TextSegmenter {
    /// Create an empty, open segmenter.
    pub fn new() -> Self {
        Self {
            buffer: String::new(),
            cursor: 0,
            scan: Scan::Leading,
            closed: false,
        }
    }

    /// Append `increment` and return the segments it completes.
    ///
    /// Segments are committed lazily as the iterator is advanced. Segments left
    /// unconsumed when the iterator is dropped stay buffered and are yielded by
    /// the next `push` or `close`.
    ///
    /// # Errors
    /// `SessionError::InvalidState` if the segmenter is closed.
    pub fn push(&mut self, increment: &str) -> Result<Segments<'_>, SessionError> {
        if self.closed {
            return Err(SessionError::invalid_state("push text", "closed"));
        }
        self.buffer.push_str(increment);
        Ok(Segments {
            segmenter: self,
            flush: false,
        })
    }

    /// Close the segmenter and return every remaining segment, including the
    /// unterminated tail.
    ///
    /// A tail made only of whitespace (possible only when no token was ever
    /// pushed) is dropped rather than emitted as an empty segment.
    ///
    /// # Errors
    /// `SessionError::InvalidState` if the segmenter is already closed.
    pub fn close(&mut self) -> Result<Segments<'_>, SessionError> {
        if self.closed {
            return Err(SessionError::invalid_state("close input", "closed"));
        }
        self.closed = true;
        Ok(Segments {
            segmenter: self,
            flush: true,
        })
    }

    /// Whether `close` has been called.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Text received but not yet committed.
    pub fn pending(&self) -> &str {
        &self.buffer
    }

    /// Byte offset of the next complete boundary, scanning only bytes not
    /// scanned before.
    fn next_boundary(&mut self) -> Option<usize> {
        for (offset, c) in self.buffer[self.cursor..].char_indices() {
            match (self.scan, c.is_whitespace()) {
                (Scan::Leading, false) => self.scan = Scan::Token,
                (Scan::Token, true) => self.scan = Scan::Gap,
                (Scan::Gap, false) => return Some(self.cursor + offset),
                _ => {}
            }
        }
        self.cursor = self.buffer.len();
        None
    }

    fn take(&mut self, end: usize) -> Segment {
        let text: String = self.buffer.drain(..end).collect();
        self.cursor = 0;
        self.scan = Scan::Leading;
        Segment { text }
    }
}

/// Lazy iterator over segments committed by one `push` or `close` call.
#[derive(Debug)]
pub struct Segments<'a> {
    segmenter: &'a mut TextSegmenter,
    flush: bool,
}

impl Iterator for Segments<'_> {
    type Item = Segment;

    fn next(&mut self) -> Option<Segment> {
        if let Some(end) = self.segmenter.next_boundary() {
            return Some(self.segmenter.take(end));
        }
        if !self.flush || self.segmenter.buffer.is_empty() {
            return None;
        }
        if self.segmenter.scan == Scan::Leading {
            // Whitespace only: nothing speakable.
            self.segmenter.buffer.clear();
            self.segmenter.cursor = 0;
            return None;
        }
        let end = self.segmenter.buffer.len();
        Some(self.segmenter.take(end))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn texts<'a>(segments: impl Iterator<Item = Segment> + 'a) -> Vec<String> {
        segments.map(Segment::into_text).collect()
    }

    fn segment_all(increments: &[&str]) -> Vec<String> {
        let mut segmenter = TextSegmenter::new();
        let mut out = Vec::new();
        for inc in increments {
            out.extend(texts(segmenter.push(inc).unwrap()));
        }
        out.extend(texts(segmenter.close().unwrap()));
        out
    }

    #[test]
    fn test_commits_tokens_once_next_token_starts() {
        let mut segmenter = TextSegmenter::new();
        assert_eq!(
            texts(segmenter.push("Testing one two").unwrap()),
            vec!["Testing ", "one "]
        );
        assert_eq!(segmenter.pending(), "two");
        assert!(texts(segmenter.push("three.").unwrap()).is_empty());
        assert_eq!(texts(segmenter.close().unwrap()), vec!["twothree."]);
    }

    #[test]
    fn test_trailing_whitespace_waits_for_next_token() {
        let mut segmenter = TextSegmenter::new();
        assert!(texts(segmenter.push("hello ").unwrap()).is_empty());
        assert!(texts(segmenter.push("  ").unwrap()).is_empty());
        assert_eq!(texts(segmenter.push("w").unwrap()), vec!["hello   "]);
        assert_eq!(texts(segmenter.close().unwrap()), vec!["w"]);
    }

    #[test]
    fn test_split_increments_match_one_shot() {
        assert_eq!(segment_all(&["hello world"]), vec!["hello ", "world"]);
        assert_eq!(segment_all(&["hel", "lo ", "world"]), vec!["hello ", "world"]);
    }

    #[test]
    fn test_leading_whitespace_rides_with_first_segment() {
        assert_eq!(segment_all(&["  hi there"]), vec!["  hi ", "there"]);
    }

    #[test]
    fn test_whitespace_only_input_yields_nothing() {
        let mut segmenter = TextSegmenter::new();
        assert!(texts(segmenter.push(" \n\t ").unwrap()).is_empty());
        assert!(texts(segmenter.close().unwrap()).is_empty());
        assert_eq!(segmenter.pending(), "");
    }

    #[test]
    fn test_empty_close_yields_nothing() {
        let mut segmenter = TextSegmenter::new();
        assert!(texts(segmenter.close().unwrap()).is_empty());
    }

    #[test]
    fn test_close_keeps_trailing_whitespace_on_tail() {
        assert_eq!(segment_all(&["done.  \n"]), vec!["done.  \n"]);
    }

    #[test]
    fn test_push_after_close_is_invalid_state() {
        let mut segmenter = TextSegmenter::new();
        drop(segmenter.close().unwrap());
        let err = segmenter.push("late").unwrap_err();
        assert!(matches!(err, SessionError::InvalidState { .. }));
        assert!(segmenter.close().is_err());
    }

    #[test]
    fn test_unconsumed_segments_survive_to_next_call() {
        let mut segmenter = TextSegmenter::new();
        let mut first = segmenter.push("a b c d").unwrap();
        assert_eq!(first.next().map(Segment::into_text).as_deref(), Some("a "));
        drop(first);
        assert_eq!(texts(segmenter.push("").unwrap()), vec!["b ", "c "]);
        assert_eq!(texts(segmenter.close().unwrap()), vec!["d"]);
    }

    #[test]
    fn test_multibyte_text() {
        assert_eq!(
            segment_all(&["héllo", " wörld\u{3000}", "日本"]),
            vec!["héllo ", "wörld\u{3000}", "日本"]
        );
    }
}

#[cfg(test)]
mod property_tests {
    use super::*;
    use proptest::prelude::*;

    /// Text drawn from words and assorted whitespace.
    fn text_strategy() -> impl Strategy<Value = String> {
        prop::collection::vec(
            prop_oneof![
                "[a-zA-Z.,!?']{1,8}",
                Just(" ".to_string()),
                Just("  ".to_string()),
                Just("\n".to_string()),
                Just("\t".to_string()),
                Just("ü".to_string()),
            ],
            0..40,
        )
        .prop_map(|parts| parts.concat())
    }

    /// Split `text` at the given char positions.
    fn split_at_chars(text: &str, mut cuts: Vec<usize>) -> Vec<String> {
        let chars: Vec<char> = text.chars().collect();
        cuts.iter_mut().for_each(|c| *c %= chars.len() + 1);
        cuts.sort_unstable();
        let mut parts = Vec::new();
        let mut start = 0;
        for cut in cuts {
            parts.push(chars[start..cut].iter().collect());
            start = cut;
        }
        parts.push(chars[start..].iter().collect());
        parts
    }

    fn run(increments: &[String]) -> Vec<String> {
        let mut segmenter = TextSegmenter::new();
        let mut out = Vec::new();
        for inc in increments {
            out.extend(segmenter.push(inc).unwrap().map(Segment::into_text));
        }
        out.extend(segmenter.close().unwrap().map(Segment::into_text));
        out
    }

    proptest! {
        /// Any split of the input produces the same segments as one push.
        #[test]
        fn segmentation_is_increment_invariant(
            text in text_strategy(),
            cuts in prop::collection::vec(any::<usize>(), 0..10),
        ) {
            let one_shot = run(&[text.clone()]);
            let pieces = split_at_chars(&text, cuts);
            prop_assert_eq!(run(&pieces), one_shot);
        }

        /// Segments reconstruct the input exactly, unless the input has no
        /// token at all.
        #[test]
        fn segments_reconstruct_input(text in text_strategy()) {
            let segments = run(&[text.clone()]);
            if text.trim().is_empty() {
                prop_assert!(segments.is_empty());
            } else {
                prop_assert_eq!(segments.concat(), text);
            }
        }

        /// No segment is empty and no segment splits a token.
        #[test]
        fn segments_hold_exactly_one_token(text in text_strategy()) {
            for segment in run(&[text]) {
                prop_assert_eq!(segment.split_whitespace().count(), 1);
            }
        }
    }
}
