//! Translation of engine tokens into completion chunks.

use crate::{CompletionChunk, CompletionResponse, MessageRole};

/// Turn markers of the supported chat templates. Generation stops at the first one.
pub(crate) const STOP_SEQUENCES: &[&str] = &[
    "<|user|>",
    "<|system|>",
    "<|im_end|>",
    "<|im_start|>",
    "<|eot_id|>",
    "<end_of_turn>",
    "</s>",
    "[INST]",
];

/// Decode as much of `buffer` as is complete UTF-8, leaving a trailing
/// partial sequence in place for the next token's bytes.
///
/// Bytes that can never become valid UTF-8 are replaced with U+FFFD.
pub fn decode_utf8_streaming(buffer: &mut Vec<u8>) -> Option<String> {
    let end = match std::str::from_utf8(buffer) {
        Ok(_) => buffer.len(),
        Err(e) => e.valid_up_to() + e.error_len().unwrap_or(0),
    };
    if end == 0 {
        return None;
    }
    let bytes: Vec<u8> = buffer.drain(..end).collect();
    Some(String::from_utf8_lossy(&bytes).into_owned())
}

pub(crate) fn find_stop_sequence(text: &str) -> Option<usize> {
    STOP_SEQUENCES.iter().filter_map(|stop| text.find(stop)).min()
}

/// Length of the longest suffix of `text` that starts some stop sequence.
fn stop_prefix_len(text: &str) -> usize {
    STOP_SEQUENCES
        .iter()
        .flat_map(|stop| (1..stop.len()).rev().map(move |k| &stop[..k]))
        .filter(|prefix| text.ends_with(prefix))
        .map(str::len)
        .max()
        .unwrap_or(0)
}

/// Outcome of feeding one token to a [`StopScanner`].
#[derive(Debug, PartialEq, Eq)]
pub enum ScanStep {
    /// Text safe to emit now; may be empty while bytes or a marker prefix are held back
    Emit(String),
    /// A turn marker was found; emit this last piece and stop generating
    Stop(String),
}

/// Turns raw token bytes into emittable text.
///
/// Multi-byte characters split across tokens are joined before emission, and
/// text that could be the start of a turn marker is held back until the
/// marker is ruled out, so no marker fragment ever reaches the caller.
#[derive(Debug, Default)]
pub struct StopScanner {
    bytes: Vec<u8>,
    pending: String,
    emitted: String,
}

impl StopScanner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, token_bytes: &[u8]) -> ScanStep {
        self.bytes.extend_from_slice(token_bytes);
        if let Some(decoded) = decode_utf8_streaming(&mut self.bytes) {
            self.pending.push_str(&decoded);
        }

        if let Some(pos) = find_stop_sequence(&self.pending) {
            let piece = self.pending[..pos].to_string();
            self.pending.clear();
            self.bytes.clear();
            self.emitted.push_str(&piece);
            return ScanStep::Stop(piece);
        }

        let keep = stop_prefix_len(&self.pending);
        let piece: String = self.pending.drain(..self.pending.len() - keep).collect();
        self.emitted.push_str(&piece);
        ScanStep::Emit(piece)
    }

    /// Release whatever is still held back once generation ends without a marker.
    pub fn flush(&mut self) -> String {
        let mut piece = std::mem::take(&mut self.pending);
        if !self.bytes.is_empty() {
            piece.push_str(&String::from_utf8_lossy(&self.bytes));
            self.bytes.clear();
        }
        self.emitted.push_str(&piece);
        piece
    }

    /// Everything emitted so far
    pub fn text(&self) -> &str {
        &self.emitted
    }
}

/// Create an assistant text chunk for `model_id`.
pub fn make_text_chunk(model_id: &str, content: String) -> CompletionChunk {
    CompletionChunk {
        content,
        role: MessageRole::Assistant,
        finish_reason: None,
        model_id: model_id.to_string(),
        tool_calls: Vec::new(),
    }
}

/// Turns each streamed token into one chunk and keeps the running text.
///
/// The final message is built from the accumulated tokens, so its content
/// always equals the concatenation of every emitted chunk.
#[derive(Debug)]
pub struct ChunkTranslator {
    model_id: String,
    accumulated: String,
    emitted: usize,
}

impl ChunkTranslator {
    pub fn new(model_id: impl Into<String>) -> Self {
        Self {
            model_id: model_id.into(),
            accumulated: String::new(),
            emitted: 0,
        }
    }

    /// Record `token` and return the chunk carrying just that token.
    pub fn translate(&mut self, token: &str) -> CompletionChunk {
        self.accumulated.push_str(token);
        self.emitted += 1;
        make_text_chunk(&self.model_id, token.to_string())
    }

    pub fn accumulated(&self) -> &str {
        &self.accumulated
    }

    pub fn chunks_emitted(&self) -> usize {
        self.emitted
    }

    pub fn finish(self) -> CompletionResponse {
        CompletionResponse::assistant(self.accumulated, self.model_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(scanner: &mut StopScanner, pieces: &[&[u8]]) -> Vec<ScanStep> {
        pieces.iter().map(|p| scanner.push(p)).collect()
    }

    #[test]
    fn test_stop_sequence_picks_earliest() {
        assert_eq!(find_stop_sequence("hi there<|im_end|>x</s>"), Some(8));
        assert_eq!(find_stop_sequence("no markers"), None);
    }

    #[test]
    fn test_decode_utf8_keeps_partial_sequence() {
        // "é" is 0xC3 0xA9
        let mut buffer = vec![b'c', b'a', b'f', 0xC3];
        assert_eq!(decode_utf8_streaming(&mut buffer).as_deref(), Some("caf"));
        assert_eq!(buffer, vec![0xC3]);

        assert_eq!(decode_utf8_streaming(&mut buffer), None);
        buffer.push(0xA9);
        assert_eq!(decode_utf8_streaming(&mut buffer).as_deref(), Some("é"));
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_decode_utf8_replaces_invalid_bytes() {
        let mut buffer = vec![b'a', 0xFF, b'b'];
        assert_eq!(decode_utf8_streaming(&mut buffer).as_deref(), Some("a\u{FFFD}"));
        assert_eq!(decode_utf8_streaming(&mut buffer).as_deref(), Some("b"));
    }

    #[test]
    fn test_scanner_joins_characters_split_across_tokens() {
        let crab = "🦀".as_bytes();
        let mut scanner = StopScanner::new();
        let steps = feed(&mut scanner, &[b"Hi ", &crab[..2], &crab[2..], b"!"]);

        assert_eq!(
            steps,
            vec![
                ScanStep::Emit("Hi ".to_string()),
                ScanStep::Emit(String::new()),
                ScanStep::Emit("🦀".to_string()),
                ScanStep::Emit("!".to_string()),
            ]
        );
        assert_eq!(scanner.flush(), "");
        assert_eq!(scanner.text(), "Hi 🦀!");
    }

    #[test]
    fn test_scanner_never_emits_split_marker() {
        let mut scanner = StopScanner::new();
        let steps = feed(&mut scanner, &[b"Done.", b"<|im", b"_end", b"|>more"]);

        assert_eq!(
            steps,
            vec![
                ScanStep::Emit("Done.".to_string()),
                ScanStep::Emit(String::new()),
                ScanStep::Emit(String::new()),
                ScanStep::Stop(String::new()),
            ]
        );
        assert_eq!(scanner.text(), "Done.");
    }

    #[test]
    fn test_scanner_releases_text_once_marker_is_ruled_out() {
        let mut scanner = StopScanner::new();
        let steps = feed(&mut scanner, &[b"a <", b"b> c</", b"div>"]);

        assert_eq!(
            steps,
            vec![
                ScanStep::Emit("a ".to_string()),
                ScanStep::Emit("<b> c".to_string()),
                ScanStep::Emit("</div>".to_string()),
            ]
        );
        assert_eq!(scanner.text(), "a <b> c</div>");
    }

    #[test]
    fn test_scanner_flushes_held_back_prefix_at_end() {
        let mut scanner = StopScanner::new();
        assert_eq!(scanner.push(b"x [IN"), ScanStep::Emit("x ".to_string()));
        assert_eq!(scanner.flush(), "[IN");
        assert_eq!(scanner.text(), "x [IN");
    }

    #[test]
    fn test_scanner_stops_mid_token() {
        let mut scanner = StopScanner::new();
        assert_eq!(
            scanner.push(b"answer</s>ignored"),
            ScanStep::Stop("answer".to_string())
        );
        assert_eq!(scanner.text(), "answer");
    }

    #[test]
    fn test_chunks_carry_single_tokens() {
        let mut translator = ChunkTranslator::new("model-a");
        let first = translator.translate("Hel");
        let second = translator.translate("lo");

        assert_eq!(first.content, "Hel");
        assert_eq!(second.content, "lo");
        assert_eq!(second.model_id, "model-a");
        assert_eq!(second.role, MessageRole::Assistant);
        assert!(second.finish_reason.is_none());
        assert!(second.tool_calls.is_empty());
        assert_eq!(translator.accumulated(), "Hello");
    }

    #[test]
    fn test_finish_uses_accumulated_text() {
        let mut translator = ChunkTranslator::new("model-a");
        let contents: Vec<String> = ["The", " answer", " is", " 42", ""]
            .iter()
            .map(|t| translator.translate(t).content)
            .collect();
        assert_eq!(translator.chunks_emitted(), 5);

        let message = translator.finish();
        assert_eq!(message.content, contents.concat());
        assert_eq!(message.model_id, "model-a");
        assert_eq!(message.role, MessageRole::Assistant);
    }
}
