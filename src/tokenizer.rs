//! Naive longest-prefix tokenizer over a GGUF vocabulary array. Quality
//! is explicitly not a core concern here: correctness of the streaming
//! pipeline is what the rest of the crate cares about, and this just
//! needs to produce deterministic token ids from literal prompts.

use crate::container::GgufContainer;

const SPACE_MARKER: char = '\u{2581}';

pub struct Tokenizer {
    tokens: Vec<String>,
    bos_token_id: Option<u32>,
    max_piece_len: usize,
}

impl Tokenizer {
    pub fn from_container(container: &GgufContainer) -> Self {
        let tokens = container.get_string_array("tokenizer.ggml.tokens").unwrap_or_default();
        let bos_token_id = container.get_u32("tokenizer.ggml.bos_token_id");
        let max_piece_len = tokens.iter().map(|t| t.len()).max().unwrap_or(1).max(1);
        Tokenizer { tokens, bos_token_id, max_piece_len }
    }

    fn normalize(text: &str) -> String {
        text.chars().map(|c| if c.is_whitespace() { SPACE_MARKER } else { c }).collect()
    }

    fn longest_match(&self, bytes: &[u8]) -> Option<(u32, usize)> {
        let upper = bytes.len().min(self.max_piece_len);
        for len in (1..=upper).rev() {
            if let Ok(candidate) = std::str::from_utf8(&bytes[..len]) {
                if let Some(id) = self.tokens.iter().position(|t| t == candidate) {
                    return Some((id as u32, len));
                }
            }
        }
        None
    }

    /// Normalizes whitespace, then greedily matches the longest known
    /// vocabulary piece at each position; unmatched bytes emit token 0.
    /// Prepends the BOS id, if the container declares one.
    pub fn encode(&self, text: &str) -> Vec<u32> {
        let normalized = Self::normalize(text);
        let bytes = normalized.as_bytes();
        let mut ids = Vec::new();
        if let Some(bos) = self.bos_token_id {
            ids.push(bos);
        }

        let mut pos = 0;
        while pos < bytes.len() {
            match self.longest_match(&bytes[pos..]) {
                Some((id, len)) => {
                    ids.push(id);
                    pos += len;
                }
                None => {
                    ids.push(0);
                    pos += 1;
                }
            }
        }
        ids
    }

    /// Joins piece strings for `ids`, replacing the whitespace marker
    /// back with a literal space. Out-of-range ids render as empty.
    pub fn decode(&self, ids: &[u32]) -> String {
        let mut out = String::new();
        for &id in ids {
            if let Some(piece) = self.tokens.get(id as usize) {
                out.push_str(piece);
            }
        }
        out.replace(SPACE_MARKER, " ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokenizer_with(tokens: &[&str], bos: Option<u32>) -> Tokenizer {
        let tokens = tokens.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        let max_piece_len = tokens.iter().map(|t| t.len()).max().unwrap_or(1).max(1);
        Tokenizer { tokens, bos_token_id: bos, max_piece_len }
    }

    #[test]
    fn longest_prefix_match_prefers_longer_pieces() {
        let tok = tokenizer_with(&["<unk>", "a", "ab", "abc", "b", "c"], None);
        let ids = tok.encode("abc");
        assert_eq!(ids, vec![3]);
    }

    #[test]
    fn whitespace_is_normalized_and_unmatched_bytes_fall_back_to_zero() {
        let tok = tokenizer_with(&["<unk>", "hi"], None);
        let ids = tok.encode("hi there");
        // "hi" matches; the space marker and "there" have no vocabulary
        // entries in this tiny test vocab, so every remaining byte is 0.
        assert_eq!(ids[0], 1);
        assert!(ids[1..].iter().all(|&id| id == 0));
    }

    #[test]
    fn bos_is_prepended_when_present() {
        let tok = tokenizer_with(&["<unk>", "x"], Some(1));
        let ids = tok.encode("x");
        assert_eq!(ids, vec![1, 1]);
    }

    #[test]
    fn decode_reverses_encode_for_known_pieces() {
        let marker = SPACE_MARKER.to_string();
        let tok = tokenizer_with(&["<unk>", "hi", &marker], None);
        let ids = vec![1u32, 2, 1];
        assert_eq!(tok.decode(&ids), "hi hi");
    }
}
