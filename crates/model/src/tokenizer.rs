//! Byte-pair tokenizer with a fixed, scored vocabulary.
//!
//! Vocabulary file (`MLMT`, version 1, little-endian): magic, version,
//! vocab_size, bos_id, eos_id, then per token `{ f32 score, u32 len, bytes }`.
//! Encoding is greedy: the text is split into known characters (unknown bytes
//! fall back to `<0xXX>` byte tokens), then the best-scoring adjacent merge
//! is applied until none remains.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt};

use crate::error::{ModelError, Result};

const MAGIC: [u8; 4] = *b"MLMT";
const VERSION: u32 = 1;

pub struct Tokenizer {
    pieces: Vec<Vec<u8>>,
    scores: Vec<f32>,
    lookup: HashMap<Vec<u8>, u32>,
    /// Token id for each raw byte via its `<0xXX>` piece, if present.
    byte_tokens: [Option<u32>; 256],
    bos_id: u32,
    eos_id: u32,
}

impl Tokenizer {
    pub fn from_file(path: &Path) -> Result<Self> {
        let mut reader = BufReader::new(File::open(path)?);

        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic)?;
        if magic != MAGIC {
            return Err(ModelError::InvalidFormat("not a meshlm tokenizer file".into()));
        }
        let version = reader.read_u32::<LittleEndian>()?;
        if version != VERSION {
            return Err(ModelError::UnsupportedVersion(version));
        }
        let vocab_size = reader.read_u32::<LittleEndian>()? as usize;
        let bos_id = reader.read_u32::<LittleEndian>()?;
        let eos_id = reader.read_u32::<LittleEndian>()?;

        let mut entries = Vec::with_capacity(vocab_size);
        for _ in 0..vocab_size {
            let score = reader.read_f32::<LittleEndian>()?;
            let len = reader.read_u32::<LittleEndian>()? as usize;
            let mut piece = vec![0u8; len];
            reader.read_exact(&mut piece)?;
            entries.push((piece, score));
        }

        Self::from_parts(entries, bos_id, eos_id)
    }

    /// Build from an in-memory vocabulary (file loading and tests share it).
    pub fn from_parts(entries: Vec<(Vec<u8>, f32)>, bos_id: u32, eos_id: u32) -> Result<Self> {
        let n = entries.len() as u32;
        if bos_id >= n || eos_id >= n {
            return Err(ModelError::InvalidFormat(format!(
                "bos {bos_id} / eos {eos_id} out of range for vocab of {n}"
            )));
        }

        let mut pieces = Vec::with_capacity(entries.len());
        let mut scores = Vec::with_capacity(entries.len());
        let mut lookup = HashMap::with_capacity(entries.len());
        let mut byte_tokens = [None; 256];

        for (id, (piece, score)) in entries.into_iter().enumerate() {
            if let Some(byte) = parse_byte_piece(&piece) {
                byte_tokens[byte as usize].get_or_insert(id as u32);
            }
            lookup.entry(piece.clone()).or_insert(id as u32);
            pieces.push(piece);
            scores.push(score);
        }

        Ok(Self { pieces, scores, lookup, byte_tokens, bos_id, eos_id })
    }

    pub fn vocab_size(&self) -> usize {
        self.pieces.len()
    }

    pub fn bos_id(&self) -> u32 {
        self.bos_id
    }

    pub fn eos_id(&self) -> u32 {
        self.eos_id
    }

    /// Greedy byte-pair encode.
    pub fn encode(&self, text: &str, bos: bool, eos: bool) -> Vec<u32> {
        let mut tokens: Vec<u32> = Vec::with_capacity(text.len() + 2);
        if bos {
            tokens.push(self.bos_id);
        }
        // Sentencepiece-style dummy prefix.
        if !text.is_empty() {
            if let Some(&space) = self.lookup.get(b" ".as_slice()) {
                tokens.push(space);
            }
        }

        for ch in text.chars() {
            let mut buf = [0u8; 4];
            let piece = ch.encode_utf8(&mut buf).as_bytes();
            match self.lookup.get(piece) {
                Some(&id) => tokens.push(id),
                None => {
                    for &byte in piece {
                        if let Some(id) = self.byte_tokens[byte as usize] {
                            tokens.push(id);
                        }
                    }
                }
            }
        }

        // Merge the best-scoring adjacent pair until no merge applies.
        loop {
            let mut best: Option<(usize, u32, f32)> = None;
            for i in 0..tokens.len().saturating_sub(1) {
                let mut merged = self.pieces[tokens[i] as usize].clone();
                merged.extend_from_slice(&self.pieces[tokens[i + 1] as usize]);
                if let Some(&id) = self.lookup.get(&merged) {
                    let score = self.scores[id as usize];
                    if best.map_or(true, |(_, _, s)| score > s) {
                        best = Some((i, id, score));
                    }
                }
            }
            match best {
                Some((i, id, _)) => {
                    tokens[i] = id;
                    tokens.remove(i + 1);
                }
                None => break,
            }
        }

        if eos {
            tokens.push(self.eos_id);
        }
        tokens
    }

    /// Decode one step: the piece produced by sampling `next` after `prev`.
    pub fn decode(&self, prev: u32, next: u32) -> String {
        let piece = &self.pieces[next as usize];
        if let Some(byte) = parse_byte_piece(piece) {
            return String::from_utf8_lossy(&[byte]).into_owned();
        }
        // Following BOS the sentencepiece decoder strips a leading space.
        let piece = if prev == self.bos_id && piece.first() == Some(&b' ') {
            &piece[1..]
        } else {
            piece.as_slice()
        };
        String::from_utf8_lossy(piece).into_owned()
    }

    pub fn piece(&self, id: u32) -> &[u8] {
        &self.pieces[id as usize]
    }
}

/// `<0xXX>` byte-fallback piece.
fn parse_byte_piece(piece: &[u8]) -> Option<u8> {
    if piece.len() == 6 && piece.starts_with(b"<0x") && piece.ends_with(b">") {
        let hex = std::str::from_utf8(&piece[3..5]).ok()?;
        u8::from_str_radix(hex, 16).ok()
    } else {
        None
    }
}

/// A piece is safe when it is printable text: only safe pieces take part in
/// stop-string matching and streaming output.
pub fn is_safe_piece(piece: &str) -> bool {
    if piece.is_empty() {
        return false;
    }
    let mut chars = piece.chars();
    let first = chars.next().unwrap();
    if chars.next().is_none() {
        // A single decoded byte must be printable or whitespace.
        return !first.is_control() || first.is_whitespace();
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny() -> Tokenizer {
        let entries: Vec<(Vec<u8>, f32)> = vec![
            (b"<s>".to_vec(), 0.0),     // 0: bos
            (b"</s>".to_vec(), 0.0),    // 1: eos
            (b" ".to_vec(), -1.0),      // 2
            (b"h".to_vec(), -2.0),      // 3
            (b"e".to_vec(), -2.0),      // 4
            (b"l".to_vec(), -2.0),      // 5
            (b"o".to_vec(), -2.0),      // 6
            (b"he".to_vec(), -1.5),     // 7
            (b"ll".to_vec(), -1.2),     // 8
            (b"hell".to_vec(), -1.0),   // 9
            (b"<0x0A>".to_vec(), -9.0), // 10: newline byte
            (b" hi".to_vec(), -0.5),    // 11
        ];
        Tokenizer::from_parts(entries, 0, 1).unwrap()
    }

    #[test]
    fn greedy_merge_prefers_best_score() {
        let tok = tiny();
        // " " + h e l l o -> "hell" wins over "he" + "ll", "o" stays.
        let ids = tok.encode("hello", false, false);
        assert_eq!(ids, vec![2, 9, 6]);
    }

    #[test]
    fn bos_and_eos_are_appended() {
        let tok = tiny();
        let ids = tok.encode("hello", true, true);
        assert_eq!(*ids.first().unwrap(), 0);
        assert_eq!(*ids.last().unwrap(), 1);
    }

    #[test]
    fn unknown_bytes_fall_back_to_byte_tokens() {
        let tok = tiny();
        let ids = tok.encode("\n", false, false);
        assert_eq!(ids, vec![2, 10]);
        assert_eq!(tok.decode(2, 10), "\n");
    }

    #[test]
    fn leading_space_is_stripped_after_bos() {
        let tok = tiny();
        assert_eq!(tok.decode(0, 11), "hi");
        assert_eq!(tok.decode(5, 11), " hi");
    }

    #[test]
    fn safe_piece_rules() {
        assert!(is_safe_piece("hello"));
        assert!(is_safe_piece(" "));
        assert!(is_safe_piece("\n"));
        assert!(!is_safe_piece(""));
        assert!(!is_safe_piece("\u{0}"));
    }
}
