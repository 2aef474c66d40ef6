//! Mapping between label strings and class indices

use std::collections::HashMap;

use crate::config::DEFAULT_ALPHABET;
use crate::error::{Error, Result};

/// Alphabet-backed label codec. Class `i` is the `i`-th alphabet character;
/// the blank is the class right after the alphabet.
#[derive(Debug, Clone)]
pub struct LabelCodec {
    alphabet: Vec<char>,
    index: HashMap<char, u32>,
}

impl LabelCodec {
    /// Build a codec; characters must be unique
    pub fn new(alphabet: &str) -> Result<Self> {
        let alphabet: Vec<char> = alphabet.chars().collect();
        if alphabet.is_empty() {
            return Err(Error::config("Alphabet must not be empty"));
        }

        let mut index = HashMap::with_capacity(alphabet.len());
        for (i, &c) in alphabet.iter().enumerate() {
            if index.insert(c, i as u32).is_some() {
                return Err(Error::config(format!(
                    "Alphabet contains '{c}' more than once"
                )));
            }
        }

        Ok(Self { alphabet, index })
    }

    /// Number of alphabet characters
    pub fn alphabet_size(&self) -> usize {
        self.alphabet.len()
    }

    /// Number of classes including the blank
    pub fn num_classes(&self) -> usize {
        self.alphabet.len() + 1
    }

    /// Index of the blank class
    pub fn blank(&self) -> u32 {
        self.alphabet.len() as u32
    }

    /// Encode a label string
    pub fn encode(&self, text: &str) -> Result<Vec<u32>> {
        text.chars()
            .map(|c| {
                self.index.get(&c).copied().ok_or_else(|| {
                    Error::invalid_target(format!("Character '{c}' in \"{text}\" is not in the alphabet"))
                })
            })
            .collect()
    }

    /// Decode a padded index row; padding and the blank are skipped
    pub fn decode(&self, indices: &[i64]) -> String {
        indices
            .iter()
            .filter_map(|&i| usize::try_from(i).ok())
            .filter_map(|i| self.alphabet.get(i))
            .collect()
    }

    /// Decode an unpadded index sequence
    pub fn decode_indices(&self, indices: &[u32]) -> String {
        indices
            .iter()
            .filter_map(|&i| self.alphabet.get(i as usize))
            .collect()
    }
}

impl Default for LabelCodec {
    fn default() -> Self {
        Self {
            alphabet: DEFAULT_ALPHABET.chars().collect(),
            index: DEFAULT_ALPHABET
                .chars()
                .enumerate()
                .map(|(i, c)| (c, i as u32))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_alphabet() {
        let codec = LabelCodec::default();
        assert_eq!(codec.alphabet_size(), 36);
        assert_eq!(codec.num_classes(), 37);
        assert_eq!(codec.blank(), 36);
        assert_eq!(codec.encode("a0z").unwrap(), vec![10, 0, 35]);
    }

    #[test]
    fn test_decode_skips_padding_and_blank() {
        let codec = LabelCodec::default();
        assert_eq!(codec.decode(&[17, 14, 36, 21, -1, -1]), "hel");
        assert_eq!(codec.decode_indices(&[33, 14, 28]), "xes");
    }

    #[test]
    fn test_unknown_character() {
        let codec = LabelCodec::default();
        assert!(matches!(codec.encode("A"), Err(Error::InvalidTarget(_))));
    }

    #[test]
    fn test_rejects_duplicates() {
        assert!(LabelCodec::new("abca").is_err());
        assert!(LabelCodec::new("").is_err());
    }
}
