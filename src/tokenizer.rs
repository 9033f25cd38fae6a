use std::path::Path;

use tokenizers::{FromPretrainedParameters, Tokenizer};

use crate::{
    error::ServiceError,
    model::{Offset, TokenizeResponse},
};

/// Strings commonly registered as the end-of-sequence token.
const EOS_CANDIDATES: [&str; 4] = ["</s>", "<|endoftext|>", "<|end_of_text|>", "<|eot_id|>"];

/// Flags of a Tokenize call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenizeOptions {
    pub return_tokens: bool,
    pub return_offsets: bool,
    pub truncate_input_tokens: Option<u32>,
}

pub struct TokenizerAdapter {
    inner: Tokenizer,
    eos_token_id: Option<u32>,
}

impl TokenizerAdapter {
    pub fn new(inner: Tokenizer) -> Self {
        let eos_token_id = EOS_CANDIDATES
            .iter()
            .find_map(|token| inner.token_to_id(token));
        tracing::debug!(
            vocab_size = inner.get_vocab_size(true),
            ?eos_token_id,
            "tokenizer ready"
        );
        Self {
            inner,
            eos_token_id,
        }
    }

    pub fn from_file(path: &Path) -> Result<Self, ServiceError> {
        let inner = Tokenizer::from_file(path).map_err(|e| ServiceError::Tokenizer(e.to_string()))?;
        Ok(Self::new(inner))
    }

    /// Downloads `tokenizer.json` for `model_id` from the Hugging Face hub.
    pub fn from_pretrained(model_id: &str, revision: Option<&str>) -> Result<Self, ServiceError> {
        let params = revision.map(|revision| FromPretrainedParameters {
            revision: revision.to_string(),
            ..Default::default()
        });
        let inner = Tokenizer::from_pretrained(model_id, params)
            .map_err(|e| ServiceError::Tokenizer(e.to_string()))?;
        Ok(Self::new(inner))
    }

    pub fn eos_token_id(&self) -> Option<u32> {
        self.eos_token_id
    }

    pub fn encode(&self, text: &str) -> Result<Vec<u32>, ServiceError> {
        let encoding = self
            .inner
            .encode(text, true)
            .map_err(|e| ServiceError::Tokenizer(e.to_string()))?;
        Ok(encoding.get_ids().to_vec())
    }

    /// Encodes `text` keeping only the most recent `limit` tokens.
    pub fn encode_truncated(&self, text: &str, limit: Option<u32>) -> Result<Vec<u32>, ServiceError> {
        let mut ids = self.encode(text)?;
        let keep = keep_from(ids.len(), limit);
        ids.drain(..keep);
        Ok(ids)
    }

    /// Decodes generated ids, dropping special tokens such as EOS.
    pub fn decode(&self, ids: &[u32]) -> Result<String, ServiceError> {
        self.inner
            .decode(ids, true)
            .map_err(|e| ServiceError::Tokenizer(e.to_string()))
    }

    /// Raw vocabulary string of a single token.
    pub fn token_text(&self, id: u32) -> String {
        self.inner.id_to_token(id).unwrap_or_default()
    }

    pub fn tokenize(
        &self,
        text: &str,
        options: TokenizeOptions,
    ) -> Result<TokenizeResponse, ServiceError> {
        let encoding = self
            .inner
            .encode_char_offsets(text, true)
            .map_err(|e| ServiceError::Tokenizer(e.to_string()))?;
        let start = keep_from(encoding.len(), options.truncate_input_tokens);

        let tokens = if options.return_tokens {
            encoding.get_tokens()[start..].to_vec()
        } else {
            Vec::new()
        };
        let offsets = if options.return_offsets {
            encoding.get_offsets()[start..]
                .iter()
                .map(|&(start, end)| Offset {
                    start: start as u32,
                    end: end as u32,
                })
                .collect()
        } else {
            Vec::new()
        };

        Ok(TokenizeResponse {
            token_count: (encoding.len() - start) as u32,
            tokens,
            offsets,
        })
    }
}

/// Index of the first token kept when truncating `len` tokens to `limit`.
fn keep_from(len: usize, limit: Option<u32>) -> usize {
    match limit {
        Some(limit) => len.saturating_sub(limit as usize),
        None => 0,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn fixture() -> TokenizerAdapter {
        let path = concat!(env!("CARGO_MANIFEST_DIR"), "/tests/fixtures/tokenizer.json");
        TokenizerAdapter::from_file(Path::new(path)).unwrap()
    }

    #[test]
    fn finds_eos_token() {
        assert_eq!(fixture().eos_token_id(), Some(256));
    }

    #[test]
    fn decode_inverts_encode() {
        let tokenizer = fixture();
        for text in [
            "Hello",
            "Please answer the following question.\nhow far is Paris from New York?",
            "  leading and trailing  ",
            "tabs\tand ümlauts, 漢字 too",
        ] {
            let ids = tokenizer.encode(text).unwrap();
            assert_eq!(tokenizer.decode(&ids).unwrap(), text);
        }
    }

    #[test]
    fn decode_skips_special_tokens() {
        let tokenizer = fixture();
        let mut ids = tokenizer.encode("ok").unwrap();
        ids.push(256);
        assert_eq!(tokenizer.decode(&ids).unwrap(), "ok");
    }

    #[test]
    fn truncation_keeps_the_most_recent_tokens() {
        let tokenizer = fixture();
        let ids = tokenizer.encode_truncated("abcdef", Some(3)).unwrap();
        assert_eq!(tokenizer.decode(&ids).unwrap(), "def");
        assert_eq!(tokenizer.encode_truncated("ab", Some(3)).unwrap().len(), 2);
        assert_eq!(tokenizer.encode_truncated("abcdef", None).unwrap().len(), 6);
    }

    #[test]
    fn tokenize_reports_tokens_and_offsets() {
        let tokenizer = fixture();
        let response = tokenizer
            .tokenize(
                "abc",
                TokenizeOptions {
                    return_tokens: true,
                    return_offsets: true,
                    truncate_input_tokens: None,
                },
            )
            .unwrap();
        assert_eq!(response.token_count, 3);
        assert_eq!(response.tokens, vec!["a", "b", "c"]);
        assert_eq!(
            response.offsets,
            vec![
                Offset { start: 0, end: 1 },
                Offset { start: 1, end: 2 },
                Offset { start: 2, end: 3 },
            ]
        );
    }

    #[test]
    fn tokenize_truncation_is_idempotent() {
        let tokenizer = fixture();
        let options = TokenizeOptions {
            return_offsets: true,
            truncate_input_tokens: Some(4),
            ..Default::default()
        };
        let first = tokenizer.tokenize("truncate me please", options).unwrap();
        assert_eq!(first.token_count, 4);
        assert_eq!(first.offsets.first().map(|o| o.start), Some(14));

        let ids = tokenizer.encode_truncated("truncate me please", Some(4)).unwrap();
        let text = tokenizer.decode(&ids).unwrap();
        let again = tokenizer.tokenize(&text, options).unwrap();
        assert_eq!(again.token_count, 4);
    }

    #[test]
    fn tokenize_omits_unrequested_fields() {
        let response = fixture().tokenize("abc", TokenizeOptions::default()).unwrap();
        assert_eq!(response.token_count, 3);
        assert!(response.tokens.is_empty());
        assert!(response.offsets.is_empty());
    }
}
