//! Token counting.
//!
//! Grounded on `holon_ai/tokens.py`'s graceful-degradation path: the
//! original prefers `tiktoken` but works without it by falling back to a
//! cheap heuristic. No tokenizer crate appears anywhere in the pack's
//! dependency set, so this crate implements only that fallback path,
//! exposed as a trait so a real tokenizer can be plugged in later without
//! touching callers.

/// Something that can estimate a token count for a piece of text.
pub trait TokenCounter: Send + Sync {
    /// Count (or estimate) the number of tokens in `text`.
    fn count(&self, text: &str) -> u32;
}

/// A whitespace/byte-ratio heuristic: roughly one token per four bytes of
/// text, with a minimum of one token for any non-empty string. This mirrors
/// the rough token-per-4-chars rule of thumb used by most vendors' own
/// documentation when a real tokenizer isn't available.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicTokenCounter;

impl TokenCounter for HeuristicTokenCounter {
    fn count(&self, text: &str) -> u32 {
        if text.is_empty() {
            return 0;
        }
        let len = text.len();
        let estimate = len.div_ceil(4);
        u32::try_from(estimate).unwrap_or(u32::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_text_counts_zero() {
        assert_eq!(HeuristicTokenCounter.count(""), 0);
    }

    #[test]
    fn nonempty_text_counts_at_least_one() {
        assert!(HeuristicTokenCounter.count("hi") >= 1);
    }

    #[test]
    fn longer_text_counts_more() {
        let short = HeuristicTokenCounter.count("hello");
        let long = HeuristicTokenCounter.count(&"hello world ".repeat(20));
        assert!(long > short);
    }
}
