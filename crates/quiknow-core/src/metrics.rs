//! Context size metrics.
//!
//! Token counts are estimated from character length (≈3.7 chars per token
//! for mixed CJK/Latin text); no tokenizer is loaded.

use serde::{Deserialize, Serialize};

/// Approximate token count of `text`.
pub fn estimate_tokens(text: &str) -> usize {
    if text.is_empty() {
        return 0;
    }
    (text.chars().count() as f64 / 3.7) as usize + 1
}

/// Aggregate size of a set of context blocks.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockStats {
    pub chars: usize,
    pub tokens: usize,
    pub blocks: usize,
}

pub fn summarize_blocks<S: AsRef<str>>(blocks: &[S]) -> BlockStats {
    BlockStats {
        chars: blocks.iter().map(|b| b.as_ref().chars().count()).sum(),
        tokens: blocks.iter().map(|b| estimate_tokens(b.as_ref())).sum(),
        blocks: blocks.len(),
    }
}

/// Size of the context assembled for one answer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextMetrics {
    pub expanded_chars: usize,
    pub expanded_tokens: usize,
    pub leaf_stats: BlockStats,
    pub sql_chars: usize,
    pub sql_tokens: usize,
}

impl ContextMetrics {
    pub fn measure<S: AsRef<str>>(expanded: &str, leaves: &[S], sql_block: &str) -> Self {
        Self {
            expanded_chars: expanded.chars().count(),
            expanded_tokens: estimate_tokens(expanded),
            leaf_stats: summarize_blocks(leaves),
            sql_chars: sql_block.chars().count(),
            sql_tokens: estimate_tokens(sql_block),
        }
    }
}
