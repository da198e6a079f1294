//! Keyword auto-reply rules

use parking_lot::RwLock;
use tracing::info;

use crate::error::PayloadError;
use crate::types::AutoReplyRule;

/// A rule that matched an inbound text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AutoReplyMatch {
    pub rule_index: usize,
    pub keyword: String,
    pub reply: String,
}

/// Ordered rule set. Every matching rule fires; rules are never removed.
#[derive(Default)]
pub struct AutoReplyEngine {
    rules: RwLock<Vec<AutoReplyRule>>,
}

impl AutoReplyEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a rule. Duplicate keywords are kept and fire once each.
    pub fn add_rule(&self, keyword: String, reply: String) -> Result<(), PayloadError> {
        if keyword.trim().is_empty() {
            return Err(PayloadError::EmptyKeyword);
        }

        let mut rules = self.rules.write();
        info!("Auto-reply rule #{} added for keyword {:?}", rules.len(), keyword);
        rules.push(AutoReplyRule { keyword, reply });
        Ok(())
    }

    pub fn rules(&self) -> Vec<AutoReplyRule> {
        self.rules.read().clone()
    }

    /// Case-insensitive substring scan over all rules, in insertion order
    pub fn evaluate(&self, inbound_text: &str) -> Vec<AutoReplyMatch> {
        let haystack = inbound_text.to_lowercase();

        self.rules
            .read()
            .iter()
            .enumerate()
            .filter(|(_, rule)| haystack.contains(&rule.keyword.to_lowercase()))
            .map(|(rule_index, rule)| AutoReplyMatch {
                rule_index,
                keyword: rule.keyword.clone(),
                reply: rule.reply.clone(),
            })
            .collect()
    }
}
