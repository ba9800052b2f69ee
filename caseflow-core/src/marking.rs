use crate::error::EngineError;
use crate::spec::CondId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The distribution of control tokens across a case's conditions.
///
/// Ordinary conditions carry 0 or 1 tokens; multiple-instance join
/// conditions may transiently accumulate more. Counts never go negative:
/// consuming from an empty condition is an invariant violation, not a
/// saturating subtract.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Marking {
    tokens: BTreeMap<CondId, u32>,
}

impl Marking {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self, cond: CondId) -> u32 {
        self.tokens.get(&cond).copied().unwrap_or(0)
    }

    pub fn marked(&self, cond: CondId) -> bool {
        self.count(cond) > 0
    }

    /// Deposit one token.
    pub fn produce(&mut self, cond: CondId) {
        *self.tokens.entry(cond).or_insert(0) += 1;
    }

    /// Remove one token. Errors when the condition holds none.
    pub fn consume(&mut self, cond: CondId) -> Result<(), EngineError> {
        match self.tokens.get_mut(&cond) {
            Some(count) if *count > 1 => {
                *count -= 1;
                Ok(())
            }
            Some(_) => {
                self.tokens.remove(&cond);
                Ok(())
            }
            None => Err(EngineError::invariant(format!(
                "consume from empty condition {cond:?}"
            ))),
        }
    }

    /// Remove every token from the condition (cancellation regions).
    /// Returns how many were removed.
    pub fn drain(&mut self, cond: CondId) -> u32 {
        self.tokens.remove(&cond).unwrap_or(0)
    }

    /// Conditions currently holding at least one token.
    pub fn marked_conditions(&self) -> impl Iterator<Item = CondId> + '_ {
        self.tokens.keys().copied()
    }

    pub fn total_tokens(&self) -> u32 {
        self.tokens.values().sum()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}
