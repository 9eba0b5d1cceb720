//! Append-only history of installed rules.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use kawase_core::Symbol;

use crate::{RuleError, RuleResult, StructuredRule};

/// Ordered rule history with current-rule lookup.
///
/// Rules are immutable once stored; an update appends a new document. When no
/// installed rule covers the current instant the engine runs rule-expired:
/// no new entries, open positions keep their own `rule_snapshot`.
pub struct RuleStore {
    symbol: Symbol,
    rules: Vec<Arc<StructuredRule>>,
}

impl RuleStore {
    #[must_use]
    pub fn new(symbol: impl Into<Symbol>) -> Self {
        Self {
            symbol: symbol.into(),
            rules: Vec::new(),
        }
    }

    /// Validate and append a rule. The caller is responsible for emitting the
    /// acceptance/rejection event.
    pub fn install(&mut self, rule: StructuredRule) -> RuleResult<Arc<StructuredRule>> {
        if rule.symbol != self.symbol {
            return Err(RuleError::SymbolMismatch {
                rule: rule.symbol,
                store: self.symbol.clone(),
            });
        }
        rule.validate()?;
        let rule = Arc::new(rule);
        self.rules.push(rule.clone());
        Ok(rule)
    }

    /// Most recent rule whose validity interval contains `at`.
    #[must_use]
    pub fn current(&self, at: DateTime<Utc>) -> Option<Arc<StructuredRule>> {
        self.rules
            .iter()
            .rev()
            .find(|rule| rule.covers(at))
            .cloned()
    }

    /// Most recently installed rule regardless of validity.
    #[must_use]
    pub fn latest(&self) -> Option<Arc<StructuredRule>> {
        self.rules.last().cloned()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}
