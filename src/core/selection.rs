//! Deterministic choice of one product among catalog candidates.
//!
//! A [`SelectionStrategy`] is a predicate (which items are eligible) plus a
//! comparator (which eligible item wins). The default comparator prefers the
//! most recent acquisition and breaks timestamp ties by the lexically greater
//! identifier, so every candidate set has exactly one winner.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

use crate::types::{CatalogItem, VegError, VegResult};

/// Orders items so that the preferred one compares greatest.
pub fn most_recent(a: &CatalogItem, b: &CatalogItem) -> Ordering {
    a.datetime
        .cmp(&b.datetime)
        .then_with(|| a.id.cmp(&b.id))
}

pub trait SelectionStrategy: Send + Sync {
    /// Whether `item` is eligible at all
    fn accepts(&self, _item: &CatalogItem) -> bool {
        true
    }

    /// Preference between two eligible items (greater wins)
    fn compare(&self, a: &CatalogItem, b: &CatalogItem) -> Ordering {
        most_recent(a, b)
    }

    /// Human-readable rule, used in diagnostics
    fn describe(&self) -> String;
}

/// Latest acquisition wins
#[derive(Debug, Clone, Copy, Default)]
pub struct MostRecent;

impl SelectionStrategy for MostRecent {
    fn describe(&self) -> String {
        "most recent acquisition".to_string()
    }
}

/// Only items whose identifier contains an exact token
/// (e.g. a datatake timestamp like `20250623T101031`)
#[derive(Debug, Clone)]
pub struct IdentifierToken(pub String);

impl SelectionStrategy for IdentifierToken {
    fn accepts(&self, item: &CatalogItem) -> bool {
        item.id.contains(&self.0)
    }

    fn describe(&self) -> String {
        format!("identifier containing '{}'", self.0)
    }
}

/// Only items whose identifier matches a regular expression
#[derive(Debug, Clone)]
pub struct IdentifierPattern(pub Regex);

impl SelectionStrategy for IdentifierPattern {
    fn accepts(&self, item: &CatalogItem) -> bool {
        self.0.is_match(&item.id)
    }

    fn describe(&self) -> String {
        format!("identifier matching /{}/", self.0.as_str())
    }
}

/// Serializable form of the built-in strategies
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "rule", content = "value")]
pub enum SelectionPolicy {
    MostRecent,
    IdentifierToken(String),
    IdentifierPattern(String),
}

impl Default for SelectionPolicy {
    fn default() -> Self {
        SelectionPolicy::MostRecent
    }
}

impl SelectionPolicy {
    pub fn into_selector(self) -> VegResult<ProductSelector> {
        let strategy: Box<dyn SelectionStrategy> = match self {
            SelectionPolicy::MostRecent => Box::new(MostRecent),
            SelectionPolicy::IdentifierToken(token) => Box::new(IdentifierToken(token)),
            SelectionPolicy::IdentifierPattern(pattern) => {
                let regex = Regex::new(&pattern).map_err(|e| {
                    VegError::InvalidInput(format!("invalid identifier pattern '{}': {}", pattern, e))
                })?;
                Box::new(IdentifierPattern(regex))
            }
        };
        Ok(ProductSelector::new(strategy))
    }
}

pub struct ProductSelector {
    strategy: Box<dyn SelectionStrategy>,
}

impl Default for ProductSelector {
    fn default() -> Self {
        Self::new(Box::new(MostRecent))
    }
}

impl ProductSelector {
    pub fn new(strategy: Box<dyn SelectionStrategy>) -> Self {
        Self { strategy }
    }

    pub fn describe(&self) -> String {
        self.strategy.describe()
    }

    /// Pick the single preferred item.
    ///
    /// Fails with [`VegError::Selection`] when `items` is empty or when no
    /// item passes the strategy's predicate.
    pub fn select<'i>(&self, items: &'i [CatalogItem]) -> VegResult<&'i CatalogItem> {
        if items.is_empty() {
            return Err(VegError::Selection(
                "no candidate items to select from".to_string(),
            ));
        }

        let chosen = items
            .iter()
            .filter(|item| self.strategy.accepts(item))
            .max_by(|a, b| self.strategy.compare(a, b))
            .ok_or_else(|| {
                VegError::Selection(format!(
                    "none of {} candidate(s) matches {}",
                    items.len(),
                    self.strategy.describe()
                ))
            })?;

        log::info!(
            "Selected {} - date {} - cloud {:.1}% ({})",
            chosen.id,
            chosen.datetime.date_naive(),
            chosen.cloud_cover,
            self.strategy.describe()
        );
        Ok(chosen)
    }
}
