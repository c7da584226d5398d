use std::collections::{BTreeMap, HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::error::TemplateError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tier {
    pub id: String,
    pub name: String,
    pub color: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    pub id: String,
    #[serde(default)]
    pub image_url: String,
    /// voter id → tier index
    #[serde(default)]
    pub votes: HashMap<String, usize>,
}

/// Everything an editor owns for one channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierListState {
    pub tiers: Vec<Tier>,
    /// item name → item
    pub items: BTreeMap<String, Item>,
    #[serde(default)]
    pub is_voting: bool,
    #[serde(default)]
    pub focus: Option<String>,
    /// Millisecond timestamp; strictly increases with every mutation.
    #[serde(default)]
    pub version: i64,
}

const DEFAULT_TIERS: [(&str, &str); 6] = [
    ("S", "#ff7f7f"),
    ("A", "#ffbf7f"),
    ("B", "#ffdf7f"),
    ("C", "#ffff7f"),
    ("D", "#bfff7f"),
    ("F", "#7fbfff"),
];

impl Default for TierListState {
    /// A fresh list: the classic S–F tiers, no items, voting off.
    fn default() -> Self {
        Self {
            tiers: DEFAULT_TIERS
                .iter()
                .map(|(name, color)| Tier {
                    id: new_id(),
                    name: name.to_string(),
                    color: color.to_string(),
                })
                .collect(),
            items: BTreeMap::new(),
            is_voting: false,
            focus: None,
            version: 0,
        }
    }
}

impl TierListState {
    pub fn tier_index(&self, name: &str) -> Option<usize> {
        self.tiers.iter().position(|t| t.name == name)
    }

    pub fn item_name_by_id(&self, id: &str) -> Option<&str> {
        self.items
            .iter()
            .find(|(_, item)| item.id == id)
            .map(|(name, _)| name.as_str())
    }
}

pub(crate) fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierTemplate {
    pub name: String,
    #[serde(default)]
    pub color: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemTemplate {
    pub name: String,
    #[serde(default)]
    pub image_url: String,
}

/// Caller-supplied tiers and items, not yet checked.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierListTemplate {
    #[serde(default)]
    pub tiers: Vec<TierTemplate>,
    #[serde(default)]
    pub items: Vec<ItemTemplate>,
}

/// A template whose names are non-empty, trimmed and unique.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidTemplate {
    tiers: Vec<TierTemplate>,
    items: Vec<ItemTemplate>,
}

impl ValidTemplate {
    pub fn tiers(&self) -> &[TierTemplate] {
        &self.tiers
    }

    pub fn items(&self) -> &[ItemTemplate] {
        &self.items
    }
}

impl TierListTemplate {
    pub fn validate(self) -> Result<ValidTemplate, TemplateError> {
        let mut seen = HashSet::new();
        let mut tiers = Vec::with_capacity(self.tiers.len());
        for tier in self.tiers {
            let name = tier.name.trim().to_string();
            if name.is_empty() {
                return Err(TemplateError::EmptyTierName);
            }
            if !seen.insert(name.clone()) {
                return Err(TemplateError::DuplicateTier(name));
            }
            tiers.push(TierTemplate {
                name,
                color: tier.color,
            });
        }

        let mut seen = HashSet::new();
        let mut items = Vec::with_capacity(self.items.len());
        for item in self.items {
            let name = item.name.trim().to_string();
            if name.is_empty() {
                return Err(TemplateError::EmptyItemName);
            }
            if !seen.insert(name.clone()) {
                return Err(TemplateError::DuplicateItem(name));
            }
            items.push(ItemTemplate {
                name,
                image_url: item.image_url,
            });
        }

        Ok(ValidTemplate { tiers, items })
    }
}

/// Vote counts for one item, indexed like the tiers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ItemTally {
    pub name: String,
    pub counts: Vec<usize>,
}
