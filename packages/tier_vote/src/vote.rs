//! Chat message → vote parsing.
//!
//! A vote is a whole message of the form `<item name> <tier name>`. Both
//! halves are matched against the current names, escaped, longest first, so
//! `item2 A` prefers the item `item2` over `item`. When names contain spaces
//! a message can split more than one valid way; the split with the longest
//! item always wins and the other reading is unreachable.

use regex::Regex;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoteMatch<'a> {
    pub item: &'a str,
    pub tier: &'a str,
}

#[derive(Debug, Clone, Default)]
pub struct VotePattern {
    regex: Option<Regex>,
}

fn alternation<'a>(names: impl Iterator<Item = &'a str>) -> Option<String> {
    let mut names: Vec<&str> = names.filter(|n| !n.is_empty()).collect();
    if names.is_empty() {
        return None;
    }
    names.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
    names.dedup();
    Some(
        names
            .iter()
            .map(|n| regex::escape(n))
            .collect::<Vec<_>>()
            .join("|"),
    )
}

impl VotePattern {
    /// Build the matcher for the given item and tier names. With no items or
    /// no tiers nothing matches.
    pub fn build<'a>(
        items: impl Iterator<Item = &'a str>,
        tiers: impl Iterator<Item = &'a str>,
    ) -> Self {
        let (Some(items), Some(tiers)) = (alternation(items), alternation(tiers)) else {
            return Self { regex: None };
        };
        let source = format!("^(?P<item>{items}) (?P<tier>{tiers})$");
        match Regex::new(&source) {
            Ok(regex) => Self { regex: Some(regex) },
            Err(e) => {
                warn!(error = %e, "vote pattern failed to compile; votes disabled");
                Self { regex: None }
            }
        }
    }

    /// Match a trimmed message.
    pub fn parse<'a>(&self, message: &'a str) -> Option<VoteMatch<'a>> {
        let caps = self.regex.as_ref()?.captures(message.trim())?;
        Some(VoteMatch {
            item: caps.name("item")?.as_str(),
            tier: caps.name("tier")?.as_str(),
        })
    }
}
