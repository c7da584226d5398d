/// A rejected editor mutation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EditError {
    #[error("name must not be empty")]
    EmptyName,

    #[error("an item named {0:?} already exists")]
    DuplicateItem(String),

    #[error("a tier named {0:?} already exists")]
    DuplicateTier(String),

    #[error("no item {0:?}")]
    UnknownItem(String),

    #[error("no tier {0:?}")]
    UnknownTier(String),
}

/// A tier list template that failed validation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TemplateError {
    #[error("tier name must not be empty")]
    EmptyTierName,

    #[error("duplicate tier {0:?}")]
    DuplicateTier(String),

    #[error("item name must not be empty")]
    EmptyItemName,

    #[error("duplicate item {0:?}")]
    DuplicateItem(String),
}

/// Why a chat message did not count as a vote.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VoteRejection {
    #[error("voting is closed")]
    VotingDisabled,

    #[error("empty message")]
    EmptyMessage,

    #[error("message is not an `<item> <tier>` vote")]
    NoMatch,

    #[error("voting is focused on {focus:?}, not {item:?}")]
    NotFocused { item: String, focus: String },

    #[error("no tier {0:?}")]
    UnknownTier(String),
}
