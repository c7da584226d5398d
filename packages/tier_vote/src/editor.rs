//! Per-channel tier list editor.
//!
//! An [`Editor`] owns one channel's [`TierListState`]. Every successful
//! mutation bumps the state version and schedules a debounced save:
//!
//! ```text
//!            mutate                 timer fires
//!   Idle ───────────▶ Pending ─────────────────▶ Saving ──done──▶ Idle
//!                        ▲                          │
//!                        │ done                     │ mutate
//!                        └────────── SavingDirty ◀──┘
//! ```
//!
//! A burst of mutations inside one delay window produces a single save, a
//! mutation during a save produces exactly one follow-up save, and saves of
//! one editor never overlap.

use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::Result;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::error::{EditError, VoteRejection};
use crate::metrics::IngestMetrics;
use crate::models::{Item, ItemTally, Tier, TierListState, ValidTemplate, new_id};
use crate::repository::StateStore;
use crate::vote::VotePattern;

/// Shared collaborators every editor needs.
#[derive(Clone)]
pub struct EditorContext {
    pub store: Arc<dyn StateStore>,
    pub metrics: Arc<IngestMetrics>,
    /// Debounce window between the first unsaved mutation and its save.
    pub save_delay: Duration,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ItemPatch {
    pub name: Option<String>,
    pub image_url: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TierPatch {
    pub name: Option<String>,
    pub color: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SaveState {
    Idle,
    Pending,
    Saving,
    SavingDirty,
}

struct Contents {
    state: TierListState,
    pattern: VotePattern,
}

impl Contents {
    fn new(state: TierListState) -> Self {
        let mut contents = Self {
            state,
            pattern: VotePattern::default(),
        };
        contents.rebuild_pattern();
        contents
    }

    fn rebuild_pattern(&mut self) {
        self.pattern = VotePattern::build(
            self.state.items.keys().map(String::as_str),
            self.state.tiers.iter().map(|t| t.name.as_str()),
        );
    }

    /// Record a successful mutation.
    fn commit(&mut self, names_changed: bool) {
        self.state.version = next_version(self.state.version);
        if names_changed {
            self.rebuild_pattern();
        }
    }
}

fn next_version(previous: i64) -> i64 {
    chrono::Utc::now().timestamp_millis().max(previous + 1)
}

fn clean_name(name: &str) -> Result<String, EditError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(EditError::EmptyName);
    }
    Ok(name.to_string())
}

pub struct Editor {
    channel_id: String,
    ctx: EditorContext,
    contents: Mutex<Contents>,
    save_state: Mutex<SaveState>,
    /// Held for the duration of every store write.
    save_lock: tokio::sync::Mutex<()>,
    this: Weak<Editor>,
}

impl Editor {
    pub fn new(channel_id: impl Into<String>, state: TierListState, ctx: EditorContext) -> Arc<Self> {
        let channel_id = channel_id.into();
        Arc::new_cyclic(|this| Self {
            channel_id,
            ctx,
            contents: Mutex::new(Contents::new(state)),
            save_state: Mutex::new(SaveState::Idle),
            save_lock: tokio::sync::Mutex::new(()),
            this: this.clone(),
        })
    }

    /// Load the channel's stored state, or start from a fresh list.
    pub async fn load(channel_id: &str, ctx: EditorContext) -> Result<Arc<Self>> {
        let state = match ctx.store.get_state(channel_id).await? {
            Some(state) => {
                debug!(channel_id, version = state.version, "loaded tier list");
                state
            }
            None => {
                info!(channel_id, "no stored tier list; starting fresh");
                TierListState::default()
            }
        };
        Ok(Self::new(channel_id, state, ctx))
    }

    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    pub fn snapshot(&self) -> TierListState {
        self.contents.lock().state.clone()
    }

    pub fn version(&self) -> i64 {
        self.contents.lock().state.version
    }

    /// Per-item vote counts, one count per tier in tier order.
    pub fn tally(&self) -> Vec<ItemTally> {
        let contents = self.contents.lock();
        let tiers = contents.state.tiers.len();
        contents
            .state
            .items
            .iter()
            .map(|(name, item)| {
                let mut counts = vec![0; tiers];
                for &tier in item.votes.values() {
                    if let Some(count) = counts.get_mut(tier) {
                        *count += 1;
                    }
                }
                ItemTally {
                    name: name.clone(),
                    counts,
                }
            })
            .collect()
    }

    /// Replace tiers and items wholesale. Votes and focus are cleared.
    pub fn overwrite(&self, template: ValidTemplate) {
        {
            let mut contents = self.contents.lock();
            contents.state.tiers = template
                .tiers()
                .iter()
                .map(|t| Tier {
                    id: new_id(),
                    name: t.name.clone(),
                    color: t.color.clone(),
                })
                .collect();
            contents.state.items = template
                .items()
                .iter()
                .map(|i| {
                    let item = Item {
                        id: new_id(),
                        image_url: i.image_url.clone(),
                        votes: Default::default(),
                    };
                    (i.name.clone(), item)
                })
                .collect();
            contents.state.focus = None;
            contents.commit(true);
        }
        info!(channel_id = %self.channel_id, "tier list overwritten");
        self.mark_dirty();
    }

    pub fn set_voting(&self, enabled: bool) {
        {
            let mut contents = self.contents.lock();
            contents.state.is_voting = enabled;
            contents.commit(false);
        }
        info!(channel_id = %self.channel_id, enabled, "voting toggled");
        self.mark_dirty();
    }

    /// Restrict votes to one item, or lift the restriction with `None`.
    pub fn set_focus(&self, item: Option<&str>) -> Result<(), EditError> {
        {
            let mut contents = self.contents.lock();
            if let Some(name) = item {
                if !contents.state.items.contains_key(name) {
                    return Err(EditError::UnknownItem(name.to_string()));
                }
            }
            contents.state.focus = item.map(str::to_string);
            contents.commit(false);
        }
        self.mark_dirty();
        Ok(())
    }

    pub fn add_item(&self, name: &str, image_url: &str) -> Result<String, EditError> {
        let name = clean_name(name)?;
        let id = new_id();
        {
            let mut contents = self.contents.lock();
            if contents.state.items.contains_key(&name) {
                return Err(EditError::DuplicateItem(name));
            }
            contents.state.items.insert(
                name,
                Item {
                    id: id.clone(),
                    image_url: image_url.to_string(),
                    votes: Default::default(),
                },
            );
            contents.commit(true);
        }
        self.mark_dirty();
        Ok(id)
    }

    /// Remove an item by id or name. Returns whether anything was removed.
    pub fn remove_item(&self, id_or_name: &str) -> bool {
        {
            let mut contents = self.contents.lock();
            let name = if contents.state.items.contains_key(id_or_name) {
                Some(id_or_name.to_string())
            } else {
                contents.state.item_name_by_id(id_or_name).map(str::to_string)
            };
            let Some(name) = name else { return false };
            contents.state.items.remove(&name);
            if contents.state.focus.as_deref() == Some(name.as_str()) {
                contents.state.focus = None;
            }
            contents.commit(true);
        }
        self.mark_dirty();
        true
    }

    /// Rename an item or change its image. Id and votes are kept.
    pub fn update_item(&self, id: &str, patch: ItemPatch) -> Result<(), EditError> {
        let new_name = patch.name.as_deref().map(clean_name).transpose()?;
        {
            let mut contents = self.contents.lock();
            let old_name = contents
                .state
                .item_name_by_id(id)
                .map(str::to_string)
                .ok_or_else(|| EditError::UnknownItem(id.to_string()))?;

            let renamed = match new_name {
                Some(new_name) if new_name != old_name => {
                    if contents.state.items.contains_key(&new_name) {
                        return Err(EditError::DuplicateItem(new_name));
                    }
                    if let Some(item) = contents.state.items.remove(&old_name) {
                        contents.state.items.insert(new_name.clone(), item);
                    }
                    if contents.state.focus.as_deref() == Some(old_name.as_str()) {
                        contents.state.focus = Some(new_name.clone());
                    }
                    Some(new_name)
                }
                _ => None,
            };

            let key = renamed.clone().unwrap_or(old_name);
            if let (Some(url), Some(item)) = (patch.image_url, contents.state.items.get_mut(&key)) {
                item.image_url = url;
            }
            contents.commit(renamed.is_some());
        }
        self.mark_dirty();
        Ok(())
    }

    pub fn add_tier(&self, name: &str, color: &str) -> Result<String, EditError> {
        let name = clean_name(name)?;
        let id = new_id();
        {
            let mut contents = self.contents.lock();
            if contents.state.tier_index(&name).is_some() {
                return Err(EditError::DuplicateTier(name));
            }
            contents.state.tiers.push(Tier {
                id: id.clone(),
                name,
                color: color.to_string(),
            });
            contents.commit(true);
        }
        self.mark_dirty();
        Ok(id)
    }

    pub fn update_tier(&self, id: &str, patch: TierPatch) -> Result<(), EditError> {
        let new_name = patch.name.as_deref().map(clean_name).transpose()?;
        {
            let mut contents = self.contents.lock();
            let index = contents
                .state
                .tiers
                .iter()
                .position(|t| t.id == id)
                .ok_or_else(|| EditError::UnknownTier(id.to_string()))?;

            let mut renamed = false;
            if let Some(new_name) = new_name {
                if contents.state.tiers[index].name != new_name {
                    if contents.state.tier_index(&new_name).is_some() {
                        return Err(EditError::DuplicateTier(new_name));
                    }
                    contents.state.tiers[index].name = new_name;
                    renamed = true;
                }
            }
            if let Some(color) = patch.color {
                contents.state.tiers[index].color = color;
            }
            contents.commit(renamed);
        }
        self.mark_dirty();
        Ok(())
    }

    /// Remove a tier. Votes for it are dropped; votes for later tiers shift
    /// down one place. Returns whether anything was removed.
    pub fn remove_tier(&self, id: &str) -> bool {
        {
            let mut contents = self.contents.lock();
            let Some(index) = contents.state.tiers.iter().position(|t| t.id == id) else {
                return false;
            };
            contents.state.tiers.remove(index);
            for item in contents.state.items.values_mut() {
                item.votes.retain(|_, tier| *tier != index);
                for tier in item.votes.values_mut() {
                    if *tier > index {
                        *tier -= 1;
                    }
                }
            }
            contents.commit(true);
        }
        self.mark_dirty();
        true
    }

    pub fn clear_votes(&self) {
        {
            let mut contents = self.contents.lock();
            for item in contents.state.items.values_mut() {
                item.votes.clear();
            }
            contents.commit(false);
        }
        self.mark_dirty();
    }

    /// Apply a chat message as `voter_id`'s vote.
    pub fn vote(&self, voter_id: &str, message: &str) -> Result<(), VoteRejection> {
        {
            let mut contents = self.contents.lock();
            if !contents.state.is_voting {
                return Err(VoteRejection::VotingDisabled);
            }
            let message = message.trim();
            if message.is_empty() {
                return Err(VoteRejection::EmptyMessage);
            }
            let (item, tier) = match contents.pattern.parse(message) {
                Some(m) => (m.item.to_string(), m.tier.to_string()),
                None => return Err(VoteRejection::NoMatch),
            };
            if let Some(focus) = &contents.state.focus {
                if *focus != item {
                    return Err(VoteRejection::NotFocused {
                        item,
                        focus: focus.clone(),
                    });
                }
            }
            let tier_index = contents
                .state
                .tier_index(&tier)
                .ok_or(VoteRejection::UnknownTier(tier))?;
            let Some(entry) = contents.state.items.get_mut(&item) else {
                return Err(VoteRejection::NoMatch);
            };
            let previous = entry.votes.insert(voter_id.to_string(), tier_index);
            if previous == Some(tier_index) {
                return Ok(());
            }
            contents.commit(false);
            debug!(channel_id = %self.channel_id, voter_id, item = %item, tier_index, "vote recorded");
        }
        self.mark_dirty();
        Ok(())
    }

    /// Write the current state to the store now. Failures are logged and
    /// returned; the next mutation schedules another attempt.
    pub async fn save(&self) -> Result<()> {
        let _guard = self.save_lock.lock().await;
        let snapshot = self.snapshot();
        match self.ctx.store.set_state(&self.channel_id, &snapshot).await {
            Ok(()) => {
                debug!(channel_id = %self.channel_id, version = snapshot.version, "tier list saved");
                self.ctx.metrics.save_succeeded();
                Ok(())
            }
            Err(e) => {
                error!(channel_id = %self.channel_id, error = %e, "failed to save tier list");
                self.ctx.metrics.save_failed();
                Err(e)
            }
        }
    }

    fn mark_dirty(&self) {
        let schedule = {
            let mut state = self.save_state.lock();
            match *state {
                SaveState::Idle => {
                    *state = SaveState::Pending;
                    true
                }
                SaveState::Saving => {
                    *state = SaveState::SavingDirty;
                    false
                }
                SaveState::Pending | SaveState::SavingDirty => false,
            }
        };
        if schedule {
            self.schedule_save();
        }
    }

    /// The scheduled task owns a strong handle, so an editor with unsaved
    /// changes stays alive until they are written.
    fn schedule_save(&self) {
        let Some(editor) = self.this.upgrade() else {
            warn!(channel_id = %self.channel_id, "editor dropped with unsaved changes");
            return;
        };
        let delay = self.ctx.save_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            editor.debounced_save().await;
        });
    }

    async fn debounced_save(&self) {
        {
            let mut state = self.save_state.lock();
            if *state != SaveState::Pending {
                return;
            }
            *state = SaveState::Saving;
        }

        // Logged inside; a failure waits for the next mutation.
        let _ = self.save().await;

        let again = {
            let mut state = self.save_state.lock();
            let again = *state == SaveState::SavingDirty;
            *state = if again {
                SaveState::Pending
            } else {
                SaveState::Idle
            };
            again
        };
        if again {
            self.schedule_save();
        }
    }
}
