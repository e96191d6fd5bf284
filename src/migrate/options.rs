use std::collections::{HashMap, HashSet};

use crate::model::source::SourceCard;

/// Allow-list of card ids or short-links, compared case-insensitively.
#[derive(Debug, Clone, Default)]
pub struct InclusionFilter {
    keys: HashSet<String>,
}

impl InclusionFilter {
    pub fn new<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            keys: keys
                .into_iter()
                .map(|k| k.as_ref().trim().to_lowercase())
                .filter(|k| !k.is_empty())
                .collect(),
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.keys.contains(&key.to_lowercase())
    }

    pub fn includes(&self, card: &SourceCard) -> bool {
        self.contains(&card.id) || self.contains(&card.short_link)
    }
}

#[derive(Debug, Clone, Default)]
pub struct MigrationOptions {
    /// Trello member id -> GitLab user id.
    pub members: HashMap<String, u64>,
    /// `(trello username, gitlab username)`, applied in order.
    pub mentions: Vec<(String, String)>,
    /// Trello label id -> GitLab label name.
    pub labels: HashMap<String, String>,
    /// Trello label id -> GitLab milestone iid.
    pub label_milestones: HashMap<String, u64>,
    /// Trello list id -> GitLab milestone iid.
    pub list_milestones: HashMap<String, u64>,
    /// `None` includes every card.
    pub include: Option<InclusionFilter>,
    pub preserve_authorship: bool,
}

impl MigrationOptions {
    pub fn includes(&self, card: &SourceCard) -> bool {
        self.include.as_ref().map_or(true, |f| f.includes(card))
    }

    /// GitLab user to act as for the given Trello member, when impersonation is on.
    pub fn acting_user(&self, member_id: &str) -> Option<u64> {
        if !self.preserve_authorship {
            return None;
        }
        self.members.get(member_id).copied()
    }

    /// Every GitLab user that may be impersonated during a run, deduplicated.
    pub fn impersonated_users(&self) -> Vec<u64> {
        let mut users: Vec<u64> = self.members.values().copied().collect();
        users.sort_unstable();
        users.dedup();
        users
    }

    pub fn has_milestone_associations(&self) -> bool {
        !self.label_milestones.is_empty() || !self.list_milestones.is_empty()
    }
}
