use std::collections::HashMap;

use anyhow::{Context, Result};
use tracing::debug;

use super::transform::{has_marker_token, marks_card};
use crate::model::source::SourceCard;
use crate::model::target::{TargetItem, TargetNote};
use crate::providers::TargetClient;

#[derive(Debug, Clone)]
pub enum Resolution {
    /// An issue carries this card's migration marker.
    Marked(TargetItem),
    /// No marker anywhere, but exactly one unmarked issue has the card's title.
    TitleMatch(TargetItem),
    Unresolved,
}

impl Resolution {
    pub fn item(&self) -> Option<&TargetItem> {
        match self {
            Self::Marked(item) | Self::TitleMatch(item) => Some(item),
            Self::Unresolved => None,
        }
    }
}

/// Card → issue lookup with a lazily filled per-run note cache.
#[derive(Debug, Default)]
pub struct ReferenceIndex {
    /// Keyed by issue `id`.
    notes: HashMap<u64, Vec<TargetNote>>,
}

impl ReferenceIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Notes of an issue, fetched on first use.
    pub async fn notes(
        &mut self,
        target: &dyn TargetClient,
        item: &TargetItem,
    ) -> Result<&[TargetNote]> {
        if !self.notes.contains_key(&item.id) {
            let notes = target
                .list_notes(item.iid)
                .await
                .with_context(|| format!("Failed to list notes of issue #{}", item.iid))?;
            debug!(iid = item.iid, count = notes.len(), "cached issue notes");
            self.notes.insert(item.id, notes);
        }
        Ok(self.notes.get(&item.id).map(Vec::as_slice).unwrap_or(&[]))
    }

    pub async fn resolve(
        &mut self,
        target: &dyn TargetClient,
        card: &SourceCard,
        items: &[TargetItem],
    ) -> Result<Resolution> {
        let mut unmarked: Vec<&TargetItem> = Vec::new();
        for item in items {
            let notes = self.notes(target, item).await?;
            if notes.iter().any(|n| marks_card(&n.body, &card.id)) {
                return Ok(Resolution::Marked(item.clone()));
            }
            if !notes.iter().any(|n| has_marker_token(&n.body)) {
                unmarked.push(item);
            }
        }

        let mut titled = unmarked.into_iter().filter(|item| item.title == card.name);
        match (titled.next(), titled.next()) {
            (Some(item), None) => Ok(Resolution::TitleMatch(item.clone())),
            _ => Ok(Resolution::Unresolved),
        }
    }

    /// Record an issue created during this run with the notes it now carries.
    pub fn remember(&mut self, item: &TargetItem, notes: Vec<TargetNote>) {
        self.notes.insert(item.id, notes);
    }

    /// Append a note written during this run to an already cached issue.
    pub fn push_note(&mut self, item: &TargetItem, note: TargetNote) {
        self.notes.entry(item.id).or_default().push(note);
    }

    /// Swap in an edited note.
    pub fn replace_note(&mut self, item: &TargetItem, note: TargetNote) {
        if let Some(notes) = self.notes.get_mut(&item.id) {
            if let Some(slot) = notes.iter_mut().find(|n| n.id == note.id) {
                *slot = note;
            }
        }
    }
}
