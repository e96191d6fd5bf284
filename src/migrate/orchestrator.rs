use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use super::attachments::Rehoster;
use super::options::MigrationOptions;
use super::privilege::PrivilegeBracket;
use super::progress::{Progress, ProgressTx, RunReport};
use super::reference::{ReferenceIndex, Resolution};
use super::transform::{
    append_section, attachment_section, build_description, custom_fields_section, is_marker,
    marker_note, replace_attachment_urls, rewrite_mentions, CrossLinks, LinkTarget,
};
use crate::model::source::{ActionKind, SourceAction, SourceBoard, SourceCard};
use crate::model::target::{IssueFields, StateEvent, TargetItem, TargetNote};
use crate::providers::{SourceClient, TargetClient};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Init,
    FetchingBoard,
    GrantingPrivileges,
    FetchingMilestones,
    ConvertingCards,
    Backfilling,
    RewritingCrossLinks,
    RevokingPrivileges,
    Finished,
}

/// Latest action flipping `closed` from false to true on the given card or list.
fn last_close<'a>(
    board: &'a SourceBoard,
    kind: ActionKind,
    entity_id: &str,
) -> Option<&'a SourceAction> {
    board.actions.iter().rev().find(|a| {
        if a.kind != kind {
            return false;
        }
        let entity = match kind {
            ActionKind::UpdateList => a.data.list.as_ref(),
            _ => a.data.card.as_ref(),
        };
        let was_open = a.data.old.as_ref().and_then(|o| o.closed) == Some(false);
        entity.is_some_and(|e| e.id == entity_id && e.closed == Some(true)) && was_open
    })
}

/// `None` when the card should stay open. Otherwise the close transition to
/// replay, if one is on record; the card's own transition wins over its list's.
pub fn find_close_action<'a>(
    board: &'a SourceBoard,
    card: &SourceCard,
) -> Option<Option<&'a SourceAction>> {
    let list_closed = board.list(&card.id_list).is_some_and(|l| l.closed);
    if !card.closed && !list_closed {
        return None;
    }
    let own = if card.closed {
        last_close(board, ActionKind::UpdateCard, &card.id)
    } else {
        None
    };
    let list = if list_closed {
        last_close(board, ActionKind::UpdateList, &card.id_list)
    } else {
        None
    };
    Some(own.or(list))
}

fn card_error(card: &SourceCard, iid: Option<u64>, what: &str, e: &anyhow::Error) -> String {
    match iid {
        Some(iid) => format!(
            "card {} ({}), issue #{iid}: {what}: {e:#}",
            card.short_link, card.id
        ),
        None => format!("card {} ({}): {what}: {e:#}", card.short_link, card.id),
    }
}

/// One migration run. Owns every per-run cache; build a new one per command.
pub struct Migrator {
    source: Arc<dyn SourceClient>,
    target: Arc<dyn TargetClient>,
    options: MigrationOptions,
    link_base: String,
    progress: ProgressTx,
    phase: Phase,
    items: Vec<TargetItem>,
    index: ReferenceIndex,
    /// Milestone iid -> id, only filled when associations are configured.
    milestones: HashMap<u64, u64>,
    report: RunReport,
}

impl Migrator {
    pub fn new(
        source: Arc<dyn SourceClient>,
        target: Arc<dyn TargetClient>,
        options: MigrationOptions,
        link_base: impl Into<String>,
        progress: ProgressTx,
    ) -> Self {
        Self {
            source,
            target,
            options,
            link_base: link_base.into(),
            progress,
            phase: Phase::Init,
            items: Vec::new(),
            index: ReferenceIndex::new(),
            milestones: HashMap::new(),
            report: RunReport::default(),
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    fn enter(&mut self, phase: Phase) {
        info!(from = ?self.phase, to = ?phase, "phase change");
        self.phase = phase;
    }

    fn status(&self, line: impl Into<String>) {
        let _ = self.progress.send(Progress::Status(line.into()));
    }

    fn record_errors(&mut self, card: &SourceCard, errors: Vec<String>) {
        if errors.is_empty() {
            return;
        }
        let _ = self.progress.send(Progress::CardErrors {
            card: format!("{} \"{}\"", card.short_link, card.name),
            errors: errors.clone(),
        });
        self.report.errors.extend(errors);
    }

    fn update_item(&mut self, updated: TargetItem) {
        if let Some(slot) = self.items.iter_mut().find(|i| i.id == updated.id) {
            *slot = updated;
        }
    }

    fn finish(mut self) -> RunReport {
        self.enter(Phase::Finished);
        info!(
            created = self.report.created,
            updated = self.report.updated,
            existing = self.report.existing,
            skipped = self.report.skipped,
            errors = self.report.errors.len(),
            "run finished"
        );
        let _ = self.progress.send(Progress::Finished(self.report.clone()));
        self.report
    }

    async fn fetch_board(&mut self) -> Result<SourceBoard> {
        self.enter(Phase::FetchingBoard);
        let board = self
            .source
            .get_board()
            .await
            .with_context(|| format!("Failed to fetch {} board", self.source.name()))?;
        self.items = self
            .target
            .list_issues()
            .await
            .with_context(|| format!("Failed to list {} issues", self.target.name()))?;
        info!(
            board = %board.name,
            cards = board.cards.len(),
            issues = self.items.len(),
            "fetched board snapshot"
        );
        let _ = self.progress.send(Progress::BoardFetched {
            name: board.name.clone(),
            cards: board.cards.len(),
        });
        Ok(board)
    }

    /// Cards passing the inclusion filter; every other card gets a skip notice.
    fn included_cards<'b>(&mut self, board: &'b SourceBoard) -> Vec<&'b SourceCard> {
        let mut included = Vec::new();
        for card in &board.cards {
            if self.options.includes(card) {
                included.push(card);
            } else {
                self.skip(card);
            }
        }
        included
    }

    fn skip(&mut self, card: &SourceCard) {
        self.report.skipped += 1;
        self.status(format!(
            "skipping card {} \"{}\": not in the inclusion list",
            card.short_link, card.name
        ));
    }

    /// Resolve a card for a backfill pass; errors are recorded and yield `None`.
    async fn resolve_card(&mut self, card: &SourceCard) -> Option<Resolution> {
        match self.index.resolve(&*self.target, card, &self.items).await {
            Ok(Resolution::Unresolved) => {
                self.status(format!(
                    "no issue found for card {} \"{}\"",
                    card.short_link, card.name
                ));
                Some(Resolution::Unresolved)
            }
            Ok(resolution) => Some(resolution),
            Err(e) => {
                self.record_errors(card, vec![card_error(card, None, "lookup", &e)]);
                None
            }
        }
    }

    /// Full migration.
    pub async fn migrate(mut self) -> Result<RunReport> {
        let board = self.fetch_board().await?;
        if self.options.preserve_authorship {
            self.enter(Phase::GrantingPrivileges);
            let bracket = PrivilegeBracket::new(self.target.clone(), self.progress.clone());
            let users = self.options.impersonated_users();
            let ((), errors) = bracket
                .run(&users, async {
                    self.convert_board(&board).await;
                    self.enter(Phase::RevokingPrivileges);
                })
                .await;
            self.report.errors.extend(errors);
        } else {
            self.convert_board(&board).await;
        }
        Ok(self.finish())
    }

    async fn convert_board(&mut self, board: &SourceBoard) {
        if self.options.has_milestone_associations() {
            self.enter(Phase::FetchingMilestones);
            self.fetch_milestones().await;
        }

        self.enter(Phase::ConvertingCards);
        let total = board.cards.len();
        for (index, card) in board.cards.iter().enumerate() {
            let _ = self.progress.send(Progress::Card {
                index,
                total,
                title: card.name.clone(),
            });
            let errors = self.convert_card(board, card).await;
            self.record_errors(card, errors);
        }

        self.enter(Phase::RewritingCrossLinks);
        self.rewrite_cross_links(board).await;
    }

    async fn fetch_milestones(&mut self) {
        let milestones = match self.target.list_milestones().await {
            Ok(m) => m,
            Err(e) => {
                self.report.errors.push(format!(
                    "milestones: {e:#}; milestone associations ignored"
                ));
                return;
            }
        };
        let _ = self
            .progress
            .send(Progress::MilestonesFetched(milestones.len()));
        self.milestones = milestones.iter().map(|m| (m.iid, m.id)).collect();

        let mut missing: Vec<String> = Vec::new();
        for (kind, associations) in [
            ("label", &self.options.label_milestones),
            ("list", &self.options.list_milestones),
        ] {
            for (source_id, iid) in associations {
                if !self.milestones.contains_key(iid) {
                    missing.push(format!(
                        "{kind} {source_id}: milestone %{iid} does not exist, association ignored"
                    ));
                }
            }
        }
        missing.sort();
        self.report.errors.extend(missing);
    }

    fn labels_for(&self, board: &SourceBoard, card: &SourceCard) -> Option<String> {
        let mut names: Vec<String> = Vec::new();
        for id in &card.id_labels {
            let name = self
                .options
                .labels
                .get(id)
                .cloned()
                .or_else(|| board.label(id).map(|l| l.name.clone()))
                .filter(|n| !n.trim().is_empty());
            if let Some(name) = name {
                if !names.contains(&name) {
                    names.push(name);
                }
            }
        }
        if names.is_empty() {
            None
        } else {
            Some(names.join(","))
        }
    }

    fn milestone_for(&self, card: &SourceCard) -> Option<u64> {
        card.id_labels
            .iter()
            .find_map(|id| {
                self.options
                    .label_milestones
                    .get(id)
                    .filter(|iid| self.milestones.contains_key(*iid))
            })
            .or_else(|| self.options.list_milestones.get(&card.id_list))
            .and_then(|iid| self.milestones.get(iid))
            .copied()
    }

    fn assignees_for(&self, card: &SourceCard) -> Option<Vec<u64>> {
        let mut ids: Vec<u64> = card
            .id_members
            .iter()
            .filter_map(|m| self.options.members.get(m).copied())
            .collect();
        ids.sort_unstable();
        ids.dedup();
        if ids.is_empty() {
            None
        } else {
            Some(ids)
        }
    }

    /// Migrate one card. Returns the errors hit along the way; never aborts the batch.
    async fn convert_card(&mut self, board: &SourceBoard, card: &SourceCard) -> Vec<String> {
        let mut errors = Vec::new();
        if !self.options.includes(card) {
            self.skip(card);
            return errors;
        }

        match self.index.resolve(&*self.target, card, &self.items).await {
            Ok(resolution) => {
                if let Some(item) = resolution.item() {
                    self.report.existing += 1;
                    self.status(format!(
                        "card {} already migrated as #{}",
                        card.short_link, item.iid
                    ));
                    return errors;
                }
            }
            Err(e) => {
                errors.push(card_error(card, None, "lookup", &e));
                return errors;
            }
        }

        let attachments = match self.source.get_attachments(&card.id).await {
            Ok(a) => a,
            Err(e) => {
                errors.push(card_error(card, None, "attachments", &e));
                Vec::new()
            }
        };
        let mut mappings = Rehoster::new(&*self.source, &*self.target)
            .rehost_all(attachments)
            .await;

        let values = if board.custom_fields.is_empty() {
            Vec::new()
        } else {
            match self.source.get_custom_field_values(&card.id).await {
                Ok(v) => v,
                Err(e) => {
                    errors.push(card_error(card, None, "custom fields", &e));
                    Vec::new()
                }
            }
        };

        let description =
            build_description(card, &board.checklists, &board.custom_fields, &values);
        let description = rewrite_mentions(&description, &self.options.mentions);
        let description = replace_attachment_urls(&description, &mut mappings);

        let mut comments: Vec<(&SourceAction, String)> = Vec::new();
        for action in board
            .card_actions(&card.id)
            .filter(|a| a.kind == ActionKind::CommentCard)
        {
            let text = action.data.text.as_deref().unwrap_or("");
            let text = rewrite_mentions(text, &self.options.mentions);
            let text = replace_attachment_urls(&text, &mut mappings);
            if !text.trim().is_empty() {
                comments.push((action, text));
            }
        }
        comments.sort_by_key(|(a, _)| a.date);

        let authored = board
            .card_actions(&card.id)
            .find(|a| a.kind == ActionKind::CreateCard)
            .and_then(|a| {
                self.options
                    .acting_user(&a.id_member_creator)
                    .map(|user| (user, a.date))
            });
        let (acting, created_at) = match authored {
            Some((user, date)) => (Some(user), date),
            None => (None, card.date_last_activity),
        };

        let fields = IssueFields {
            title: Some(card.name.clone()),
            description: Some(description.clone()),
            labels: self.labels_for(board, card),
            milestone_id: self.milestone_for(card),
            assignee_ids: self.assignees_for(card),
            due_date: card.due.map(|d| d.date_naive()),
            created_at: Some(created_at),
            ..IssueFields::default()
        };
        let item = match self.target.create_issue(&fields, acting).await {
            Ok(item) => item,
            Err(e) => {
                errors.push(card_error(card, None, "create issue", &e));
                return errors;
            }
        };
        self.report.created += 1;
        info!(card = %card.short_link, iid = item.iid, "created issue");
        self.items.push(item.clone());

        let mut notes: Vec<TargetNote> = Vec::new();
        let marker = marker_note(card, &self.link_base);
        match self.target.create_note(item.iid, &marker, None, None).await {
            Ok(note) => notes.push(note),
            Err(e) => errors.push(card_error(card, Some(item.iid), "marker note", &e)),
        }

        for (action, text) in comments {
            let acting = self.options.acting_user(&action.id_member_creator);
            let body = match acting {
                Some(_) => text,
                None => format!(
                    "**{}** commented on {}:\n\n{text}",
                    action.actor_name(),
                    action.date.format("%Y-%m-%d %H:%M UTC")
                ),
            };
            match self
                .target
                .create_note(item.iid, &body, Some(action.date), acting)
                .await
            {
                Ok(note) => notes.push(note),
                Err(e) => errors.push(card_error(card, Some(item.iid), "comment", &e)),
            }
        }
        self.index.remember(&item, notes);

        if let Some(section) = attachment_section(&mappings) {
            let fields = IssueFields::description(append_section(&description, &section));
            match self.target.edit_issue(item.iid, &fields, None).await {
                Ok(updated) => self.update_item(updated),
                Err(e) => errors.push(card_error(card, Some(item.iid), "attachment list", &e)),
            }
        }

        if let Some(close) = find_close_action(board, card) {
            let fields = IssueFields {
                state_event: Some(StateEvent::Close),
                updated_at: close.map(|a| a.date),
                ..IssueFields::default()
            };
            let acting = close.and_then(|a| self.options.acting_user(&a.id_member_creator));
            match self.target.edit_issue(item.iid, &fields, acting).await {
                Ok(updated) => self.update_item(updated),
                Err(e) => errors.push(card_error(card, Some(item.iid), "close", &e)),
            }
        }

        errors
    }

    /// Replace card URLs in every migrated issue and its notes with `#iid`.
    async fn rewrite_cross_links(&mut self, board: &SourceBoard) {
        let links = match CrossLinks::new(&self.link_base) {
            Ok(links) => links,
            Err(e) => {
                self.report
                    .errors
                    .push(format!("cross-links: invalid link base: {e}"));
                return;
            }
        };

        let mut targets: HashMap<String, LinkTarget> = HashMap::new();
        let mut resolved: Vec<(&SourceCard, TargetItem)> = Vec::new();
        for card in &board.cards {
            if !self.options.includes(card) {
                targets.insert(card.short_link.clone(), LinkTarget::Excluded);
                continue;
            }
            match self.index.resolve(&*self.target, card, &self.items).await {
                Ok(resolution) => match resolution.item() {
                    Some(item) => {
                        targets.insert(card.short_link.clone(), LinkTarget::Issue(item.iid));
                        resolved.push((card, item.clone()));
                    }
                    None => {
                        targets.insert(card.short_link.clone(), LinkTarget::Unresolved);
                    }
                },
                Err(e) => {
                    targets.insert(card.short_link.clone(), LinkTarget::Unresolved);
                    self.record_errors(card, vec![card_error(card, None, "lookup", &e)]);
                }
            }
        }

        for (card, item) in resolved {
            let mut errors = Vec::new();

            let rewritten = links.rewrite(item.description(), &targets);
            self.announce_skipped_links(&item, &rewritten.skipped);
            if rewritten.text != item.description() {
                let fields = IssueFields::description(rewritten.text);
                match self.target.edit_issue(item.iid, &fields, None).await {
                    Ok(updated) => {
                        self.report.updated += 1;
                        self.update_item(updated);
                    }
                    Err(e) => errors.push(card_error(card, Some(item.iid), "cross-links", &e)),
                }
            }

            let notes = match self.index.notes(&*self.target, &item).await {
                Ok(notes) => notes.to_vec(),
                Err(e) => {
                    errors.push(card_error(card, Some(item.iid), "notes", &e));
                    Vec::new()
                }
            };
            for note in notes.iter().filter(|n| !n.system && !is_marker(&n.body)) {
                let rewritten = links.rewrite(&note.body, &targets);
                self.announce_skipped_links(&item, &rewritten.skipped);
                if rewritten.text == note.body {
                    continue;
                }
                match self
                    .target
                    .edit_note(item.iid, note.id, &rewritten.text)
                    .await
                {
                    Ok(edited) => self.index.replace_note(&item, edited),
                    Err(e) => errors.push(card_error(
                        card,
                        Some(item.iid),
                        &format!("cross-links in note {}", note.id),
                        &e,
                    )),
                }
            }

            self.record_errors(card, errors);
        }
    }

    fn announce_skipped_links(&self, item: &TargetItem, skipped: &[String]) {
        for short_link in skipped {
            self.status(format!(
                "leaving link to card {short_link} in #{}: card is not in the inclusion list",
                item.iid
            ));
        }
    }

    /// Rewrite mentions in already migrated issues and their comments.
    pub async fn adjust_mentions(mut self) -> Result<RunReport> {
        let board = self.fetch_board().await?;
        let mentions = self.options.mentions.clone();
        if mentions.is_empty() {
            self.status("no mention mappings configured");
            return Ok(self.finish());
        }

        self.enter(Phase::Backfilling);
        for card in self.included_cards(&board) {
            let Some(item) = self.resolve_card(card).await.and_then(|r| r.item().cloned())
            else {
                continue;
            };
            let mut errors = Vec::new();

            let description = rewrite_mentions(item.description(), &mentions);
            if description != item.description() {
                match self
                    .target
                    .edit_issue(item.iid, &IssueFields::description(description), None)
                    .await
                {
                    Ok(updated) => {
                        self.report.updated += 1;
                        self.update_item(updated);
                    }
                    Err(e) => errors.push(card_error(card, Some(item.iid), "mentions", &e)),
                }
            }

            let notes = match self.index.notes(&*self.target, &item).await {
                Ok(notes) => notes.to_vec(),
                Err(e) => {
                    errors.push(card_error(card, Some(item.iid), "notes", &e));
                    Vec::new()
                }
            };
            for note in notes.iter().filter(|n| !n.system && !is_marker(&n.body)) {
                let body = rewrite_mentions(&note.body, &mentions);
                if body == note.body {
                    continue;
                }
                match self.target.edit_note(item.iid, note.id, &body).await {
                    Ok(edited) => self.index.replace_note(&item, edited),
                    Err(e) => errors.push(card_error(
                        card,
                        Some(item.iid),
                        &format!("mentions in note {}", note.id),
                        &e,
                    )),
                }
            }

            self.record_errors(card, errors);
        }
        Ok(self.finish())
    }

    /// Append the custom-field section to migrated issues that lack it.
    pub async fn backfill_custom_fields(mut self) -> Result<RunReport> {
        let board = self.fetch_board().await?;
        if board.custom_fields.is_empty() {
            self.status("board defines no custom fields");
            return Ok(self.finish());
        }

        self.enter(Phase::Backfilling);
        for card in self.included_cards(&board) {
            let Some(item) = self.resolve_card(card).await.and_then(|r| r.item().cloned())
            else {
                continue;
            };
            let values = match self.source.get_custom_field_values(&card.id).await {
                Ok(v) => v,
                Err(e) => {
                    let error = card_error(card, Some(item.iid), "custom fields", &e);
                    self.record_errors(card, vec![error]);
                    continue;
                }
            };
            let Some(section) =
                custom_fields_section(item.description(), &board.custom_fields, &values)
            else {
                continue;
            };
            let fields = IssueFields::description(append_section(item.description(), &section));
            match self.target.edit_issue(item.iid, &fields, None).await {
                Ok(updated) => {
                    self.report.updated += 1;
                    self.update_item(updated);
                }
                Err(e) => {
                    let error = card_error(card, Some(item.iid), "custom fields", &e);
                    self.record_errors(card, vec![error]);
                }
            }
        }
        Ok(self.finish())
    }

    /// Add markers to issues migrated before markers existed (unique title match).
    pub async fn backfill_markers(mut self) -> Result<RunReport> {
        let board = self.fetch_board().await?;
        self.enter(Phase::Backfilling);
        for card in self.included_cards(&board) {
            let item = match self.resolve_card(card).await {
                Some(Resolution::TitleMatch(item)) => item,
                Some(Resolution::Marked(_)) => {
                    self.report.existing += 1;
                    continue;
                }
                Some(Resolution::Unresolved) | None => continue,
            };
            let marker = marker_note(card, &self.link_base);
            match self.target.create_note(item.iid, &marker, None, None).await {
                Ok(note) => {
                    self.report.updated += 1;
                    self.status(format!(
                        "linked card {} to #{}",
                        card.short_link, item.iid
                    ));
                    self.index.push_note(&item, note);
                }
                Err(e) => {
                    let error = card_error(card, Some(item.iid), "marker note", &e);
                    self.record_errors(card, vec![error]);
                }
            }
        }
        Ok(self.finish())
    }

    /// Only the cross-link pass.
    pub async fn rewrite_links(mut self) -> Result<RunReport> {
        let board = self.fetch_board().await?;
        self.included_cards(&board);
        self.enter(Phase::RewritingCrossLinks);
        self.rewrite_cross_links(&board).await;
        Ok(self.finish())
    }

    /// Delete every issue numbered above `iid`.
    pub async fn delete_above(mut self, iid: u64) -> Result<RunReport> {
        let deleted = self
            .target
            .delete_issues(iid)
            .await
            .with_context(|| format!("Failed to delete issues above #{iid}"))?;
        self.report.deleted = deleted;
        self.status(format!("deleted {deleted} issue(s) above #{iid}"));
        Ok(self.finish())
    }
}
