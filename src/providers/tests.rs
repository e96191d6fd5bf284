use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};

use super::{SourceClient, TargetClient};
use crate::error::MigrateError;
use crate::model::source::{
    ActionData, ActionKind, ActionOld, ActionRef, CustomFieldDefinition, CustomFieldValue,
    SourceAction, SourceAttachment, SourceBoard, SourceCard, SourceList, SourceMember,
};
use crate::model::target::{
    IssueFields, IssueState, StateEvent, TargetItem, TargetMilestone, TargetNote, TargetUpload,
    TargetUser,
};

fn api_error(service: &'static str, status: u16, body: &str) -> anyhow::Error {
    MigrateError::Api {
        service,
        status,
        body: body.to_string(),
    }
    .into()
}

pub fn ts(day: u32, hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2021, 3, day, hour, 0, 0).unwrap()
}

pub fn card(id: &str, short_link: &str, title: &str) -> SourceCard {
    SourceCard {
        id: id.into(),
        short_link: short_link.into(),
        short_url: Some(format!("https://trello.com/c/{short_link}")),
        name: title.into(),
        desc: String::new(),
        closed: false,
        due: None,
        id_labels: vec![],
        id_list: "list1".into(),
        id_members: vec![],
        date_last_activity: ts(20, 12),
    }
}

pub fn list(id: &str, closed: bool) -> SourceList {
    SourceList {
        id: id.into(),
        name: format!("List {id}"),
        closed,
    }
}

pub fn attachment(url: &str, name: &str) -> SourceAttachment {
    SourceAttachment {
        id: format!("att-{name}"),
        name: name.into(),
        url: url.into(),
        mime_type: Some("application/octet-stream".into()),
        is_upload: true,
    }
}

pub fn action(kind: ActionKind, member: &str, date: DateTime<Utc>) -> SourceAction {
    SourceAction {
        id: format!("act-{member}-{}", date.timestamp()),
        id_member_creator: member.into(),
        kind,
        date,
        data: ActionData::default(),
        member_creator: Some(SourceMember {
            id: member.into(),
            username: member.into(),
            full_name: format!("Member {member}"),
        }),
    }
}

pub fn comment(card_id: &str, member: &str, date: DateTime<Utc>, text: &str) -> SourceAction {
    let mut a = action(ActionKind::CommentCard, member, date);
    a.data.card = Some(ActionRef {
        id: card_id.into(),
        closed: None,
    });
    a.data.text = Some(text.into());
    a
}

pub fn created(card_id: &str, member: &str, date: DateTime<Utc>) -> SourceAction {
    let mut a = action(ActionKind::CreateCard, member, date);
    a.data.card = Some(ActionRef {
        id: card_id.into(),
        closed: None,
    });
    a
}

/// `updateCard` or `updateList` flipping `closed` from `from` to `to`.
pub fn closed_transition(
    kind: ActionKind,
    entity_id: &str,
    member: &str,
    date: DateTime<Utc>,
    from: bool,
    to: bool,
) -> SourceAction {
    let mut a = action(kind, member, date);
    let entity = Some(ActionRef {
        id: entity_id.into(),
        closed: Some(to),
    });
    if kind == ActionKind::UpdateList {
        a.data.list = entity;
    } else {
        a.data.card = entity;
    }
    a.data.old = Some(ActionOld { closed: Some(from) });
    a
}

#[derive(Default)]
pub struct MockSource {
    pub board: SourceBoard,
    attachments: HashMap<String, Vec<SourceAttachment>>,
    files: HashMap<String, Vec<u8>>,
    field_values: HashMap<String, Vec<CustomFieldValue>>,
    downloads: Arc<Mutex<Vec<String>>>,
}

impl MockSource {
    pub fn with_board(board: SourceBoard) -> Self {
        Self {
            board,
            ..Self::default()
        }
    }

    pub fn with_download(mut self, url: &str, bytes: &[u8]) -> Self {
        self.files.insert(url.to_string(), bytes.to_vec());
        self
    }

    pub fn with_attachments(mut self, card_id: &str, attachments: Vec<SourceAttachment>) -> Self {
        self.attachments.insert(card_id.to_string(), attachments);
        self
    }

    pub fn with_field_values(mut self, card_id: &str, values: Vec<CustomFieldValue>) -> Self {
        self.field_values.insert(card_id.to_string(), values);
        self
    }

    pub fn with_custom_fields(mut self, definitions: Vec<CustomFieldDefinition>) -> Self {
        self.board.custom_fields = definitions;
        self
    }

    pub fn downloads(&self) -> Vec<String> {
        self.downloads.lock().unwrap().clone()
    }
}

#[async_trait]
impl SourceClient for MockSource {
    fn name(&self) -> &str {
        "MockSource"
    }

    async fn get_board(&self) -> Result<SourceBoard> {
        Ok(self.board.clone())
    }

    async fn get_attachments(&self, card_id: &str) -> Result<Vec<SourceAttachment>> {
        Ok(self.attachments.get(card_id).cloned().unwrap_or_default())
    }

    async fn download_attachment(&self, url: &str) -> Result<Vec<u8>> {
        self.downloads.lock().unwrap().push(url.to_string());
        self.files
            .get(url)
            .cloned()
            .ok_or_else(|| api_error("Trello", 404, "not found"))
    }

    async fn get_custom_field_definitions(&self) -> Result<Vec<CustomFieldDefinition>> {
        Ok(self.board.custom_fields.clone())
    }

    async fn get_custom_field_values(&self, card_id: &str) -> Result<Vec<CustomFieldValue>> {
        Ok(self.field_values.get(card_id).cloned().unwrap_or_default())
    }
}

#[derive(Default)]
pub struct TargetState {
    pub users: Vec<TargetUser>,
    pub milestones: Vec<TargetMilestone>,
    pub issues: Vec<TargetItem>,
    /// Keyed by issue iid.
    pub notes: HashMap<u64, Vec<TargetNote>>,
    pub admin_calls: Vec<(u64, bool)>,
    pub creates: Vec<(IssueFields, Option<u64>)>,
    pub edits: Vec<(u64, IssueFields, Option<u64>)>,
    pub note_creates: Vec<(u64, String, Option<DateTime<Utc>>, Option<u64>)>,
    pub note_edits: Vec<(u64, u64, String)>,
    pub note_listings: usize,
    uploads: Vec<(PathBuf, Vec<u8>)>,
    upload_attempts: Vec<PathBuf>,
    fail_uploads: bool,
    fail_users: bool,
    fail_admin: HashSet<(u64, bool)>,
    fail_titles: HashSet<String>,
    next_id: u64,
}

impl TargetState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    pub fn issue(&self, iid: u64) -> Option<&TargetItem> {
        self.issues.iter().find(|i| i.iid == iid)
    }

    pub fn notes_of(&self, iid: u64) -> Vec<String> {
        self.notes
            .get(&iid)
            .map(|n| n.iter().map(|n| n.body.clone()).collect())
            .unwrap_or_default()
    }
}

#[derive(Default)]
pub struct MockTarget {
    state: Mutex<TargetState>,
}

impl MockTarget {
    pub fn state(&self) -> MutexGuard<'_, TargetState> {
        self.state.lock().unwrap()
    }

    pub fn with_user(self, id: u64, username: &str, is_admin: bool) -> Self {
        self.state().users.push(TargetUser {
            id,
            username: username.into(),
            name: username.into(),
            is_admin: Some(is_admin),
        });
        self
    }

    pub fn with_milestone(self, id: u64, iid: u64) -> Self {
        self.state().milestones.push(TargetMilestone {
            id,
            iid,
            title: format!("Milestone {iid}"),
        });
        self
    }

    /// Pre-existing issue, e.g. from an earlier run.
    pub fn with_issue(self, iid: u64, title: &str) -> Self {
        {
            let mut state = self.state();
            let id = 5000 + iid;
            state.issues.push(TargetItem {
                id,
                iid,
                title: title.into(),
                description: None,
                state: IssueState::Opened,
                labels: vec![],
                milestone: None,
                assignees: vec![],
                due_date: None,
            });
        }
        self
    }

    pub fn with_note(self, iid: u64, body: &str) -> Self {
        {
            let mut state = self.state();
            let id = state.next_id();
            state.notes.entry(iid).or_default().push(TargetNote {
                id,
                body: body.into(),
                author: None,
                created_at: None,
                system: false,
            });
        }
        self
    }

    pub fn with_description(self, iid: u64, description: &str) -> Self {
        if let Some(issue) = self.state().issues.iter_mut().find(|i| i.iid == iid) {
            issue.description = Some(description.into());
        }
        self
    }

    pub fn fail_uploads(&self) {
        self.state().fail_uploads = true;
    }

    pub fn fail_list_users(&self) {
        self.state().fail_users = true;
    }

    pub fn fail_admin(&self, user_id: u64, admin: bool) {
        self.state().fail_admin.insert((user_id, admin));
    }

    pub fn fail_create(&self, title: &str) {
        self.state().fail_titles.insert(title.to_string());
    }

    pub fn list_issues_now(&self) -> Vec<TargetItem> {
        self.state().issues.clone()
    }

    pub fn uploads(&self) -> Vec<(PathBuf, Vec<u8>)> {
        self.state().uploads.clone()
    }

    pub fn upload_attempts(&self) -> Vec<PathBuf> {
        self.state().upload_attempts.clone()
    }
}

fn apply(issue: &mut TargetItem, fields: &IssueFields) {
    if let Some(title) = &fields.title {
        issue.title = title.clone();
    }
    if let Some(description) = &fields.description {
        issue.description = Some(description.clone());
    }
    if let Some(labels) = &fields.labels {
        issue.labels = labels
            .split(',')
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect();
    }
    if let Some(due) = fields.due_date {
        issue.due_date = Some(due);
    }
    match fields.state_event {
        Some(StateEvent::Close) => issue.state = IssueState::Closed,
        Some(StateEvent::Reopen) => issue.state = IssueState::Opened,
        None => {}
    }
}

#[async_trait]
impl TargetClient for MockTarget {
    fn name(&self) -> &str {
        "MockTarget"
    }

    async fn list_users(&self) -> Result<Vec<TargetUser>> {
        let state = self.state();
        if state.fail_users {
            return Err(api_error("GitLab", 502, "bad gateway"));
        }
        Ok(state.users.clone())
    }

    async fn set_admin(&self, user_id: u64, admin: bool) -> Result<()> {
        let mut state = self.state();
        state.admin_calls.push((user_id, admin));
        if state.fail_admin.contains(&(user_id, admin)) {
            return Err(api_error("GitLab", 500, "admin toggle failed"));
        }
        match state.users.iter_mut().find(|u| u.id == user_id) {
            Some(user) => {
                user.is_admin = Some(admin);
                Ok(())
            }
            None => Err(api_error("GitLab", 404, "user not found")),
        }
    }

    async fn list_milestones(&self) -> Result<Vec<TargetMilestone>> {
        Ok(self.state().milestones.clone())
    }

    async fn list_issues(&self) -> Result<Vec<TargetItem>> {
        Ok(self.state().issues.clone())
    }

    async fn create_issue(&self, fields: &IssueFields, acting: Option<u64>) -> Result<TargetItem> {
        let mut state = self.state();
        let title = fields.title.clone().unwrap_or_default();
        if state.fail_titles.contains(&title) {
            return Err(api_error("GitLab", 500, "create failed"));
        }
        state.creates.push((fields.clone(), acting));
        let iid = state.issues.iter().map(|i| i.iid).max().unwrap_or(0) + 1;
        let id = 1000 + state.next_id();
        let mut issue = TargetItem {
            id,
            iid,
            title,
            description: None,
            state: IssueState::Opened,
            labels: vec![],
            milestone: None,
            assignees: vec![],
            due_date: None,
        };
        apply(&mut issue, fields);
        state.issues.push(issue.clone());
        Ok(issue)
    }

    async fn edit_issue(
        &self,
        iid: u64,
        fields: &IssueFields,
        acting: Option<u64>,
    ) -> Result<TargetItem> {
        let mut state = self.state();
        state.edits.push((iid, fields.clone(), acting));
        let issue = state
            .issues
            .iter_mut()
            .find(|i| i.iid == iid)
            .ok_or_else(|| api_error("GitLab", 404, "issue not found"))?;
        apply(issue, fields);
        Ok(issue.clone())
    }

    async fn list_notes(&self, iid: u64) -> Result<Vec<TargetNote>> {
        let mut state = self.state();
        state.note_listings += 1;
        Ok(state.notes.get(&iid).cloned().unwrap_or_default())
    }

    async fn create_note(
        &self,
        iid: u64,
        body: &str,
        created_at: Option<DateTime<Utc>>,
        acting: Option<u64>,
    ) -> Result<TargetNote> {
        let mut state = self.state();
        if state.issue(iid).is_none() {
            return Err(api_error("GitLab", 404, "issue not found"));
        }
        state
            .note_creates
            .push((iid, body.to_string(), created_at, acting));
        let note = TargetNote {
            id: state.next_id(),
            body: body.to_string(),
            author: None,
            created_at,
            system: false,
        };
        state.notes.entry(iid).or_default().push(note.clone());
        Ok(note)
    }

    async fn edit_note(&self, iid: u64, note_id: u64, body: &str) -> Result<TargetNote> {
        let mut state = self.state();
        state.note_edits.push((iid, note_id, body.to_string()));
        let note = state
            .notes
            .get_mut(&iid)
            .and_then(|notes| notes.iter_mut().find(|n| n.id == note_id))
            .ok_or_else(|| api_error("GitLab", 404, "note not found"))?;
        note.body = body.to_string();
        Ok(note.clone())
    }

    async fn upload_file(&self, path: &Path, _mime_type: Option<&str>) -> Result<TargetUpload> {
        let mut state = self.state();
        state.upload_attempts.push(path.to_path_buf());
        if state.fail_uploads {
            return Err(api_error("GitLab", 413, "too large"));
        }
        let bytes = std::fs::read(path)?;
        state.uploads.push((path.to_path_buf(), bytes));
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let url = format!("/uploads/{}/{name}", state.uploads.len());
        Ok(TargetUpload {
            markdown: format!("[{name}]({url})"),
            url,
        })
    }

    async fn delete_issues(&self, iid: u64) -> Result<usize> {
        let mut state = self.state();
        let before = state.issues.len();
        state.issues.retain(|i| i.iid <= iid);
        Ok(before - state.issues.len())
    }
}

#[tokio::test]
async fn mock_target_assigns_sequential_iids() {
    let target = MockTarget::default().with_issue(3, "existing");
    let fields = IssueFields {
        title: Some("new".into()),
        ..IssueFields::default()
    };
    let first = target.create_issue(&fields, None).await.unwrap();
    let second = target.create_issue(&fields, Some(7)).await.unwrap();
    assert_eq!(first.iid, 4);
    assert_eq!(second.iid, 5);
    assert_ne!(first.id, second.id);
    assert_eq!(target.state().creates[1].1, Some(7));
}

#[tokio::test]
async fn mock_target_delete_above() {
    let target = MockTarget::default()
        .with_issue(1, "a")
        .with_issue(2, "b")
        .with_issue(3, "c");
    assert_eq!(target.delete_issues(1).await.unwrap(), 2);
    let remaining: Vec<u64> = target.state().issues.iter().map(|i| i.iid).collect();
    assert_eq!(remaining, vec![1]);
}

#[tokio::test]
async fn mock_failures_surface_as_api_errors() {
    let source = MockSource::default();
    let err = source.download_attachment("nope").await.unwrap_err();
    let api = err.downcast_ref::<MigrateError>().unwrap();
    assert!(matches!(api, MigrateError::Api { status: 404, .. }));
}
