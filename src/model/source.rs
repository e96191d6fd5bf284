use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Snapshot of a Trello board, fetched once per command.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourceBoard {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub lists: Vec<SourceList>,
    #[serde(default)]
    pub cards: Vec<SourceCard>,
    #[serde(default)]
    pub labels: Vec<SourceLabel>,
    #[serde(default)]
    pub checklists: Vec<SourceChecklist>,
    /// Oldest first.
    #[serde(default)]
    pub actions: Vec<SourceAction>,
    #[serde(default)]
    pub custom_fields: Vec<CustomFieldDefinition>,
}

impl SourceBoard {
    pub fn list(&self, id: &str) -> Option<&SourceList> {
        self.lists.iter().find(|l| l.id == id)
    }

    pub fn label(&self, id: &str) -> Option<&SourceLabel> {
        self.labels.iter().find(|l| l.id == id)
    }

    /// Actions that target the given card, in chronological order.
    pub fn card_actions<'a>(
        &'a self,
        card_id: &'a str,
    ) -> impl Iterator<Item = &'a SourceAction> + 'a {
        self.actions.iter().filter(move |a| a.card_id() == Some(card_id))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceList {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub closed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceLabel {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub color: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceCard {
    pub id: String,
    pub short_link: String,
    #[serde(default)]
    pub short_url: Option<String>,
    pub name: String,
    #[serde(default)]
    pub desc: String,
    #[serde(default)]
    pub closed: bool,
    #[serde(default)]
    pub due: Option<DateTime<Utc>>,
    #[serde(default)]
    pub id_labels: Vec<String>,
    pub id_list: String,
    #[serde(default)]
    pub id_members: Vec<String>,
    pub date_last_activity: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceChecklist {
    pub id: String,
    pub name: String,
    pub id_card: String,
    #[serde(default)]
    pub pos: f64,
    #[serde(default)]
    pub check_items: Vec<CheckItem>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckItem {
    pub id: String,
    pub name: String,
    /// `complete` or `incomplete`.
    pub state: String,
    #[serde(default)]
    pub pos: f64,
}

impl CheckItem {
    pub fn is_complete(&self) -> bool {
        self.state == "complete"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ActionKind {
    CreateCard,
    UpdateCard,
    CommentCard,
    UpdateList,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceAction {
    pub id: String,
    pub id_member_creator: String,
    #[serde(rename = "type")]
    pub kind: ActionKind,
    pub date: DateTime<Utc>,
    #[serde(default)]
    pub data: ActionData,
    #[serde(default)]
    pub member_creator: Option<SourceMember>,
}

impl SourceAction {
    pub fn card_id(&self) -> Option<&str> {
        self.data.card.as_ref().map(|c| c.id.as_str())
    }

    /// Display name of whoever performed the action.
    pub fn actor_name(&self) -> &str {
        self.member_creator
            .as_ref()
            .map(|m| {
                if m.full_name.is_empty() {
                    m.username.as_str()
                } else {
                    m.full_name.as_str()
                }
            })
            .unwrap_or(self.id_member_creator.as_str())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ActionData {
    #[serde(default)]
    pub card: Option<ActionRef>,
    #[serde(default)]
    pub list: Option<ActionRef>,
    #[serde(default)]
    pub old: Option<ActionOld>,
    #[serde(default)]
    pub text: Option<String>,
}

/// Entity an action refers to; `closed` is the value after the action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionRef {
    pub id: String,
    #[serde(default)]
    pub closed: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ActionOld {
    #[serde(default)]
    pub closed: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceMember {
    pub id: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub full_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceAttachment {
    pub id: String,
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub is_upload: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CustomFieldKind {
    Text,
    Number,
    Date,
    Checkbox,
    /// Drop-down: values reference an option id.
    List,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomFieldDefinition {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: CustomFieldKind,
    #[serde(default)]
    pub options: Vec<CustomFieldOption>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomFieldOption {
    pub id: String,
    pub value: CustomFieldRaw,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CustomFieldRaw {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub number: Option<String>,
    #[serde(default)]
    pub date: Option<String>,
    #[serde(default)]
    pub checked: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomFieldValue {
    pub id_custom_field: String,
    #[serde(default)]
    pub value: Option<CustomFieldRaw>,
    #[serde(default)]
    pub id_value: Option<String>,
}
