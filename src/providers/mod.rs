pub mod gitlab;
pub mod trello;

use std::path::Path;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::MigrateError;
use crate::model::source::{
    CustomFieldDefinition, CustomFieldValue, SourceAttachment, SourceBoard,
};
use crate::model::target::{
    IssueFields, TargetItem, TargetMilestone, TargetNote, TargetUpload, TargetUser,
};

/// Read side of the board being migrated.
#[async_trait]
pub trait SourceClient: Send + Sync {
    fn name(&self) -> &str;
    async fn get_board(&self) -> Result<SourceBoard>;
    async fn get_attachments(&self, card_id: &str) -> Result<Vec<SourceAttachment>>;
    async fn download_attachment(&self, url: &str) -> Result<Vec<u8>>;
    async fn get_custom_field_definitions(&self) -> Result<Vec<CustomFieldDefinition>>;
    async fn get_custom_field_values(&self, card_id: &str) -> Result<Vec<CustomFieldValue>>;
}

/// Issue tracker receiving the migrated items. `acting` names the user to
/// impersonate; `None` acts as the token owner.
#[async_trait]
pub trait TargetClient: Send + Sync {
    fn name(&self) -> &str;
    async fn list_users(&self) -> Result<Vec<TargetUser>>;
    async fn set_admin(&self, user_id: u64, admin: bool) -> Result<()>;
    async fn list_milestones(&self) -> Result<Vec<TargetMilestone>>;
    async fn list_issues(&self) -> Result<Vec<TargetItem>>;
    async fn create_issue(&self, fields: &IssueFields, acting: Option<u64>) -> Result<TargetItem>;
    async fn edit_issue(
        &self,
        iid: u64,
        fields: &IssueFields,
        acting: Option<u64>,
    ) -> Result<TargetItem>;
    async fn list_notes(&self, iid: u64) -> Result<Vec<TargetNote>>;
    async fn create_note(
        &self,
        iid: u64,
        body: &str,
        created_at: Option<DateTime<Utc>>,
        acting: Option<u64>,
    ) -> Result<TargetNote>;
    async fn edit_note(&self, iid: u64, note_id: u64, body: &str) -> Result<TargetNote>;
    async fn upload_file(&self, path: &Path, mime_type: Option<&str>) -> Result<TargetUpload>;
    /// Delete every issue whose iid is greater than `iid`. Returns how many went.
    async fn delete_issues(&self, iid: u64) -> Result<usize>;
}

/// Turn a non-2xx response into [`MigrateError::Api`] carrying its body.
pub(crate) async fn check(
    service: &'static str,
    resp: reqwest::Response,
) -> Result<reqwest::Response, MigrateError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(MigrateError::Api {
        service,
        status: status.as_u16(),
        body,
    })
}

#[cfg(test)]
pub mod tests;
