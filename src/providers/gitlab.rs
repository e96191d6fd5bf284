use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info};

use super::{check, TargetClient};
use crate::config::GitLabSettings;
use crate::model::target::{
    IssueFields, TargetItem, TargetMilestone, TargetNote, TargetUpload, TargetUser,
};

const PER_PAGE: &str = "100";

pub struct GitLabClient {
    api: String,
    project: String,
    token: String,
    client: reqwest::Client,
}

impl GitLabClient {
    pub fn new(settings: &GitLabSettings) -> Self {
        Self {
            api: format!("{}/api/v4", settings.url),
            project: urlencoding::encode(&settings.project.to_string()).into_owned(),
            token: settings.token.clone(),
            client: reqwest::Client::new(),
        }
    }

    fn project_url(&self, path: &str) -> String {
        format!("{}/projects/{}{path}", self.api, self.project)
    }

    fn request(
        &self,
        method: reqwest::Method,
        url: &str,
        acting: Option<u64>,
    ) -> reqwest::RequestBuilder {
        let builder = self
            .client
            .request(method, url)
            .header("PRIVATE-TOKEN", &self.token);
        match acting {
            Some(user) => builder.header("Sudo", user.to_string()),
            None => builder,
        }
    }

    async fn send<T: DeserializeOwned>(&self, builder: reqwest::RequestBuilder, what: &str) -> Result<T> {
        let resp = builder
            .send()
            .await
            .with_context(|| format!("GitLab {what} request failed"))?;
        let resp = check("GitLab", resp).await?;
        resp.json()
            .await
            .with_context(|| format!("Failed to parse GitLab {what} response"))
    }

    /// Follow `x-next-page` until the listing is exhausted.
    async fn get_all<T: DeserializeOwned>(&self, url: &str, query: &[(&str, &str)]) -> Result<Vec<T>> {
        let mut out = Vec::new();
        let mut page = "1".to_string();
        loop {
            let resp = self
                .request(reqwest::Method::GET, url, None)
                .query(query)
                .query(&[("per_page", PER_PAGE), ("page", page.as_str())])
                .send()
                .await
                .with_context(|| format!("GitLab GET {url} failed"))?;
            let resp = check("GitLab", resp).await?;
            let next = resp
                .headers()
                .get("x-next-page")
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(String::from);
            let items: Vec<T> = resp
                .json()
                .await
                .with_context(|| format!("Failed to parse GitLab listing {url}"))?;
            let empty = items.is_empty();
            out.extend(items);
            match next {
                Some(n) if !empty => page = n,
                _ => break,
            }
        }
        Ok(out)
    }
}

#[derive(Serialize)]
struct AdminFlag {
    admin: bool,
}

#[derive(Serialize)]
struct NoteBody<'a> {
    body: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    created_at: Option<DateTime<Utc>>,
}

#[async_trait]
impl TargetClient for GitLabClient {
    fn name(&self) -> &str {
        "GitLab"
    }

    async fn list_users(&self) -> Result<Vec<TargetUser>> {
        self.get_all(&format!("{}/users", self.api), &[]).await
    }

    async fn set_admin(&self, user_id: u64, admin: bool) -> Result<()> {
        let url = format!("{}/users/{user_id}", self.api);
        let _: TargetUser = self
            .send(
                self.request(reqwest::Method::PUT, &url, None)
                    .json(&AdminFlag { admin }),
                "user update",
            )
            .await?;
        Ok(())
    }

    async fn list_milestones(&self) -> Result<Vec<TargetMilestone>> {
        self.get_all(&self.project_url("/milestones"), &[]).await
    }

    async fn list_issues(&self) -> Result<Vec<TargetItem>> {
        self.get_all(
            &self.project_url("/issues"),
            &[("scope", "all"), ("order_by", "created_at"), ("sort", "asc")],
        )
        .await
    }

    async fn create_issue(&self, fields: &IssueFields, acting: Option<u64>) -> Result<TargetItem> {
        let url = self.project_url("/issues");
        let item: TargetItem = self
            .send(
                self.request(reqwest::Method::POST, &url, acting).json(fields),
                "issue create",
            )
            .await?;
        debug!(iid = item.iid, "created issue");
        Ok(item)
    }

    async fn edit_issue(
        &self,
        iid: u64,
        fields: &IssueFields,
        acting: Option<u64>,
    ) -> Result<TargetItem> {
        let url = self.project_url(&format!("/issues/{iid}"));
        self.send(
            self.request(reqwest::Method::PUT, &url, acting).json(fields),
            "issue edit",
        )
        .await
    }

    async fn list_notes(&self, iid: u64) -> Result<Vec<TargetNote>> {
        self.get_all(
            &self.project_url(&format!("/issues/{iid}/notes")),
            &[("sort", "asc"), ("order_by", "created_at")],
        )
        .await
    }

    async fn create_note(
        &self,
        iid: u64,
        body: &str,
        created_at: Option<DateTime<Utc>>,
        acting: Option<u64>,
    ) -> Result<TargetNote> {
        let url = self.project_url(&format!("/issues/{iid}/notes"));
        self.send(
            self.request(reqwest::Method::POST, &url, acting)
                .json(&NoteBody { body, created_at }),
            "note create",
        )
        .await
    }

    async fn edit_note(&self, iid: u64, note_id: u64, body: &str) -> Result<TargetNote> {
        let url = self.project_url(&format!("/issues/{iid}/notes/{note_id}"));
        self.send(
            self.request(reqwest::Method::PUT, &url, None).json(&NoteBody {
                body,
                created_at: None,
            }),
            "note edit",
        )
        .await
    }

    async fn upload_file(&self, path: &Path, mime_type: Option<&str>) -> Result<TargetUpload> {
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "attachment".to_string());
        let mut part = reqwest::multipart::Part::bytes(bytes).file_name(file_name);
        if let Some(mime) = mime_type.filter(|m| !m.is_empty()) {
            part = part
                .mime_str(mime)
                .with_context(|| format!("Invalid mime type {mime}"))?;
        }
        let form = reqwest::multipart::Form::new().part("file", part);
        let url = self.project_url("/uploads");
        self.send(
            self.request(reqwest::Method::POST, &url, None).multipart(form),
            "upload",
        )
        .await
    }

    async fn delete_issues(&self, iid: u64) -> Result<usize> {
        let issues = self.list_issues().await?;
        let mut deleted = 0;
        for issue in issues.iter().filter(|i| i.iid > iid) {
            let url = self.project_url(&format!("/issues/{}", issue.iid));
            let resp = self
                .request(reqwest::Method::DELETE, &url, None)
                .send()
                .await
                .with_context(|| format!("GitLab DELETE issue #{} failed", issue.iid))?;
            check("GitLab", resp).await?;
            info!(iid = issue.iid, "deleted issue");
            deleted += 1;
        }
        Ok(deleted)
    }
}
