use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::debug;

use super::{check, SourceClient};
use crate::config::TrelloSettings;
use crate::model::source::{
    CustomFieldDefinition, CustomFieldValue, SourceAction, SourceAttachment, SourceBoard,
    SourceCard, SourceChecklist, SourceLabel, SourceList,
};

const BASE: &str = "https://api.trello.com/1";
const ACTION_FILTER: &str = "createCard,updateCard,commentCard,updateList";
const ACTION_PAGE: usize = 1000;

const CARD_FIELDS: &str =
    "id,shortLink,shortUrl,name,desc,closed,due,idLabels,idList,idMembers,dateLastActivity";

pub struct TrelloClient {
    api_key: String,
    token: String,
    board_id: String,
    client: reqwest::Client,
}

impl TrelloClient {
    pub fn new(settings: &TrelloSettings) -> Self {
        Self {
            api_key: settings.api_key.clone(),
            token: settings.token.clone(),
            board_id: settings.board_id.clone(),
            client: reqwest::Client::new(),
        }
    }

    fn auth_params(&self) -> [(&str, &str); 2] {
        [("key", self.api_key.as_str()), ("token", self.token.as_str())]
    }

    async fn get<T: DeserializeOwned>(&self, path: &str, query: &[(&str, &str)]) -> Result<T> {
        let resp = self
            .client
            .get(format!("{BASE}{path}"))
            .query(&self.auth_params())
            .query(query)
            .send()
            .await
            .with_context(|| format!("Trello GET {path} failed"))?;
        let resp = check("Trello", resp).await?;
        resp.json()
            .await
            .with_context(|| format!("Failed to parse Trello response for {path}"))
    }

    /// Board actions come newest first; page backwards with `before` until a
    /// short page, then return them oldest first.
    async fn fetch_actions(&self) -> Result<Vec<SourceAction>> {
        let path = format!("/boards/{}/actions", self.board_id);
        let limit = ACTION_PAGE.to_string();
        let mut actions: Vec<SourceAction> = Vec::new();
        let mut before: Option<String> = None;
        loop {
            let mut query = vec![
                ("filter", ACTION_FILTER),
                ("limit", limit.as_str()),
                ("memberCreator_fields", "username,fullName"),
            ];
            if let Some(b) = &before {
                query.push(("before", b.as_str()));
            }
            let page: Vec<SourceAction> = self.get(&path, &query).await?;
            let len = page.len();
            before = page.last().map(|a| a.id.clone());
            actions.extend(page);
            debug!(fetched = actions.len(), "fetched Trello actions page");
            if len < ACTION_PAGE || before.is_none() {
                break;
            }
        }
        actions.sort_by(|a, b| a.date.cmp(&b.date));
        Ok(actions)
    }
}

#[derive(Deserialize)]
struct Board {
    id: String,
    name: String,
}

#[async_trait]
impl SourceClient for TrelloClient {
    fn name(&self) -> &str {
        "Trello"
    }

    async fn get_board(&self) -> Result<SourceBoard> {
        let bid = &self.board_id;
        let board_path = format!("/boards/{bid}");
        let lists_path = format!("/boards/{bid}/lists");
        let cards_path = format!("/boards/{bid}/cards/all");
        let labels_path = format!("/boards/{bid}/labels");
        let checklists_path = format!("/boards/{bid}/checklists");

        let board_fut = self.get::<Board>(&board_path, &[("fields", "id,name")]);
        let lists_fut = self.get::<Vec<SourceList>>(
            &lists_path,
            &[("filter", "all"), ("fields", "id,name,closed")],
        );
        let cards_fut = self.get::<Vec<SourceCard>>(&cards_path, &[("fields", CARD_FIELDS)]);
        let labels_fut =
            self.get::<Vec<SourceLabel>>(&labels_path, &[("fields", "id,name,color")]);
        let checklists_fut = self.get::<Vec<SourceChecklist>>(&checklists_path, &[]);
        let fields_fut = self.get_custom_field_definitions();
        let actions_fut = self.fetch_actions();

        let (board, lists, cards, labels, checklists, custom_fields, actions) = tokio::try_join!(
            board_fut,
            lists_fut,
            cards_fut,
            labels_fut,
            checklists_fut,
            fields_fut,
            actions_fut
        )
        .context("Failed to fetch Trello board snapshot")?;

        Ok(SourceBoard {
            id: board.id,
            name: board.name,
            lists,
            cards,
            labels,
            checklists,
            actions,
            custom_fields,
        })
    }

    async fn get_attachments(&self, card_id: &str) -> Result<Vec<SourceAttachment>> {
        self.get(
            &format!("/cards/{card_id}/attachments"),
            &[("fields", "id,name,url,mimeType,isUpload")],
        )
        .await
    }

    async fn download_attachment(&self, url: &str) -> Result<Vec<u8>> {
        // Uploaded attachments only download with OAuth header credentials.
        let auth = format!(
            "OAuth oauth_consumer_key=\"{}\", oauth_token=\"{}\"",
            self.api_key, self.token
        );
        let resp = self
            .client
            .get(url)
            .header("Authorization", auth)
            .send()
            .await
            .with_context(|| format!("Failed to download {url}"))?;
        let resp = check("Trello", resp).await?;
        let bytes = resp.bytes().await.context("Failed to read attachment body")?;
        Ok(bytes.to_vec())
    }

    async fn get_custom_field_definitions(&self) -> Result<Vec<CustomFieldDefinition>> {
        self.get(&format!("/boards/{}/customFields", self.board_id), &[])
            .await
    }

    async fn get_custom_field_values(&self, card_id: &str) -> Result<Vec<CustomFieldValue>> {
        self.get(&format!("/cards/{card_id}/customFieldItems"), &[])
            .await
    }
}
