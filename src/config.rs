use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::MigrateError;
use crate::migrate::options::{InclusionFilter, MigrationOptions};

pub const DEFAULT_LINK_BASE: &str = "https://trello.com";

#[derive(Debug, Deserialize, Default)]
pub struct AppConfig {
    pub trello: Option<TrelloConfig>,
    pub gitlab: Option<GitLabConfig>,
    #[serde(default)]
    pub migration: MigrationConfig,
}

#[derive(Debug, Deserialize)]
pub struct TrelloConfig {
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub token: String,
    pub board_id: String,
    pub link_base: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct GitLabConfig {
    pub url: String,
    #[serde(default)]
    pub token: String,
    pub project: ProjectRef,
}

/// A project is addressed either by numeric id or by `group/project` path.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum ProjectRef {
    Id(u64),
    Path(String),
}

impl fmt::Display for ProjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Id(id) => write!(f, "{id}"),
            Self::Path(path) => write!(f, "{path}"),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct MigrationConfig {
    #[serde(default = "default_true")]
    pub preserve_authorship: bool,
    pub include: Option<Vec<String>>,
    /// Trello member id -> GitLab user id.
    #[serde(default)]
    pub members: HashMap<String, u64>,
    /// Trello username -> GitLab username, kept in file order.
    #[serde(default)]
    pub mentions: toml::Table,
    /// Trello label id -> GitLab label name.
    #[serde(default)]
    pub labels: HashMap<String, String>,
    /// Trello label id -> GitLab milestone iid.
    #[serde(default)]
    pub label_milestones: HashMap<String, u64>,
    /// Trello list id -> GitLab milestone iid.
    #[serde(default)]
    pub list_milestones: HashMap<String, u64>,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            preserve_authorship: true,
            include: None,
            members: HashMap::new(),
            mentions: toml::Table::new(),
            labels: HashMap::new(),
            label_milestones: HashMap::new(),
            list_milestones: HashMap::new(),
        }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone)]
pub struct TrelloSettings {
    pub api_key: String,
    pub token: String,
    pub board_id: String,
    pub link_base: String,
}

#[derive(Debug, Clone)]
pub struct GitLabSettings {
    pub url: String,
    pub token: String,
    pub project: ProjectRef,
}

/// Validated configuration. Building it performs no network activity.
#[derive(Debug, Clone)]
pub struct Settings {
    pub trello: TrelloSettings,
    pub gitlab: GitLabSettings,
    pub migration: MigrationOptions,
}

fn config_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".trellab")
        .join("config.toml")
}

/// Load the config file. An explicit path must exist; the default one may not.
pub fn load_config(path: Option<&Path>) -> Result<AppConfig> {
    let (path, explicit) = match path {
        Some(p) => (p.to_path_buf(), true),
        None => (config_path(), false),
    };
    if !path.exists() {
        if explicit {
            return Err(MigrateError::config(format!(
                "config file {} does not exist",
                path.display()
            ))
            .into());
        }
        return Ok(AppConfig::default());
    }
    let contents = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read config from {}", path.display()))?;
    parse_config(&contents).with_context(|| format!("Failed to parse {}", path.display()))
}

pub fn parse_config(contents: &str) -> Result<AppConfig> {
    let config: AppConfig = toml::from_str(contents)
        .map_err(|e| MigrateError::config(e.message().to_string()))?;
    Ok(config)
}

fn secret(value: String, var: &str) -> Option<String> {
    if !value.trim().is_empty() {
        return Some(value);
    }
    std::env::var(var).ok().filter(|v| !v.trim().is_empty())
}

impl AppConfig {
    /// Check required settings and turn the raw file into [`Settings`].
    /// `extra_include` extends the allow-list from the file.
    pub fn validate(self, extra_include: &[String]) -> Result<Settings, MigrateError> {
        let trello = self
            .trello
            .ok_or_else(|| MigrateError::config("missing [trello] section"))?;
        let gitlab = self
            .gitlab
            .ok_or_else(|| MigrateError::config("missing [gitlab] section"))?;

        let api_key = secret(trello.api_key, "TRELLO_API_KEY")
            .ok_or_else(|| MigrateError::config("trello.api_key is not set"))?;
        let token = secret(trello.token, "TRELLO_TOKEN")
            .ok_or_else(|| MigrateError::config("trello.token is not set"))?;
        if trello.board_id.trim().is_empty() {
            return Err(MigrateError::config("trello.board_id is empty"));
        }
        let gitlab_token = secret(gitlab.token, "GITLAB_TOKEN")
            .ok_or_else(|| MigrateError::config("gitlab.token is not set"))?;
        if !gitlab.url.starts_with("http://") && !gitlab.url.starts_with("https://") {
            return Err(MigrateError::config(format!(
                "gitlab.url must be an http(s) URL, got {:?}",
                gitlab.url
            )));
        }
        if let ProjectRef::Path(path) = &gitlab.project {
            if path.trim().is_empty() {
                return Err(MigrateError::config("gitlab.project is empty"));
            }
        }

        let migration = self.migration;
        let mut mentions = Vec::with_capacity(migration.mentions.len());
        for (source, target) in migration.mentions {
            let target = target.as_str().ok_or_else(|| {
                MigrateError::config(format!("migration.mentions.{source} must be a string"))
            })?;
            mentions.push((
                source.trim_start_matches('@').to_string(),
                target.trim_start_matches('@').to_string(),
            ));
        }
        if let Some((member, _)) = migration.members.iter().find(|(_, id)| **id == 0) {
            return Err(MigrateError::config(format!(
                "migration.members.{member} must be a GitLab user id"
            )));
        }

        let mut include: Vec<String> = migration.include.unwrap_or_default();
        include.extend(extra_include.iter().cloned());
        let include = if include.is_empty() {
            None
        } else {
            Some(InclusionFilter::new(include))
        };

        Ok(Settings {
            trello: TrelloSettings {
                api_key,
                token,
                board_id: trello.board_id,
                link_base: trello
                    .link_base
                    .unwrap_or_else(|| DEFAULT_LINK_BASE.to_string())
                    .trim_end_matches('/')
                    .to_string(),
            },
            gitlab: GitLabSettings {
                url: gitlab.url.trim_end_matches('/').to_string(),
                token: gitlab_token,
                project: gitlab.project,
            },
            migration: MigrationOptions {
                members: migration.members,
                mentions,
                labels: migration.labels,
                label_milestones: migration.label_milestones,
                list_milestones: migration.list_milestones,
                include,
                preserve_authorship: migration.preserve_authorship,
            },
        })
    }
}
