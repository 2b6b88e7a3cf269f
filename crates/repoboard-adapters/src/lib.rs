//! Capability interfaces for the two external services plus their HTTP
//! implementations: the GitHub repository metadata adapter and the Notion
//! record store client.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use repoboard_core::{RecordPayload, RemoteRecord, RepoStats};
use reqwest::{header, Method, StatusCode};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use thiserror::Error;
use tracing::warn;

pub const CRATE_NAME: &str = "repoboard-adapters";

const GITHUB_API: &str = "https://api.github.com";
const NOTION_API: &str = "https://api.notion.com/v1";
const NOTION_VERSION: &str = "2022-06-28";
const USER_AGENT: &str = "repoboard/0.1";
const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// Board property labels, by the logical field they carry.
pub mod fields {
    pub const TITLE: &str = "Name";
    pub const URL: &str = "GitHub URL";
    pub const DESCRIPTION: &str = "Description";
    pub const STARS: &str = "Stars";
    pub const FORKS: &str = "Forks";
    pub const WATCHERS: &str = "Watchers";
    pub const OPEN_ISSUES: &str = "Open Issues";
    pub const LANGUAGE: &str = "Language";
    pub const TAGS: &str = "Tags";
    pub const LAST_UPDATED: &str = "Last Updated";
    pub const LAST_PUSHED: &str = "Last Pushed";
    pub const OWNER: &str = "Owner";
    pub const LICENSE: &str = "License";
    pub const STATUS: &str = "Status";
    pub const CATEGORY: &str = "Category";
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("invalid repository url {0:?}")]
    InvalidUrl(String),
    #[error("repository {owner}/{repo} not found or not accessible")]
    NotFound { owner: String, repo: String },
    #[error("rate limited fetching {owner}/{repo} (retry after {retry_after:?})")]
    RateLimited {
        owner: String,
        repo: String,
        retry_after: Option<Duration>,
    },
    #[error("metadata api status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error(transparent)]
    Request(#[from] reqwest::Error),
}

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("board service rejected credentials (status {0})")]
    Auth(u16),
    #[error("board write rejected (status {status}): {detail}")]
    Write { status: u16, detail: String },
    #[error("board query failed (status {status}): {detail}")]
    Query { status: u16, detail: String },
    #[error("board response missing field {0:?}")]
    Malformed(&'static str),
    #[error(transparent)]
    Request(#[from] reqwest::Error),
}

/// Read access to the repository metadata service.
#[async_trait]
pub trait RepoMetadata: Send + Sync {
    async fn fetch(&self, owner: &str, repo: &str) -> Result<RepoStats, FetchError>;

    /// Minimal read used by the connection-test command.
    async fn ping(&self) -> Result<(), FetchError>;
}

/// The remote structured database holding one record per project.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn find_by_url(&self, github_url: &str) -> Result<Option<String>, RemoteError>;
    async fn create(&self, payload: &RecordPayload) -> Result<String, RemoteError>;
    async fn update(&self, remote_id: &str, payload: &RecordPayload) -> Result<(), RemoteError>;
    async fn query_all(&self) -> Result<Vec<RemoteRecord>, RemoteError>;
    async fn ping(&self) -> Result<(), RemoteError>;
}

/// Normalizes a repository URL to its `(owner, repo)` pair. Accepts
/// host-prefixed (`https://github.com/acme/widget`) and bare
/// (`acme/widget`) forms; trailing slashes, `.git` suffixes, and deeper
/// paths are tolerated.
pub fn parse_repo_url(url: &str) -> Result<(String, String), FetchError> {
    let invalid = || FetchError::InvalidUrl(url.to_string());

    let mut rest = url.trim();
    for prefix in ["https://", "http://"] {
        rest = rest.strip_prefix(prefix).unwrap_or(rest);
    }
    let rest = rest.trim_matches('/');

    let mut segments = rest.split('/').filter(|s| !s.is_empty());
    let first = segments.next().ok_or_else(invalid)?;
    // A dot in the first segment marks it as a host name, not an owner.
    let owner = if first.contains('.') {
        segments.next().ok_or_else(invalid)?
    } else {
        first
    };
    let repo = segments.next().ok_or_else(invalid)?;
    let repo = repo.strip_suffix(".git").unwrap_or(repo);

    if owner.is_empty() || repo.is_empty() {
        return Err(invalid());
    }
    Ok((owner.to_string(), repo.to_string()))
}

#[derive(Debug, Clone)]
pub struct GithubClient {
    http: reqwest::Client,
    token: Option<String>,
}

impl GithubClient {
    pub fn new(token: Option<String>) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(HTTP_TIMEOUT)
            .build()
            .context("building github http client")?;
        Ok(Self { http, token })
    }

    fn get(&self, url: &str) -> reqwest::RequestBuilder {
        let mut req = self
            .http
            .get(url)
            .header(header::ACCEPT, "application/vnd.github+json");
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }
        req
    }
}

#[async_trait]
impl RepoMetadata for GithubClient {
    async fn fetch(&self, owner: &str, repo: &str) -> Result<RepoStats, FetchError> {
        let url = format!("{GITHUB_API}/repos/{owner}/{repo}");
        let resp = self.get(&url).send().await?;
        let status = resp.status();

        if status.is_success() {
            let body: RepoResponse = resp.json().await?;
            return Ok(body.into_stats());
        }
        if status == StatusCode::NOT_FOUND {
            return Err(FetchError::NotFound {
                owner: owner.to_string(),
                repo: repo.to_string(),
            });
        }
        if status == StatusCode::FORBIDDEN || status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = resp
                .headers()
                .get(header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs);
            return Err(FetchError::RateLimited {
                owner: owner.to_string(),
                repo: repo.to_string(),
                retry_after,
            });
        }
        Err(FetchError::HttpStatus {
            status: status.as_u16(),
            url,
        })
    }

    async fn ping(&self) -> Result<(), FetchError> {
        let url = format!("{GITHUB_API}/rate_limit");
        let resp = self.get(&url).send().await?;
        let status = resp.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url,
            })
        }
    }
}

#[derive(Debug, Deserialize)]
struct RepoResponse {
    name: String,
    #[serde(default)]
    description: Option<String>,
    html_url: String,
    #[serde(default)]
    stargazers_count: u64,
    #[serde(default)]
    forks_count: u64,
    #[serde(default)]
    watchers_count: u64,
    #[serde(default)]
    open_issues_count: u64,
    #[serde(default)]
    language: Option<String>,
    #[serde(default)]
    topics: Vec<String>,
    #[serde(default)]
    updated_at: Option<String>,
    #[serde(default)]
    pushed_at: Option<String>,
    #[serde(default)]
    license: Option<LicenseInfo>,
    #[serde(default)]
    archived: bool,
    owner: OwnerInfo,
}

#[derive(Debug, Deserialize)]
struct LicenseInfo {
    #[serde(default)]
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OwnerInfo {
    login: String,
}

impl RepoResponse {
    fn into_stats(self) -> RepoStats {
        RepoStats {
            name: self.name,
            description: self.description.unwrap_or_default(),
            html_url: self.html_url,
            stars: self.stargazers_count,
            forks: self.forks_count,
            watchers: self.watchers_count,
            open_issues: self.open_issues_count,
            language: self.language.filter(|s| !s.is_empty()),
            license: self.license.and_then(|l| l.name).filter(|s| !s.is_empty()),
            topics: self.topics,
            updated_at: parse_timestamp(self.updated_at.as_deref()),
            pushed_at: parse_timestamp(self.pushed_at.as_deref()),
            owner_login: self.owner.login,
            archived: self.archived,
        }
    }
}

/// Unparsable upstream dates become `None` instead of failing the fetch.
fn parse_timestamp(raw: Option<&str>) -> Option<DateTime<Utc>> {
    let raw = raw?.trim();
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

#[derive(Debug, Clone)]
pub struct NotionClient {
    http: reqwest::Client,
    token: String,
    database_id: String,
}

impl NotionClient {
    pub fn new(token: impl Into<String>, database_id: impl Into<String>) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(HTTP_TIMEOUT)
            .build()
            .context("building board http client")?;
        Ok(Self {
            http,
            token: token.into(),
            database_id: database_id.into(),
        })
    }

    fn request(&self, method: Method, url: String) -> reqwest::RequestBuilder {
        self.http
            .request(method, url)
            .bearer_auth(&self.token)
            .header("Notion-Version", NOTION_VERSION)
    }

    async fn query_page(&self, cursor: Option<&str>) -> Result<Value, RemoteError> {
        let mut body = json!({ "page_size": 100 });
        if let Some(cursor) = cursor {
            body["start_cursor"] = json!(cursor);
        }
        let resp = self
            .request(
                Method::POST,
                format!("{NOTION_API}/databases/{}/query", self.database_id),
            )
            .json(&body)
            .send()
            .await?;
        into_json(resp, ErrorKind::Query).await
    }
}

enum ErrorKind {
    Write,
    Query,
}

async fn into_json(resp: reqwest::Response, kind: ErrorKind) -> Result<Value, RemoteError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp.json().await?);
    }
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Err(RemoteError::Auth(status.as_u16()));
    }
    let detail: String = resp
        .text()
        .await
        .unwrap_or_default()
        .chars()
        .take(200)
        .collect();
    Err(match kind {
        ErrorKind::Write => RemoteError::Write {
            status: status.as_u16(),
            detail,
        },
        ErrorKind::Query => RemoteError::Query {
            status: status.as_u16(),
            detail,
        },
    })
}

#[async_trait]
impl RecordStore for NotionClient {
    async fn find_by_url(&self, github_url: &str) -> Result<Option<String>, RemoteError> {
        let github_url = github_url.trim();
        if github_url.is_empty() {
            return Ok(None);
        }
        let body = json!({
            "filter": { "property": fields::URL, "url": { "equals": github_url } },
            "page_size": 10,
        });
        let resp = self
            .request(
                Method::POST,
                format!("{NOTION_API}/databases/{}/query", self.database_id),
            )
            .json(&body)
            .send()
            .await?;
        let value = into_json(resp, ErrorKind::Query).await?;

        let results = value
            .get("results")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        if results.len() > 1 {
            warn!(
                url = github_url,
                count = results.len(),
                "multiple board records share one repository url; using the first"
            );
        }
        Ok(results
            .first()
            .and_then(|page| page.get("id"))
            .and_then(Value::as_str)
            .map(str::to_string))
    }

    async fn create(&self, payload: &RecordPayload) -> Result<String, RemoteError> {
        let body = json!({
            "parent": { "database_id": &self.database_id },
            "properties": create_properties(payload),
        });
        let resp = self
            .request(Method::POST, format!("{NOTION_API}/pages"))
            .json(&body)
            .send()
            .await?;
        let value = into_json(resp, ErrorKind::Write).await?;
        value
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or(RemoteError::Malformed("id"))
    }

    async fn update(&self, remote_id: &str, payload: &RecordPayload) -> Result<(), RemoteError> {
        let body = json!({ "properties": update_properties(payload) });
        let resp = self
            .request(Method::PATCH, format!("{NOTION_API}/pages/{remote_id}"))
            .json(&body)
            .send()
            .await?;
        into_json(resp, ErrorKind::Write).await?;
        Ok(())
    }

    async fn query_all(&self) -> Result<Vec<RemoteRecord>, RemoteError> {
        let mut records = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let page = self.query_page(cursor.as_deref()).await?;
            if let Some(results) = page.get("results").and_then(Value::as_array) {
                records.extend(results.iter().filter_map(record_from_page));
            }
            let has_more = page
                .get("has_more")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            cursor = page
                .get("next_cursor")
                .and_then(Value::as_str)
                .map(str::to_string);
            if !has_more || cursor.is_none() {
                return Ok(records);
            }
        }
    }

    async fn ping(&self) -> Result<(), RemoteError> {
        let resp = self
            .request(
                Method::GET,
                format!("{NOTION_API}/databases/{}", self.database_id),
            )
            .send()
            .await?;
        into_json(resp, ErrorKind::Query).await?;
        Ok(())
    }
}

/// Full property set for a create: identity fields (title, url, owner) plus
/// everything [`update_properties`] writes.
pub fn create_properties(payload: &RecordPayload) -> Value {
    let mut props = property_map(payload);
    props.insert(
        fields::TITLE.to_string(),
        json!({ "title": [{ "text": { "content": &payload.title } }] }),
    );
    props.insert(fields::URL.to_string(), json!({ "url": &payload.url }));
    if let Some(owner) = &payload.owner {
        props.insert(fields::OWNER.to_string(), rich_text(owner));
    }
    Value::Object(props)
}

/// Updates never rewrite identity fields: title, url, and owner stay as
/// they were created.
pub fn update_properties(payload: &RecordPayload) -> Value {
    Value::Object(property_map(payload))
}

fn property_map(payload: &RecordPayload) -> Map<String, Value> {
    let mut props = Map::new();
    props.insert(
        fields::DESCRIPTION.to_string(),
        rich_text(&truncate_chars(&payload.description, 2000)),
    );
    props.insert(fields::STARS.to_string(), number(payload.stars));
    props.insert(fields::FORKS.to_string(), number(payload.forks));
    props.insert(fields::WATCHERS.to_string(), number(payload.watchers));
    props.insert(fields::OPEN_ISSUES.to_string(), number(payload.open_issues));
    if let Some(language) = &payload.language {
        props.insert(fields::LANGUAGE.to_string(), select(language));
    }
    if !payload.topics.is_empty() {
        let options: Vec<Value> = payload
            .topics
            .iter()
            .take(10)
            .map(|t| json!({ "name": t }))
            .collect();
        props.insert(fields::TAGS.to_string(), json!({ "multi_select": options }));
    }
    if let Some(updated_at) = payload.updated_at {
        props.insert(
            fields::LAST_UPDATED.to_string(),
            json!({ "date": { "start": updated_at.to_rfc3339() } }),
        );
    }
    if let Some(pushed_at) = payload.pushed_at {
        props.insert(
            fields::LAST_PUSHED.to_string(),
            json!({ "date": { "start": pushed_at.to_rfc3339() } }),
        );
    }
    if let Some(license) = &payload.license {
        props.insert(fields::LICENSE.to_string(), select(license));
    }
    if let Some(archived) = payload.archived {
        let status = if archived { "Archived" } else { "Active" };
        props.insert(fields::STATUS.to_string(), select(status));
    }
    if let Some(category) = &payload.category {
        props.insert(fields::CATEGORY.to_string(), select(category));
    }
    props
}

fn rich_text(content: &str) -> Value {
    json!({ "rich_text": [{ "text": { "content": content } }] })
}

fn select(name: &str) -> Value {
    json!({ "select": { "name": name } })
}

fn number(value: u64) -> Value {
    json!({ "number": value })
}

fn truncate_chars(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

/// Extracts the reconciler's view of a board page. Pages without an id are
/// dropped; a missing url or category property becomes empty/`None`.
pub fn record_from_page(page: &Value) -> Option<RemoteRecord> {
    let remote_id = page.get("id")?.as_str()?.to_string();
    let props = page.get("properties").cloned().unwrap_or_else(|| json!({}));
    let github_url = props
        .get(fields::URL)
        .and_then(|p| p.get("url"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    Some(RemoteRecord {
        remote_id,
        category_label: category_label(&props),
        github_url,
    })
}

/// Reads the category label out of a page's properties, covering the three
/// property shapes the board has historically used for it.
pub fn category_label(props: &Value) -> Option<String> {
    let prop = props.get(fields::CATEGORY)?;
    match prop.get("type").and_then(Value::as_str)? {
        "select" => prop
            .get("select")
            .and_then(|s| s.get("name"))
            .and_then(Value::as_str)
            .map(str::to_string),
        "multi_select" => prop
            .get("multi_select")
            .and_then(Value::as_array)
            .and_then(|opts| opts.first())
            .and_then(|o| o.get("name"))
            .and_then(Value::as_str)
            .map(str::to_string),
        "rich_text" => {
            let text: String = prop
                .get("rich_text")
                .and_then(Value::as_array)
                .map(|items| {
                    items
                        .iter()
                        .filter_map(|i| i.get("plain_text").and_then(Value::as_str))
                        .collect()
                })
                .unwrap_or_default();
            let text = text.trim().to_string();
            if text.is_empty() {
                None
            } else {
                Some(text)
            }
        }
        _ => None,
    }
}
