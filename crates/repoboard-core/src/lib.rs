//! Core domain model for repoboard: the local catalog and the derived
//! records exchanged with the two external services.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "repoboard-core";

/// Sort key used when a row carries no explicit order value; sorts last.
pub const ORDER_UNSET: i64 = 999_999;

/// A grouping bucket for projects, keyed by a stable slug id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Category {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub icon: String,
    #[serde(default = "order_unset")]
    pub order: i64,
    /// Unknown workbook columns carried through load/save untouched.
    #[serde(skip)]
    pub extra: Vec<(String, String)>,
}

fn order_unset() -> i64 {
    ORDER_UNSET
}

impl Category {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            icon: String::new(),
            order: ORDER_UNSET,
            extra: Vec::new(),
        }
    }
}

/// One tracked repository, as configured locally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    #[serde(default)]
    pub category_id: String,
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "github")]
    pub github_url: String,
    #[serde(default)]
    pub topics: Vec<String>,
    #[serde(default)]
    pub notion_page_id: String,
    #[serde(default = "order_unset")]
    pub order: i64,
    #[serde(skip)]
    pub extra: Vec<(String, String)>,
}

impl Project {
    pub fn new(id: impl Into<String>, github_url: impl Into<String>) -> Self {
        Self {
            category_id: String::new(),
            id: id.into(),
            name: String::new(),
            description: String::new(),
            github_url: github_url.into(),
            topics: Vec::new(),
            notion_page_id: String::new(),
            order: ORDER_UNSET,
            extra: Vec::new(),
        }
    }

    pub fn has_page_id(&self) -> bool {
        !self.notion_page_id.trim().is_empty()
    }
}

/// The in-memory aggregate loaded from / saved to the workbook.
///
/// `projects` is kept flat, in file order; grouping into categories is a
/// view computed by [`Catalog::ordered_projects`]. Mutation happens in
/// memory only; the caller persists the whole catalog at the end of a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Catalog {
    #[serde(default)]
    pub categories: Vec<Category>,
    #[serde(default)]
    pub projects: Vec<Project>,
    /// Header names of unknown columns, in workbook order.
    #[serde(skip)]
    pub extra_category_columns: Vec<String>,
    #[serde(skip)]
    pub extra_project_columns: Vec<String>,
}

impl Catalog {
    pub fn category(&self, id: &str) -> Option<&Category> {
        self.categories.iter().find(|c| c.id == id)
    }

    pub fn project_index(&self, id: &str) -> Option<usize> {
        self.projects.iter().position(|p| p.id == id)
    }

    pub fn project_index_by_page_id(&self, page_id: &str) -> Option<usize> {
        self.projects
            .iter()
            .position(|p| p.has_page_id() && p.notion_page_id == page_id)
    }

    /// Categories in display order: ascending `order`, ties in file order.
    pub fn ordered_categories(&self) -> Vec<&Category> {
        let mut cats: Vec<&Category> = self.categories.iter().collect();
        cats.sort_by_key(|c| c.order);
        cats
    }

    /// Iteration order for a sync run: projects grouped by category in
    /// category order, each group in ascending project `order` (ties in
    /// file order), with uncategorized or dangling projects in a trailing
    /// group. Returns `(project index, category name)` pairs so the caller
    /// may mutate projects while iterating.
    pub fn ordered_projects(&self) -> Vec<(usize, Option<String>)> {
        let mut slots = Vec::with_capacity(self.projects.len());
        let mut seen = vec![false; self.projects.len()];

        for category in self.ordered_categories() {
            let mut group: Vec<usize> = self
                .projects
                .iter()
                .enumerate()
                .filter(|(_, p)| p.category_id == category.id)
                .map(|(i, _)| i)
                .collect();
            group.sort_by_key(|&i| self.projects[i].order);
            for i in group {
                seen[i] = true;
                slots.push((i, Some(category.name.clone())));
            }
        }

        let mut rest: Vec<usize> = (0..self.projects.len()).filter(|&i| !seen[i]).collect();
        rest.sort_by_key(|&i| self.projects[i].order);
        for i in rest {
            slots.push((i, None));
        }

        slots
    }
}

/// Run-time policy restricting the upsert engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    #[default]
    All,
    CreateOnly,
    UpdateOnly,
}

impl SyncMode {
    /// Accepts the historical aliases; `None` means the value was not
    /// recognized and the caller should fall back to [`SyncMode::All`].
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "all" | "full" | "both" => Some(Self::All),
            "create_only" | "create" | "new_only" | "only_create" => Some(Self::CreateOnly),
            "update_only" | "update" | "only_update" => Some(Self::UpdateOnly),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::All => "all",
            Self::CreateOnly => "create_only",
            Self::UpdateOnly => "update_only",
        }
    }
}

/// Normalized repository statistics fetched from the metadata service.
/// Validated at the adapter boundary; missing fields become defaults here
/// rather than propagating untyped payloads inward.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoStats {
    pub name: String,
    pub description: String,
    pub html_url: String,
    pub stars: u64,
    pub forks: u64,
    pub watchers: u64,
    pub open_issues: u64,
    pub language: Option<String>,
    pub license: Option<String>,
    pub topics: Vec<String>,
    pub updated_at: Option<DateTime<Utc>>,
    pub pushed_at: Option<DateTime<Utc>>,
    pub owner_login: String,
    pub archived: bool,
}

/// A board record as seen by the reconciler: just enough to match it back
/// to a local project and read its classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteRecord {
    pub remote_id: String,
    pub category_label: Option<String>,
    pub github_url: String,
}

/// The explicit field payload written to the board for one project.
/// Built by the upsert engine, serialized by the record store client.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordPayload {
    pub title: String,
    pub url: String,
    pub description: String,
    pub stars: u64,
    pub forks: u64,
    pub watchers: u64,
    pub open_issues: u64,
    pub language: Option<String>,
    pub topics: Vec<String>,
    pub updated_at: Option<DateTime<Utc>>,
    pub pushed_at: Option<DateTime<Utc>>,
    pub owner: Option<String>,
    pub license: Option<String>,
    pub archived: Option<bool>,
    pub category: Option<String>,
}
