//! Sync engine: the per-project upsert decision, the run orchestrator, and
//! the category reconciler that reads classifications back from the board.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use repoboard_adapters::{parse_repo_url, RecordStore, RemoteError, RepoMetadata};
use repoboard_core::{Catalog, Project, RecordPayload, RepoStats, SyncMode};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "repoboard-sync";

pub const DEFAULT_PROJECTS_FILE: &str = "data/projects.xlsx";
const DEFAULT_WRITE_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    MissingVar(&'static str),
}

/// Run configuration, read once at startup and passed into the orchestrator.
/// Inner components never consult the environment themselves.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub notion_token: String,
    pub database_id: String,
    pub github_token: Option<String>,
    pub projects_file: PathBuf,
    pub sync_mode: SyncMode,
    pub reconcile_before_sync: bool,
    pub write_delay: Duration,
}

impl RunConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let sync_mode = match nonempty_var("SYNC_MODE") {
            Some(raw) => SyncMode::parse(&raw).unwrap_or_else(|| {
                warn!(value = %raw, "unrecognized SYNC_MODE; falling back to \"all\"");
                SyncMode::All
            }),
            None => SyncMode::All,
        };

        Ok(Self {
            notion_token: nonempty_var("NOTION_TOKEN")
                .ok_or(ConfigError::MissingVar("NOTION_TOKEN"))?,
            database_id: nonempty_var("NOTION_DATABASE_ID")
                .ok_or(ConfigError::MissingVar("NOTION_DATABASE_ID"))?,
            github_token: nonempty_var("GITHUB_TOKEN"),
            projects_file: nonempty_var("PROJECTS_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_PROJECTS_FILE)),
            sync_mode,
            reconcile_before_sync: parse_bool(
                nonempty_var("SYNC_CATEGORY_FROM_NOTION").as_deref(),
                false,
            ),
            write_delay: nonempty_var("SYNC_DELAY_MS")
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_WRITE_DELAY),
        })
    }
}

fn nonempty_var(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub fn parse_bool(raw: Option<&str>, default: bool) -> bool {
    match raw.map(|v| v.trim().to_ascii_lowercase()) {
        Some(v) if ["1", "true", "yes", "on"].contains(&v.as_str()) => true,
        Some(v) if ["0", "false", "no", "off"].contains(&v.as_str()) => false,
        _ => default,
    }
}

/// What the upsert engine will do for one project.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpsertAction {
    Skip,
    Create,
    Update { remote_id: String, backfill: bool },
}

/// The create/update/skip decision table, as a pure function of the local
/// identifier, the URL-fallback lookup result, and the active mode.
///
/// The URL lookup prevents duplicate records when the local identifier was
/// lost (catalog reset) but the remote record persists.
pub fn decide(page_id: Option<&str>, url_match: Option<&str>, mode: SyncMode) -> UpsertAction {
    match (page_id, url_match, mode) {
        (Some(_), _, SyncMode::CreateOnly) => UpsertAction::Skip,
        (Some(id), _, _) => UpsertAction::Update {
            remote_id: id.to_string(),
            backfill: false,
        },
        (None, Some(_), SyncMode::CreateOnly) => UpsertAction::Skip,
        (None, Some(id), _) => UpsertAction::Update {
            remote_id: id.to_string(),
            backfill: true,
        },
        (None, None, SyncMode::UpdateOnly) => UpsertAction::Skip,
        (None, None, _) => UpsertAction::Create,
    }
}

/// Order-preserving, case-insensitive union of local and fetched topics.
pub fn merge_topics(local: &[String], fetched: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut merged = Vec::new();
    for topic in local.iter().chain(fetched.iter()) {
        let topic = topic.trim();
        if topic.is_empty() {
            continue;
        }
        if seen.insert(topic.to_lowercase()) {
            merged.push(topic.to_string());
        }
    }
    merged
}

/// Builds the board field payload for one project. When stats are absent
/// (fetch failed) the numeric fields stay defined at zero and the static
/// local fields carry the record.
pub fn build_payload(
    project: &Project,
    stats: Option<&RepoStats>,
    category_name: Option<&str>,
) -> RecordPayload {
    let fetched_topics: &[String] = stats.map(|s| s.topics.as_slice()).unwrap_or(&[]);
    let topics = merge_topics(&project.topics, fetched_topics);

    let title = stats
        .map(|s| s.name.clone())
        .filter(|s| !s.is_empty())
        .or_else(|| Some(project.name.clone()).filter(|s| !s.is_empty()))
        .unwrap_or_else(|| project.id.clone());
    let description = stats
        .map(|s| s.description.clone())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| project.description.clone());
    let url = stats
        .map(|s| s.html_url.clone())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| project.github_url.clone());

    RecordPayload {
        title,
        url,
        description,
        stars: stats.map(|s| s.stars).unwrap_or(0),
        forks: stats.map(|s| s.forks).unwrap_or(0),
        watchers: stats.map(|s| s.watchers).unwrap_or(0),
        open_issues: stats.map(|s| s.open_issues).unwrap_or(0),
        language: stats.and_then(|s| s.language.clone()),
        topics,
        updated_at: stats.and_then(|s| s.updated_at),
        pushed_at: stats.and_then(|s| s.pushed_at),
        owner: stats.map(|s| s.owner_login.clone()).filter(|s| !s.is_empty()),
        license: stats.and_then(|s| s.license.clone()),
        archived: stats.map(|s| s.archived),
        category: category_name.map(str::to_string),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProjectFailure {
    pub project_id: String,
    pub cause: String,
}

/// Aggregate counts for one sync run. `failed` counts failure entries, so a
/// project whose metadata fetch failed but whose upsert succeeded shows up
/// both as a failure and in the action counts.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncReport {
    pub created: usize,
    pub updated: usize,
    pub skipped: usize,
    pub failed: usize,
    pub failures: Vec<ProjectFailure>,
}

impl SyncReport {
    fn record_failure(&mut self, project_id: &str, cause: impl Into<String>) {
        self.failures.push(ProjectFailure {
            project_id: project_id.to_string(),
            cause: cause.into(),
        });
        self.failed = self.failures.len();
    }
}

/// Per-project upsert engine plus the sequential iteration loop.
///
/// One external call is in flight at a time, and every board write is
/// preceded by a fixed sleep to stay under the service's requests-per-
/// second ceiling.
pub struct SyncEngine {
    mode: SyncMode,
    write_delay: Duration,
    github: Arc<dyn RepoMetadata>,
    records: Arc<dyn RecordStore>,
}

impl SyncEngine {
    pub fn new(
        mode: SyncMode,
        write_delay: Duration,
        github: Arc<dyn RepoMetadata>,
        records: Arc<dyn RecordStore>,
    ) -> Self {
        Self {
            mode,
            write_delay,
            github,
            records,
        }
    }

    /// Iterates the catalog in category order then project order, with
    /// uncategorized projects in a trailing group. Per-project errors are
    /// isolated here; the loop never aborts on one.
    pub async fn sync_catalog(&self, catalog: &mut Catalog) -> SyncReport {
        let mut report = SyncReport::default();
        for (idx, category_name) in catalog.ordered_projects() {
            self.sync_one(
                &mut catalog.projects[idx],
                category_name.as_deref(),
                &mut report,
            )
            .await;
        }
        report
    }

    async fn sync_one(
        &self,
        project: &mut Project,
        category_name: Option<&str>,
        report: &mut SyncReport,
    ) {
        let (owner, repo) = match parse_repo_url(&project.github_url) {
            Ok(parsed) => parsed,
            Err(err) => {
                warn!(project = %project.id, %err, "skipping project with unusable url");
                report.record_failure(&project.id, err.to_string());
                return;
            }
        };

        let url_match = if project.has_page_id() {
            None
        } else {
            match self.records.find_by_url(&project.github_url).await {
                Ok(found) => found,
                Err(err) => {
                    // Without the lookup, create vs update cannot be decided
                    // safely; bail on this project rather than risk a duplicate.
                    report.record_failure(&project.id, format!("board lookup failed: {err}"));
                    return;
                }
            }
        };

        // Decide before touching the metadata service: a skipped project
        // must cost zero remote calls.
        let page_id = project.has_page_id().then(|| project.notion_page_id.clone());
        match decide(page_id.as_deref(), url_match.as_deref(), self.mode) {
            UpsertAction::Skip => {
                info!(project = %project.id, mode = self.mode.as_str(), "skipped");
                report.skipped += 1;
            }
            UpsertAction::Create => {
                let stats = self.fetch_stats(&project.id, &owner, &repo, report).await;
                let payload = build_payload(project, stats.as_ref(), category_name);
                self.pause().await;
                match self.records.create(&payload).await {
                    Ok(remote_id) => {
                        project.notion_page_id = remote_id;
                        report.created += 1;
                        info!(project = %project.id, "board record created");
                    }
                    Err(err) => report.record_failure(&project.id, format!("create rejected: {err}")),
                }
            }
            UpsertAction::Update { remote_id, backfill } => {
                let stats = self.fetch_stats(&project.id, &owner, &repo, report).await;
                let payload = build_payload(project, stats.as_ref(), category_name);
                self.pause().await;
                match self.records.update(&remote_id, &payload).await {
                    Ok(()) => {
                        if backfill {
                            info!(project = %project.id, "recovered board record by url; backfilling id");
                            project.notion_page_id = remote_id;
                        }
                        report.updated += 1;
                    }
                    Err(err) => report.record_failure(&project.id, format!("update rejected: {err}")),
                }
            }
        }
    }

    /// Fetch failures are non-fatal: record them and upsert with the local
    /// fields only, so the board record keeps defined values.
    async fn fetch_stats(
        &self,
        project_id: &str,
        owner: &str,
        repo: &str,
        report: &mut SyncReport,
    ) -> Option<RepoStats> {
        match self.github.fetch(owner, repo).await {
            Ok(stats) => Some(stats),
            Err(err) => {
                warn!(project = %project_id, %err, "metadata fetch failed; using local fields");
                report.record_failure(project_id, err.to_string());
                None
            }
        }
    }

    async fn pause(&self) {
        if !self.write_delay.is_zero() {
            tokio::time::sleep(self.write_delay).await;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileMode {
    Preview,
    Apply,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CategoryChange {
    pub project_id: String,
    pub old_category_id: String,
    pub new_category_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnmappedRecord {
    pub remote_id: String,
    pub label: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconcileReport {
    pub changes: Vec<CategoryChange>,
    pub unmapped: Vec<UnmappedRecord>,
}

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("reconcile ambiguity: {0}")]
    Consistency(String),
    #[error(transparent)]
    Remote(#[from] RemoteError),
}

/// Reads every board record, maps category labels back to local category
/// ids by case-insensitive exact name match, and reports the pending
/// changes. Preview mode never mutates; apply mode writes the changes into
/// the catalog and leaves persistence to the caller. Labels naming no local
/// category are reported as unmapped rather than erroring.
pub async fn reconcile(
    records: &dyn RecordStore,
    catalog: &mut Catalog,
    mode: ReconcileMode,
) -> Result<ReconcileReport, ReconcileError> {
    let mut by_name: HashMap<String, String> = HashMap::new();
    for category in &catalog.categories {
        let key = category.name.trim().to_lowercase();
        if let Some(existing) = by_name.insert(key, category.id.clone()) {
            if existing != category.id {
                return Err(ReconcileError::Consistency(format!(
                    "categories {existing:?} and {:?} share the name {:?} case-insensitively",
                    category.id, category.name
                )));
            }
        }
    }

    let remote = records.query_all().await?;

    let mut report = ReconcileReport::default();
    let mut matched: HashSet<usize> = HashSet::new();
    let mut pending: Vec<(usize, String)> = Vec::new();

    for record in &remote {
        let Some(label) = record
            .category_label
            .as_deref()
            .map(str::trim)
            .filter(|l| !l.is_empty())
        else {
            continue;
        };

        // Label mapping comes first: an unknown label is reported even when
        // the record matches no local project.
        let Some(new_category_id) = by_name.get(&label.to_lowercase()) else {
            report.unmapped.push(UnmappedRecord {
                remote_id: record.remote_id.clone(),
                label: label.to_string(),
            });
            continue;
        };

        let Some(idx) = catalog.project_index_by_page_id(&record.remote_id) else {
            continue;
        };
        if !matched.insert(idx) {
            return Err(ReconcileError::Consistency(format!(
                "multiple board records resolve to project {:?}",
                catalog.projects[idx].id
            )));
        }

        let project = &catalog.projects[idx];
        if &project.category_id != new_category_id {
            report.changes.push(CategoryChange {
                project_id: project.id.clone(),
                old_category_id: project.category_id.clone(),
                new_category_id: new_category_id.clone(),
            });
            pending.push((idx, new_category_id.clone()));
        }
    }

    if mode == ReconcileMode::Apply {
        for (idx, category_id) in pending {
            catalog.projects[idx].category_id = category_id;
        }
    }

    Ok(report)
}

/// Outcome of one full sync run.
#[derive(Debug)]
pub struct RunSummary {
    pub report: SyncReport,
    pub reconcile: Option<ReconcileReport>,
    pub migrated: bool,
    pub catalog_path: PathBuf,
}

/// The orchestrator state machine: load, optional reverse reconciliation,
/// sequential iteration, then a single persist. A non-empty failure list
/// does not prevent the save; partial success is expected and kept.
pub async fn run_sync(
    config: &RunConfig,
    github: Arc<dyn RepoMetadata>,
    records: Arc<dyn RecordStore>,
) -> Result<RunSummary> {
    let (mut catalog, migrated) = repoboard_store::load(&config.projects_file)
        .with_context(|| format!("loading catalog {}", config.projects_file.display()))?;
    info!(
        categories = catalog.categories.len(),
        projects = catalog.projects.len(),
        migrated,
        "catalog loaded"
    );

    let mut reconcile_report = None;
    if config.reconcile_before_sync {
        match reconcile(records.as_ref(), &mut catalog, ReconcileMode::Apply).await {
            Ok(report) => {
                info!(
                    changes = report.changes.len(),
                    unmapped = report.unmapped.len(),
                    "category reconciliation pre-pass done"
                );
                reconcile_report = Some(report);
            }
            Err(err) => {
                warn!(%err, "category reconciliation failed; continuing with sync");
            }
        }
    }

    let engine = SyncEngine::new(config.sync_mode, config.write_delay, github, records);
    let report = engine.sync_catalog(&mut catalog).await;

    repoboard_store::save(&config.projects_file, &catalog)
        .with_context(|| format!("persisting catalog {}", config.projects_file.display()))?;

    Ok(RunSummary {
        report,
        reconcile: reconcile_report,
        migrated,
        catalog_path: config.projects_file.clone(),
    })
}

/// Loads the catalog, runs the reconciler, and persists only in apply mode.
pub async fn run_reconcile(
    config: &RunConfig,
    records: Arc<dyn RecordStore>,
    mode: ReconcileMode,
) -> Result<ReconcileReport> {
    let (mut catalog, _migrated) = repoboard_store::load(&config.projects_file)
        .with_context(|| format!("loading catalog {}", config.projects_file.display()))?;
    let report = reconcile(records.as_ref(), &mut catalog, mode).await?;
    if mode == ReconcileMode::Apply {
        repoboard_store::save(&config.projects_file, &catalog)
            .with_context(|| format!("persisting catalog {}", config.projects_file.display()))?;
    }
    Ok(report)
}

/// Minimal read against both external services, for the `test` command.
pub async fn verify_connections(
    github: &dyn RepoMetadata,
    records: &dyn RecordStore,
) -> Result<()> {
    github.ping().await.context("repository metadata service")?;
    records.ping().await.context("board service")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use repoboard_adapters::FetchError;
    use repoboard_core::{Category, RemoteRecord};
    use std::sync::Mutex;

    #[test]
    fn upsert_decision_table_covers_all_inputs() {
        use SyncMode::*;
        use UpsertAction::*;

        let update = |id: &str, backfill| Update {
            remote_id: id.to_string(),
            backfill,
        };

        // page id known: only create_only skips
        assert_eq!(decide(Some("p"), None, CreateOnly), Skip);
        assert_eq!(decide(Some("p"), None, UpdateOnly), update("p", false));
        assert_eq!(decide(Some("p"), None, All), update("p", false));

        // no page id, url lookup found a record: update + backfill
        assert_eq!(decide(None, Some("r"), CreateOnly), Skip);
        assert_eq!(decide(None, Some("r"), UpdateOnly), update("r", true));
        assert_eq!(decide(None, Some("r"), All), update("r", true));

        // nothing known remotely: create unless update_only
        assert_eq!(decide(None, None, CreateOnly), Create);
        assert_eq!(decide(None, None, UpdateOnly), Skip);
        assert_eq!(decide(None, None, All), Create);
    }

    #[test]
    fn topics_merge_preserves_order_and_dedups_case_insensitively() {
        let local = vec!["Rust".to_string(), "cli".to_string()];
        let fetched = vec!["rust".to_string(), "tui".to_string(), "".to_string()];
        assert_eq!(merge_topics(&local, &fetched), vec!["Rust", "cli", "tui"]);
    }

    #[test]
    fn payload_defaults_numbers_to_zero_without_stats() {
        let mut project = Project::new("p1", "https://github.com/acme/widget");
        project.name = "Widget".into();
        project.topics = vec!["rust".into()];

        let payload = build_payload(&project, None, Some("AI"));
        assert_eq!(payload.title, "Widget");
        assert_eq!(payload.url, "https://github.com/acme/widget");
        assert_eq!(payload.stars, 0);
        assert_eq!(payload.open_issues, 0);
        assert_eq!(payload.topics, vec!["rust"]);
        assert_eq!(payload.category.as_deref(), Some("AI"));
        assert!(payload.language.is_none());
        assert!(payload.archived.is_none());
    }

    #[test]
    fn bool_env_values_parse() {
        assert!(parse_bool(Some("1"), false));
        assert!(parse_bool(Some("Yes"), false));
        assert!(!parse_bool(Some("off"), true));
        assert!(parse_bool(None, true));
        assert!(!parse_bool(Some("maybe"), false));
    }

    fn stats(stars: u64, forks: u64) -> RepoStats {
        RepoStats {
            name: "widget".into(),
            description: "a widget".into(),
            html_url: "https://github.com/acme/widget".into(),
            stars,
            forks,
            watchers: stars,
            open_issues: 0,
            language: Some("Rust".into()),
            license: None,
            topics: vec!["rust".into()],
            updated_at: None,
            pushed_at: None,
            owner_login: "acme".into(),
            archived: false,
        }
    }

    struct StubMetadata {
        stats: Option<RepoStats>,
        fail_repos: Vec<String>,
        fetches: Mutex<Vec<String>>,
    }

    impl StubMetadata {
        fn ok(stats: RepoStats) -> Self {
            Self {
                stats: Some(stats),
                fail_repos: Vec::new(),
                fetches: Mutex::new(Vec::new()),
            }
        }

        fn failing(repo: &str, stats: RepoStats) -> Self {
            Self {
                stats: Some(stats),
                fail_repos: vec![repo.to_string()],
                fetches: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl RepoMetadata for StubMetadata {
        async fn fetch(&self, owner: &str, repo: &str) -> Result<RepoStats, FetchError> {
            self.fetches.lock().unwrap().push(format!("{owner}/{repo}"));
            if self.fail_repos.iter().any(|r| r == repo) {
                return Err(FetchError::NotFound {
                    owner: owner.to_string(),
                    repo: repo.to_string(),
                });
            }
            Ok(self.stats.clone().expect("stub stats"))
        }

        async fn ping(&self) -> Result<(), FetchError> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct StubRecords {
        by_url: HashMap<String, String>,
        records: Vec<RemoteRecord>,
        lookups: Mutex<Vec<String>>,
        created: Mutex<Vec<RecordPayload>>,
        updated: Mutex<Vec<(String, RecordPayload)>>,
    }

    #[async_trait]
    impl RecordStore for StubRecords {
        async fn find_by_url(&self, github_url: &str) -> Result<Option<String>, RemoteError> {
            self.lookups.lock().unwrap().push(github_url.to_string());
            Ok(self.by_url.get(github_url).cloned())
        }

        async fn create(&self, payload: &RecordPayload) -> Result<String, RemoteError> {
            let mut created = self.created.lock().unwrap();
            created.push(payload.clone());
            Ok(format!("page-{}", created.len()))
        }

        async fn update(&self, remote_id: &str, payload: &RecordPayload) -> Result<(), RemoteError> {
            self.updated
                .lock()
                .unwrap()
                .push((remote_id.to_string(), payload.clone()));
            Ok(())
        }

        async fn query_all(&self) -> Result<Vec<RemoteRecord>, RemoteError> {
            Ok(self.records.clone())
        }

        async fn ping(&self) -> Result<(), RemoteError> {
            Ok(())
        }
    }

    fn one_project_catalog() -> Catalog {
        let mut ai = Category::new("ai", "AI");
        ai.order = 1;
        let mut p1 = Project::new("p1", "https://github.com/acme/widget");
        p1.category_id = "ai".into();
        p1.order = 1;
        Catalog {
            categories: vec![ai],
            projects: vec![p1],
            ..Catalog::default()
        }
    }

    fn engine(mode: SyncMode, github: Arc<dyn RepoMetadata>, records: Arc<dyn RecordStore>) -> SyncEngine {
        SyncEngine::new(mode, Duration::ZERO, github, records)
    }

    #[tokio::test]
    async fn first_sync_creates_and_backfills_page_id() {
        let mut catalog = one_project_catalog();
        let records = Arc::new(StubRecords::default());
        let github = Arc::new(StubMetadata::ok(stats(42, 3)));

        let report = engine(SyncMode::All, github, records.clone())
            .sync_catalog(&mut catalog)
            .await;

        let created = records.created.lock().unwrap();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].stars, 42);
        assert_eq!(created[0].forks, 3);
        assert_eq!(created[0].category.as_deref(), Some("AI"));
        assert_eq!(catalog.projects[0].notion_page_id, "page-1");
        assert_eq!(report.created, 1);
        assert!(report.failures.is_empty());
    }

    #[tokio::test]
    async fn create_only_skips_known_projects_without_any_remote_call() {
        let mut catalog = one_project_catalog();
        catalog.projects[0].notion_page_id = "existing".into();
        let records = Arc::new(StubRecords::default());
        let github = Arc::new(StubMetadata::ok(stats(1, 1)));

        let report = engine(SyncMode::CreateOnly, github.clone(), records.clone())
            .sync_catalog(&mut catalog)
            .await;

        assert_eq!(report.skipped, 1);
        assert!(report.failures.is_empty());
        assert!(github.fetches.lock().unwrap().is_empty());
        assert!(records.lookups.lock().unwrap().is_empty());
        assert!(records.created.lock().unwrap().is_empty());
        assert!(records.updated.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn url_match_updates_and_backfills_instead_of_duplicating() {
        let mut catalog = one_project_catalog();
        let mut records = StubRecords::default();
        records.by_url.insert(
            "https://github.com/acme/widget".to_string(),
            "recovered".to_string(),
        );
        let records = Arc::new(records);
        let github = Arc::new(StubMetadata::ok(stats(5, 1)));

        let report = engine(SyncMode::All, github, records.clone())
            .sync_catalog(&mut catalog)
            .await;

        assert!(records.created.lock().unwrap().is_empty());
        let updated = records.updated.lock().unwrap();
        assert_eq!(updated.len(), 1);
        assert_eq!(updated[0].0, "recovered");
        assert_eq!(catalog.projects[0].notion_page_id, "recovered");
        assert_eq!(report.updated, 1);
    }

    #[tokio::test]
    async fn update_only_issues_no_writes_for_unknown_projects() {
        let mut catalog = one_project_catalog();
        let records = Arc::new(StubRecords::default());
        let github = Arc::new(StubMetadata::ok(stats(1, 1)));

        let report = engine(SyncMode::UpdateOnly, github.clone(), records.clone())
            .sync_catalog(&mut catalog)
            .await;

        assert_eq!(report.skipped, 1);
        assert!(github.fetches.lock().unwrap().is_empty());
        assert!(records.created.lock().unwrap().is_empty());
        assert!(records.updated.lock().unwrap().is_empty());
        assert_eq!(catalog.projects[0].notion_page_id, "");
    }

    #[tokio::test]
    async fn fetch_failure_is_isolated_and_upsert_still_runs() {
        let mut catalog = one_project_catalog();
        let mut p2 = Project::new("p2", "https://github.com/acme/gadget");
        p2.category_id = "ai".into();
        p2.order = 2;
        catalog.projects.push(p2);

        let records = Arc::new(StubRecords::default());
        let github = Arc::new(StubMetadata::failing("widget", stats(7, 2)));

        let report = engine(SyncMode::All, github, records.clone())
            .sync_catalog(&mut catalog)
            .await;

        // Both projects were created: the first with zeroed stats.
        let created = records.created.lock().unwrap();
        assert_eq!(created.len(), 2);
        assert_eq!(created[0].stars, 0);
        assert_eq!(created[1].stars, 7);
        assert_eq!(report.created, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(report.failures[0].project_id, "p1");
    }

    #[tokio::test]
    async fn invalid_url_is_recorded_and_iteration_continues() {
        let mut catalog = one_project_catalog();
        catalog.projects[0].github_url = "not a url".into();
        let mut p2 = Project::new("p2", "https://github.com/acme/gadget");
        p2.category_id = "ai".into();
        catalog.projects.push(p2);

        let records = Arc::new(StubRecords::default());
        let github = Arc::new(StubMetadata::ok(stats(1, 1)));

        let report = engine(SyncMode::All, github, records.clone())
            .sync_catalog(&mut catalog)
            .await;

        assert_eq!(report.failed, 1);
        assert_eq!(report.failures[0].project_id, "p1");
        assert_eq!(records.created.lock().unwrap().len(), 1);
    }

    fn reconcile_fixture() -> (Catalog, StubRecords) {
        let mut ai = Category::new("ai", "AI");
        ai.order = 1;
        let mut tools = Category::new("tools", "Tooling");
        tools.order = 2;

        let mut p1 = Project::new("p1", "https://github.com/acme/widget");
        p1.category_id = "ai".into();
        p1.notion_page_id = "page-1".into();

        let catalog = Catalog {
            categories: vec![ai, tools],
            projects: vec![p1],
            ..Catalog::default()
        };

        let records = StubRecords {
            records: vec![RemoteRecord {
                remote_id: "page-1".into(),
                category_label: Some("tooling".into()),
                github_url: "https://github.com/acme/widget".into(),
            }],
            ..StubRecords::default()
        };
        (catalog, records)
    }

    #[tokio::test]
    async fn preview_reports_changes_without_mutating() {
        let (mut catalog, records) = reconcile_fixture();
        let report = reconcile(&records, &mut catalog, ReconcileMode::Preview)
            .await
            .expect("reconcile");

        assert_eq!(
            report.changes,
            vec![CategoryChange {
                project_id: "p1".into(),
                old_category_id: "ai".into(),
                new_category_id: "tools".into(),
            }]
        );
        assert_eq!(catalog.projects[0].category_id, "ai");
    }

    #[tokio::test]
    async fn apply_mutates_and_is_idempotent() {
        let (mut catalog, records) = reconcile_fixture();
        let first = reconcile(&records, &mut catalog, ReconcileMode::Apply)
            .await
            .expect("first apply");
        assert_eq!(first.changes.len(), 1);
        assert_eq!(catalog.projects[0].category_id, "tools");

        let second = reconcile(&records, &mut catalog, ReconcileMode::Apply)
            .await
            .expect("second apply");
        assert!(second.changes.is_empty());
    }

    #[tokio::test]
    async fn unknown_labels_are_reported_as_unmapped() {
        let (mut catalog, mut records) = reconcile_fixture();
        records.records[0].category_label = Some("Databases".into());

        let report = reconcile(&records, &mut catalog, ReconcileMode::Apply)
            .await
            .expect("reconcile");
        assert!(report.changes.is_empty());
        assert_eq!(
            report.unmapped,
            vec![UnmappedRecord {
                remote_id: "page-1".into(),
                label: "Databases".into(),
            }]
        );
        assert_eq!(catalog.projects[0].category_id, "ai");
    }

    #[tokio::test]
    async fn unknown_labels_on_unmatched_records_are_still_reported() {
        let (mut catalog, mut records) = reconcile_fixture();
        records.records[0] = RemoteRecord {
            remote_id: "page-unknown".into(),
            category_label: Some("Databases".into()),
            github_url: "https://github.com/acme/other".into(),
        };

        let report = reconcile(&records, &mut catalog, ReconcileMode::Apply)
            .await
            .expect("reconcile");
        assert!(report.changes.is_empty());
        assert_eq!(
            report.unmapped,
            vec![UnmappedRecord {
                remote_id: "page-unknown".into(),
                label: "Databases".into(),
            }]
        );
    }

    #[tokio::test]
    async fn ambiguous_category_names_fail_the_pass() {
        let (mut catalog, records) = reconcile_fixture();
        catalog.categories.push(Category::new("ai-2", "ai"));

        let err = reconcile(&records, &mut catalog, ReconcileMode::Preview)
            .await
            .expect_err("ambiguity");
        assert!(matches!(err, ReconcileError::Consistency(_)));
    }

    #[tokio::test]
    async fn duplicate_remote_matches_fail_the_pass() {
        let (mut catalog, mut records) = reconcile_fixture();
        let duplicate = records.records[0].clone();
        records.records.push(duplicate);

        let err = reconcile(&records, &mut catalog, ReconcileMode::Preview)
            .await
            .expect_err("duplicate match");
        assert!(matches!(err, ReconcileError::Consistency(_)));
    }
}
