//! Catalog persistence: two-sheet workbook load/save with legacy JSON
//! migration and atomic writes.
//!
//! The workbook is the source of truth between runs; in-process mutation is
//! accumulate-then-flush, so `save` always rewrites both sheets whole.

use std::fs;
use std::path::{Path, PathBuf};

use calamine::{open_workbook, Data, Reader, Xlsx};
use repoboard_core::{Catalog, Category, Project, ORDER_UNSET};
use rust_xlsxwriter::Workbook;
use serde::Deserialize;
use thiserror::Error;
use tracing::warn;

pub const CRATE_NAME: &str = "repoboard-store";

pub const CATEGORIES_SHEET: &str = "categories";
pub const PROJECTS_SHEET: &str = "projects";
pub const LEGACY_JSON_FILENAME: &str = "projects.json";

const CATEGORY_HEADERS: [&str; 4] = ["id", "name", "icon", "order"];
const PROJECT_HEADERS: [&str; 8] = [
    "category_id",
    "id",
    "name",
    "description",
    "github",
    "topics",
    "notion_page_id",
    "order",
];
const DEFAULT_ICON: &str = "📁";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("catalog file not found: {0} (no legacy {LEGACY_JSON_FILENAME} alongside it)")]
    Missing(PathBuf),
    #[error("sheet {sheet:?} is missing required column {column:?}")]
    MissingColumn { sheet: &'static str, column: &'static str },
    #[error("duplicate project id {0:?} in catalog")]
    DuplicateProject(String),
    #[error("duplicate category id {0:?} in catalog")]
    DuplicateCategory(String),
    #[error("reading workbook: {0}")]
    Workbook(#[from] calamine::XlsxError),
    #[error("writing workbook: {0}")]
    WorkbookWrite(#[from] rust_xlsxwriter::XlsxError),
    #[error("parsing legacy catalog {path}: {source}")]
    LegacyJson {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Loads the catalog from `path`. If the workbook is absent but a legacy
/// flat JSON list sits next to it, the list is migrated into a single
/// default category, persisted immediately, and reported via the second
/// tuple element so the migration runs at most once.
pub fn load(path: &Path) -> Result<(Catalog, bool), StoreError> {
    if path.exists() {
        return Ok((load_workbook_file(path)?, false));
    }

    let legacy = path.with_file_name(LEGACY_JSON_FILENAME);
    if legacy.exists() {
        let catalog = load_legacy_json(&legacy)?;
        save(path, &catalog)?;
        warn!(
            legacy = %legacy.display(),
            catalog = %path.display(),
            "migrated legacy JSON catalog to workbook"
        );
        return Ok((catalog, true));
    }

    Err(StoreError::Missing(path.to_path_buf()))
}

/// Writes both sheets back in stable column order, unknown extra columns
/// included, via a temp file and atomic rename.
pub fn save(path: &Path, catalog: &Catalog) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let mut workbook = Workbook::new();

    let sheet = workbook.add_worksheet().set_name(CATEGORIES_SHEET)?;
    let extra_cat = &catalog.extra_category_columns;
    for (col, header) in CATEGORY_HEADERS.iter().enumerate() {
        sheet.write_string(0, col as u16, *header)?;
    }
    for (offset, header) in extra_cat.iter().enumerate() {
        sheet.write_string(0, (CATEGORY_HEADERS.len() + offset) as u16, header)?;
    }
    for (row, category) in catalog.categories.iter().enumerate() {
        let row = (row + 1) as u32;
        sheet.write_string(row, 0, &category.id)?;
        sheet.write_string(row, 1, &category.name)?;
        sheet.write_string(row, 2, &category.icon)?;
        sheet.write_number(row, 3, category.order as f64)?;
        for (offset, column) in extra_cat.iter().enumerate() {
            let value = extra_value(&category.extra, column);
            sheet.write_string(row, (CATEGORY_HEADERS.len() + offset) as u16, value)?;
        }
    }

    let sheet = workbook.add_worksheet().set_name(PROJECTS_SHEET)?;
    let extra_proj = &catalog.extra_project_columns;
    for (col, header) in PROJECT_HEADERS.iter().enumerate() {
        sheet.write_string(0, col as u16, *header)?;
    }
    for (offset, header) in extra_proj.iter().enumerate() {
        sheet.write_string(0, (PROJECT_HEADERS.len() + offset) as u16, header)?;
    }
    for (row, project) in catalog.projects.iter().enumerate() {
        let row = (row + 1) as u32;
        sheet.write_string(row, 0, &project.category_id)?;
        sheet.write_string(row, 1, &project.id)?;
        sheet.write_string(row, 2, &project.name)?;
        sheet.write_string(row, 3, &project.description)?;
        sheet.write_string(row, 4, &project.github_url)?;
        sheet.write_string(row, 5, project.topics.join(", "))?;
        sheet.write_string(row, 6, &project.notion_page_id)?;
        sheet.write_number(row, 7, project.order as f64)?;
        for (offset, column) in extra_proj.iter().enumerate() {
            let value = extra_value(&project.extra, column);
            sheet.write_string(row, (PROJECT_HEADERS.len() + offset) as u16, value)?;
        }
    }

    let tmp = path.with_extension("xlsx.tmp");
    workbook.save(&tmp)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

fn extra_value<'a>(extra: &'a [(String, String)], column: &str) -> &'a str {
    extra
        .iter()
        .find(|(name, _)| name == column)
        .map(|(_, value)| value.as_str())
        .unwrap_or("")
}

fn load_workbook_file(path: &Path) -> Result<Catalog, StoreError> {
    let mut workbook: Xlsx<_> = open_workbook(path)?;

    let categories_range = workbook.worksheet_range(CATEGORIES_SHEET)?;
    let projects_range = workbook.worksheet_range(PROJECTS_SHEET)?;

    let mut catalog = Catalog::default();

    let (category_cols, extra_category_cols) =
        header_columns(&categories_range, CATEGORIES_SHEET, &CATEGORY_HEADERS)?;
    catalog.extra_category_columns =
        extra_category_cols.iter().map(|(name, _)| name.clone()).collect();

    for row in categories_range.rows().skip(1) {
        let id = cell_string(row, category_cols[0]);
        let name = cell_string(row, category_cols[1]);
        if id.is_empty() && name.is_empty() {
            continue;
        }
        let id = if id.is_empty() { slugify(&name) } else { id };
        let name = if name.is_empty() { id.clone() } else { name };
        if catalog.categories.iter().any(|c| c.id == id) {
            return Err(StoreError::DuplicateCategory(id));
        }
        let icon = cell_string(row, category_cols[2]);
        catalog.categories.push(Category {
            id,
            name,
            icon: if icon.is_empty() { DEFAULT_ICON.to_string() } else { icon },
            order: cell_order(row, category_cols[3]),
            extra: collect_extra(row, &extra_category_cols),
        });
    }

    let (project_cols, extra_project_cols) =
        header_columns(&projects_range, PROJECTS_SHEET, &PROJECT_HEADERS)?;
    catalog.extra_project_columns =
        extra_project_cols.iter().map(|(name, _)| name.clone()).collect();

    for row in projects_range.rows().skip(1) {
        let id = cell_string(row, project_cols[1]);
        let github_url = cell_string(row, project_cols[4]);
        if id.is_empty() && github_url.is_empty() {
            continue;
        }
        let id = if id.is_empty() { derived_id(&github_url) } else { id };
        if catalog.projects.iter().any(|p| p.id == id) {
            return Err(StoreError::DuplicateProject(id));
        }
        catalog.projects.push(Project {
            category_id: cell_string(row, project_cols[0]),
            id,
            name: cell_string(row, project_cols[2]),
            description: cell_string(row, project_cols[3]),
            github_url,
            topics: parse_topics(&cell_string(row, project_cols[5])),
            notion_page_id: cell_string(row, project_cols[6]),
            order: cell_order(row, project_cols[7]),
            extra: collect_extra(row, &extra_project_cols),
        });
    }

    synthesize_dangling_categories(&mut catalog);
    Ok(catalog)
}

/// A non-empty `category_id` must resolve to a category row; rows that
/// reference a missing category get a placeholder so the invariant holds.
fn synthesize_dangling_categories(catalog: &mut Catalog) {
    let dangling: Vec<String> = catalog
        .projects
        .iter()
        .map(|p| p.category_id.clone())
        .filter(|cid| !cid.is_empty() && catalog.category(cid).is_none())
        .collect();
    for cid in dangling {
        if catalog.category(&cid).is_some() {
            continue;
        }
        warn!(category_id = %cid, "project references unknown category; synthesizing it");
        catalog.categories.push(Category {
            id: cid.clone(),
            name: cid,
            icon: DEFAULT_ICON.to_string(),
            order: ORDER_UNSET,
            extra: Vec::new(),
        });
    }
}

type HeaderColumns = (Vec<usize>, Vec<(String, usize)>);

fn header_columns(
    range: &calamine::Range<Data>,
    sheet: &'static str,
    known: &[&'static str],
) -> Result<HeaderColumns, StoreError> {
    let headers: Vec<String> = range
        .rows()
        .next()
        .map(|row| row.iter().map(|c| cell_to_string(c)).collect())
        .unwrap_or_default();

    let mut known_cols = Vec::with_capacity(known.len());
    for column in known {
        let idx = headers
            .iter()
            .position(|h| h == column)
            .ok_or(StoreError::MissingColumn { sheet, column })?;
        known_cols.push(idx);
    }

    let extras = headers
        .iter()
        .enumerate()
        .filter(|(idx, header)| !header.is_empty() && !known_cols.contains(idx))
        .map(|(idx, header)| (header.clone(), idx))
        .collect();

    Ok((known_cols, extras))
}

fn collect_extra(row: &[Data], extras: &[(String, usize)]) -> Vec<(String, String)> {
    extras
        .iter()
        .map(|(name, idx)| (name.clone(), cell_string(row, *idx)))
        .collect()
}

fn cell_string(row: &[Data], idx: usize) -> String {
    row.get(idx).map(cell_to_string).unwrap_or_default()
}

fn cell_to_string(cell: &Data) -> String {
    match cell {
        Data::String(s) => s.trim().to_string(),
        Data::Float(f) => {
            if f.fract() == 0.0 {
                format!("{}", *f as i64)
            } else {
                f.to_string()
            }
        }
        Data::Int(i) => i.to_string(),
        Data::Bool(b) => b.to_string(),
        Data::DateTimeIso(s) | Data::DurationIso(s) => s.trim().to_string(),
        Data::DateTime(dt) => dt.as_f64().to_string(),
        Data::Error(_) | Data::Empty => String::new(),
    }
}

fn cell_order(row: &[Data], idx: usize) -> i64 {
    match row.get(idx) {
        Some(Data::Int(i)) => *i,
        Some(Data::Float(f)) => *f as i64,
        Some(Data::String(s)) => s.trim().parse().unwrap_or(ORDER_UNSET),
        _ => ORDER_UNSET,
    }
}

/// Topics cells are comma-joined, but historical files stored JSON arrays.
fn parse_topics(raw: &str) -> Vec<String> {
    let text = raw.trim();
    if text.is_empty() {
        return Vec::new();
    }
    if text.starts_with('[') && text.ends_with(']') {
        if let Ok(serde_json::Value::Array(items)) = serde_json::from_str(text) {
            return items
                .iter()
                .filter_map(|v| v.as_str())
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
    }
    text.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn derived_id(github_url: &str) -> String {
    github_url
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or_default()
        .to_ascii_lowercase()
}

fn slugify(text: &str) -> String {
    let mut slug: String = text
        .trim()
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '-' })
        .collect();
    while slug.contains("--") {
        slug = slug.replace("--", "-");
    }
    let slug = slug.trim_matches('-').to_string();
    if slug.is_empty() {
        "category".to_string()
    } else {
        slug
    }
}

#[derive(Debug, Deserialize)]
struct LegacyProjectRow {
    #[serde(default)]
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    github: String,
    #[serde(default)]
    topics: Vec<String>,
    #[serde(default)]
    notion_page_id: String,
}

fn load_legacy_json(path: &Path) -> Result<Catalog, StoreError> {
    let text = fs::read_to_string(path)?;
    let value: serde_json::Value =
        serde_json::from_str(&text).map_err(|source| StoreError::LegacyJson {
            path: path.to_path_buf(),
            source,
        })?;

    let rows_value = match value {
        serde_json::Value::Array(_) => value,
        serde_json::Value::Object(mut map) => {
            map.remove("projects").unwrap_or(serde_json::Value::Array(Vec::new()))
        }
        _ => serde_json::Value::Array(Vec::new()),
    };
    let rows: Vec<LegacyProjectRow> =
        serde_json::from_value(rows_value).map_err(|source| StoreError::LegacyJson {
            path: path.to_path_buf(),
            source,
        })?;

    let mut catalog = Catalog::default();
    let mut default_category = Category::new("projects", "Projects");
    default_category.icon = DEFAULT_ICON.to_string();
    default_category.order = 0;
    catalog.categories.push(default_category);

    for (idx, row) in rows.into_iter().enumerate() {
        let id = if row.id.trim().is_empty() {
            derived_id(&row.github)
        } else {
            row.id.trim().to_string()
        };
        if id.is_empty() || catalog.projects.iter().any(|p| p.id == id) {
            continue;
        }
        catalog.projects.push(Project {
            category_id: "projects".to_string(),
            id,
            name: row.name.trim().to_string(),
            description: row.description.trim().to_string(),
            github_url: row.github.trim().to_string(),
            topics: row.topics,
            notion_page_id: row.notion_page_id.trim().to_string(),
            order: idx as i64,
            extra: Vec::new(),
        });
    }

    Ok(catalog)
}
