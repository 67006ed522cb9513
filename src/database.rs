use crate::model::{Model, ModelFile, ModelImage, ModelVersion, Page};
use anyhow::{anyhow, Context, Result};
use log::debug;
use rusqlite::{params, Connection, OptionalExtension, ToSql};
use std::{
    fs,
    path::{Path, PathBuf},
    sync::{Mutex, MutexGuard},
};

pub const DATABASE_FILE: &str = "catalog.sqlite";

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS model (
        id INTEGER PRIMARY KEY,
        name TEXT NOT NULL,
        type TEXT NOT NULL,
        category TEXT NOT NULL,
        nsfw INTEGER NOT NULL,
        creator_name TEXT NOT NULL,
        creator_image TEXT NOT NULL,
        image TEXT NOT NULL,
        image_blur_hash TEXT NOT NULL,
        description TEXT NOT NULL,
        updated_at INTEGER NOT NULL,
        download_cnt INTEGER NOT NULL,
        favorite_cnt INTEGER NOT NULL,
        thumbs_up_cnt INTEGER NOT NULL,
        thumbs_down_cnt INTEGER NOT NULL,
        comment_cnt INTEGER NOT NULL,
        rating_cnt INTEGER NOT NULL,
        rating_score REAL NOT NULL,
        tipped_amt_cnt INTEGER NOT NULL
    );
    CREATE TABLE IF NOT EXISTS model_version (
        id INTEGER PRIMARY KEY,
        model_id INTEGER NOT NULL,
        name TEXT NOT NULL,
        description TEXT NOT NULL,
        trained_words TEXT NOT NULL,
        base_model TEXT NOT NULL,
        download_cnt INTEGER NOT NULL,
        rating_cnt INTEGER NOT NULL,
        rating_score REAL NOT NULL,
        thumbs_up_cnt INTEGER NOT NULL,
        thumbs_down_cnt INTEGER NOT NULL
    );
    CREATE TABLE IF NOT EXISTS model_file (
        id INTEGER PRIMARY KEY,
        model_id INTEGER NOT NULL,
        model_version_id INTEGER NOT NULL,
        is_primary INTEGER NOT NULL,
        name TEXT NOT NULL,
        url TEXT NOT NULL,
        size REAL NOT NULL,
        safe INTEGER NOT NULL,
        format TEXT NOT NULL,
        datatype TEXT NOT NULL,
        pruned INTEGER NOT NULL,
        sha256 TEXT NOT NULL DEFAULT ''
    );
    CREATE TABLE IF NOT EXISTS model_image (
        id INTEGER PRIMARY KEY,
        model_id INTEGER NOT NULL,
        model_version_id INTEGER NOT NULL,
        url TEXT NOT NULL,
        generation_data TEXT NOT NULL,
        blur_hash TEXT NOT NULL,
        width INTEGER NOT NULL,
        height INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_model_type ON model(type);
    CREATE INDEX IF NOT EXISTS idx_model_category ON model(category);
    CREATE INDEX IF NOT EXISTS idx_model_updated ON model(updated_at);
    CREATE INDEX IF NOT EXISTS idx_version_model ON model_version(model_id);
    CREATE INDEX IF NOT EXISTS idx_file_version ON model_file(model_version_id);
    CREATE INDEX IF NOT EXISTS idx_image_version ON model_image(model_version_id);
";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ModelSort {
    #[default]
    Updated,
    Downloads,
    Rating,
    Name,
}

impl ModelSort {
    fn order_clause(self) -> &'static str {
        match self {
            ModelSort::Updated => "updated_at DESC, id DESC",
            ModelSort::Downloads => "download_cnt DESC, id DESC",
            ModelSort::Rating => "rating_score DESC, rating_cnt DESC, id DESC",
            ModelSort::Name => "name COLLATE NOCASE ASC, id ASC",
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        match label.trim().to_ascii_lowercase().as_str() {
            "updated" | "newest" => Some(ModelSort::Updated),
            "downloads" => Some(ModelSort::Downloads),
            "rating" | "rated" => Some(ModelSort::Rating),
            "name" => Some(ModelSort::Name),
            _ => None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct ModelFilter {
    pub text: Option<String>,
    pub kind: Option<String>,
    pub category: Option<String>,
    pub base_model: Option<String>,
    pub include_nsfw: bool,
    pub sort: ModelSort,
    pub limit: usize,
    pub offset: usize,
}

impl Default for ModelFilter {
    fn default() -> Self {
        Self {
            text: None,
            kind: None,
            category: None,
            base_model: None,
            include_nsfw: false,
            sort: ModelSort::default(),
            limit: 50,
            offset: 0,
        }
    }
}

#[derive(Clone, Debug)]
pub struct SearchResult {
    pub models: Vec<Model>,
    pub total_count: usize,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TableCounts {
    pub models: usize,
    pub versions: usize,
    pub files: usize,
    pub images: usize,
}

#[derive(Debug)]
pub struct Database {
    path: Option<PathBuf>,
    conn: Mutex<Connection>,
}

impl Database {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create database directory {parent:?}"))?;
        }

        let conn = Connection::open(&path)
            .with_context(|| format!("failed to open catalog database {path:?}"))?;
        conn.execute_batch(
            "
            PRAGMA journal_mode=WAL;
            PRAGMA busy_timeout=30000;
            PRAGMA synchronous=NORMAL;
            ",
        )
        .context("failed to configure catalog database")?;

        Self::with_connection(conn, Some(path))
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory database")?;
        Self::with_connection(conn, None)
    }

    fn with_connection(conn: Connection, path: Option<PathBuf>) -> Result<Self> {
        conn.execute_batch(SCHEMA)
            .context("failed to create catalog schema")?;
        Ok(Self {
            path,
            conn: Mutex::new(conn),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn connection(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("catalog database lock poisoned"))
    }

    pub fn insert_page(&self, page: &Page) -> Result<()> {
        let mut conn = self.connection()?;
        let tx = conn
            .transaction()
            .context("failed to begin page transaction")?;

        {
            let mut stmt = tx.prepare_cached(
                "INSERT OR REPLACE INTO model (
                    id, name, type, category, nsfw, creator_name, creator_image, image,
                    image_blur_hash, description, updated_at, download_cnt, favorite_cnt,
                    thumbs_up_cnt, thumbs_down_cnt, comment_cnt, rating_cnt, rating_score,
                    tipped_amt_cnt
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)",
            )?;
            for model in &page.models {
                stmt.execute(params![
                    model.id,
                    model.name,
                    model.kind,
                    model.category,
                    model.nsfw,
                    model.creator_name,
                    model.creator_image,
                    model.image,
                    model.image_blur_hash,
                    model.description,
                    model.updated_at,
                    model.download_cnt,
                    model.favorite_cnt,
                    model.thumbs_up_cnt,
                    model.thumbs_down_cnt,
                    model.comment_cnt,
                    model.rating_cnt,
                    model.rating_score,
                    model.tipped_amt_cnt,
                ])
                .with_context(|| format!("failed to insert model {}", model.id))?;
            }

            let mut stmt = tx.prepare_cached(
                "INSERT OR REPLACE INTO model_version (
                    id, model_id, name, description, trained_words, base_model,
                    download_cnt, rating_cnt, rating_score, thumbs_up_cnt, thumbs_down_cnt
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            )?;
            for version in &page.versions {
                let trained_words = serde_json::to_string(&version.trained_words)?;
                stmt.execute(params![
                    version.id,
                    version.model_id,
                    version.name,
                    version.description,
                    trained_words,
                    version.base_model,
                    version.download_cnt,
                    version.rating_cnt,
                    version.rating_score,
                    version.thumbs_up_cnt,
                    version.thumbs_down_cnt,
                ])
                .with_context(|| format!("failed to insert model version {}", version.id))?;
            }

            let mut stmt = tx.prepare_cached(
                "INSERT OR REPLACE INTO model_file (
                    id, model_id, model_version_id, is_primary, name, url, size, safe,
                    format, datatype, pruned, sha256
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            )?;
            for file in &page.files {
                stmt.execute(params![
                    file.id,
                    file.model_id,
                    file.model_version_id,
                    file.is_primary,
                    file.name,
                    file.url,
                    file.size,
                    file.safe,
                    file.format,
                    file.datatype,
                    file.pruned,
                    file.sha256,
                ])
                .with_context(|| format!("failed to insert model file {}", file.id))?;
            }

            let mut stmt = tx.prepare_cached(
                "INSERT OR REPLACE INTO model_image (
                    id, model_id, model_version_id, url, generation_data, blur_hash, width, height
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            )?;
            for image in &page.images {
                let generation_data = serde_json::to_string(&image.generation_data)?;
                stmt.execute(params![
                    image.id,
                    image.model_id,
                    image.model_version_id,
                    image.url,
                    generation_data,
                    image.blur_hash,
                    image.width,
                    image.height,
                ])
                .with_context(|| format!("failed to insert model image {}", image.id))?;
            }
        }

        tx.commit().context("failed to commit page transaction")?;
        debug!("Stored page: {}", page.summary());
        Ok(())
    }

    pub fn model(&self, id: i64) -> Result<Option<Model>> {
        let conn = self.connection()?;
        conn.query_row("SELECT * FROM model WHERE id = ?1", [id], Model::from_row)
            .optional()
            .with_context(|| format!("failed to load model {id}"))
    }

    pub fn version(&self, id: i64) -> Result<Option<ModelVersion>> {
        let conn = self.connection()?;
        conn.query_row(
            "SELECT * FROM model_version WHERE id = ?1",
            [id],
            ModelVersion::from_row,
        )
        .optional()
        .with_context(|| format!("failed to load model version {id}"))
    }

    pub fn file(&self, id: i64) -> Result<Option<ModelFile>> {
        let conn = self.connection()?;
        conn.query_row(
            "SELECT * FROM model_file WHERE id = ?1",
            [id],
            ModelFile::from_row,
        )
        .optional()
        .with_context(|| format!("failed to load model file {id}"))
    }

    pub fn latest_version(&self, model_id: i64) -> Result<Option<ModelVersion>> {
        let conn = self.connection()?;
        conn.query_row(
            "SELECT * FROM model_version
             WHERE model_id = ?1
             ORDER BY id DESC
             LIMIT 1",
            [model_id],
            ModelVersion::from_row,
        )
        .optional()
        .with_context(|| format!("failed to load latest version of model {model_id}"))
    }

    pub fn primary_safe_file(&self, model_version_id: i64) -> Result<Option<ModelFile>> {
        let conn = self.connection()?;
        conn.query_row(
            "SELECT * FROM model_file
             WHERE model_version_id = ?1
             AND safe = 1
             ORDER BY is_primary DESC, id ASC
             LIMIT 1",
            [model_version_id],
            ModelFile::from_row,
        )
        .optional()
        .with_context(|| format!("failed to load file for model version {model_version_id}"))
    }

    pub fn versions_for_model(&self, model_id: i64) -> Result<Vec<ModelVersion>> {
        let conn = self.connection()?;
        let mut stmt =
            conn.prepare("SELECT * FROM model_version WHERE model_id = ?1 ORDER BY id DESC")?;
        let rows = stmt.query_map([model_id], ModelVersion::from_row)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .with_context(|| format!("failed to load versions of model {model_id}"))
    }

    pub fn files_for_version(&self, model_version_id: i64) -> Result<Vec<ModelFile>> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM model_file WHERE model_version_id = ?1 ORDER BY is_primary DESC, id ASC",
        )?;
        let rows = stmt.query_map([model_version_id], ModelFile::from_row)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .with_context(|| format!("failed to load files of model version {model_version_id}"))
    }

    pub fn images_for_version(&self, model_version_id: i64) -> Result<Vec<ModelImage>> {
        let conn = self.connection()?;
        let mut stmt =
            conn.prepare("SELECT * FROM model_image WHERE model_version_id = ?1 ORDER BY id DESC")?;
        let rows = stmt.query_map([model_version_id], ModelImage::from_row)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .with_context(|| format!("failed to load images of model version {model_version_id}"))
    }

    pub fn search(&self, filter: &ModelFilter) -> Result<SearchResult> {
        let conn = self.connection()?;

        let mut where_clause = String::from("WHERE 1=1");
        let mut params_vec: Vec<Box<dyn ToSql>> = Vec::new();

        if let Some(text) = filter.text.as_deref().map(str::trim).filter(|t| !t.is_empty()) {
            where_clause.push_str(" AND (name LIKE ? OR creator_name LIKE ?)");
            let pattern = format!("%{text}%");
            params_vec.push(Box::new(pattern.clone()));
            params_vec.push(Box::new(pattern));
        }
        if let Some(kind) = &filter.kind {
            where_clause.push_str(" AND type = ? COLLATE NOCASE");
            params_vec.push(Box::new(kind.clone()));
        }
        if let Some(category) = &filter.category {
            where_clause.push_str(" AND category = ? COLLATE NOCASE");
            params_vec.push(Box::new(category.clone()));
        }
        if let Some(base_model) = &filter.base_model {
            where_clause.push_str(
                " AND id IN (SELECT model_id FROM model_version WHERE base_model = ? COLLATE NOCASE)",
            );
            params_vec.push(Box::new(base_model.clone()));
        }
        if !filter.include_nsfw {
            where_clause.push_str(" AND nsfw = 0");
        }

        let params_refs: Vec<&dyn ToSql> = params_vec.iter().map(|p| p.as_ref()).collect();

        let count_sql = format!("SELECT COUNT(*) FROM model {where_clause}");
        let total_count: usize = conn
            .query_row(&count_sql, params_refs.as_slice(), |row| row.get(0))
            .context("failed to count models")?;

        let sql = format!(
            "SELECT * FROM model {where_clause} ORDER BY {} LIMIT {} OFFSET {}",
            filter.sort.order_clause(),
            filter.limit,
            filter.offset
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_refs.as_slice(), Model::from_row)?;
        let models = rows
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("failed to read model rows")?;

        Ok(SearchResult {
            models,
            total_count,
        })
    }

    pub fn categories(&self) -> Result<Vec<String>> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare("SELECT DISTINCT category FROM model ORDER BY category")?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        rows.collect::<rusqlite::Result<Vec<String>>>()
            .context("failed to list categories")
    }

    pub fn counts(&self) -> Result<TableCounts> {
        let conn = self.connection()?;
        let count = |table: &str| -> Result<usize> {
            conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))
                .with_context(|| format!("failed to count {table}"))
        };
        Ok(TableCounts {
            models: count("model")?,
            versions: count("model_version")?,
            files: count("model_file")?,
            images: count("model_image")?,
        })
    }
}
