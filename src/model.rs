use crate::api::{ApiFile, ApiImage, ApiModel, ApiModelVersion};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use log::warn;
use rusqlite::{types::Type, Row};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use std::{fmt, str::FromStr};

const CATEGORIES: &[&str] = &[
    "character",
    "style",
    "celebrity",
    "concept",
    "clothing",
    "base model",
    "poses",
    "background",
    "tool",
    "buildings",
    "vehicle",
    "objects",
    "animal",
    "action",
    "assets",
];
const FALLBACK_CATEGORY: &str = "other";
const DEFAULT_BASE_MODEL: &str = "Other";
const NSFW_LEVEL_R: u32 = 4;
const SCAN_PASSED: &str = "Success";
const DEFAULT_STEPS: u32 = 20;
const DEFAULT_CFG_SCALE: f64 = 7.0;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Period {
    Day,
    Week,
    Month,
    Year,
    AllTime,
}

impl Period {
    pub fn all() -> &'static [Period] {
        use Period::*;
        &[Day, Week, Month, Year, AllTime]
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Period::Day => "Day",
            Period::Week => "Week",
            Period::Month => "Month",
            Period::Year => "Year",
            Period::AllTime => "AllTime",
        }
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Period {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        Period::all()
            .iter()
            .copied()
            .find(|period| period.as_str().eq_ignore_ascii_case(value.trim()))
            .ok_or_else(|| anyhow!("unknown period {value:?}"))
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Model {
    pub id: i64,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub category: String,
    pub nsfw: bool,
    pub creator_name: String,
    pub creator_image: String,
    pub image: String,
    pub image_blur_hash: String,
    pub description: String,
    pub updated_at: i64,
    pub download_cnt: i64,
    pub favorite_cnt: i64,
    pub thumbs_up_cnt: i64,
    pub thumbs_down_cnt: i64,
    pub comment_cnt: i64,
    pub rating_cnt: i64,
    pub rating_score: f64,
    pub tipped_amt_cnt: i64,
}

impl Model {
    pub fn from_api(data: &ApiModel, now: i64) -> Result<Self> {
        let image = display_image(data);
        let updated_at = model_timestamp(&data.model_versions, now)
            .with_context(|| format!("invalid timestamps on model {}", data.id))?;

        let (creator_name, creator_image) = match &data.creator {
            Some(creator) => (
                creator.username.clone(),
                creator.image.clone().unwrap_or_default(),
            ),
            None => (String::new(), String::new()),
        };

        Ok(Self {
            id: data.id,
            name: data.name.clone(),
            kind: data.kind.clone(),
            category: select_category(&data.tags),
            nsfw: detect_nsfw(data, image),
            creator_name,
            creator_image,
            image: image.map(|img| img.url.clone()).unwrap_or_default(),
            image_blur_hash: image.and_then(|img| img.hash.clone()).unwrap_or_default(),
            description: data.description.clone().unwrap_or_default(),
            updated_at,
            download_cnt: data.stats.download_count,
            favorite_cnt: data.stats.favorite_count,
            thumbs_up_cnt: data.stats.thumbs_up_count,
            thumbs_down_cnt: data.stats.thumbs_down_count,
            comment_cnt: data.stats.comment_count,
            rating_cnt: data.stats.rating_count,
            rating_score: data.stats.rating,
            tipped_amt_cnt: data.stats.tipped_amount_count,
        })
    }

    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            name: row.get("name")?,
            kind: row.get("type")?,
            category: row.get("category")?,
            nsfw: row.get("nsfw")?,
            creator_name: row.get("creator_name")?,
            creator_image: row.get("creator_image")?,
            image: row.get("image")?,
            image_blur_hash: row.get("image_blur_hash")?,
            description: row.get("description")?,
            updated_at: row.get("updated_at")?,
            download_cnt: row.get("download_cnt")?,
            favorite_cnt: row.get("favorite_cnt")?,
            thumbs_up_cnt: row.get("thumbs_up_cnt")?,
            thumbs_down_cnt: row.get("thumbs_down_cnt")?,
            comment_cnt: row.get("comment_cnt")?,
            rating_cnt: row.get("rating_cnt")?,
            rating_score: row.get("rating_score")?,
            tipped_amt_cnt: row.get("tipped_amt_cnt")?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ModelVersion {
    pub id: i64,
    pub model_id: i64,
    pub name: String,
    pub description: String,
    pub trained_words: Vec<String>,
    pub base_model: String,
    pub download_cnt: i64,
    pub rating_cnt: i64,
    pub rating_score: f64,
    pub thumbs_up_cnt: i64,
    pub thumbs_down_cnt: i64,
}

impl ModelVersion {
    pub fn from_api(model_id: i64, data: &ApiModelVersion) -> Self {
        Self {
            id: data.id,
            model_id,
            name: data.name.clone(),
            description: data.description.clone().unwrap_or_default(),
            trained_words: data.trained_words.clone(),
            base_model: data
                .base_model
                .clone()
                .unwrap_or_else(|| DEFAULT_BASE_MODEL.to_string()),
            download_cnt: data.stats.download_count,
            rating_cnt: data.stats.rating_count,
            rating_score: data.stats.rating,
            thumbs_up_cnt: data.stats.thumbs_up_count,
            thumbs_down_cnt: data.stats.thumbs_down_count,
        }
    }

    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            model_id: row.get("model_id")?,
            name: row.get("name")?,
            description: row.get("description")?,
            trained_words: json_column(row, "trained_words")?,
            base_model: row.get("base_model")?,
            download_cnt: row.get("download_cnt")?,
            rating_cnt: row.get("rating_cnt")?,
            rating_score: row.get("rating_score")?,
            thumbs_up_cnt: row.get("thumbs_up_cnt")?,
            thumbs_down_cnt: row.get("thumbs_down_cnt")?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ModelFile {
    pub id: i64,
    pub model_id: i64,
    pub model_version_id: i64,
    pub is_primary: bool,
    pub name: String,
    pub url: String,
    /// Size in kilobytes, as reported by the catalog.
    pub size: f64,
    pub safe: bool,
    pub format: String,
    pub datatype: String,
    pub pruned: bool,
    pub sha256: String,
}

impl ModelFile {
    pub fn from_api(model_id: i64, model_version_id: i64, data: &ApiFile) -> Self {
        let metadata = data.metadata.clone().unwrap_or_default();

        Self {
            id: data.id,
            model_id,
            model_version_id,
            is_primary: data.primary.unwrap_or(false),
            name: data.name.clone(),
            url: data.download_url.clone(),
            size: data.size_kb,
            safe: is_file_safe(data),
            format: metadata.format.unwrap_or_default(),
            datatype: metadata.fp.unwrap_or_default(),
            pruned: metadata.size.as_deref().unwrap_or_default() != "full",
            sha256: data
                .hashes
                .iter()
                .find(|(algo, _)| algo.eq_ignore_ascii_case("sha256"))
                .map(|(_, digest)| digest.to_ascii_lowercase())
                .unwrap_or_default(),
        }
    }

    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            model_id: row.get("model_id")?,
            model_version_id: row.get("model_version_id")?,
            is_primary: row.get("is_primary")?,
            name: row.get("name")?,
            url: row.get("url")?,
            size: row.get("size")?,
            safe: row.get("safe")?,
            format: row.get("format")?,
            datatype: row.get("datatype")?,
            pruned: row.get("pruned")?,
            sha256: row.get("sha256")?,
        })
    }

    pub fn size_bytes(&self) -> Option<u64> {
        (self.size > 0.0).then(|| (self.size * 1024.0).round() as u64)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GenerationData {
    pub prompt: String,
    pub negative_prompt: String,
    pub seed: Value,
    pub steps: u32,
    pub cfg_scale: f64,
    pub sampler: String,
}

impl Default for GenerationData {
    fn default() -> Self {
        Self::from_meta(None)
    }
}

impl GenerationData {
    /// Null or mistyped entries fall back to the defaults.
    pub fn from_meta(meta: Option<&Value>) -> Self {
        let meta = meta.and_then(Value::as_object);
        let field = |key: &str| meta.and_then(|m| m.get(key)).filter(|v| !v.is_null());
        let text = |key: &str| {
            field(key)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };

        Self {
            prompt: text("prompt"),
            negative_prompt: text("negativePrompt"),
            seed: field("seed")
                .cloned()
                .unwrap_or_else(|| Value::String(String::new())),
            steps: field("steps")
                .and_then(Value::as_u64)
                .and_then(|steps| u32::try_from(steps).ok())
                .unwrap_or(DEFAULT_STEPS),
            cfg_scale: field("cfgScale")
                .and_then(Value::as_f64)
                .unwrap_or(DEFAULT_CFG_SCALE),
            sampler: text("sampler"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ModelImage {
    pub id: i64,
    pub model_id: i64,
    pub model_version_id: i64,
    pub url: String,
    pub generation_data: GenerationData,
    pub blur_hash: String,
    pub width: u32,
    pub height: u32,
}

impl ModelImage {
    pub fn from_api(model_id: i64, model_version_id: i64, data: &ApiImage) -> Self {
        Self {
            id: data.id,
            model_id,
            model_version_id,
            url: data.url.clone(),
            generation_data: GenerationData::from_meta(data.meta.as_ref()),
            blur_hash: data.hash.clone().unwrap_or_default(),
            width: data.width,
            height: data.height,
        }
    }

    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            model_id: row.get("model_id")?,
            model_version_id: row.get("model_version_id")?,
            url: row.get("url")?,
            generation_data: json_column(row, "generation_data")?,
            blur_hash: row.get("blur_hash")?,
            width: row.get("width")?,
            height: row.get("height")?,
        })
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Page {
    pub models: Vec<Model>,
    pub versions: Vec<ModelVersion>,
    pub images: Vec<ModelImage>,
    pub files: Vec<ModelFile>,
}

impl Page {
    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    pub fn summary(&self) -> String {
        format!(
            "{} models, {} versions, {} files, {} images",
            self.models.len(),
            self.versions.len(),
            self.files.len(),
            self.images.len()
        )
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ModelItems {
    pub model: Model,
    pub versions: Vec<ModelVersion>,
    pub files: Vec<ModelFile>,
    pub images: Vec<ModelImage>,
}

pub fn items_from_model_version(
    model_id: i64,
    data: &ApiModelVersion,
) -> (ModelVersion, Vec<ModelFile>, Vec<ModelImage>) {
    let version = ModelVersion::from_api(model_id, data);

    let files = data
        .files
        .iter()
        .map(|file| ModelFile::from_api(version.model_id, version.id, file))
        .filter(|file| file.safe)
        .collect();
    let images = data
        .images
        .iter()
        .map(|image| ModelImage::from_api(version.model_id, version.id, image))
        .collect();

    (version, files, images)
}

/// Returns `None` for models without any version; those are never persisted.
pub fn items_from_model(data: &ApiModel, now: i64) -> Result<Option<ModelItems>> {
    let model = Model::from_api(data, now)?;
    let mut versions = Vec::new();
    let mut files = Vec::new();
    let mut images = Vec::new();

    for version_data in &data.model_versions {
        let (version, version_files, version_images) =
            items_from_model_version(model.id, version_data);
        versions.push(version);
        files.extend(version_files);
        images.extend(version_images);
    }

    if versions.is_empty() {
        warn!("Model {} has no versions, discarding.", model.name);
        return Ok(None);
    }

    Ok(Some(ModelItems {
        model,
        versions,
        files,
        images,
    }))
}

pub fn deserialise_items(page: &[ApiModel], now: i64) -> Result<Page> {
    let mut out = Page::default();
    for model_data in page {
        let Some(items) = items_from_model(model_data, now)? else {
            continue;
        };
        out.models.push(items.model);
        out.versions.extend(items.versions);
        out.files.extend(items.files);
        out.images.extend(items.images);
    }
    Ok(out)
}

pub fn now_timestamp() -> i64 {
    Utc::now().timestamp()
}

/// Accepts RFC 3339 (`Z` or offset). Strings without an offset are read as UTC.
pub fn parse_timestamp(value: &str) -> Result<i64> {
    let value = value.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Ok(parsed.timestamp());
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(value, format).ok())
        .map(|naive| naive.and_utc().timestamp())
        .ok_or_else(|| anyhow!("invalid timestamp {value:?}"))
}

pub fn resolve_version_timestamp(version: &ApiModelVersion, now: i64) -> Result<i64> {
    for candidate in [
        &version.updated_at,
        &version.published_at,
        &version.created_at,
    ] {
        if let Some(value) = non_empty(candidate) {
            return parse_timestamp(value);
        }
    }

    let mut scanned = Vec::new();
    for file in &version.files {
        if let Some(value) = non_empty(&file.scanned_at) {
            scanned.push(parse_timestamp(value)?);
        }
    }
    Ok(scanned.into_iter().max().unwrap_or(now))
}

pub fn model_timestamp(versions: &[ApiModelVersion], now: i64) -> Result<i64> {
    let mut latest = None;
    for version in versions {
        let timestamp = resolve_version_timestamp(version, now)?;
        latest = Some(latest.map_or(timestamp, |current: i64| current.max(timestamp)));
    }
    Ok(latest.unwrap_or(now))
}

pub fn display_image(data: &ApiModel) -> Option<&ApiImage> {
    let images = || data.model_versions.iter().flat_map(|v| v.images.iter());
    images()
        .find(|image| !image.is_video())
        .or_else(|| images().next())
}

pub fn select_category(tags: &[String]) -> String {
    tags.iter()
        .map(|tag| tag.trim().to_ascii_lowercase())
        .find(|tag| CATEGORIES.contains(&tag.as_str()))
        .unwrap_or_else(|| FALLBACK_CATEGORY.to_string())
}

pub fn detect_nsfw(data: &ApiModel, image: Option<&ApiImage>) -> bool {
    if data.nsfw || data.nsfw_level.is_some_and(|level| level >= NSFW_LEVEL_R) {
        return true;
    }
    let Some(image) = image else {
        return false;
    };
    if image.nsfw_level.is_some_and(|level| level >= NSFW_LEVEL_R) {
        return true;
    }
    match &image.nsfw {
        Some(Value::Bool(flag)) => *flag,
        Some(Value::String(label)) => matches!(label.as_str(), "Mature" | "X"),
        _ => false,
    }
}

pub fn is_file_safe(file: &ApiFile) -> bool {
    let passed = |result: &Option<String>| result.as_deref() == Some(SCAN_PASSED);
    passed(&file.pickle_scan_result) && passed(&file.virus_scan_result)
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

fn json_column<T: DeserializeOwned>(row: &Row<'_>, column: &str) -> rusqlite::Result<T> {
    let text: String = row.get(column)?;
    serde_json::from_str(&text).map_err(|err| {
        let index = row.as_ref().column_index(column).unwrap_or_default();
        rusqlite::Error::FromSqlConversionFailure(index, Type::Text, Box::new(err))
    })
}
