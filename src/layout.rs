use crate::{
    config::AppSettings,
    model::{Model, ModelFile, ModelVersion},
};
use percent_encoding::percent_decode_str;
use std::{
    path::{Path, PathBuf},
    sync::atomic::{AtomicU64, Ordering},
};

const CATEGORY_PLACEHOLDER: &str = "{category}";

static PART_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DownloadLayout {
    pub file_path: PathBuf,
    pub json_path: PathBuf,
    pub markdown_path: PathBuf,
    stem: String,
}

impl DownloadLayout {
    pub fn new(file_path: PathBuf) -> Self {
        let dir = file_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        let stem = file_path
            .file_stem()
            .map(|stem| stem.to_string_lossy().to_string())
            .unwrap_or_else(|| "download".to_string());
        Self {
            json_path: dir.join(format!("{stem}.json")),
            markdown_path: dir.join(format!("{stem}.md")),
            file_path,
            stem,
        }
    }

    pub fn dir(&self) -> &Path {
        self.file_path.parent().unwrap_or_else(|| Path::new(""))
    }

    pub fn image_path(&self, index: usize) -> PathBuf {
        self.dir().join(format!("{}_{index}.jpg", self.stem))
    }
}

/// `<type dir>/<base model>/<category>[_nsfw]/<model>/<version>/<file>`
pub fn plan_layout(
    settings: &AppSettings,
    library_root: &Path,
    model: &Model,
    version: &ModelVersion,
    file: &ModelFile,
) -> DownloadLayout {
    let dir = type_dir(settings, library_root, model).join(hierarchy(model, version));
    DownloadLayout::new(dir.join(sanitize_file_name(&file.name)))
}

pub fn type_dir(settings: &AppSettings, library_root: &Path, model: &Model) -> PathBuf {
    match settings.type_dir(&model.kind) {
        Some(configured) => {
            let configured = configured
                .to_string_lossy()
                .replace(CATEGORY_PLACEHOLDER, &path_segment(&model.category));
            let configured = PathBuf::from(configured);
            if configured.is_absolute() {
                configured
            } else {
                library_root.join(configured)
            }
        }
        None => {
            log::debug!(
                "No directory configured for model type {}, using library root",
                model.kind
            );
            library_root.join(path_segment(&model.kind))
        }
    }
}

pub fn hierarchy(model: &Model, version: &ModelVersion) -> PathBuf {
    let category = if model.nsfw {
        format!("{}_nsfw", path_segment(&model.category))
    } else {
        path_segment(&model.category)
    };

    [
        path_segment(&version.base_model),
        category,
        path_segment(&model.name),
        path_segment(&version.name),
    ]
    .iter()
    .collect()
}

/// Sibling `.part.N` path that a write is staged in before being renamed to `target`.
pub fn staging_path(target: &Path) -> PathBuf {
    let suffix = PART_COUNTER.fetch_add(1, Ordering::Relaxed);
    let name = target
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| "download".to_string());
    target.with_file_name(format!("{name}.part.{suffix}"))
}

pub fn path_segment(value: &str) -> String {
    let spaced = value.trim().replace(' ', "_");
    let sanitized = sanitize_file_name(&spaced);
    match sanitized.trim_matches('.') {
        "" => "_".to_string(),
        trimmed => trimmed.to_string(),
    }
}

pub fn sanitize_file_name(name: &str) -> String {
    let sanitized = percent_decode_str(name)
        .decode_utf8_lossy()
        .chars()
        .map(|ch| match ch {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            _ if ch.is_control() => '_',
            _ => ch,
        })
        .collect::<String>();
    if sanitized.trim_matches('_').is_empty() {
        "download".to_string()
    } else {
        sanitized
    }
}
