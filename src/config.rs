use crate::{api::DEFAULT_CATALOG_ENDPOINT, app::APP_ID, database::DATABASE_FILE, env_flags};
use anyhow::{anyhow, Context, Result};
use directories::BaseDirs;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    sync::RwLock,
};

const SETTINGS_FILE: &str = "settings.json";

#[derive(Debug)]
pub struct ConfigStore {
    root_dir: PathBuf,
    config_dir: PathBuf,
    state_dir: PathBuf,
    cache_dir: PathBuf,
    home_dir: PathBuf,
    settings: RwLock<AppSettings>,
}

impl ConfigStore {
    pub fn new() -> Result<Self> {
        let base = BaseDirs::new()
            .ok_or_else(|| anyhow!("unable to resolve base directories for {APP_ID}"))?;
        let root_dir = base.data_local_dir().join(APP_ID);
        Self::with_root(root_dir, base.home_dir().to_path_buf())
    }

    pub fn with_root(root_dir: PathBuf, home_dir: PathBuf) -> Result<Self> {
        let config_dir = root_dir.join("config");
        let state_dir = root_dir.join("state");
        let cache_dir = root_dir.join("cache");

        for dir in [&config_dir, &state_dir, &cache_dir] {
            fs::create_dir_all(dir)
                .with_context(|| format!("failed to create directory {dir:?}"))?;
        }

        let settings_path = config_dir.join(SETTINGS_FILE);
        let mut settings = if settings_path.exists() {
            let data = fs::read(&settings_path)
                .with_context(|| format!("failed to read settings file {settings_path:?}"))?;
            serde_json::from_slice(&data)
                .with_context(|| format!("failed to parse settings from {settings_path:?}"))?
        } else {
            AppSettings::default()
        };

        let mut persist_defaults = false;
        if settings.catalog_endpoint.is_none() {
            settings.catalog_endpoint = default_catalog_endpoint();
            persist_defaults = settings_path.exists();
        }

        let store = Self {
            root_dir,
            config_dir,
            state_dir,
            cache_dir,
            home_dir,
            settings: RwLock::new(settings),
        };

        if persist_defaults {
            let snapshot = store.settings();
            store.persist_locked(&snapshot)?;
        }

        Ok(store)
    }

    pub fn settings(&self) -> AppSettings {
        match self.settings.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn update_settings<F>(&self, mutate: F) -> Result<AppSettings>
    where
        F: FnOnce(&mut AppSettings),
    {
        let mut guard = self
            .settings
            .write()
            .map_err(|_| anyhow!("settings lock poisoned for write"))?;
        mutate(&mut guard);
        let snapshot = guard.clone();
        self.persist_locked(&snapshot)?;
        Ok(snapshot)
    }

    pub fn config_path(&self) -> PathBuf {
        self.config_dir.clone()
    }

    pub fn state_path(&self) -> PathBuf {
        self.state_dir.clone()
    }

    pub fn cache_path(&self) -> PathBuf {
        self.cache_dir.clone()
    }

    pub fn root_path(&self) -> PathBuf {
        self.root_dir.clone()
    }

    pub fn database_path(&self) -> PathBuf {
        env_flags::database_override().unwrap_or_else(|| self.state_dir.join(DATABASE_FILE))
    }

    /// Falls back to the home directory when no library root is configured.
    pub fn library_root(&self) -> PathBuf {
        self.settings()
            .library_root
            .unwrap_or_else(|| self.home_dir.clone())
    }

    /// The environment token wins over the stored one.
    pub fn api_token(&self) -> Option<String> {
        env_flags::api_key_from_env().or_else(|| {
            self.settings()
                .civitai_token
                .map(|token| token.trim().to_string())
                .filter(|token| !token.is_empty())
        })
    }

    pub fn download_previews(&self) -> bool {
        self.settings().download_previews && !env_flags::skip_previews()
    }

    fn persist_locked(&self, settings: &AppSettings) -> Result<()> {
        let path = self.config_path().join(SETTINGS_FILE);
        let data = serde_json::to_vec_pretty(settings)?;
        fs::write(&path, data).with_context(|| format!("failed to write settings to {path:?}"))?;
        Ok(())
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct AppSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub library_root: Option<PathBuf>,
    /// Destination folder per catalog model type (`LORA`, `Checkpoint`, ...).
    #[serde(default)]
    pub type_dirs: BTreeMap<String, PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub catalog_endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub civitai_token: Option<String>,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    #[serde(default)]
    pub overwrite_existing: bool,
    #[serde(default = "default_true")]
    pub download_previews: bool,
    #[serde(default)]
    pub show_nsfw: bool,
}

impl AppSettings {
    pub fn type_dir(&self, kind: &str) -> Option<&Path> {
        self.type_dirs
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(kind))
            .map(|(_, path)| path.as_path())
            .filter(|path| !path.as_os_str().is_empty())
    }

    pub fn endpoint(&self) -> &str {
        self.catalog_endpoint
            .as_deref()
            .unwrap_or(DEFAULT_CATALOG_ENDPOINT)
    }
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            library_root: None,
            type_dirs: BTreeMap::new(),
            catalog_endpoint: default_catalog_endpoint(),
            civitai_token: None,
            page_size: default_page_size(),
            overwrite_existing: false,
            download_previews: true,
            show_nsfw: false,
        }
    }
}

pub(crate) fn default_catalog_endpoint() -> Option<String> {
    Some(DEFAULT_CATALOG_ENDPOINT.to_string())
}

fn default_page_size() -> u32 {
    100
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn creates_layout_and_defaults() {
        let temp = TempDir::new().unwrap();
        let store =
            ConfigStore::with_root(temp.path().join("app"), temp.path().join("home")).unwrap();
        assert!(store.config_path().is_dir());
        assert!(store.state_path().is_dir());
        assert!(store.cache_path().is_dir());

        let settings = store.settings();
        assert_eq!(settings.endpoint(), DEFAULT_CATALOG_ENDPOINT);
        assert_eq!(settings.page_size, 100);
        assert!(settings.download_previews);
        assert_eq!(store.library_root(), temp.path().join("home"));
    }

    #[test]
    fn updates_persist_across_reopen() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("app");
        let store = ConfigStore::with_root(root.clone(), temp.path().to_path_buf()).unwrap();
        store
            .update_settings(|settings| {
                settings.library_root = Some(PathBuf::from("/models"));
                settings
                    .type_dirs
                    .insert("LORA".to_string(), PathBuf::from("loras"));
            })
            .unwrap();

        let reopened = ConfigStore::with_root(root, temp.path().to_path_buf()).unwrap();
        let settings = reopened.settings();
        assert_eq!(reopened.library_root(), PathBuf::from("/models"));
        assert_eq!(settings.type_dir("lora"), Some(Path::new("loras")));
        assert_eq!(settings.type_dir("Checkpoint"), None);
    }

    #[test]
    fn missing_endpoint_is_backfilled() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("app");
        fs::create_dir_all(root.join("config")).unwrap();
        fs::write(
            root.join("config").join(SETTINGS_FILE),
            br#"{"type_dirs": {}, "page_size": 25}"#,
        )
        .unwrap();

        let store = ConfigStore::with_root(root.clone(), temp.path().to_path_buf()).unwrap();
        assert_eq!(store.settings().page_size, 25);
        let written = fs::read_to_string(root.join("config").join(SETTINGS_FILE)).unwrap();
        assert!(written.contains(DEFAULT_CATALOG_ENDPOINT));
    }
}
