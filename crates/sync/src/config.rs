use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use figment::{
    Figment,
    providers::{Env, Format, Json, Serialized},
};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};
use tempfile::NamedTempFile;

pub const SETTINGS_DIRECTORY_NAME: &str = "rapport";
pub const SETTINGS_FILE_NAME: &str = "settings.json";
pub const DATABASE_FILE_NAME: &str = "rapport.db";
pub const ENV_PREFIX: &str = "RAPPORT_";

pub const DEFAULT_MAX_BODY_CHARS: usize = 1_000;
pub const DEFAULT_RATE_LIMIT_MAX_SENDS: u32 = 20;
pub const DEFAULT_RATE_LIMIT_WINDOW_SECS: u64 = 60;
pub const DEFAULT_READ_SETTLE_DELAY_MS: u64 = 1_000;
pub const DEFAULT_TYPING_IDLE_MS: u64 = 2_000;
pub const DEFAULT_EVENT_BUFFER: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncSettings {
    #[serde(default = "default_database_path")]
    pub database_path: String,
    #[serde(default = "default_max_body_chars")]
    pub max_body_chars: usize,
    #[serde(default = "default_rate_limit_max_sends")]
    pub rate_limit_max_sends: u32,
    #[serde(default = "default_rate_limit_window_secs")]
    pub rate_limit_window_secs: u64,
    #[serde(default = "default_read_settle_delay_ms")]
    pub read_settle_delay_ms: u64,
    #[serde(default = "default_typing_idle_ms")]
    pub typing_idle_ms: u64,
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            max_body_chars: default_max_body_chars(),
            rate_limit_max_sends: default_rate_limit_max_sends(),
            rate_limit_window_secs: default_rate_limit_window_secs(),
            read_settle_delay_ms: default_read_settle_delay_ms(),
            typing_idle_ms: default_typing_idle_ms(),
            event_buffer: default_event_buffer(),
        }
    }
}

impl SyncSettings {
    pub fn rate_limit_window(&self) -> Duration {
        Duration::from_secs(self.rate_limit_window_secs)
    }

    pub fn read_settle_delay(&self) -> Duration {
        Duration::from_millis(self.read_settle_delay_ms)
    }

    pub fn typing_idle(&self) -> Duration {
        Duration::from_millis(self.typing_idle_ms)
    }

    /// Replaces values that would disable a safeguard with their defaults.
    pub fn normalized(mut self) -> Self {
        self.database_path = self.database_path.trim().to_string();
        if self.database_path.is_empty() {
            self.database_path = default_database_path();
        }
        if self.max_body_chars == 0 {
            self.max_body_chars = default_max_body_chars();
        }
        if self.rate_limit_max_sends == 0 {
            self.rate_limit_max_sends = default_rate_limit_max_sends();
        }
        if self.rate_limit_window_secs == 0 {
            self.rate_limit_window_secs = default_rate_limit_window_secs();
        }
        if self.typing_idle_ms == 0 {
            self.typing_idle_ms = default_typing_idle_ms();
        }
        if self.event_buffer == 0 {
            self.event_buffer = default_event_buffer();
        }

        self
    }
}

pub struct SettingsStore {
    settings: Arc<ArcSwap<SyncSettings>>,
    config_path: Option<PathBuf>,
}

impl SettingsStore {
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(".rapport"))
    }

    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join(SETTINGS_FILE_NAME)
    }

    pub fn new(config_path: PathBuf) -> Self {
        let settings = Self::load_from_disk(&config_path);
        Self {
            settings: Arc::new(ArcSwap::from_pointee(settings)),
            config_path: Some(config_path),
        }
    }

    pub fn load() -> Self {
        Self::new(Self::default_config_path())
    }

    /// Settings that live only in memory; `update` swaps without persisting.
    pub fn from_settings(settings: SyncSettings) -> Self {
        Self {
            settings: Arc::new(ArcSwap::from_pointee(settings.normalized())),
            config_path: None,
        }
    }

    pub fn settings(&self) -> Arc<SyncSettings> {
        self.settings.load_full()
    }

    pub fn config_path(&self) -> Option<&PathBuf> {
        self.config_path.as_ref()
    }

    /// Re-reads the file and environment. On failure the current settings stay in place.
    pub fn reload(&self) -> Result<Arc<SyncSettings>, SettingsError> {
        let Some(path) = self.config_path.as_ref() else {
            return Ok(self.settings());
        };

        let settings = Arc::new(Self::extract(path)?);
        self.settings.store(Arc::clone(&settings));
        tracing::info!(path = %path.display(), "settings reloaded");
        Ok(settings)
    }

    pub fn update(&self, settings: SyncSettings) -> Result<(), SettingsError> {
        let normalized_settings = settings.normalized();
        if let Some(path) = self.config_path.as_ref() {
            Self::persist(path, &normalized_settings)?;
        }
        self.settings.store(Arc::new(normalized_settings));
        Ok(())
    }

    fn load_from_disk(path: &Path) -> SyncSettings {
        if !path.exists() {
            tracing::info!(path = %path.display(), "no settings file, starting from defaults");
        }

        Self::extract(path).unwrap_or_else(|error| {
            tracing::warn!(error = %error, "ignoring unreadable settings file");
            SyncSettings::default()
        })
    }

    fn extract(path: &Path) -> Result<SyncSettings, SettingsError> {
        let figment = Figment::from(Serialized::defaults(SyncSettings::default()))
            .merge(Json::file(path))
            .merge(Env::prefixed(ENV_PREFIX));

        figment
            .extract::<SyncSettings>()
            .map(SyncSettings::normalized)
            .map_err(Box::new)
            .context(LoadSnafu {
                stage: "settings-load-extract",
                path,
            })
    }

    /// Writes `settings` next to `path` and swaps it into place, so readers never see a
    /// half-written file.
    fn persist(path: &Path, settings: &SyncSettings) -> Result<(), SettingsError> {
        let directory = path
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(directory).context(SaveSnafu {
            stage: "settings-save-directory",
            path: directory,
        })?;

        let mut staged = NamedTempFile::new_in(directory).context(SaveSnafu {
            stage: "settings-save-stage",
            path: directory,
        })?;
        serde_json::to_writer_pretty(staged.as_file_mut(), settings).context(EncodeSnafu {
            stage: "settings-save-encode",
        })?;
        staged.as_file_mut().flush().context(SaveSnafu {
            stage: "settings-save-flush",
            path: staged.path(),
        })?;
        staged.persist(path).map_err(|error| error.error).context(SaveSnafu {
            stage: "settings-save-replace",
            path,
        })?;

        tracing::info!(path = %path.display(), "settings saved");
        Ok(())
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SettingsError {
    #[snafu(display("settings at {} are unreadable on `{stage}`: {source}", path.display()))]
    Load {
        stage: &'static str,
        path: PathBuf,
        source: Box<figment::Error>,
    },
    #[snafu(display("settings could not be encoded on `{stage}`: {source}"))]
    Encode {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("settings could not be saved to {} on `{stage}`: {source}", path.display()))]
    Save {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
}

fn default_database_path() -> String {
    SettingsStore::default_config_dir()
        .join(DATABASE_FILE_NAME)
        .display()
        .to_string()
}

fn default_max_body_chars() -> usize {
    DEFAULT_MAX_BODY_CHARS
}

fn default_rate_limit_max_sends() -> u32 {
    DEFAULT_RATE_LIMIT_MAX_SENDS
}

fn default_rate_limit_window_secs() -> u64 {
    DEFAULT_RATE_LIMIT_WINDOW_SECS
}

fn default_read_settle_delay_ms() -> u64 {
    DEFAULT_READ_SETTLE_DELAY_MS
}

fn default_typing_idle_ms() -> u64 {
    DEFAULT_TYPING_IDLE_MS
}

fn default_event_buffer() -> usize {
    DEFAULT_EVENT_BUFFER
}
