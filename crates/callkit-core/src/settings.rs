use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::credentials::{CredentialConfig, DEFAULT_TTL};
use crate::engine::ChannelProfile;

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct CallSettings {
    #[serde(default)]
    pub app_id: Option<String>,
    #[serde(default)]
    pub token_server_url: Option<String>,
    #[serde(default)]
    pub static_token: Option<String>,
    #[serde(default)]
    pub static_token_channel: Option<String>,
    #[serde(default)]
    pub signing_key: Option<String>,
    #[serde(default = "default_ttl_secs")]
    pub credential_ttl_secs: u64,
    #[serde(default = "default_join_timeout_secs")]
    pub join_timeout_secs: u64,
    #[serde(default = "default_true")]
    pub mic_enabled_on_join: bool,
    #[serde(default = "default_true")]
    pub camera_enabled_on_join: bool,
    #[serde(default = "default_true")]
    pub speaker_enabled_on_join: bool,
    #[serde(default)]
    pub channel_profile: ChannelProfile,
}

fn default_true() -> bool {
    true
}

fn default_ttl_secs() -> u64 {
    DEFAULT_TTL.as_secs()
}

fn default_join_timeout_secs() -> u64 {
    30
}

impl Default for CallSettings {
    fn default() -> Self {
        Self {
            app_id: None,
            token_server_url: None,
            static_token: None,
            static_token_channel: None,
            signing_key: None,
            credential_ttl_secs: default_ttl_secs(),
            join_timeout_secs: default_join_timeout_secs(),
            mic_enabled_on_join: true,
            camera_enabled_on_join: true,
            speaker_enabled_on_join: true,
            channel_profile: ChannelProfile::default(),
        }
    }
}

impl CallSettings {
    pub fn credential_config(&self) -> CredentialConfig {
        CredentialConfig {
            server_url: self.token_server_url.clone(),
            static_token: self.static_token.clone(),
            static_token_channel: self.static_token_channel.clone(),
            app_id: self.app_id.clone(),
            signing_key: self.signing_key.clone(),
            http_timeout: None,
        }
    }

    pub fn credential_ttl(&self) -> Duration {
        Duration::from_secs(self.credential_ttl_secs)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_secs(self.join_timeout_secs)
    }
}

/// Settings persisted as `settings.json` under a data directory.
pub struct SettingsStore {
    settings: Mutex<CallSettings>,
    file_path: PathBuf,
}

impl SettingsStore {
    pub fn new(data_dir: &str) -> Self {
        let file_path = PathBuf::from(data_dir).join("settings.json");
        let settings = Self::load(&file_path);
        Self {
            settings: Mutex::new(settings),
            file_path,
        }
    }

    pub fn get(&self) -> CallSettings {
        self.lock().clone()
    }

    pub fn set_app_id(&self, app_id: Option<String>) {
        self.lock().app_id = app_id;
        self.save();
    }

    pub fn set_token_server_url(&self, url: Option<String>) {
        self.lock().token_server_url = url;
        self.save();
    }

    pub fn set_static_token(&self, token: Option<String>, channel: Option<String>) {
        {
            let mut settings = self.lock();
            settings.static_token = token;
            settings.static_token_channel = channel;
        }
        self.save();
    }

    pub fn set_signing_key(&self, key: Option<String>) {
        self.lock().signing_key = key;
        self.save();
    }

    pub fn set_mic_enabled_on_join(&self, enabled: bool) {
        self.lock().mic_enabled_on_join = enabled;
        self.save();
    }

    pub fn set_camera_enabled_on_join(&self, enabled: bool) {
        self.lock().camera_enabled_on_join = enabled;
        self.save();
    }

    pub fn set_speaker_enabled_on_join(&self, enabled: bool) {
        self.lock().speaker_enabled_on_join = enabled;
        self.save();
    }

    pub fn set_channel_profile(&self, profile: ChannelProfile) {
        self.lock().channel_profile = profile;
        self.save();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CallSettings> {
        self.settings.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn save(&self) {
        let settings = self.get();
        if let Some(parent) = self.file_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        match serde_json::to_string_pretty(&settings) {
            Ok(json) => {
                if let Err(e) = std::fs::write(&self.file_path, json) {
                    tracing::warn!("failed to write settings to {}: {e}", self.file_path.display());
                }
            }
            Err(e) => tracing::warn!("failed to serialize settings: {e}"),
        }
    }

    fn load(path: &PathBuf) -> CallSettings {
        match std::fs::read_to_string(path) {
            Ok(contents) => serde_json::from_str(&contents).unwrap_or_else(|e| {
                tracing::warn!("corrupt settings file {}, using defaults: {e}", path.display());
                CallSettings::default()
            }),
            Err(_) => CallSettings::default(),
        }
    }
}
