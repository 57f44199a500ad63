use std::{collections::HashMap, fs, path::Path};

use serde::Deserialize;

pub const SETTINGS_FILE: &str = "csaas.toml";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Settings {
    pub supabase_url: String,
    pub supabase_anon_key: String,
    pub api_url: String,
    pub session_database_url: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            supabase_url: "http://127.0.0.1:54321".into(),
            supabase_anon_key: String::new(),
            api_url: "http://127.0.0.1:8000".into(),
            session_database_url: "sqlite://./data/csaas-session.db".into(),
        }
    }
}

pub fn load_settings() -> Settings {
    load_settings_from(Path::new(SETTINGS_FILE), |name| std::env::var(name).ok())
}

/// Defaults, then the settings file, then the environment. Later sources win.
pub fn load_settings_from(path: &Path, env: impl Fn(&str) -> Option<String>) -> Settings {
    let mut settings = Settings::default();

    if let Ok(raw) = fs::read_to_string(path) {
        match toml::from_str::<HashMap<String, String>>(&raw) {
            Ok(file_cfg) => {
                if let Some(v) = file_cfg.get("supabase_url") {
                    settings.supabase_url = v.clone();
                }
                if let Some(v) = file_cfg.get("supabase_anon_key") {
                    settings.supabase_anon_key = v.clone();
                }
                if let Some(v) = file_cfg.get("api_url") {
                    settings.api_url = v.clone();
                }
                if let Some(v) = file_cfg.get("session_database_url") {
                    settings.session_database_url = v.clone();
                }
            }
            Err(error) => {
                tracing::warn!(path = %path.display(), %error, "config: ignoring unreadable settings file");
            }
        }
    }

    if let Some(v) = env("SUPABASE_URL") {
        settings.supabase_url = v;
    }
    if let Some(v) = env("APP__SUPABASE_URL") {
        settings.supabase_url = v;
    }

    if let Some(v) = env("SUPABASE_ANON_KEY") {
        settings.supabase_anon_key = v;
    }
    if let Some(v) = env("APP__SUPABASE_ANON_KEY") {
        settings.supabase_anon_key = v;
    }

    if let Some(v) = env("API_URL") {
        settings.api_url = v;
    }
    if let Some(v) = env("APP__API_URL") {
        settings.api_url = v;
    }

    if let Some(v) = env("CSAAS_SESSION_DB") {
        settings.session_database_url = v;
    }
    if let Some(v) = env("APP__SESSION_DATABASE_URL") {
        settings.session_database_url = v;
    }

    settings
}

/// Accepts a plain file path or a SQLite URL. The store creates missing
/// parent directories when it opens.
pub fn session_database_url(raw: &str) -> String {
    let raw = raw.trim();
    if raw.is_empty() {
        return Settings::default().session_database_url;
    }

    match raw.strip_prefix("sqlite:") {
        _ if raw.contains("://") => raw.to_string(),
        Some(rest) if rest.starts_with(":memory:") => raw.to_string(),
        Some(path) => format!("sqlite://{}", path.replace('\\', "/")),
        None => format!("sqlite://{}", raw.replace('\\', "/")),
    }
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
