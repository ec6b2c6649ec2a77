use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ThemePreference {
    #[default]
    Terminal,
    Light,
    Dark,
}

impl ThemePreference {
    pub fn next(self) -> Self {
        match self {
            ThemePreference::Terminal => ThemePreference::Light,
            ThemePreference::Light => ThemePreference::Dark,
            ThemePreference::Dark => ThemePreference::Terminal,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Settings {
    #[serde(default)]
    pub theme: ThemePreference,
    #[serde(default)]
    pub parse_markdown: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_id: Option<u64>,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            theme: ThemePreference::default(),
            parse_markdown: false,
            workspace_id: None,
            poll_interval_secs: default_poll_interval_secs(),
        }
    }
}

impl Settings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(MIN_POLL_INTERVAL_SECS))
    }
}

const MIN_POLL_INTERVAL_SECS: u64 = 5;

pub fn read_token() -> Option<String> {
    if let Ok(value) = env::var("TOGGL_API_TOKEN") {
        if !value.trim().is_empty() {
            return Some(value.trim().to_string());
        }
    }

    let path = token_path()?;
    fs::read_to_string(path)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

pub fn write_token(token: &str) -> Result<(), io::Error> {
    let path = token_path().ok_or_else(home_not_found)?;
    fs::write(path, token)
}

fn token_path() -> Option<PathBuf> {
    let mut path = dirs::home_dir()?;
    path.push(".toggl-now-token");
    Some(path)
}

fn settings_path() -> Option<PathBuf> {
    let mut path = dirs::home_dir()?;
    path.push(".toggl-now.json");
    Some(path)
}

pub fn read_settings() -> Settings {
    settings_path()
        .and_then(|path| read_settings_from(&path))
        .unwrap_or_default()
}

pub fn write_settings(settings: &Settings) -> Result<(), io::Error> {
    let path = settings_path().ok_or_else(home_not_found)?;
    write_settings_to(&path, settings)
}

fn read_settings_from(path: &Path) -> Option<Settings> {
    let contents = fs::read_to_string(path).ok()?;
    serde_json::from_str(&contents).ok()
}

fn write_settings_to(path: &Path, settings: &Settings) -> Result<(), io::Error> {
    let json = serde_json::to_string_pretty(settings).map_err(io::Error::other)?;
    fs::write(path, json)
}

fn home_not_found() -> io::Error {
    io::Error::new(io::ErrorKind::NotFound, "Home directory not found")
}

const fn default_poll_interval_secs() -> u64 {
    30
}
