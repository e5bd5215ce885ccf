use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

/// Read-only user settings. A missing file yields the defaults.
#[derive(Debug, Clone, Default)]
pub struct Settings {
    source: Option<String>,
    file: SettingsFile,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct SettingsFile {
    current_context: String,
    current_namespace: String,
    colors: ColorSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct ColorSettings {
    enabled: bool,
}

impl Default for SettingsFile {
    fn default() -> Self {
        Self {
            current_context: String::new(),
            current_namespace: String::new(),
            colors: ColorSettings::default(),
        }
    }
}

impl Default for ColorSettings {
    fn default() -> Self {
        Self { enabled: true }
    }
}

impl Settings {
    pub fn load() -> Result<Self> {
        match discover_config_path() {
            Some(path) => Self::from_path(&path),
            None => Ok(Self::default()),
        }
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let mut settings = Self::from_yaml(&raw)
            .with_context(|| format!("failed to parse config {}", path.display()))?;
        settings.source = Some(path.display().to_string());
        Ok(settings)
    }

    pub fn from_yaml(raw: &str) -> Result<Self> {
        let file = if raw.trim().is_empty() {
            SettingsFile::default()
        } else {
            serde_yaml::from_str(raw)?
        };
        Ok(Self { source: None, file })
    }

    pub fn source(&self) -> Option<&str> {
        self.source.as_deref()
    }

    /// Context to use instead of the kubeconfig's current one.
    pub fn current_context(&self) -> Option<&str> {
        non_empty(&self.file.current_context)
    }

    pub fn current_namespace(&self) -> Option<&str> {
        non_empty(&self.file.current_namespace)
    }

    pub fn colors_enabled(&self) -> bool {
        self.file.colors.enabled
    }
}

fn non_empty(value: &str) -> Option<&str> {
    let value = value.trim();
    (!value.is_empty()).then_some(value)
}

const CONFIG_ENV: &str = "KVIEW_CONFIG";
const LOCAL_FILES: [&str; 3] = ["kview.yaml", "kview.yml", ".kview.yaml"];
const HOME_FILES: [&str; 3] = [
    ".config/kview/config.yaml",
    ".config/kview/config.yml",
    ".kview.yaml",
];

/// `KVIEW_CONFIG` is taken as given; otherwise the first existing candidate wins.
fn discover_config_path() -> Option<PathBuf> {
    std::env::var_os(CONFIG_ENV)
        .filter(|value| !value.to_string_lossy().trim().is_empty())
        .map(PathBuf::from)
        .or_else(|| {
            candidate_paths(std::env::var_os("HOME").map(PathBuf::from).as_deref())
                .into_iter()
                .find(|candidate| candidate.is_file())
        })
}

/// Working-directory files first, then files under `home`.
fn candidate_paths(home: Option<&Path>) -> Vec<PathBuf> {
    let local = LOCAL_FILES.iter().map(PathBuf::from);
    let user = home
        .into_iter()
        .flat_map(|home| HOME_FILES.iter().map(move |file| home.join(file)));
    local.chain(user).collect()
}
