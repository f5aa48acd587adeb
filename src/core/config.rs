use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
    #[serde(default = "default_prefs_path")]
    pub prefs_path: String,

    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Silent window after the last detection before a match fires.
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,

    /// Minimum interval between attempted playback starts.
    #[serde(default = "default_min_play_interval_ms")]
    pub min_play_interval_ms: u64,

    /// Display-name substrings classifying a speaker as male for the
    /// default-pool fallback. Policy data, editable per deployment.
    #[serde(default = "default_male_markers")]
    pub male_markers: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            prefs_path: default_prefs_path(),
            base_url: default_base_url(),
            debounce_ms: default_debounce_ms(),
            min_play_interval_ms: default_min_play_interval_ms(),
            male_markers: default_male_markers(),
        }
    }
}

fn default_prefs_path() -> String {
    "prefs.json".to_string()
}
fn default_base_url() -> String {
    "http://127.0.0.1:8000".to_string()
}
fn default_debounce_ms() -> u64 {
    500
}
fn default_min_play_interval_ms() -> u64 {
    500
}
fn default_male_markers() -> Vec<String> {
    ["male", "man", "boy", "mr.", "sir", "king", "prince", "lord", "father", "uncle"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

impl Config {
    pub fn load() -> Result<Self> {
        let path = Path::new("config.yml");
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path).context("Failed to read config.yml")?;
        let config: Config =
            serde_yaml_ng::from_str(&content).context("Failed to parse config.yml")?;
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let content = serde_yaml_ng::to_string(self)?;
        fs::write("config.yml", content).context("Failed to write config.yml")?;
        Ok(())
    }
}
