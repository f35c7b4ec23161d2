use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
    pub server: ServerConfig,

    #[serde(default)]
    pub polling: PollingConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct PollingConfig {
    /// Interval between task status queries, in milliseconds.
    #[serde(default = "default_task_interval_ms")]
    pub task_interval_ms: u64,

    /// Interval between authoritative project refreshes, in milliseconds.
    /// Independent of per-task polling.
    #[serde(default = "default_project_refresh_ms")]
    pub project_refresh_ms: u64,

    /// Window after a voice-preview submission during which re-submission
    /// for the same character is rejected, in milliseconds.
    #[serde(default = "default_preview_cooldown_ms")]
    pub preview_cooldown_ms: u64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            task_interval_ms: default_task_interval_ms(),
            project_refresh_ms: default_project_refresh_ms(),
            preview_cooldown_ms: default_preview_cooldown_ms(),
        }
    }
}

impl PollingConfig {
    pub fn task_interval(&self) -> Duration {
        Duration::from_millis(self.task_interval_ms)
    }

    pub fn project_refresh(&self) -> Duration {
        Duration::from_millis(self.project_refresh_ms)
    }

    pub fn preview_cooldown(&self) -> Duration {
        Duration::from_millis(self.preview_cooldown_ms)
    }
}

fn default_base_url() -> String {
    "http://127.0.0.1:8000".to_string()
}

fn default_task_interval_ms() -> u64 {
    2000
}

fn default_project_refresh_ms() -> u64 {
    2000
}

fn default_preview_cooldown_ms() -> u64 {
    8000
}

impl Config {
    pub fn load() -> Result<Self> {
        Self::load_from(Path::new("config.yml"))
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            anyhow::bail!("{} not found. Please create one.", path.display());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config: Config = serde_yaml_ng::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let content = serde_yaml_ng::to_string(self)?;
        fs::write("config.yml", content).context("Failed to write config.yml")?;
        Ok(())
    }
}
