use anyhow::{bail, Context, Result};
use directories::BaseDirs;
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub name: String,
    pub target_dir: PathBuf,
    pub library_dir: PathBuf,
    pub backup_dir: PathBuf,
    /// Zip compression method for backups; negative for plain directory backups.
    #[serde(default = "default_backup_method")]
    pub backup_method: i32,
    #[serde(default = "default_backup_level")]
    pub backup_level: i32,
    #[serde(default)]
    pub no_overlap: bool,
    #[serde(default = "default_download_max")]
    pub download_max: usize,
    /// Aggregate bytes per second, 0 for unlimited.
    #[serde(default)]
    pub download_rate: u64,
    #[serde(default)]
    pub repositories: Vec<String>,
}

impl ChannelConfig {
    pub fn with_root(name: &str, root: &Path) -> Self {
        Self {
            name: name.to_string(),
            target_dir: root.join("target"),
            library_dir: root.join("library"),
            backup_dir: root.join("backups"),
            backup_method: default_backup_method(),
            backup_level: default_backup_level(),
            no_overlap: false,
            download_max: default_download_max(),
            download_rate: 0,
            repositories: Vec::new(),
        }
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        fs::create_dir_all(&self.target_dir).context("create target dir")?;
        fs::create_dir_all(&self.library_dir).context("create library dir")?;
        fs::create_dir_all(&self.backup_dir).context("create backup dir")?;
        Ok(())
    }

    pub fn uses_directory_backups(&self) -> bool {
        self.backup_method < 0
    }

    pub fn per_download_rate(&self) -> Option<u64> {
        if self.download_rate == 0 {
            return None;
        }
        let slots = self.download_max.max(1) as u64;
        Some((self.download_rate / slots).max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub channels: Vec<ChannelConfig>,
    #[serde(default)]
    pub active_channel: String,
}

impl AppConfig {
    pub fn load_or_create() -> Result<Self> {
        let base_dir = base_data_dir()?;
        Self::load_or_create_in(&base_dir)
    }

    pub fn load_or_create_in(base_dir: &Path) -> Result<Self> {
        fs::create_dir_all(base_dir).context("create app data dir")?;
        let path = base_dir.join("config.json");
        if path.exists() {
            let raw = fs::read_to_string(&path).context("read app config")?;
            let mut config: AppConfig = serde_json::from_str(&raw).context("parse app config")?;
            if config.channels.is_empty() {
                config.channels.push(ChannelConfig::with_root("Default", base_dir));
            }
            if config.channel(&config.active_channel).is_none() {
                config.active_channel = config.channels[0].name.clone();
                config.save_in(base_dir)?;
            }
            return Ok(config);
        }

        let config = AppConfig {
            channels: vec![ChannelConfig::with_root("Default", base_dir)],
            active_channel: "Default".to_string(),
        };
        config.save_in(base_dir)?;
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let base_dir = base_data_dir()?;
        self.save_in(&base_dir)
    }

    pub fn save_in(&self, base_dir: &Path) -> Result<()> {
        fs::create_dir_all(base_dir).context("create app data dir")?;
        let path = base_dir.join("config.json");
        let raw = serde_json::to_string_pretty(self).context("serialize app config")?;
        fs::write(path, raw).context("write app config")?;
        Ok(())
    }

    pub fn channel(&self, name: &str) -> Option<&ChannelConfig> {
        self.channels.iter().find(|channel| channel.name == name)
    }

    pub fn select(&self, name: Option<&str>) -> Result<&ChannelConfig> {
        let wanted = name.unwrap_or(&self.active_channel);
        match self.channel(wanted) {
            Some(channel) => Ok(channel),
            None => bail!("unknown channel '{wanted}'"),
        }
    }
}

fn default_backup_method() -> i32 {
    8
}

fn default_backup_level() -> i32 {
    6
}

fn default_download_max() -> usize {
    3
}

pub fn base_data_dir() -> Result<PathBuf> {
    let base = BaseDirs::new().context("resolve home dir")?;
    Ok(base.data_local_dir().join("modvault"))
}
