use color_eyre::eyre::bail;
use std::path::{Path, PathBuf};

pub const CONFIG_DIR_ENV: &str = "DEVDASH_CONFIG_DIR";
pub const CONFIG_DIR_NAME: &str = ".devdashboard";

#[derive(Debug, Clone)]
pub struct Paths {
    config_dir: PathBuf,
}

impl Paths {
    pub fn new() -> color_eyre::Result<Self> {
        if let Ok(path) = std::env::var(CONFIG_DIR_ENV) {
            return Ok(Self {
                config_dir: PathBuf::from(path),
            });
        }
        let Some(home) = dirs::home_dir() else {
            bail!("could not determine home directory");
        };
        Ok(Self {
            config_dir: home.join(CONFIG_DIR_NAME),
        })
    }

    pub fn with_base(base: PathBuf) -> Self {
        Self { config_dir: base }
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    pub fn services_file(&self) -> PathBuf {
        self.config_dir.join("config.json")
    }

    pub fn settings_file(&self) -> PathBuf {
        self.config_dir.join("settings.json")
    }
}
