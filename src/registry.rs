use crate::config::{Service, ServiceConfig, ServiceUpdate, Settings, SettingsUpdate};
use crate::paths::Paths;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::fs;
use tokio::sync::RwLock;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("failed to write '{path}': {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to serialize registry: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ServicesFile {
    #[serde(default)]
    services: Vec<Service>,
}

/// Store of service definitions and settings.
///
/// Display fields on each [`Service`] are written through
/// [`Registry::update_display`]; definition edits go through the
/// add/update/delete methods, which persist immediately when the registry
/// is file-backed.
pub struct Registry {
    paths: Option<Paths>,
    services: RwLock<HashMap<String, Service>>,
    settings: RwLock<Settings>,
}

impl Registry {
    /// Load from the configuration directory. Missing or unreadable files
    /// start empty (services) or with defaults (settings).
    pub async fn open(paths: Paths) -> Self {
        let services = load_services(&paths.services_file()).await;
        let settings = load_settings(&paths.settings_file()).await;
        Self {
            paths: Some(paths),
            services: RwLock::new(services),
            settings: RwLock::new(settings),
        }
    }

    pub fn in_memory() -> Self {
        Self {
            paths: None,
            services: RwLock::new(HashMap::new()),
            settings: RwLock::new(Settings::default()),
        }
    }

    pub async fn get_service(&self, id: &str) -> Option<Service> {
        self.services.read().await.get(id).cloned()
    }

    /// All services, ordered by id.
    pub async fn get_all_services(&self) -> Vec<Service> {
        let services = self.services.read().await;
        let mut all: Vec<Service> = services.values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    pub async fn add_service(&self, config: ServiceConfig) -> Result<String, RegistryError> {
        let settings = self.settings.read().await.clone();
        let id = {
            let mut services = self.services.write().await;
            let id = unique_id(&services);
            services.insert(id.clone(), Service::from_config(id.clone(), config, &settings));
            id
        };
        self.save().await?;
        Ok(id)
    }

    pub async fn update_service(
        &self,
        id: &str,
        update: ServiceUpdate,
    ) -> Result<bool, RegistryError> {
        {
            let mut services = self.services.write().await;
            let Some(service) = services.get_mut(id) else {
                return Ok(false);
            };
            service.apply_update(update);
        }
        self.save().await?;
        Ok(true)
    }

    pub async fn delete_service(&self, id: &str) -> Result<bool, RegistryError> {
        let removed = self.services.write().await.remove(id).is_some();
        if removed {
            self.save().await?;
        }
        Ok(removed)
    }

    /// Mutate the display fields of one service in place. Returns false
    /// when the id is unknown. Does not persist.
    pub async fn update_display(&self, id: &str, f: impl FnOnce(&mut Service)) -> bool {
        let mut services = self.services.write().await;
        match services.get_mut(id) {
            Some(service) => {
                f(service);
                true
            }
            None => false,
        }
    }

    pub async fn settings(&self) -> Settings {
        self.settings.read().await.clone()
    }

    pub async fn update_settings(&self, update: SettingsUpdate) -> Result<Settings, RegistryError> {
        let settings = {
            let mut settings = self.settings.write().await;
            settings.apply_update(update);
            settings.clone()
        };
        if let Some(ref paths) = self.paths {
            write_json(paths.config_dir(), &paths.settings_file(), &settings).await?;
        }
        Ok(settings)
    }

    /// Persist the service map. A no-op for in-memory registries.
    pub async fn save(&self) -> Result<(), RegistryError> {
        let Some(ref paths) = self.paths else {
            return Ok(());
        };
        let file = ServicesFile {
            services: self.get_all_services().await,
        };
        write_json(paths.config_dir(), &paths.services_file(), &file).await
    }
}

fn unique_id(services: &HashMap<String, Service>) -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default();
    let base = format!("service-{millis}");
    if !services.contains_key(&base) {
        return base;
    }
    let mut suffix = 1u32;
    loop {
        let candidate = format!("{base}-{suffix}");
        if !services.contains_key(&candidate) {
            return candidate;
        }
        suffix += 1;
    }
}

async fn load_services(path: &Path) -> HashMap<String, Service> {
    let data = match fs::read_to_string(path).await {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return HashMap::new(),
        Err(e) => {
            tracing::warn!("failed to read {}: {e}", path.display());
            return HashMap::new();
        }
    };
    match serde_json::from_str::<ServicesFile>(&data) {
        Ok(file) => file
            .services
            .into_iter()
            .map(|mut service| {
                // No process survives a restart of the host.
                service.reset_display();
                (service.id.clone(), service)
            })
            .collect(),
        Err(e) => {
            tracing::warn!("ignoring malformed {}: {e}", path.display());
            HashMap::new()
        }
    }
}

async fn load_settings(path: &Path) -> Settings {
    let data = match fs::read_to_string(path).await {
        Ok(data) => data,
        Err(_) => return Settings::default(),
    };
    serde_json::from_str(&data).unwrap_or_else(|e| {
        tracing::warn!("ignoring malformed {}: {e}", path.display());
        Settings::default()
    })
}

async fn write_json<T: Serialize>(dir: &Path, path: &Path, value: &T) -> Result<(), RegistryError> {
    let json = serde_json::to_string_pretty(value)?;
    fs::create_dir_all(dir)
        .await
        .map_err(|source| RegistryError::Write {
            path: dir.to_path_buf(),
            source,
        })?;
    fs::write(path, json.as_bytes())
        .await
        .map_err(|source| RegistryError::Write {
            path: path.to_path_buf(),
            source,
        })
}
