use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serenity::model::id::{GuildId, RoleId};
use std::path::PathBuf;
use tokio::fs;
use tracing::{info, warn};

use crate::audio::queue::QueueType;
use crate::error::Result;

/// Configuración por guild leída de un almacén externo.
///
/// Las claves ausentes caen a los defaults: volumen 100, repetición
/// apagada, supresión de duplicados activa.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GuildSettings {
    pub dj_role: Option<RoleId>,
    pub queue_type: QueueType,
    pub default_volume: u16,
    pub allow_duplicates: bool,
    pub max_queue_size: usize,
}

impl Default for GuildSettings {
    fn default() -> Self {
        Self {
            dj_role: None,
            queue_type: QueueType::Standard,
            default_volume: 100,
            allow_duplicates: false,
            max_queue_size: 1000,
        }
    }
}

/// Acceso al almacén de configuración de guilds.
///
/// El núcleo solo lee por clave; quién lo llena (comandos de settings,
/// dashboard) queda afuera.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SettingsStore: Send + Sync {
    /// Configuración de la guild; nunca falla, a lo sumo defaults.
    async fn get(&self, guild_id: GuildId) -> GuildSettings;
    async fn set(&self, guild_id: GuildId, settings: GuildSettings) -> Result<()>;
}

/// Almacén de configuraciones basado en archivos JSON.
pub struct JsonSettingsStore {
    data_dir: PathBuf,
    cache: DashMap<GuildId, GuildSettings>,
}

impl JsonSettingsStore {
    pub async fn new(data_dir: PathBuf) -> Result<Self> {
        let servers_dir = data_dir.join("servers");
        fs::create_dir_all(&servers_dir).await?;
        info!("📁 Configuración de guilds en: {}", servers_dir.display());

        let store = Self {
            data_dir,
            cache: DashMap::new(),
        };
        store.load_all().await;
        Ok(store)
    }

    fn file_path(&self, guild_id: GuildId) -> PathBuf {
        self.data_dir
            .join("servers")
            .join(format!("guild_{}.json", guild_id))
    }

    async fn load_all(&self) {
        let servers_dir = self.data_dir.join("servers");
        let Ok(mut entries) = fs::read_dir(&servers_dir).await else {
            return;
        };

        let mut loaded = 0;
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            let Some(name) = path.file_stem().and_then(|n| n.to_str()) else {
                continue;
            };
            let Some(raw_id) = name.strip_prefix("guild_") else {
                continue;
            };
            let Ok(guild_id) = raw_id.parse::<u64>() else {
                continue;
            };
            if guild_id == 0 {
                continue;
            }

            match fs::read_to_string(&path).await {
                Ok(content) => match serde_json::from_str::<GuildSettings>(&content) {
                    Ok(settings) => {
                        self.cache.insert(GuildId::new(guild_id), settings);
                        loaded += 1;
                    }
                    Err(e) => warn!("Configuración corrupta para guild {}: {}", guild_id, e),
                },
                Err(e) => warn!("Error leyendo configuración de guild {}: {}", guild_id, e),
            }
        }

        if loaded > 0 {
            info!("📂 Cargadas {} configuraciones de guild", loaded);
        }
    }
}

#[async_trait]
impl SettingsStore for JsonSettingsStore {
    async fn get(&self, guild_id: GuildId) -> GuildSettings {
        if let Some(settings) = self.cache.get(&guild_id) {
            return settings.clone();
        }

        match fs::read_to_string(self.file_path(guild_id)).await {
            Ok(content) => match serde_json::from_str::<GuildSettings>(&content) {
                Ok(settings) => {
                    self.cache.insert(guild_id, settings.clone());
                    settings
                }
                Err(e) => {
                    warn!("Configuración corrupta para guild {}: {}", guild_id, e);
                    GuildSettings::default()
                }
            },
            Err(_) => GuildSettings::default(),
        }
    }

    async fn set(&self, guild_id: GuildId, settings: GuildSettings) -> Result<()> {
        self.cache.insert(guild_id, settings.clone());
        let content = serde_json::to_string_pretty(&settings)?;
        fs::write(self.file_path(guild_id), content).await?;
        info!("💾 Configuración actualizada para guild {}", guild_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn missing_guilds_fall_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonSettingsStore::new(dir.path().to_path_buf()).await.unwrap();

        let settings = store.get(GuildId::new(1)).await;
        assert_eq!(settings.default_volume, 100);
        assert!(!settings.allow_duplicates);
        assert_eq!(settings.queue_type, QueueType::Standard);
        assert!(settings.dj_role.is_none());
    }

    #[tokio::test]
    async fn settings_survive_a_store_reload() {
        let dir = tempfile::tempdir().unwrap();
        let guild = GuildId::new(42);

        {
            let store = JsonSettingsStore::new(dir.path().to_path_buf()).await.unwrap();
            let settings = GuildSettings {
                dj_role: Some(RoleId::new(777)),
                queue_type: QueueType::Fair,
                default_volume: 80,
                allow_duplicates: true,
                max_queue_size: 200,
            };
            store.set(guild, settings).await.unwrap();
        }

        let reloaded = JsonSettingsStore::new(dir.path().to_path_buf()).await.unwrap();
        let settings = reloaded.get(guild).await;
        assert_eq!(settings.dj_role, Some(RoleId::new(777)));
        assert_eq!(settings.queue_type, QueueType::Fair);
        assert_eq!(settings.default_volume, 80);
        assert!(settings.allow_duplicates);
    }

    #[tokio::test]
    async fn partial_documents_tolerate_missing_keys() {
        let dir = tempfile::tempdir().unwrap();
        let servers = dir.path().join("servers");
        tokio::fs::create_dir_all(&servers).await.unwrap();
        tokio::fs::write(
            servers.join("guild_9.json"),
            r#"{ "default_volume": 55 }"#,
        )
        .await
        .unwrap();

        let store = JsonSettingsStore::new(dir.path().to_path_buf()).await.unwrap();
        let settings = store.get(GuildId::new(9)).await;
        assert_eq!(settings.default_volume, 55);
        // el resto cae a los defaults documentados
        assert!(!settings.allow_duplicates);
        assert_eq!(settings.max_queue_size, 1000);
    }
}
