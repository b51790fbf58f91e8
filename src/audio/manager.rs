use async_trait::async_trait;
use dashmap::DashMap;
use serenity::model::id::{ChannelId, GuildId, UserId};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::info;

use crate::audio::player::Player;
use crate::error::{Error, Result};
use crate::events::PlayerEvent;
use crate::node::pool::NodePool;
use crate::node::protocol::VoiceServer;
use crate::node::NodeLink;
use crate::settings::SettingsStore;

/// Ocupante de un canal de voz con lo necesario para decidir privilegios.
#[derive(Debug, Clone)]
pub struct VoiceMember {
    pub id: UserId,
    pub is_bot: bool,
    /// Tiene el rol DJ configurado para la guild.
    pub has_dj_role: bool,
    /// Tiene un permiso equivalente a gestionar la guild.
    pub can_manage: bool,
}

/// La única dependencia hacia Discord que el núcleo necesita: quién está en
/// un canal de voz. La implementa el bot con su cache de gateway.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait VoiceRoster: Send + Sync {
    async fn members(&self, guild_id: GuildId, channel_id: ChannelId) -> Vec<VoiceMember>;
}

/// Players vivos indexados por guild; compartido con los nodos para el
/// despacho de eventos.
#[derive(Default)]
pub struct PlayerRegistry {
    players: DashMap<GuildId, Arc<Player>>,
}

impl PlayerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, guild_id: GuildId) -> Option<Arc<Player>> {
        self.players.get(&guild_id).map(|p| Arc::clone(p.value()))
    }

    pub fn insert(&self, player: Arc<Player>) {
        self.players.insert(player.guild_id(), player);
    }

    pub fn remove(&self, guild_id: GuildId) -> Option<Arc<Player>> {
        self.players.remove(&guild_id).map(|(_, p)| p)
    }

    pub fn len(&self) -> usize {
        self.players.len()
    }

    pub fn is_empty(&self) -> bool {
        self.players.is_empty()
    }

    /// Copia instantánea de los players activos.
    pub fn all(&self) -> Vec<Arc<Player>> {
        self.players.iter().map(|e| Arc::clone(e.value())).collect()
    }
}

/// Fachada del núcleo: crea, busca y destruye players.
pub struct PlayerManager {
    registry: Arc<PlayerRegistry>,
    pool: Arc<NodePool>,
    roster: Arc<dyn VoiceRoster>,
    settings: Arc<dyn SettingsStore>,
    events: broadcast::Sender<PlayerEvent>,
}

impl PlayerManager {
    pub fn new(
        registry: Arc<PlayerRegistry>,
        pool: Arc<NodePool>,
        roster: Arc<dyn VoiceRoster>,
        settings: Arc<dyn SettingsStore>,
    ) -> Self {
        let (events, _) = crate::events::channel();
        Self {
            registry,
            pool,
            roster,
            settings,
            events,
        }
    }

    /// Suscripción a los eventos salientes del núcleo.
    pub fn subscribe(&self) -> broadcast::Receiver<PlayerEvent> {
        self.events.subscribe()
    }

    pub fn registry(&self) -> &Arc<PlayerRegistry> {
        &self.registry
    }

    pub fn roster(&self) -> &Arc<dyn VoiceRoster> {
        &self.roster
    }

    pub fn get(&self, guild_id: GuildId) -> Option<Arc<Player>> {
        self.registry.get(guild_id)
    }

    /// Crea el player de la guild sobre el nodo menos cargado.
    ///
    /// Si ya existe uno vivo lo devuelve tal cual; la configuración de la
    /// guild se lee al crear y los faltantes caen a los defaults.
    pub async fn connect(
        &self,
        guild_id: GuildId,
        voice_channel: ChannelId,
        text_channel: Option<ChannelId>,
    ) -> Result<Arc<Player>> {
        if let Some(existing) = self.registry.get(guild_id) {
            if !existing.is_destroyed() {
                return Ok(existing);
            }
            self.registry.remove(guild_id);
        }

        let settings = self.settings.get(guild_id).await;
        let node = self.pool.best_node()?;
        let player = Player::new(
            guild_id,
            voice_channel,
            text_channel,
            node.clone(),
            Arc::clone(&self.roster),
            self.events.clone(),
            &settings,
        );

        node.attach_player();
        self.registry.insert(Arc::clone(&player));
        info!(
            "🔗 Player creado en guild {} sobre el nodo {} ({} activos)",
            guild_id,
            node.identifier(),
            self.registry.len()
        );
        Ok(player)
    }

    /// Reenvía al nodo las credenciales de voz del gateway.
    pub async fn voice_update(&self, guild_id: GuildId, voice: VoiceServer) -> Result<()> {
        let player = self.registry.get(guild_id).ok_or(Error::NoPlayer)?;
        player.connect_voice(voice).await
    }

    /// Desarma el player de una guild y libera su lugar en el nodo.
    pub async fn teardown(&self, guild_id: GuildId) -> Result<()> {
        let player = self.registry.remove(guild_id).ok_or(Error::NoPlayer)?;
        let node_id = player.node_identifier();
        player.destroy().await;
        if let Some(node) = self.pool.node(&node_id) {
            node.detach_player();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::protocol::NodeStats;
    use crate::node::NodeConfig;
    use crate::settings::{GuildSettings, MockSettingsStore};
    use std::time::Duration;

    fn empty_roster() -> Arc<MockVoiceRoster> {
        let mut roster = MockVoiceRoster::new();
        roster.expect_members().returning(|_, _| Vec::new());
        Arc::new(roster)
    }

    fn default_settings() -> Arc<MockSettingsStore> {
        let mut settings = MockSettingsStore::new();
        settings
            .expect_get()
            .returning(|_| GuildSettings::default());
        Arc::new(settings)
    }

    fn manager_with_ready_node() -> PlayerManager {
        let registry = Arc::new(PlayerRegistry::new());
        let pool = NodePool::new(
            vec![NodeConfig {
                identifier: "main".to_string(),
                host: "localhost".to_string(),
                port: 2333,
                password: "pass".to_string(),
                secure: false,
            }],
            UserId::new(1),
            Arc::clone(&registry),
            Duration::from_secs(10),
        )
        .unwrap();
        pool.node("main")
            .unwrap()
            .force_ready("session", NodeStats::default());

        PlayerManager::new(registry, Arc::new(pool), empty_roster(), default_settings())
    }

    #[tokio::test]
    async fn connect_is_idempotent_per_guild() {
        let manager = manager_with_ready_node();
        let guild = GuildId::new(1);

        let a = manager
            .connect(guild, ChannelId::new(10), None)
            .await
            .unwrap();
        let b = manager
            .connect(guild, ChannelId::new(10), None)
            .await
            .unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(manager.registry().len(), 1);
    }

    #[tokio::test]
    async fn connect_fails_without_available_nodes() {
        let registry = Arc::new(PlayerRegistry::new());
        let pool = NodePool::new(
            vec![NodeConfig {
                identifier: "down".to_string(),
                host: "localhost".to_string(),
                port: 2333,
                password: "pass".to_string(),
                secure: false,
            }],
            UserId::new(1),
            Arc::clone(&registry),
            Duration::from_secs(10),
        )
        .unwrap();
        let manager =
            PlayerManager::new(registry, Arc::new(pool), empty_roster(), default_settings());

        let result = manager.connect(GuildId::new(1), ChannelId::new(10), None).await;
        assert!(matches!(result, Err(Error::NodeUnavailable)));
    }

    #[tokio::test]
    async fn teardown_releases_the_node_slot() {
        let manager = manager_with_ready_node();
        let guild = GuildId::new(1);
        manager
            .connect(guild, ChannelId::new(10), None)
            .await
            .unwrap();
        assert_eq!(manager.pool.node("main").unwrap().player_count(), 1);

        manager.teardown(guild).await.unwrap();
        assert!(manager.get(guild).is_none());
        assert_eq!(manager.pool.node("main").unwrap().player_count(), 0);

        assert!(matches!(
            manager.teardown(guild).await,
            Err(Error::NoPlayer)
        ));
    }
}
