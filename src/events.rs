use serenity::model::id::GuildId;
use tokio::sync::broadcast;

use crate::audio::track::Track;
use crate::node::protocol::EndReason;

/// Capacidad del canal de eventos; los listeners lentos pierden los más viejos.
const EVENT_CAPACITY: usize = 256;

/// Eventos que el núcleo emite hacia afuera.
///
/// Persistencia, stats y cualquier otro consumidor se suscriben por
/// broadcast; el player no conoce a sus observadores.
#[derive(Debug, Clone)]
pub enum PlayerEvent {
    TrackStart {
        guild_id: GuildId,
        track: Track,
    },
    TrackEnd {
        guild_id: GuildId,
        track: Option<Track>,
        reason: EndReason,
    },
    /// Se agotaron los reintentos de avance; el player quedó idle.
    PlaybackFailed {
        guild_id: GuildId,
        track: Track,
        attempts: u8,
    },
    /// Cola agotada sin autoplay; candidato a teardown por inactividad.
    QueueFinished {
        guild_id: GuildId,
    },
    PlayerDestroyed {
        guild_id: GuildId,
    },
    FiltersChanged {
        guild_id: GuildId,
        tags: Vec<String>,
    },
    AutoplayToggled {
        guild_id: GuildId,
        enabled: bool,
    },
}

/// Crea el canal de eventos del núcleo.
pub fn channel() -> (broadcast::Sender<PlayerEvent>, broadcast::Receiver<PlayerEvent>) {
    broadcast::channel(EVENT_CAPACITY)
}
