use chrono::Utc;
use serde::{Deserialize, Serialize};
use serenity::model::id::{ChannelId, GuildId, UserId};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::audio::manager::{PlayerManager, PlayerRegistry};
use crate::audio::player::Player;
use crate::audio::queue::LoopType;
use crate::audio::track::Track;
use crate::error::Result;

/// Una sesión más vieja que esto se descarta sin intentar restaurarla.
pub const SESSION_TIMEOUT: Duration = Duration::from_secs(900);
/// Cadencia del loop de guardado.
pub const SAVE_INTERVAL: Duration = Duration::from_secs(5);

/// Proyección persistida de un track: el blob manda, el resto es para
/// inspeccionar el archivo a mano.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackSnapshot {
    pub track_id: String,
    pub title: String,
    pub author: String,
    pub uri: Option<String>,
    pub length: u64,
    pub requester_id: Option<u64>,
}

impl TrackSnapshot {
    fn of(track: &Track) -> Self {
        Self {
            track_id: track.encoded.clone(),
            title: track.info.title.clone(),
            author: track.info.author.clone(),
            uri: track.info.uri.clone(),
            length: track.info.length,
            requester_id: Some(track.requester.get()),
        }
    }

    /// Reconstruye el track decodificando el blob; el requester original
    /// puede ya no estar en el canal, ahí entra el fallback.
    fn into_track(&self, fallback: UserId) -> Result<Track> {
        let requester = match self.requester_id {
            Some(id) if id > 0 => UserId::new(id),
            _ => fallback,
        };
        Track::from_encoded(&self.track_id, requester)
    }
}

/// Estado persistido de un player, suficiente para reconstruirlo.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub guild_id: u64,
    pub voice_channel_id: u64,
    pub text_channel_id: Option<u64>,
    pub current_track: Option<TrackSnapshot>,
    pub position: u64,
    pub queue: Vec<TrackSnapshot>,
    pub volume: u16,
    pub loop_mode: LoopType,
    pub autoplay: bool,
    pub is_paused: bool,
    pub timestamp: i64,
}

/// Persistencia de sesiones en JSON plano, un archivo por guild.
///
/// El loop de guardado arranca recién después de la pasada de
/// restauración: restaurar reclama (borra) cada snapshot antes de que el
/// tick siguiente pueda re-persistir un player a medio armar.
pub struct SessionManager {
    dir: PathBuf,
    save_interval: Duration,
    timeout: Duration,
    shutdown: CancellationToken,
}

impl SessionManager {
    pub async fn new(data_dir: &Path, save_interval: Duration, timeout: Duration) -> Result<Self> {
        let dir = data_dir.join("sessions");
        fs::create_dir_all(&dir).await?;
        info!("📁 Sesiones persistidas en: {}", dir.display());

        Ok(Self {
            dir,
            save_interval,
            timeout,
            shutdown: CancellationToken::new(),
        })
    }

    fn file_path(&self, guild_id: u64) -> PathBuf {
        self.dir.join(format!("guild_{}.json", guild_id))
    }

    /// Proyección pura del player al shape persistido.
    ///
    /// `None` para un player destruido o sin track actual: no hay nada que
    /// valga la pena revivir.
    pub async fn snapshot(player: &Player) -> Option<SessionSnapshot> {
        if player.is_destroyed() {
            return None;
        }
        let view = player.view().await;
        let current = view.current.as_ref()?;

        Some(SessionSnapshot {
            guild_id: view.guild_id.get(),
            voice_channel_id: view.voice_channel.get(),
            text_channel_id: view.text_channel.map(|c| c.get()),
            current_track: Some(TrackSnapshot::of(current)),
            position: view.position_ms,
            queue: view.upcoming.iter().map(TrackSnapshot::of).collect(),
            volume: view.volume,
            loop_mode: view.repeat,
            autoplay: view.autoplay,
            is_paused: view.paused,
            timestamp: Utc::now().timestamp(),
        })
    }

    /// Una pasada de guardado: upsert para lo que suena (o está en pausa),
    /// borrado para lo que ya no. Escritura completa por documento, el
    /// último escritor gana.
    pub async fn save_all(&self, players: Vec<Arc<Player>>) {
        for player in players {
            let guild_id = player.guild_id().get();
            match Self::snapshot(&player).await {
                Some(snapshot) => {
                    let path = self.file_path(guild_id);
                    let write = async {
                        let content = serde_json::to_string_pretty(&snapshot)?;
                        fs::write(&path, content).await?;
                        crate::error::Result::Ok(())
                    };
                    if let Err(e) = write.await {
                        error!("Error guardando la sesión de guild {}: {}", guild_id, e);
                    }
                }
                None => {
                    let _ = fs::remove_file(self.file_path(guild_id)).await;
                }
            }
        }
    }

    /// Lanza el loop periódico de guardado; se corta con [`SessionManager::shutdown`].
    pub fn start_save_loop(self: &Arc<Self>, registry: Arc<PlayerRegistry>) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        info!(
            "💾 Loop de sesiones cada {}",
            humantime::format_duration(manager.save_interval)
        );
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(manager.save_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = manager.shutdown.cancelled() => break,
                    _ = interval.tick() => manager.save_all(registry.all()).await,
                }
            }
            debug!("Loop de sesiones detenido");
        })
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Restaura todas las sesiones frescas. Corre una sola vez, con el bot
    /// listo y antes de arrancar el loop de guardado.
    ///
    /// Cada snapshot se borra apenas se lee, haya salido bien o mal: un
    /// intento fallido no debe repetirse en el próximo arranque.
    pub async fn restore_all(&self, manager: &PlayerManager) -> usize {
        let Ok(mut entries) = fs::read_dir(&self.dir).await else {
            return 0;
        };

        let now = Utc::now().timestamp();
        let mut restored = 0;

        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if path.extension().map_or(true, |ext| ext != "json") {
                continue;
            }

            let snapshot = match fs::read_to_string(&path).await {
                Ok(content) => serde_json::from_str::<SessionSnapshot>(&content),
                Err(e) => {
                    warn!("No se pudo leer {}: {}", path.display(), e);
                    let _ = fs::remove_file(&path).await;
                    continue;
                }
            };
            // reclamar el snapshot antes de intentar nada
            let _ = fs::remove_file(&path).await;

            let snapshot = match snapshot {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    warn!("Snapshot corrupto en {}: {}", path.display(), e);
                    continue;
                }
            };

            if now - snapshot.timestamp > self.timeout.as_secs() as i64 {
                debug!(
                    "🕑 Sesión de guild {} vencida ({}s), descartada",
                    snapshot.guild_id,
                    now - snapshot.timestamp
                );
                continue;
            }

            let guild_id = snapshot.guild_id;
            match self.restore_one(manager, snapshot).await {
                Ok(true) => restored += 1,
                Ok(false) => {}
                Err(e) => error!("Falló la restauración de guild {}: {}", guild_id, e),
            }
        }

        if restored > 0 {
            info!("🔄 Restauradas {} sesión(es) del último apagado", restored);
        }
        restored
    }

    async fn restore_one(&self, manager: &PlayerManager, snapshot: SessionSnapshot) -> Result<bool> {
        if snapshot.guild_id == 0 || snapshot.voice_channel_id == 0 {
            return Ok(false);
        }
        let guild_id = GuildId::new(snapshot.guild_id);
        let voice_channel = ChannelId::new(snapshot.voice_channel_id);

        // no volver a un canal vacío
        let members = manager.roster().members(guild_id, voice_channel).await;
        let Some(fallback) = members.iter().find(|m| !m.is_bot).map(|m| m.id) else {
            debug!(
                "Canal de voz vacío en guild {}, restauración salteada",
                snapshot.guild_id
            );
            return Ok(false);
        };

        if snapshot.current_track.is_none() {
            return Ok(false);
        }

        let text_channel = snapshot
            .text_channel_id
            .filter(|id| *id > 0)
            .map(ChannelId::new);
        let player = manager.connect(guild_id, voice_channel, text_channel).await?;
        Self::replay(&player, &snapshot, fallback).await?;

        info!("✅ Sesión restaurada en guild {}", snapshot.guild_id);
        Ok(true)
    }

    /// Re-aplica un snapshot sobre un player recién conectado: prefs,
    /// track actual + cola en orden, avance y seek a la posición guardada.
    pub(crate) async fn replay(
        player: &Player,
        snapshot: &SessionSnapshot,
        fallback: UserId,
    ) -> Result<()> {
        player
            .restore_prefs(snapshot.volume, snapshot.autoplay, snapshot.loop_mode)
            .await;

        let mut tracks = Vec::with_capacity(snapshot.queue.len() + 1);
        if let Some(current) = &snapshot.current_track {
            tracks.push(current.into_track(fallback)?);
        }
        for entry in &snapshot.queue {
            match entry.into_track(fallback) {
                Ok(track) => tracks.push(track),
                Err(e) => warn!("Track no decodificable en el snapshot, salteado: {e}"),
            }
        }
        if tracks.is_empty() {
            return Ok(());
        }

        player.add_track(tracks, 0, None, false).await?;
        player.do_next().await?;

        if snapshot.position > 0 {
            if let Err(e) = player.force_seek(snapshot.position).await {
                warn!("No se pudo retomar la posición guardada: {e}");
            }
        }
        if snapshot.is_paused {
            player.force_pause(true).await?;
        }
        Ok(())
    }
}
