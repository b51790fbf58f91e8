//! Cliente del nodo de audio: una sesión WebSocket de eventos + un canal
//! REST de comandos, multiplexando a todos los players de todas las guilds.

pub mod pool;
pub mod protocol;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use regex::Regex;
use serde::Deserialize;
use serenity::model::id::{GuildId, UserId};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async, tungstenite::client::IntoClientRequest,
    tungstenite::http::HeaderValue, tungstenite::protocol::Message as WsMessage,
    MaybeTlsStream, WebSocketStream,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::audio::manager::PlayerRegistry;
use crate::audio::track::{LoadedTracks, Playlist, Track};
use crate::error::{Error, Result};
use crate::node::protocol::{
    Inbound, LoadResponse, NodeStats, SessionUpdate, UpdatePlayer, UpdateTrack, VoiceServer,
};

/// Backoff inicial del reintento de conexión; se duplica hasta el máximo.
const RECONNECT_BACKOFF: Duration = Duration::from_secs(1);
const RECONNECT_BACKOFF_MAX: Duration = Duration::from_secs(60);
/// Ventana que el nodo retiene la sesión ante un corte, en segundos.
const RESUME_TIMEOUT_SECS: u64 = 60;

fn url_regex() -> &'static Regex {
    static URL_REGEX: OnceLock<Regex> = OnceLock::new();
    URL_REGEX.get_or_init(|| Regex::new(r"^https?://\S+$").expect("regex estática válida"))
}

/// Endpoint de un nodo de audio.
#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    pub identifier: String,
    pub host: String,
    pub port: u16,
    pub password: String,
    #[serde(default)]
    pub secure: bool,
}

impl NodeConfig {
    fn rest_base(&self) -> String {
        let scheme = if self.secure { "https" } else { "http" };
        format!("{}://{}:{}/v4", scheme, self.host, self.port)
    }

    fn ws_url(&self) -> String {
        let scheme = if self.secure { "wss" } else { "ws" };
        format!("{}://{}:{}/v4/websocket", scheme, self.host, self.port)
    }
}

/// Superficie de un nodo vista desde el player.
///
/// Los comandos son fire-and-forget: la confirmación llega después como
/// evento. Separado en trait para poder testear el player sin red.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NodeLink: Send + Sync {
    fn identifier(&self) -> String;
    fn is_available(&self) -> bool;

    async fn play(&self, guild_id: GuildId, track: Track, volume: u16, no_replace: bool) -> Result<()>;
    async fn stop(&self, guild_id: GuildId) -> Result<()>;
    async fn pause(&self, guild_id: GuildId, paused: bool) -> Result<()>;
    async fn seek(&self, guild_id: GuildId, position_ms: u64) -> Result<()>;
    async fn set_volume(&self, guild_id: GuildId, volume: u16) -> Result<()>;
    async fn set_filters(&self, guild_id: GuildId, payload: serde_json::Value) -> Result<()>;
    async fn voice_update(&self, guild_id: GuildId, voice: VoiceServer) -> Result<()>;
    async fn destroy(&self, guild_id: GuildId) -> Result<()>;

    async fn get_tracks(&self, query: &str, requester: UserId) -> Result<Option<LoadedTracks>>;
    async fn recommendations(
        &self,
        seed: &Track,
        exclude: Vec<String>,
        requester: UserId,
    ) -> Result<Vec<Track>>;
}

/// Conexión lógica a un nodo de audio.
pub struct Node {
    config: NodeConfig,
    http: reqwest::Client,
    user_id: UserId,
    session_id: RwLock<Option<String>>,
    available: AtomicBool,
    stats: RwLock<NodeStats>,
    player_count: AtomicUsize,
    registry: Arc<PlayerRegistry>,
    shutdown: CancellationToken,
}

impl Node {
    pub fn new(
        config: NodeConfig,
        user_id: UserId,
        registry: Arc<PlayerRegistry>,
        request_timeout: Duration,
        shutdown: CancellationToken,
    ) -> Result<Arc<Self>> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()?;

        Ok(Arc::new(Self {
            config,
            http,
            user_id,
            session_id: RwLock::new(None),
            available: AtomicBool::new(false),
            stats: RwLock::new(NodeStats::default()),
            player_count: AtomicUsize::new(0),
            registry,
            shutdown,
        }))
    }

    /// Lanza la tarea de conexión con reintentos.
    pub fn start(self: &Arc<Self>) {
        let node = Arc::clone(self);
        tokio::spawn(async move { node.run().await });
    }

    /// Carga estimada para la selección de nodo: players locales más una
    /// penalización exponencial por CPU del sistema.
    pub fn penalty(&self) -> f64 {
        let cpu = self.stats.read().cpu.system_load;
        let cpu_penalty = 1.05f64.powf(100.0 * cpu) * 10.0 - 10.0;
        self.player_count.load(Ordering::Relaxed) as f64 + cpu_penalty
    }

    pub fn player_count(&self) -> usize {
        self.player_count.load(Ordering::Relaxed)
    }

    pub(crate) fn attach_player(&self) {
        self.player_count.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn detach_player(&self) {
        let previous = self.player_count.fetch_sub(1, Ordering::Relaxed);
        debug_assert!(previous > 0);
    }

    async fn run(self: Arc<Self>) {
        let mut backoff = RECONNECT_BACKOFF;
        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            match self.connect_once().await {
                Ok(ws) => {
                    backoff = RECONNECT_BACKOFF;
                    if let Err(e) = self.read_loop(ws).await {
                        warn!("⚠️ Nodo {} desconectado: {}", self.config.identifier, e);
                    }
                }
                Err(e) => {
                    warn!(
                        "❌ No se pudo conectar al nodo {}: {}",
                        self.config.identifier, e
                    );
                }
            }

            self.available.store(false, Ordering::SeqCst);
            if self.shutdown.is_cancelled() {
                break;
            }

            debug!(
                "🔄 Reintentando nodo {} en {}",
                self.config.identifier,
                humantime::format_duration(backoff)
            );
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff = (backoff * 2).min(RECONNECT_BACKOFF_MAX);
        }
        self.available.store(false, Ordering::SeqCst);
    }

    async fn connect_once(&self) -> Result<WebSocketStream<MaybeTlsStream<TcpStream>>> {
        let mut request = self
            .config
            .ws_url()
            .into_client_request()
            .map_err(|e| Error::Protocol(format!("URL de nodo inválida: {e}")))?;

        let headers = request.headers_mut();
        let header = |v: &str| {
            HeaderValue::from_str(v).map_err(|e| Error::Config(format!("header inválido: {e}")))
        };
        headers.insert("Authorization", header(&self.config.password)?);
        headers.insert("User-Id", header(&self.user_id.to_string())?);
        headers.insert(
            "Client-Name",
            header(&format!("open-lava/{}", env!("CARGO_PKG_VERSION")))?,
        );
        if let Some(session) = self.session_id.read().clone() {
            headers.insert("Session-Id", header(&session)?);
        }

        let (ws, _response) = connect_async(request).await.map_err(Box::new)?;
        info!("🔌 WebSocket conectado al nodo {}", self.config.identifier);
        Ok(ws)
    }

    async fn read_loop(&self, mut ws: WebSocketStream<MaybeTlsStream<TcpStream>>) -> Result<()> {
        loop {
            let message = tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(()),
                m = ws.next() => m,
            };
            let Some(message) = message else {
                return Err(Error::Protocol("el nodo cerró la conexión".into()));
            };

            match message.map_err(Box::new)? {
                WsMessage::Text(text) => self.handle_frame(&text),
                WsMessage::Ping(data) => {
                    ws.send(WsMessage::Pong(data)).await.map_err(Box::new)?;
                }
                WsMessage::Close(frame) => {
                    return Err(Error::Protocol(format!("close del nodo: {frame:?}")));
                }
                _ => {}
            }
        }
    }

    /// Decodifica un frame y lo despacha sin bloquear el receive loop: cada
    /// evento de guild corre en su propia task contra el mutex del player.
    fn handle_frame(&self, text: &str) {
        let inbound: Inbound = match serde_json::from_str(text) {
            Ok(inbound) => inbound,
            Err(e) => {
                warn!("⚠️ Frame ilegible del nodo {}: {}", self.config.identifier, e);
                return;
            }
        };

        match inbound {
            Inbound::Ready(ready) => {
                info!(
                    "✅ Nodo {} listo (resumed: {})",
                    self.config.identifier, ready.resumed
                );
                *self.session_id.write() = Some(ready.session_id.clone());
                self.available.store(true, Ordering::SeqCst);
                self.spawn_configure_resuming(ready.session_id);
            }
            Inbound::Stats(stats) => {
                *self.stats.write() = stats;
            }
            Inbound::PlayerUpdate(update) => {
                let Some(player) = self.player_for(&update.guild_id) else {
                    return;
                };
                tokio::spawn(async move { player.handle_position(update.state).await });
            }
            Inbound::Event(event) => {
                let Some(player) = self.player_for(event.guild_id()) else {
                    debug!(
                        "📭 Evento para guild {} sin player, ignorado",
                        event.guild_id()
                    );
                    return;
                };
                tokio::spawn(async move { player.handle_event(event).await });
            }
        }
    }

    fn player_for(&self, raw_guild: &str) -> Option<Arc<crate::audio::player::Player>> {
        let id: u64 = match raw_guild.parse() {
            Ok(id) if id > 0 => id,
            _ => {
                warn!("⚠️ Guild id ilegible en evento del nodo: {raw_guild}");
                return None;
            }
        };
        self.registry.get(GuildId::new(id))
    }

    fn spawn_configure_resuming(&self, session_id: String) {
        let http = self.http.clone();
        let base = self.config.rest_base();
        let password = self.config.password.clone();
        tokio::spawn(async move {
            let body = SessionUpdate {
                resuming: true,
                timeout: RESUME_TIMEOUT_SECS,
            };
            let url = format!("{base}/sessions/{session_id}");
            if let Err(e) = http
                .patch(&url)
                .header("Authorization", &password)
                .json(&body)
                .send()
                .await
            {
                warn!("⚠️ No se pudo configurar resuming: {e}");
            }
        });
    }

    fn session(&self) -> Result<String> {
        if !self.is_available() {
            return Err(Error::NodeUnavailable);
        }
        self.session_id.read().clone().ok_or(Error::NodeUnavailable)
    }

    async fn update_player(
        &self,
        guild_id: GuildId,
        body: &UpdatePlayer,
        no_replace: bool,
    ) -> Result<()> {
        let session = self.session()?;
        let url = format!(
            "{}/sessions/{}/players/{}?noReplace={}",
            self.config.rest_base(),
            session,
            guild_id,
            no_replace
        );
        let response = self
            .http
            .patch(&url)
            .header("Authorization", &self.config.password)
            .json(body)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Error::Protocol(format!(
                "el nodo rechazó el comando: {}",
                response.status()
            )));
        }
        Ok(())
    }

    async fn load(&self, identifier: &str) -> Result<LoadResponse> {
        self.session()?;

        let url = format!(
            "{}/loadtracks?identifier={}",
            self.config.rest_base(),
            urlencoding::encode(identifier)
        );
        let response = self
            .http
            .get(&url)
            .header("Authorization", &self.config.password)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Error::Protocol(format!(
                "loadtracks devolvió {}",
                response.status()
            )));
        }
        Ok(response.json::<LoadResponse>().await?)
    }

    #[cfg(test)]
    pub(crate) fn force_ready(&self, session_id: &str, stats: NodeStats) {
        *self.session_id.write() = Some(session_id.to_string());
        *self.stats.write() = stats;
        self.available.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl NodeLink for Node {
    fn identifier(&self) -> String {
        self.config.identifier.clone()
    }

    fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    async fn play(&self, guild_id: GuildId, track: Track, volume: u16, no_replace: bool) -> Result<()> {
        let body = UpdatePlayer {
            track: Some(UpdateTrack {
                encoded: Some(track.encoded.clone()),
            }),
            position: (track.start_ms > 0).then_some(track.start_ms),
            end_time: track.end_ms,
            volume: Some(volume),
            paused: Some(false),
            ..Default::default()
        };
        self.update_player(guild_id, &body, no_replace).await
    }

    async fn stop(&self, guild_id: GuildId) -> Result<()> {
        let body = UpdatePlayer {
            track: Some(UpdateTrack { encoded: None }),
            ..Default::default()
        };
        self.update_player(guild_id, &body, false).await
    }

    async fn pause(&self, guild_id: GuildId, paused: bool) -> Result<()> {
        let body = UpdatePlayer {
            paused: Some(paused),
            ..Default::default()
        };
        self.update_player(guild_id, &body, false).await
    }

    async fn seek(&self, guild_id: GuildId, position_ms: u64) -> Result<()> {
        let body = UpdatePlayer {
            position: Some(position_ms),
            ..Default::default()
        };
        self.update_player(guild_id, &body, false).await
    }

    async fn set_volume(&self, guild_id: GuildId, volume: u16) -> Result<()> {
        let body = UpdatePlayer {
            volume: Some(volume),
            ..Default::default()
        };
        self.update_player(guild_id, &body, false).await
    }

    async fn set_filters(&self, guild_id: GuildId, payload: serde_json::Value) -> Result<()> {
        let body = UpdatePlayer {
            filters: Some(payload),
            ..Default::default()
        };
        self.update_player(guild_id, &body, false).await
    }

    async fn voice_update(&self, guild_id: GuildId, voice: VoiceServer) -> Result<()> {
        let body = UpdatePlayer {
            voice: Some(voice),
            ..Default::default()
        };
        self.update_player(guild_id, &body, false).await
    }

    async fn destroy(&self, guild_id: GuildId) -> Result<()> {
        let session = self.session()?;
        let url = format!(
            "{}/sessions/{}/players/{}",
            self.config.rest_base(),
            session,
            guild_id
        );
        let response = self
            .http
            .delete(&url)
            .header("Authorization", &self.config.password)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Error::Protocol(format!(
                "destroy devolvió {}",
                response.status()
            )));
        }
        Ok(())
    }

    /// Resuelve una búsqueda o URL directa a tracks.
    ///
    /// Sin resultados o con query malformada devuelve `None`; solo las
    /// fallas de transporte son `Err`.
    async fn get_tracks(&self, query: &str, requester: UserId) -> Result<Option<LoadedTracks>> {
        let identifier = if url_regex().is_match(query) {
            query.to_string()
        } else {
            format!("ytsearch:{query}")
        };

        match self.load(&identifier).await? {
            LoadResponse::Track(track) => Ok(Some(LoadedTracks::Tracks(vec![
                track.into_track(requester),
            ]))),
            LoadResponse::Search(tracks) => {
                if tracks.is_empty() {
                    return Ok(None);
                }
                Ok(Some(LoadedTracks::Tracks(
                    tracks.into_iter().map(|t| t.into_track(requester)).collect(),
                )))
            }
            LoadResponse::Playlist(playlist) => Ok(Some(LoadedTracks::Playlist(Playlist {
                name: playlist.info.name,
                tracks: playlist
                    .tracks
                    .into_iter()
                    .map(|t| t.into_track(requester))
                    .collect(),
            }))),
            LoadResponse::Empty(_) => Ok(None),
            LoadResponse::Error(exception) => {
                error!(
                    "❌ El nodo no pudo cargar {:?}: {:?}",
                    identifier, exception.message
                );
                Ok(None)
            }
        }
    }

    /// Recomendaciones para autoplay sembradas con el último track.
    ///
    /// Usa el mix radio de YouTube; otras fuentes devuelven vacío y el
    /// ranking/novedad queda del lado del backend.
    async fn recommendations(
        &self,
        seed: &Track,
        exclude: Vec<String>,
        requester: UserId,
    ) -> Result<Vec<Track>> {
        if seed.info.source_name != "youtube" {
            return Ok(Vec::new());
        }

        let identifier = format!(
            "https://www.youtube.com/watch?v={id}&list=RD{id}",
            id = seed.info.identifier
        );
        let tracks = match self.load(&identifier).await? {
            LoadResponse::Playlist(playlist) => playlist.tracks,
            _ => return Ok(Vec::new()),
        };

        Ok(tracks
            .into_iter()
            .filter(|t| {
                t.info.identifier != seed.info.identifier
                    && !exclude.contains(&t.info.identifier)
            })
            .take(10)
            .map(|t| t.into_track(requester))
            .collect())
    }
}
