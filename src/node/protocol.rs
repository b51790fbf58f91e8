//! Tipos serde del protocolo del nodo de audio (REST + WebSocket v4).

use serde::{Deserialize, Serialize};
use serde_json::Value;
use serenity::model::id::UserId;

use crate::audio::track::{Track, TrackInfo};

/// Mensaje entrante por el WebSocket de eventos.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum Inbound {
    Ready(ReadyPayload),
    PlayerUpdate(PlayerUpdatePayload),
    Stats(NodeStats),
    Event(NodeEvent),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadyPayload {
    pub resumed: bool,
    pub session_id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerUpdatePayload {
    pub guild_id: String,
    pub state: PlayerUpdateState,
}

/// Heartbeat de posición; la verdad del nodo contra la estimación local.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerUpdateState {
    pub time: i64,
    pub position: u64,
    pub connected: bool,
    #[serde(default)]
    pub ping: i64,
}

/// Métricas del nodo, usadas para elegir el menos cargado.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeStats {
    pub players: u32,
    pub playing_players: u32,
    pub uptime: u64,
    #[serde(default)]
    pub cpu: CpuStats,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CpuStats {
    pub cores: u32,
    pub system_load: f64,
    pub lavalink_load: f64,
}

/// Evento con scope de guild empujado por el nodo.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum NodeEvent {
    #[serde(rename = "TrackStartEvent", rename_all = "camelCase")]
    TrackStart { guild_id: String, track: ApiTrack },
    #[serde(rename = "TrackEndEvent", rename_all = "camelCase")]
    TrackEnd {
        guild_id: String,
        track: ApiTrack,
        reason: EndReason,
    },
    #[serde(rename = "TrackExceptionEvent", rename_all = "camelCase")]
    TrackException {
        guild_id: String,
        track: ApiTrack,
        exception: ApiException,
    },
    #[serde(rename = "TrackStuckEvent", rename_all = "camelCase")]
    TrackStuck {
        guild_id: String,
        track: ApiTrack,
        threshold_ms: u64,
    },
    #[serde(rename = "WebSocketClosedEvent", rename_all = "camelCase")]
    WebSocketClosed {
        guild_id: String,
        code: u16,
        reason: String,
        by_remote: bool,
    },
}

impl NodeEvent {
    pub fn guild_id(&self) -> &str {
        match self {
            NodeEvent::TrackStart { guild_id, .. }
            | NodeEvent::TrackEnd { guild_id, .. }
            | NodeEvent::TrackException { guild_id, .. }
            | NodeEvent::TrackStuck { guild_id, .. }
            | NodeEvent::WebSocketClosed { guild_id, .. } => guild_id,
        }
    }
}

/// Motivo con el que terminó un track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EndReason {
    Finished,
    LoadFailed,
    Stopped,
    Replaced,
    Cleanup,
}

impl EndReason {
    /// `true` si corresponde avanzar al siguiente track.
    ///
    /// `Replaced` significa que ya hay otro play en vuelo y `Cleanup` que
    /// el player se está destruyendo; en ambos casos no se avanza.
    pub fn should_advance(self) -> bool {
        matches!(self, EndReason::Finished | EndReason::LoadFailed | EndReason::Stopped)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiException {
    pub message: Option<String>,
    pub severity: String,
    #[serde(default)]
    pub cause: Option<String>,
}

/// Track tal como viaja por el wire: blob + metadatos ya decodificados.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiTrack {
    pub encoded: String,
    pub info: ApiTrackInfo,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiTrackInfo {
    pub identifier: String,
    pub is_seekable: bool,
    pub author: String,
    pub length: u64,
    pub is_stream: bool,
    pub position: u64,
    pub title: String,
    pub uri: Option<String>,
    #[serde(default)]
    pub artwork_url: Option<String>,
    #[serde(default)]
    pub isrc: Option<String>,
    pub source_name: String,
}

impl ApiTrack {
    /// Proyecta el track del wire al modelo interno con su requester.
    pub fn into_track(self, requester: UserId) -> Track {
        let info = TrackInfo {
            title: self.info.title,
            author: self.info.author,
            length: self.info.length,
            identifier: self.info.identifier,
            is_stream: self.info.is_stream,
            uri: self.info.uri,
            artwork_url: self.info.artwork_url,
            isrc: self.info.isrc,
            source_name: self.info.source_name,
            position: self.info.position,
        };
        Track::new(self.encoded, info, requester)
    }
}

/// Respuesta de `/loadtracks`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "loadType", content = "data", rename_all = "camelCase")]
pub enum LoadResponse {
    Track(Box<ApiTrack>),
    Playlist(ApiPlaylist),
    Search(Vec<ApiTrack>),
    Empty(Option<Value>),
    Error(ApiException),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiPlaylist {
    pub info: PlaylistInfo,
    #[serde(default)]
    pub plugin_info: Value,
    pub tracks: Vec<ApiTrack>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaylistInfo {
    pub name: String,
    #[serde(default)]
    pub selected_track: i64,
}

/// Credenciales de voz que el gateway entrega y el nodo necesita.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceServer {
    pub token: String,
    pub endpoint: String,
    pub session_id: String,
}

/// Cuerpo del PATCH sobre el player de una guild.
///
/// Solo viajan los campos presentes; `track.encoded: null` detiene la
/// reproducción actual.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdatePlayer {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub track: Option<UpdateTrack>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub paused: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filters: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice: Option<VoiceServer>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UpdateTrack {
    pub encoded: Option<String>,
}

/// Cuerpo del PATCH de sesión para activar resuming.
#[derive(Debug, Clone, Serialize)]
pub struct SessionUpdate {
    pub resuming: bool,
    pub timeout: u64,
}
