use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serenity::model::id::UserId;

use crate::error::{Error, Result};

/// Flag del header que indica que el blob lleva byte de versión.
const TRACK_INFO_VERSIONED: i32 = 1;

/// Metadatos nativos de un track tal como los entiende el nodo de audio.
///
/// Es la proyección decodificada del identificador opaco. `length == 0`
/// significa duración desconocida (streams en vivo).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackInfo {
    pub title: String,
    pub author: String,
    pub length: u64,
    pub identifier: String,
    pub is_stream: bool,
    pub uri: Option<String>,
    pub artwork_url: Option<String>,
    pub isrc: Option<String>,
    pub source_name: String,
    pub position: u64,
}

/// Un track inmutable dentro de la cola.
///
/// La identidad es el identificador codificado: dos tracks con el mismo
/// `encoded` son la misma canción aunque el requester difiera.
#[derive(Debug, Clone)]
pub struct Track {
    /// Identificador opaco y durable, apto para persistencia y playlists.
    pub encoded: String,
    pub info: TrackInfo,
    /// Miembro que pidió la canción.
    pub requester: UserId,
    /// Recorte de reproducción aplicado al cargar (inicio en ms).
    pub start_ms: u64,
    /// Recorte de reproducción aplicado al cargar (fin en ms).
    pub end_ms: Option<u64>,
}

impl PartialEq for Track {
    fn eq(&self, other: &Self) -> bool {
        self.encoded == other.encoded
    }
}

impl Track {
    pub fn new(encoded: String, info: TrackInfo, requester: UserId) -> Self {
        Self {
            encoded,
            info,
            requester,
            start_ms: 0,
            end_ms: None,
        }
    }

    /// Reconstruye un track a partir de su identificador persistido.
    pub fn from_encoded(encoded: &str, requester: UserId) -> Result<Self> {
        let info = decode(encoded)?;
        Ok(Self::new(encoded.to_string(), info, requester))
    }

    /// Construye un track codificando sus metadatos.
    pub fn from_info(info: TrackInfo, requester: UserId) -> Self {
        let encoded = encode(&info);
        Self::new(encoded, info, requester)
    }

    pub fn with_window(mut self, start_ms: u64, end_ms: Option<u64>) -> Self {
        self.start_ms = start_ms;
        self.end_ms = end_ms;
        self
    }

    /// Duración en formato `h:mm:ss` o `🔴 EN VIVO` para streams.
    pub fn formatted_length(&self) -> String {
        if self.info.is_stream || self.info.length == 0 {
            return "🔴 EN VIVO".to_string();
        }
        let total = self.info.length / 1000;
        let (h, m, s) = (total / 3600, (total % 3600) / 60, total % 60);
        if h > 0 {
            format!("{}:{:02}:{:02}", h, m, s)
        } else {
            format!("{}:{:02}", m, s)
        }
    }
}

/// Playlist resuelta por el nodo.
#[derive(Debug, Clone)]
pub struct Playlist {
    pub name: String,
    pub tracks: Vec<Track>,
}

/// Resultado de una búsqueda: un track suelto, una playlist o nada.
#[derive(Debug, Clone)]
pub enum LoadedTracks {
    Tracks(Vec<Track>),
    Playlist(Playlist),
}

/// Decodifica el identificador opaco del nodo a sus metadatos.
///
/// Soporta las versiones 2 y 3 del blob (big-endian, strings con prefijo
/// u16). La versión 1 no lleva URI y ya no circula, se rechaza.
pub fn decode(encoded: &str) -> Result<TrackInfo> {
    let raw = BASE64
        .decode(encoded)
        .map_err(|e| Error::TrackDecode(format!("base64 inválido: {e}")))?;
    let mut buf = Bytes::from(raw);

    let header = read_i32(&mut buf)?;
    let flags = (header >> 30) & 0x3;
    let version = if flags & TRACK_INFO_VERSIONED != 0 {
        read_u8(&mut buf)?
    } else {
        1
    };
    if version < 2 || version > 3 {
        return Err(Error::TrackDecode(format!(
            "versión de track desconocida: {version}"
        )));
    }

    let title = read_utf(&mut buf)?;
    let author = read_utf(&mut buf)?;
    let length = read_i64(&mut buf)? as u64;
    let identifier = read_utf(&mut buf)?;
    let is_stream = read_u8(&mut buf)? != 0;
    let uri = read_optional_utf(&mut buf)?;
    let (artwork_url, isrc) = if version >= 3 {
        (read_optional_utf(&mut buf)?, read_optional_utf(&mut buf)?)
    } else {
        (None, None)
    };
    let source_name = read_utf(&mut buf)?;
    let position = read_i64(&mut buf)? as u64;

    Ok(TrackInfo {
        title,
        author,
        length,
        identifier,
        is_stream,
        uri,
        artwork_url,
        isrc,
        source_name,
        position,
    })
}

/// Codifica metadatos al mismo blob base64 que emite el nodo (versión 3).
///
/// `decode(&encode(info)) == *info` para cualquier info bien formado, de
/// modo que los identificadores sobreviven al viaje por disco.
pub fn encode(info: &TrackInfo) -> String {
    let mut body = BytesMut::new();
    body.put_u8(3);
    write_utf(&mut body, &info.title);
    write_utf(&mut body, &info.author);
    body.put_i64(info.length as i64);
    write_utf(&mut body, &info.identifier);
    body.put_u8(info.is_stream as u8);
    write_optional_utf(&mut body, info.uri.as_deref());
    write_optional_utf(&mut body, info.artwork_url.as_deref());
    write_optional_utf(&mut body, info.isrc.as_deref());
    write_utf(&mut body, &info.source_name);
    body.put_i64(info.position as i64);

    let mut out = BytesMut::with_capacity(body.len() + 4);
    out.put_i32((TRACK_INFO_VERSIONED << 30) | body.len() as i32);
    out.extend_from_slice(&body);
    BASE64.encode(out)
}

fn read_u8(buf: &mut Bytes) -> Result<u8> {
    if buf.remaining() < 1 {
        return Err(Error::TrackDecode("blob truncado".into()));
    }
    Ok(buf.get_u8())
}

fn read_i32(buf: &mut Bytes) -> Result<i32> {
    if buf.remaining() < 4 {
        return Err(Error::TrackDecode("blob truncado".into()));
    }
    Ok(buf.get_i32())
}

fn read_i64(buf: &mut Bytes) -> Result<i64> {
    if buf.remaining() < 8 {
        return Err(Error::TrackDecode("blob truncado".into()));
    }
    Ok(buf.get_i64())
}

fn read_utf(buf: &mut Bytes) -> Result<String> {
    if buf.remaining() < 2 {
        return Err(Error::TrackDecode("blob truncado".into()));
    }
    let len = buf.get_u16() as usize;
    if buf.remaining() < len {
        return Err(Error::TrackDecode("string truncado".into()));
    }
    let raw = buf.copy_to_bytes(len);
    String::from_utf8(raw.to_vec()).map_err(|e| Error::TrackDecode(format!("UTF-8 inválido: {e}")))
}

fn read_optional_utf(buf: &mut Bytes) -> Result<Option<String>> {
    if read_u8(buf)? != 0 {
        Ok(Some(read_utf(buf)?))
    } else {
        Ok(None)
    }
}

fn write_utf(buf: &mut BytesMut, value: &str) {
    buf.put_u16(value.len() as u16);
    buf.put_slice(value.as_bytes());
}

fn write_optional_utf(buf: &mut BytesMut, value: Option<&str>) {
    match value {
        Some(v) => {
            buf.put_u8(1);
            write_utf(buf, v);
        }
        None => buf.put_u8(0),
    }
}
