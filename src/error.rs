use thiserror::Error;

/// Resultado estándar del crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errores del núcleo de reproducción.
///
/// Las condiciones esperadas (cola vacía, índice inválido, nodo caído) se
/// devuelven como variantes tipadas para que la capa de comandos las pueda
/// renderizar. Los pánicos quedan reservados para violaciones de invariantes.
#[derive(Debug, Error)]
pub enum Error {
    /// El nodo de audio no tiene sesión activa (desconectado o reconectando).
    #[error("el nodo de audio no está disponible, reconectando")]
    NodeUnavailable,

    /// No existe player para la guild solicitada.
    #[error("no hay un player activo en esta guild")]
    NoPlayer,

    /// El player ya fue destruido con teardown.
    #[error("el player fue destruido")]
    PlayerDestroyed,

    /// Operación que exige un track sonando, sin nada sonando.
    #[error("no hay nada reproduciéndose")]
    NothingPlaying,

    /// Índice de cola fuera de rango (1-based sobre la parte no reproducida).
    #[error("índice fuera de rango: {index} (cola de {len})")]
    OutOfRange { index: usize, len: usize },

    /// La cola alcanzó su tamaño máximo.
    #[error("la cola está llena (máximo {0} canciones)")]
    QueueFull(usize),

    /// Track duplicado con supresión de duplicados activa.
    #[error("la canción ya está en la cola: {0}")]
    Duplicate(String),

    /// Seek inválido: streams en vivo o posición más allá de la duración.
    #[error("posición de seek inválida: {position}ms (duración {length}ms)")]
    InvalidSeek { position: u64, length: u64 },

    /// El requester no tiene permisos para una operación solo-DJ.
    #[error("se requiere rol DJ o permiso de gestión para esta acción")]
    NotPrivileged,

    /// Tag de filtro ya registrado en la cadena.
    #[error("el tag de filtro ya está en uso: {0}")]
    FilterTagInUse(String),

    /// Tag de filtro inexistente.
    #[error("no existe un filtro con el tag: {0}")]
    FilterTagNotFound(String),

    /// Parámetro de filtro fuera de su rango válido.
    #[error("parámetro de filtro inválido: {0}")]
    FilterArgument(String),

    /// Blob de track corrupto o de versión desconocida.
    #[error("no se pudo decodificar el track: {0}")]
    TrackDecode(String),

    /// Error de transporte HTTP hacia el nodo.
    #[error("error HTTP: {0}")]
    Http(#[from] reqwest::Error),

    /// Error del WebSocket de eventos.
    #[error("error de WebSocket: {0}")]
    WebSocket(#[from] Box<tokio_tungstenite::tungstenite::Error>),

    /// JSON inválido (protocolo o almacenamiento).
    #[error("error de JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// Respuesta del nodo que no respeta el protocolo.
    #[error("error de protocolo: {0}")]
    Protocol(String),

    /// Error de E/S del almacenamiento en disco.
    #[error("error de E/S: {0}")]
    Io(#[from] std::io::Error),

    /// Configuración inválida al arrancar.
    #[error("configuración inválida: {0}")]
    Config(String),
}
