use serenity::model::id::{ChannelId, GuildId, UserId};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, error, info, warn};

use crate::audio::filters::{Filter, FilterChain};
use crate::audio::manager::{VoiceMember, VoiceRoster};
use crate::audio::queue::{LoopType, Queue, QueueScope};
use crate::audio::track::{LoadedTracks, Track};
use crate::error::{Error, Result};
use crate::events::PlayerEvent;
use crate::node::protocol::{EndReason, NodeEvent, PlayerUpdateState, VoiceServer};
use crate::node::NodeLink;
use crate::settings::GuildSettings;

/// Fallos de carga consecutivos tolerados antes de rendirse.
pub const MAX_ADVANCE_FAILURES: u8 = 3;

/// Fase de reproducción; la pausa es un overlay sobre `Playing`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Loading,
    Playing,
}

/// Acciones democratizadas: cada una junta votos en su propio set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VoteKind {
    Pause,
    Resume,
    Skip,
    Shuffle,
    Previous,
    Stop,
}

/// Resultado de una operación con gate de votos.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VoteOutcome {
    /// La acción se ejecutó (por privilegio o por alcanzar el umbral).
    Executed,
    /// Voto registrado, faltan más; para que la capa externa lo muestre.
    Pending { votes: usize, required: usize },
    /// El miembro ya había votado esta acción.
    AlreadyVoted,
}

enum Cast {
    Reached,
    Pending(usize),
    Already,
}

/// Los votos no caducan por tiempo: solo los limpia un cambio de estado.
/// Decisión de producto heredada, no un bug.
#[derive(Debug, Default)]
struct VoteSets {
    sets: HashMap<VoteKind, HashSet<UserId>>,
}

impl VoteSets {
    fn cast(&mut self, kind: VoteKind, member: UserId, required: usize) -> Cast {
        let set = self.sets.entry(kind).or_default();
        if !set.insert(member) {
            return Cast::Already;
        }
        if set.len() >= required {
            Cast::Reached
        } else {
            Cast::Pending(set.len())
        }
    }

    fn clear_all(&mut self) {
        self.sets.clear();
    }
}

#[derive(Debug)]
struct PlayerState {
    queue: Queue,
    current: Option<Track>,
    /// Último track que llegó a sonar; semilla de autoplay y de la
    /// repetición de track.
    last_track: Option<Track>,
    /// Candidato enviado al nodo, a confirmar cuando llegue el start.
    pending: Option<(usize, Track)>,
    phase: Phase,
    paused: bool,
    volume: u16,
    autoplay: bool,
    filters: FilterChain,
    votes: VoteSets,
    advance_failures: u8,
    position_ms: u64,
    position_at: Option<Instant>,
    connected: bool,
}

impl PlayerState {
    /// Posición estimada; entre heartbeats es una aproximación local.
    fn estimated_position(&self) -> u64 {
        match (self.phase, self.paused, self.position_at) {
            (Phase::Playing, false, Some(at)) => {
                self.position_ms + at.elapsed().as_millis() as u64
            }
            _ => self.position_ms,
        }
    }

    fn freeze_position(&mut self) {
        self.position_ms = self.estimated_position();
        self.position_at = Some(Instant::now());
    }
}

/// Proyección de solo lectura del player, para UI y persistencia.
#[derive(Debug, Clone)]
pub struct PlayerView {
    pub guild_id: GuildId,
    pub voice_channel: ChannelId,
    pub text_channel: Option<ChannelId>,
    pub phase: Phase,
    pub paused: bool,
    pub volume: u16,
    pub autoplay: bool,
    pub repeat: LoopType,
    pub current: Option<Track>,
    pub upcoming: Vec<Track>,
    pub history: Vec<Track>,
    pub position_ms: u64,
    pub connected: bool,
    pub filter_tags: Vec<String>,
}

/// Controlador de reproducción de una guild.
///
/// Toda mutación pasa por un único mutex: comandos entrantes y eventos del
/// nodo se serializan entre sí, nunca se intercalan dos mutaciones.
pub struct Player {
    guild_id: GuildId,
    voice_channel: ChannelId,
    text_channel: Option<ChannelId>,
    node: Arc<dyn NodeLink>,
    roster: Arc<dyn VoiceRoster>,
    events: broadcast::Sender<PlayerEvent>,
    state: Mutex<PlayerState>,
    destroyed: AtomicBool,
}

impl Player {
    pub(crate) fn new(
        guild_id: GuildId,
        voice_channel: ChannelId,
        text_channel: Option<ChannelId>,
        node: Arc<dyn NodeLink>,
        roster: Arc<dyn VoiceRoster>,
        events: broadcast::Sender<PlayerEvent>,
        settings: &GuildSettings,
    ) -> Arc<Self> {
        Arc::new(Self {
            guild_id,
            voice_channel,
            text_channel,
            node,
            roster,
            events,
            state: Mutex::new(PlayerState {
                queue: Queue::new(
                    settings.queue_type,
                    settings.allow_duplicates,
                    settings.max_queue_size,
                ),
                current: None,
                last_track: None,
                pending: None,
                phase: Phase::Idle,
                paused: false,
                volume: settings.default_volume,
                autoplay: false,
                filters: FilterChain::new(),
                votes: VoteSets::default(),
                advance_failures: 0,
                position_ms: 0,
                position_at: None,
                connected: false,
            }),
            destroyed: AtomicBool::new(false),
        })
    }

    pub fn guild_id(&self) -> GuildId {
        self.guild_id
    }

    pub fn voice_channel(&self) -> ChannelId {
        self.voice_channel
    }

    pub fn text_channel(&self) -> Option<ChannelId> {
        self.text_channel
    }

    pub fn node_identifier(&self) -> String {
        self.node.identifier()
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    fn ensure_alive(&self) -> Result<()> {
        if self.is_destroyed() {
            return Err(Error::PlayerDestroyed);
        }
        Ok(())
    }

    fn ensure_node(&self) -> Result<()> {
        if !self.node.is_available() {
            return Err(Error::NodeUnavailable);
        }
        Ok(())
    }

    fn emit(&self, event: PlayerEvent) {
        let _ = self.events.send(event);
    }

    /// Entrega al nodo las credenciales de voz que resolvió el gateway.
    pub async fn connect_voice(&self, voice: VoiceServer) -> Result<()> {
        self.ensure_alive()?;
        self.node.voice_update(self.guild_id, voice).await
    }

    /// Resuelve una búsqueda a través del nodo del player.
    pub async fn get_tracks(&self, query: &str, requester: UserId) -> Result<Option<LoadedTracks>> {
        self.ensure_alive()?;
        self.node.get_tracks(query, requester).await
    }

    // ------------------------------------------------------------------
    // Privilegios y votos
    // ------------------------------------------------------------------

    async fn voice_members(&self) -> Vec<VoiceMember> {
        self.roster.members(self.guild_id, self.voice_channel).await
    }

    fn member_privileged(members: &[VoiceMember], member: UserId) -> bool {
        let Some(entry) = members.iter().find(|m| m.id == member) else {
            return false;
        };
        if entry.has_dj_role || entry.can_manage {
            return true;
        }
        let mut non_bots = members.iter().filter(|m| !m.is_bot);
        matches!(
            (non_bots.next(), non_bots.next()),
            (Some(only), None) if only.id == member
        )
    }

    /// Mayoría estricta de los ocupantes no-bot, nunca menos de uno.
    fn required_of(members: &[VoiceMember]) -> usize {
        let non_bots = members.iter().filter(|m| !m.is_bot).count();
        non_bots / 2 + 1
    }

    /// `true` si el miembro está exento de votar: rol DJ, permiso de
    /// gestión, o es el único no-bot del canal.
    pub async fn is_privileged(&self, member: UserId) -> bool {
        Self::member_privileged(&self.voice_members().await, member)
    }

    /// Umbral de votos vigente para las acciones democratizadas.
    pub async fn required(&self) -> usize {
        Self::required_of(&self.voice_members().await)
    }

    // ------------------------------------------------------------------
    // Avance
    // ------------------------------------------------------------------

    /// El algoritmo de avance: elige el próximo track y se lo pide al nodo.
    ///
    /// La repetición se evalúa acá: en modo Track el último track vuelve a
    /// encolarse al frente; en modo Queue una cola agotada vuelve al
    /// principio. Con la cola vacía y autoplay activo se piden
    /// recomendaciones antes de declarar idle.
    pub async fn do_next(&self) -> Result<()> {
        if self.is_destroyed() {
            return Ok(());
        }

        {
            let mut state = self.state.lock().await;
            if state.phase != Phase::Idle {
                return Ok(());
            }
            if state.queue.repeat() == LoopType::Track {
                if let Some(last) = state.last_track.clone() {
                    state.queue.insert_at_cursor(last);
                }
            }
        }

        let mut tried_autoplay = false;
        loop {
            let candidate = {
                let mut state = self.state.lock().await;
                if state.phase != Phase::Idle {
                    return Ok(());
                }
                match state.queue.next_pending() {
                    Some((index, track)) => {
                        state.phase = Phase::Loading;
                        state.pending = Some((index, track.clone()));
                        Some((index, track, state.volume))
                    }
                    None => None,
                }
            };

            let Some((index, track, volume)) = candidate else {
                if !tried_autoplay {
                    tried_autoplay = true;
                    if self.try_autoplay().await {
                        continue;
                    }
                }

                let mut state = self.state.lock().await;
                state.phase = Phase::Idle;
                state.current = None;
                state.pending = None;
                state.position_ms = 0;
                state.position_at = None;
                drop(state);

                debug!("📭 Cola agotada en guild {}", self.guild_id);
                self.emit(PlayerEvent::QueueFinished { guild_id: self.guild_id });
                return Ok(());
            };

            match self.node.play(self.guild_id, track.clone(), volume, false).await {
                Ok(()) => {
                    info!("🎵 Pedido al nodo: {} - {}", track.info.author, track.info.title);
                    return Ok(());
                }
                Err(e) => {
                    warn!("❌ El nodo no aceptó {}: {}", track.info.title, e);
                    let exhausted = {
                        let mut state = self.state.lock().await;
                        state.phase = Phase::Idle;
                        state.pending = None;
                        // consume el candidato fallido, nunca se reintenta en loop
                        state.queue.confirm(index);
                        state.advance_failures += 1;
                        state.advance_failures >= MAX_ADVANCE_FAILURES
                    };
                    if exhausted {
                        error!(
                            "🚫 Sin candidatos reproducibles en guild {} tras {} intentos",
                            self.guild_id, MAX_ADVANCE_FAILURES
                        );
                        self.emit(PlayerEvent::PlaybackFailed {
                            guild_id: self.guild_id,
                            track,
                            attempts: MAX_ADVANCE_FAILURES,
                        });
                        return Err(e);
                    }
                }
            }
        }
    }

    /// Encola recomendaciones derivadas del último track. `true` si sumó algo.
    async fn try_autoplay(&self) -> bool {
        let seed = {
            let state = self.state.lock().await;
            if !state.autoplay {
                return false;
            }
            state.last_track.clone().map(|track| {
                let played: Vec<String> = state
                    .queue
                    .played()
                    .iter()
                    .map(|t| t.info.identifier.clone())
                    .collect();
                (track, played)
            })
        };
        let Some((seed_track, exclude)) = seed else {
            return false;
        };

        match self
            .node
            .recommendations(&seed_track, exclude, seed_track.requester)
            .await
        {
            Ok(recommended) if !recommended.is_empty() => {
                let mut state = self.state.lock().await;
                let mut added = 0;
                for track in recommended {
                    if state.queue.put(track).is_ok() {
                        added += 1;
                    }
                }
                info!("🎶 Autoplay encoló {} recomendaciones", added);
                added > 0
            }
            Ok(_) => false,
            Err(e) => {
                warn!("⚠️ Autoplay no consiguió recomendaciones: {e}");
                false
            }
        }
    }

    // ------------------------------------------------------------------
    // Cola
    // ------------------------------------------------------------------

    /// Encola tracks con recorte opcional. Devuelve la posición 1-based en
    /// la que sonará el primero; los duplicados se rechazan track por track
    /// y solo si cae el lote entero la operación falla.
    pub async fn add_track(
        &self,
        tracks: Vec<Track>,
        start_ms: u64,
        end_ms: Option<u64>,
        at_front: bool,
    ) -> Result<usize> {
        self.ensure_alive()?;
        let mut state = self.state.lock().await;

        let mut first_position: Option<usize> = None;
        let mut last_error: Option<Error> = None;
        let windowed: Vec<Track> = tracks
            .into_iter()
            .map(|t| t.with_window(start_ms, end_ms))
            .collect();

        if at_front {
            for track in windowed.into_iter().rev() {
                match state.queue.put_at_front(track) {
                    Ok(position) => first_position = Some(position),
                    Err(e) => last_error = Some(e),
                }
            }
        } else {
            for track in windowed {
                match state.queue.put(track) {
                    Ok(position) => {
                        first_position.get_or_insert(position);
                    }
                    Err(e) => last_error = Some(e),
                }
            }
        }

        match (first_position, last_error) {
            (Some(position), _) => Ok(position),
            (None, Some(error)) => Err(error),
            (None, None) => Ok(0),
        }
    }

    /// Saltea la canción actual; con `index` saltea hasta esa posición.
    pub async fn skip(&self, index: Option<usize>, requester: UserId) -> Result<VoteOutcome> {
        self.ensure_alive()?;
        self.ensure_node()?;

        let members = self.voice_members().await;
        let mut state = self.state.lock().await;

        if state.phase != Phase::Playing || state.current.is_none() {
            return Err(Error::NothingPlaying);
        }

        let auto_privileged = state
            .current
            .as_ref()
            .map(|t| t.requester == requester)
            .unwrap_or(false);

        if !auto_privileged && !Self::member_privileged(&members, requester) {
            let required = Self::required_of(&members);
            match state.votes.cast(VoteKind::Skip, requester, required) {
                Cast::Already => return Ok(VoteOutcome::AlreadyVoted),
                Cast::Pending(votes) => return Ok(VoteOutcome::Pending { votes, required }),
                Cast::Reached => {}
            }
        }

        if let Some(n) = index {
            state.queue.skip_to(n);
        }
        // saltear escapa de la repetición de track
        if state.queue.repeat() == LoopType::Track {
            state.queue.set_repeat(LoopType::Off);
        }
        state.votes.clear_all();
        drop(state);

        // el stop dispara trackEnd(stopped) y con eso el avance
        self.node.stop(self.guild_id).await?;
        Ok(VoteOutcome::Executed)
    }

    /// Vuelve `n` tracks atrás en el historial.
    pub async fn back(&self, n: usize, requester: UserId) -> Result<VoteOutcome> {
        self.ensure_alive()?;
        self.ensure_node()?;

        let members = self.voice_members().await;
        let mut state = self.state.lock().await;

        if !Self::member_privileged(&members, requester) {
            let required = Self::required_of(&members);
            match state.votes.cast(VoteKind::Previous, requester, required) {
                Cast::Already => return Ok(VoteOutcome::AlreadyVoted),
                Cast::Pending(votes) => return Ok(VoteOutcome::Pending { votes, required }),
                Cast::Reached => {}
            }
        }

        let playing = state.phase == Phase::Playing;
        if playing {
            // el actual ocupa un lugar del historial, un paso extra
            state.queue.back_to(n.max(1) + 1);
        } else {
            state.queue.back_to(n.max(1));
        }
        if state.queue.repeat() == LoopType::Track {
            state.queue.set_repeat(LoopType::Off);
        }
        state.votes.clear_all();
        drop(state);

        if playing {
            self.node.stop(self.guild_id).await?;
        } else {
            self.do_next().await?;
        }
        Ok(VoteOutcome::Executed)
    }

    /// Pausa o reanuda, con gate de votos para no-privilegiados.
    pub async fn set_pause(&self, paused: bool, requester: UserId) -> Result<VoteOutcome> {
        self.ensure_alive()?;
        self.ensure_node()?;

        let members = self.voice_members().await;
        let mut state = self.state.lock().await;

        if !Self::member_privileged(&members, requester) {
            let kind = if paused { VoteKind::Pause } else { VoteKind::Resume };
            let required = Self::required_of(&members);
            match state.votes.cast(kind, requester, required) {
                Cast::Already => return Ok(VoteOutcome::AlreadyVoted),
                Cast::Pending(votes) => return Ok(VoteOutcome::Pending { votes, required }),
                Cast::Reached => {}
            }
        }

        state.freeze_position();
        state.paused = paused;
        state.votes.clear_all();
        drop(state);

        self.node.pause(self.guild_id, paused).await?;
        info!(
            "{} Guild {}: pausa = {}",
            if paused { "⏸️" } else { "▶️" },
            self.guild_id,
            paused
        );
        Ok(VoteOutcome::Executed)
    }

    /// Mezcla la cola pendiente (o el historial), con gate de votos.
    pub async fn shuffle(&self, scope: QueueScope, requester: UserId) -> Result<VoteOutcome> {
        self.ensure_alive()?;

        let members = self.voice_members().await;
        let mut state = self.state.lock().await;

        if !Self::member_privileged(&members, requester) {
            let required = Self::required_of(&members);
            match state.votes.cast(VoteKind::Shuffle, requester, required) {
                Cast::Already => return Ok(VoteOutcome::AlreadyVoted),
                Cast::Pending(votes) => return Ok(VoteOutcome::Pending { votes, required }),
                Cast::Reached => {}
            }
        }

        state.queue.shuffle(scope);
        state.votes.clear_all();
        Ok(VoteOutcome::Executed)
    }

    /// Gate de votos para abandonar el canal; ejecutarlo queda del lado de
    /// la capa externa vía `PlayerManager::teardown`.
    pub async fn request_leave(&self, requester: UserId) -> Result<VoteOutcome> {
        self.ensure_alive()?;

        let members = self.voice_members().await;
        let mut state = self.state.lock().await;

        if !Self::member_privileged(&members, requester) {
            let required = Self::required_of(&members);
            match state.votes.cast(VoteKind::Stop, requester, required) {
                Cast::Already => return Ok(VoteOutcome::AlreadyVoted),
                Cast::Pending(votes) => return Ok(VoteOutcome::Pending { votes, required }),
                Cast::Reached => {}
            }
        }
        state.votes.clear_all();
        Ok(VoteOutcome::Executed)
    }

    /// Detiene la reproducción y vacía lo pendiente.
    ///
    /// Apaga la repetición: un stop explícito no debe resucitar la cola en
    /// modo Queue.
    pub async fn stop(&self) -> Result<()> {
        self.ensure_alive()?;
        {
            let mut state = self.state.lock().await;
            state.queue.clear(QueueScope::Queue);
            state.queue.set_repeat(LoopType::Off);
            state.votes.clear_all();
        }
        self.node.stop(self.guild_id).await
    }

    // ------------------------------------------------------------------
    // Controles solo-DJ
    // ------------------------------------------------------------------

    async fn ensure_privileged(&self, requester: UserId) -> Result<()> {
        if !self.is_privileged(requester).await {
            return Err(Error::NotPrivileged);
        }
        Ok(())
    }

    /// Cambia la posición de reproducción del track actual.
    pub async fn seek(&self, position_ms: u64, requester: UserId) -> Result<()> {
        self.ensure_alive()?;
        self.ensure_node()?;
        self.ensure_privileged(requester).await?;

        let mut state = self.state.lock().await;
        let Some(current) = state.current.as_ref() else {
            return Err(Error::NothingPlaying);
        };
        let length = current.info.length;
        if current.info.is_stream || length == 0 || position_ms > length {
            return Err(Error::InvalidSeek { position: position_ms, length });
        }

        state.position_ms = position_ms;
        state.position_at = Some(Instant::now());
        drop(state);

        self.node.seek(self.guild_id, position_ms).await
    }

    /// Ajusta el volumen, recortado a 0..=150.
    pub async fn set_volume(&self, volume: u16, requester: UserId) -> Result<u16> {
        self.ensure_alive()?;
        self.ensure_node()?;
        self.ensure_privileged(requester).await?;

        let volume = volume.min(150);
        {
            let mut state = self.state.lock().await;
            state.volume = volume;
        }
        self.node.set_volume(self.guild_id, volume).await?;
        info!("🔊 Guild {}: volumen {}%", self.guild_id, volume);
        Ok(volume)
    }

    /// Fija el modo de repetición, o cicla al siguiente si no se indica.
    pub async fn set_repeat(&self, mode: Option<LoopType>, requester: UserId) -> Result<LoopType> {
        self.ensure_alive()?;
        self.ensure_privileged(requester).await?;

        let mut state = self.state.lock().await;
        let applied = match mode {
            Some(mode) => {
                state.queue.set_repeat(mode);
                mode
            }
            None => state.queue.cycle_repeat(),
        };
        info!("🔁 Guild {}: repetición {}", self.guild_id, applied);
        Ok(applied)
    }

    pub async fn clear_queue(&self, scope: QueueScope, requester: UserId) -> Result<usize> {
        self.ensure_alive()?;
        self.ensure_privileged(requester).await?;

        let mut state = self.state.lock().await;
        Ok(state.queue.clear(scope))
    }

    pub async fn remove_track(
        &self,
        index1: usize,
        index2: Option<usize>,
        by_requester: Option<UserId>,
        requester: UserId,
    ) -> Result<Vec<Track>> {
        self.ensure_alive()?;
        self.ensure_privileged(requester).await?;

        let mut state = self.state.lock().await;
        state.queue.remove(index1, index2, by_requester)
    }

    pub async fn move_track(&self, from: usize, to: usize, requester: UserId) -> Result<()> {
        self.ensure_alive()?;
        self.ensure_privileged(requester).await?;

        let mut state = self.state.lock().await;
        state.queue.move_track(from, to)
    }

    pub async fn toggle_autoplay(&self, requester: UserId) -> Result<bool> {
        self.ensure_alive()?;
        self.ensure_privileged(requester).await?;

        let (enabled, idle) = {
            let mut state = self.state.lock().await;
            state.autoplay = !state.autoplay;
            (state.autoplay, state.phase == Phase::Idle)
        };
        self.emit(PlayerEvent::AutoplayToggled { guild_id: self.guild_id, enabled });

        if enabled && idle {
            self.do_next().await?;
        }
        Ok(enabled)
    }

    // ------------------------------------------------------------------
    // Filtros
    // ------------------------------------------------------------------

    async fn push_filters(&self) -> Result<()> {
        // la cadena completa viaja en cada cambio, el protocolo no es incremental
        let payload = {
            let state = self.state.lock().await;
            state.filters.payload()
        };
        self.node.set_filters(self.guild_id, payload).await?;

        let tags = {
            let state = self.state.lock().await;
            state.filters.tags()
        };
        self.emit(PlayerEvent::FiltersChanged { guild_id: self.guild_id, tags });
        Ok(())
    }

    pub async fn add_filter(&self, tag: &str, filter: Filter, requester: UserId) -> Result<()> {
        self.ensure_alive()?;
        self.ensure_node()?;
        self.ensure_privileged(requester).await?;

        {
            let mut state = self.state.lock().await;
            state.filters.add(tag, filter)?;
        }
        self.push_filters().await
    }

    pub async fn remove_filter(&self, tag: &str, requester: UserId) -> Result<()> {
        self.ensure_alive()?;
        self.ensure_node()?;
        self.ensure_privileged(requester).await?;

        {
            let mut state = self.state.lock().await;
            state.filters.remove(tag)?;
        }
        self.push_filters().await
    }

    /// Deja la cadena vacía; repetirlo es inocuo.
    pub async fn reset_filter(&self, requester: UserId) -> Result<usize> {
        self.ensure_alive()?;
        self.ensure_node()?;
        self.ensure_privileged(requester).await?;

        let removed = {
            let mut state = self.state.lock().await;
            state.filters.reset()
        };
        self.push_filters().await?;
        Ok(removed)
    }

    // ------------------------------------------------------------------
    // Eventos del nodo
    // ------------------------------------------------------------------

    /// Aplica un evento del nodo. Corre en su propia task: un teardown que
    /// corra en paralelo se resuelve acá con el flag de destruido.
    pub(crate) async fn handle_event(&self, event: NodeEvent) {
        if self.is_destroyed() {
            debug!("Evento para player destruido en guild {}, ignorado", self.guild_id);
            return;
        }

        match event {
            NodeEvent::TrackStart { .. } => self.on_track_start().await,
            NodeEvent::TrackEnd { reason, .. } => self.on_track_end(reason).await,
            NodeEvent::TrackException { exception, .. } => {
                // el nodo manda después el trackEnd(loadFailed) que avanza
                error!(
                    "💥 Excepción de track en guild {}: {:?}",
                    self.guild_id, exception.message
                );
            }
            NodeEvent::TrackStuck { threshold_ms, .. } => {
                warn!(
                    "🐌 Track clavado {}ms en guild {}, salteando",
                    threshold_ms, self.guild_id
                );
                if let Err(e) = self.node.stop(self.guild_id).await {
                    warn!("No se pudo destrabar el track: {e}");
                }
            }
            NodeEvent::WebSocketClosed { code, by_remote, .. } => {
                warn!(
                    "🔕 Voz cerrada en guild {} (código {}, remoto: {})",
                    self.guild_id, code, by_remote
                );
            }
        }
    }

    async fn on_track_start(&self) {
        let started = {
            let mut state = self.state.lock().await;
            let Some((index, track)) = state.pending.take() else {
                warn!("Inicio sin candidato pendiente en guild {}", self.guild_id);
                if state.current.is_some() {
                    state.phase = Phase::Playing;
                }
                return;
            };
            state.queue.confirm(index);
            state.position_ms = track.start_ms;
            state.position_at = Some(Instant::now());
            state.current = Some(track.clone());
            state.phase = Phase::Playing;
            state.paused = false;
            state.advance_failures = 0;
            state.votes.clear_all();
            track
        };

        info!(
            "▶️ Sonando en guild {}: {} - {}",
            self.guild_id, started.info.author, started.info.title
        );
        self.emit(PlayerEvent::TrackStart {
            guild_id: self.guild_id,
            track: started,
        });
    }

    async fn on_track_end(&self, reason: EndReason) {
        let (ended, exhausted) = {
            let mut state = self.state.lock().await;
            state.votes.clear_all();

            let mut ended = state.current.take();
            if let Some(track) = ended.clone() {
                state.last_track = Some(track);
            }

            if reason == EndReason::Replaced {
                // hay otro play en vuelo que ya es dueño de la fase
                return;
            }

            // un candidato que nunca arrancó se consume acá
            if let Some((index, track)) = state.pending.take() {
                state.queue.confirm(index);
                ended.get_or_insert(track);
            }
            state.phase = Phase::Idle;
            state.position_ms = 0;
            state.position_at = None;

            let exhausted = if reason == EndReason::LoadFailed {
                state.advance_failures += 1;
                state.advance_failures >= MAX_ADVANCE_FAILURES
            } else {
                false
            };
            (ended, exhausted)
        };

        debug!("⏹️ Track terminado en guild {} ({:?})", self.guild_id, reason);
        self.emit(PlayerEvent::TrackEnd {
            guild_id: self.guild_id,
            track: ended.clone(),
            reason,
        });

        if exhausted {
            if let Some(track) = ended {
                error!(
                    "🚫 {} falló {} veces seguidas en guild {}",
                    track.info.title, MAX_ADVANCE_FAILURES, self.guild_id
                );
                self.emit(PlayerEvent::PlaybackFailed {
                    guild_id: self.guild_id,
                    track,
                    attempts: MAX_ADVANCE_FAILURES,
                });
            }
            return;
        }

        if reason.should_advance() {
            if let Err(e) = self.do_next().await {
                error!("Error avanzando en guild {}: {e}", self.guild_id);
            }
        }
    }

    /// Reconcilia la estimación local con el heartbeat del nodo.
    pub(crate) async fn handle_position(&self, update: PlayerUpdateState) {
        let mut state = self.state.lock().await;
        state.position_ms = update.position;
        state.position_at = Some(Instant::now());
        state.connected = update.connected;
    }

    // ------------------------------------------------------------------
    // Lectura y ciclo de vida
    // ------------------------------------------------------------------

    pub async fn position_ms(&self) -> u64 {
        self.state.lock().await.estimated_position()
    }

    pub async fn is_playing(&self) -> bool {
        let state = self.state.lock().await;
        state.phase == Phase::Playing && !state.paused
    }

    pub async fn is_paused(&self) -> bool {
        self.state.lock().await.paused
    }

    pub async fn current(&self) -> Option<Track> {
        self.state.lock().await.current.clone()
    }

    pub async fn view(&self) -> PlayerView {
        let state = self.state.lock().await;
        PlayerView {
            guild_id: self.guild_id,
            voice_channel: self.voice_channel,
            text_channel: self.text_channel,
            phase: state.phase,
            paused: state.paused,
            volume: state.volume,
            autoplay: state.autoplay,
            repeat: state.queue.repeat(),
            current: state.current.clone(),
            upcoming: state.queue.tracks(false),
            history: state.queue.played().to_vec(),
            position_ms: state.estimated_position(),
            connected: state.connected,
            filter_tags: state.filters.tags(),
        }
    }

    /// Destrucción terminal; idempotente y a prueba de eventos en vuelo.
    pub(crate) async fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.node.destroy(self.guild_id).await {
            warn!("No se pudo destruir el player remoto de {}: {e}", self.guild_id);
        }
        {
            let mut state = self.state.lock().await;
            state.current = None;
            state.pending = None;
            state.phase = Phase::Idle;
            state.votes.clear_all();
        }
        info!("👋 Player destruido en guild {}", self.guild_id);
        self.emit(PlayerEvent::PlayerDestroyed { guild_id: self.guild_id });
    }

    // ------------------------------------------------------------------
    // Restauración (uso interno del módulo de sesiones)
    // ------------------------------------------------------------------

    pub(crate) async fn restore_prefs(&self, volume: u16, autoplay: bool, repeat: LoopType) {
        let mut state = self.state.lock().await;
        state.volume = volume.min(150);
        state.autoplay = autoplay;
        state.queue.set_repeat(repeat);
    }

    pub(crate) async fn force_seek(&self, position_ms: u64) -> Result<()> {
        {
            let mut state = self.state.lock().await;
            state.position_ms = position_ms;
            state.position_at = Some(Instant::now());
        }
        self.node.seek(self.guild_id, position_ms).await
    }

    pub(crate) async fn force_pause(&self, paused: bool) -> Result<()> {
        {
            let mut state = self.state.lock().await;
            state.freeze_position();
            state.paused = paused;
        }
        self.node.pause(self.guild_id, paused).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::manager::MockVoiceRoster;
    use crate::audio::track::TrackInfo;
    use crate::node::protocol::{ApiTrack, ApiTrackInfo};
    use crate::node::MockNodeLink;
    use crate::settings::GuildSettings;
    use pretty_assertions::assert_eq;

    const GUILD: u64 = 900;

    fn track(id: &str, requester: u64) -> Track {
        let info = TrackInfo {
            title: format!("title-{id}"),
            author: "author".to_string(),
            length: 180_000,
            identifier: id.to_string(),
            is_stream: false,
            uri: Some(format!("https://youtu.be/{id}")),
            artwork_url: None,
            isrc: None,
            source_name: "youtube".to_string(),
            position: 0,
        };
        Track::from_info(info, UserId::new(requester))
    }

    fn api_track(track: &Track) -> ApiTrack {
        ApiTrack {
            encoded: track.encoded.clone(),
            info: ApiTrackInfo {
                identifier: track.info.identifier.clone(),
                is_seekable: true,
                author: track.info.author.clone(),
                length: track.info.length,
                is_stream: track.info.is_stream,
                position: 0,
                title: track.info.title.clone(),
                uri: track.info.uri.clone(),
                artwork_url: None,
                isrc: None,
                source_name: track.info.source_name.clone(),
            },
        }
    }

    fn plain_members(ids: &[u64]) -> Vec<VoiceMember> {
        ids.iter()
            .map(|id| VoiceMember {
                id: UserId::new(*id),
                is_bot: false,
                has_dj_role: false,
                can_manage: false,
            })
            .collect()
    }

    fn roster(members: Vec<VoiceMember>) -> Arc<MockVoiceRoster> {
        let mut roster = MockVoiceRoster::new();
        roster
            .expect_members()
            .returning(move |_, _| members.clone());
        Arc::new(roster)
    }

    fn quiet_node() -> MockNodeLink {
        let mut node = MockNodeLink::new();
        node.expect_is_available().return_const(true);
        node.expect_identifier().return_const("test".to_string());
        node
    }

    fn player_with(
        node: MockNodeLink,
        members: Vec<VoiceMember>,
        settings: GuildSettings,
    ) -> (Arc<Player>, broadcast::Receiver<PlayerEvent>) {
        let (tx, rx) = crate::events::channel();
        let player = Player::new(
            GuildId::new(GUILD),
            ChannelId::new(100),
            Some(ChannelId::new(200)),
            Arc::new(node),
            roster(members),
            tx,
            &settings,
        );
        (player, rx)
    }

    async fn start_pending(player: &Arc<Player>) {
        let track = {
            let state = player.state.lock().await;
            state.pending.as_ref().expect("sin candidato pendiente").1.clone()
        };
        player
            .handle_event(NodeEvent::TrackStart {
                guild_id: GUILD.to_string(),
                track: api_track(&track),
            })
            .await;
    }

    async fn end_current(player: &Arc<Player>, reason: EndReason) {
        let track = player.current().await.unwrap_or_else(|| track("ended", 1));
        player
            .handle_event(NodeEvent::TrackEnd {
                guild_id: GUILD.to_string(),
                track: api_track(&track),
                reason,
            })
            .await;
    }

    #[tokio::test]
    async fn scenario_a_advance_skip_and_back() {
        let mut node = quiet_node();
        node.expect_play().times(3).returning(|_, _, _, _| Ok(()));
        node.expect_stop().times(2).returning(|_| Ok(()));

        // un solo miembro: privilegiado por ser el único no-bot
        let (player, _rx) = player_with(node, plain_members(&[1]), GuildSettings::default());
        let requester = UserId::new(1);

        player
            .add_track(vec![track("x", 1), track("y", 1), track("z", 1)], 0, None, false)
            .await
            .unwrap();

        player.do_next().await.unwrap();
        // el cursor no se mueve hasta que el nodo confirme el inicio
        {
            let state = player.state.lock().await;
            assert_eq!(state.queue.position(), 0);
            assert_eq!(state.phase, Phase::Loading);
        }
        start_pending(&player).await;
        {
            let state = player.state.lock().await;
            assert_eq!(state.queue.position(), 1);
        }
        assert_eq!(player.current().await.unwrap().info.identifier, "x");

        // skip: stop → trackEnd(stopped) → avanza a Y
        assert_eq!(
            player.skip(None, requester).await.unwrap(),
            VoteOutcome::Executed
        );
        end_current(&player, EndReason::Stopped).await;
        start_pending(&player).await;
        assert_eq!(player.current().await.unwrap().info.identifier, "y");

        // back(1): vuelve a X desde el historial
        assert_eq!(
            player.back(1, requester).await.unwrap(),
            VoteOutcome::Executed
        );
        end_current(&player, EndReason::Stopped).await;
        start_pending(&player).await;
        assert_eq!(player.current().await.unwrap().info.identifier, "x");
    }

    #[tokio::test]
    async fn scenario_b_sole_member_pauses_without_votes() {
        let mut node = quiet_node();
        node.expect_pause()
            .withf(|_, paused| *paused)
            .times(1)
            .returning(|_, _| Ok(()));

        let (player, _rx) = player_with(node, plain_members(&[1]), GuildSettings::default());
        assert_eq!(player.required().await, 1);

        let outcome = player.set_pause(true, UserId::new(1)).await.unwrap();
        assert_eq!(outcome, VoteOutcome::Executed);
        assert!(player.is_paused().await);
    }

    #[tokio::test]
    async fn scenario_c_two_members_need_two_skip_votes() {
        let mut node = quiet_node();
        node.expect_play().returning(|_, _, _, _| Ok(()));
        node.expect_stop().times(1).returning(|_| Ok(()));

        let (player, _rx) = player_with(node, plain_members(&[1, 2]), GuildSettings::default());

        // el requester del track es el 7 para que nadie sea auto-privilegiado
        player
            .add_track(vec![track("x", 7), track("y", 7)], 0, None, false)
            .await
            .unwrap();
        player.do_next().await.unwrap();
        start_pending(&player).await;

        let first = player.skip(None, UserId::new(1)).await.unwrap();
        assert_eq!(first, VoteOutcome::Pending { votes: 1, required: 2 });

        let repeat = player.skip(None, UserId::new(1)).await.unwrap();
        assert_eq!(repeat, VoteOutcome::AlreadyVoted);

        let second = player.skip(None, UserId::new(2)).await.unwrap();
        assert_eq!(second, VoteOutcome::Executed);

        // ejecutar limpió el set: el siguiente voto arranca de cero
        end_current(&player, EndReason::Stopped).await;
        start_pending(&player).await;
        let fresh = player.skip(None, UserId::new(1)).await.unwrap();
        assert_eq!(fresh, VoteOutcome::Pending { votes: 1, required: 2 });
    }

    #[tokio::test]
    async fn vote_threshold_is_a_strict_majority() {
        for (members, required) in [(1usize, 1usize), (2, 2), (3, 2), (10, 6)] {
            let ids: Vec<u64> = (1..=members as u64).collect();
            let (player, _rx) = player_with(quiet_node(), plain_members(&ids), GuildSettings::default());
            assert_eq!(player.required().await, required, "con {members} miembros");
        }
    }

    #[tokio::test]
    async fn current_requester_is_auto_privileged_for_skip() {
        let mut node = quiet_node();
        node.expect_play().returning(|_, _, _, _| Ok(()));
        node.expect_stop().times(1).returning(|_| Ok(()));

        let (player, _rx) = player_with(node, plain_members(&[1, 2, 3]), GuildSettings::default());

        player
            .add_track(vec![track("x", 2)], 0, None, false)
            .await
            .unwrap();
        player.do_next().await.unwrap();
        start_pending(&player).await;

        // el 2 pidió el track actual: saltea sin juntar votos
        let outcome = player.skip(None, UserId::new(2)).await.unwrap();
        assert_eq!(outcome, VoteOutcome::Executed);
    }

    #[tokio::test]
    async fn track_repeat_replays_the_same_identifier() {
        let mut node = quiet_node();
        node.expect_play().times(2).returning(|_, _, _, _| Ok(()));

        let (player, _rx) = player_with(node, plain_members(&[1]), GuildSettings::default());
        player
            .add_track(vec![track("loopme", 1)], 0, None, false)
            .await
            .unwrap();
        player.set_repeat(Some(LoopType::Track), UserId::new(1)).await.unwrap();

        player.do_next().await.unwrap();
        start_pending(&player).await;
        let first = player.current().await.unwrap();

        end_current(&player, EndReason::Finished).await;
        start_pending(&player).await;
        let second = player.current().await.unwrap();

        assert_eq!(first.info.identifier, second.info.identifier);
    }

    #[tokio::test]
    async fn queue_repeat_wraps_to_the_start() {
        let mut node = quiet_node();
        node.expect_play().times(3).returning(|_, _, _, _| Ok(()));

        let (player, _rx) = player_with(node, plain_members(&[1]), GuildSettings::default());
        player
            .add_track(vec![track("a", 1), track("b", 1)], 0, None, false)
            .await
            .unwrap();
        player.set_repeat(Some(LoopType::Queue), UserId::new(1)).await.unwrap();

        player.do_next().await.unwrap();
        start_pending(&player).await;
        end_current(&player, EndReason::Finished).await;
        start_pending(&player).await;
        assert_eq!(player.current().await.unwrap().info.identifier, "b");

        // cola agotada: vuelve al principio
        end_current(&player, EndReason::Finished).await;
        start_pending(&player).await;
        assert_eq!(player.current().await.unwrap().info.identifier, "a");
        assert_eq!(player.state.lock().await.queue.position(), 1);
    }

    #[tokio::test]
    async fn load_failures_cap_and_surface_a_terminal_event() {
        let mut node = quiet_node();
        node.expect_play().returning(|_, _, _, _| Ok(()));

        let (player, mut rx) = player_with(node, plain_members(&[1]), GuildSettings::default());
        player
            .add_track(
                vec![track("f1", 1), track("f2", 1), track("f3", 1), track("ok", 1)],
                0,
                None,
                false,
            )
            .await
            .unwrap();

        player.do_next().await.unwrap();
        for _ in 0..MAX_ADVANCE_FAILURES {
            end_current(&player, EndReason::LoadFailed).await;
        }

        // quedó idle sin tocar el cuarto track
        assert_eq!(player.state.lock().await.phase, Phase::Idle);

        let mut saw_failure = false;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, PlayerEvent::PlaybackFailed { attempts, .. } if attempts == MAX_ADVANCE_FAILURES)
            {
                saw_failure = true;
            }
        }
        assert!(saw_failure, "faltó el evento terminal de reproducción");
    }

    #[tokio::test]
    async fn autoplay_refills_from_recommendations() {
        let mut node = quiet_node();
        node.expect_play().times(2).returning(|_, _, _, _| Ok(()));
        node.expect_recommendations()
            .times(1)
            .returning(|_, _, _| Ok(vec![track("rec1", 1)]));

        let (player, _rx) = player_with(node, plain_members(&[1]), GuildSettings::default());
        player
            .add_track(vec![track("seed", 1)], 0, None, false)
            .await
            .unwrap();
        player.toggle_autoplay(UserId::new(1)).await.unwrap();
        start_pending(&player).await;

        end_current(&player, EndReason::Finished).await;
        start_pending(&player).await;
        assert_eq!(player.current().await.unwrap().info.identifier, "rec1");
    }

    #[tokio::test]
    async fn exhausted_queue_without_autoplay_goes_idle() {
        let mut node = quiet_node();
        node.expect_play().times(1).returning(|_, _, _, _| Ok(()));

        let (player, mut rx) = player_with(node, plain_members(&[1]), GuildSettings::default());
        player
            .add_track(vec![track("only", 1)], 0, None, false)
            .await
            .unwrap();
        player.do_next().await.unwrap();
        start_pending(&player).await;
        end_current(&player, EndReason::Finished).await;

        assert_eq!(player.state.lock().await.phase, Phase::Idle);
        assert!(player.current().await.is_none());

        let mut finished = false;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, PlayerEvent::QueueFinished { .. }) {
                finished = true;
            }
        }
        assert!(finished);
    }

    #[tokio::test]
    async fn seek_validates_streams_and_bounds() {
        let mut node = quiet_node();
        node.expect_play().returning(|_, _, _, _| Ok(()));
        node.expect_seek().times(1).returning(|_, _| Ok(()));

        let (player, _rx) = player_with(node, plain_members(&[1]), GuildSettings::default());
        let requester = UserId::new(1);

        player
            .add_track(vec![track("x", 1)], 0, None, false)
            .await
            .unwrap();
        player.do_next().await.unwrap();
        start_pending(&player).await;

        assert!(matches!(
            player.seek(999_999_999, requester).await,
            Err(Error::InvalidSeek { .. })
        ));
        player.seek(30_000, requester).await.unwrap();
        assert!(player.position_ms().await >= 30_000);
    }

    #[tokio::test]
    async fn volume_clamps_to_150() {
        let mut node = quiet_node();
        node.expect_set_volume()
            .withf(|_, v| *v == 150)
            .times(1)
            .returning(|_, _| Ok(()));

        let (player, _rx) = player_with(node, plain_members(&[1]), GuildSettings::default());
        let applied = player.set_volume(999, UserId::new(1)).await.unwrap();
        assert_eq!(applied, 150);
    }

    #[tokio::test]
    async fn non_privileged_dj_controls_are_rejected() {
        let (player, _rx) = player_with(quiet_node(), plain_members(&[1, 2]), GuildSettings::default());
        let result = player.set_repeat(Some(LoopType::Track), UserId::new(1)).await;
        assert!(matches!(result, Err(Error::NotPrivileged)));
    }

    #[tokio::test]
    async fn reset_filter_is_idempotent() {
        let mut node = quiet_node();
        node.expect_set_filters().returning(|_, _| Ok(()));

        let (player, _rx) = player_with(node, plain_members(&[1]), GuildSettings::default());
        let requester = UserId::new(1);

        player
            .add_filter("speed", Filter::nightcore(), requester)
            .await
            .unwrap();
        assert_eq!(player.reset_filter(requester).await.unwrap(), 1);
        assert_eq!(player.reset_filter(requester).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn duplicate_batch_fails_only_when_everything_is_rejected() {
        let settings = GuildSettings {
            allow_duplicates: false,
            ..GuildSettings::default()
        };
        let (player, _rx) = player_with(quiet_node(), plain_members(&[1]), settings);

        player
            .add_track(vec![track("a", 1)], 0, None, false)
            .await
            .unwrap();

        // lote mixto: el duplicado se descarta pero el lote entra
        let position = player
            .add_track(vec![track("a", 1), track("b", 1)], 0, None, false)
            .await
            .unwrap();
        assert_eq!(position, 2);

        // lote de puros duplicados: falla tipado
        let err = player
            .add_track(vec![track("a", 1)], 0, None, false)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Duplicate(_)));
    }

    #[tokio::test]
    async fn commands_fail_while_the_node_reconnects() {
        let mut node = MockNodeLink::new();
        node.expect_is_available().return_const(false);
        node.expect_identifier().return_const("down".to_string());

        let (player, _rx) = player_with(node, plain_members(&[1]), GuildSettings::default());
        let result = player.set_pause(true, UserId::new(1)).await;
        assert!(matches!(result, Err(Error::NodeUnavailable)));
    }

    #[tokio::test]
    async fn events_after_teardown_are_ignored() {
        let mut node = quiet_node();
        node.expect_play().returning(|_, _, _, _| Ok(()));
        node.expect_destroy().times(1).returning(|_| Ok(()));

        let (player, _rx) = player_with(node, plain_members(&[1]), GuildSettings::default());
        player
            .add_track(vec![track("x", 1)], 0, None, false)
            .await
            .unwrap();
        player.do_next().await.unwrap();

        player.destroy().await;
        // el start en vuelo llega tarde y no revive al player
        let ghost = track("x", 1);
        player
            .handle_event(NodeEvent::TrackStart {
                guild_id: GUILD.to_string(),
                track: api_track(&ghost),
            })
            .await;
        assert!(player.current().await.is_none());
        assert!(player.is_destroyed());
    }
}
