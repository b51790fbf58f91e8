use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use serenity::model::id::UserId;
use std::collections::HashMap;
use tracing::{debug, info};

use crate::audio::track::Track;
use crate::error::{Error, Result};

/// Modo de repetición del player.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LoopType {
    Off,
    Track,
    Queue,
}

impl LoopType {
    /// El modo que resultaría de un ciclo más, sin mutar nada.
    ///
    /// La UI lo usa para pre-renderizar el botón de loop.
    pub fn peek_next(self) -> Self {
        match self {
            LoopType::Off => LoopType::Track,
            LoopType::Track => LoopType::Queue,
            LoopType::Queue => LoopType::Off,
        }
    }
}

impl std::fmt::Display for LoopType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoopType::Off => write!(f, "off"),
            LoopType::Track => write!(f, "track"),
            LoopType::Queue => write!(f, "queue"),
        }
    }
}

/// Tipo de cola configurable por guild.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum QueueType {
    /// FIFO estricto.
    #[default]
    Standard,
    /// Intercala tracks por requester para repartir turnos.
    Fair,
}

/// Parte de la cola sobre la que opera shuffle/clear.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueScope {
    Queue,
    History,
}

impl QueueScope {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "queue" => Some(QueueScope::Queue),
            "history" => Some(QueueScope::History),
            _ => None,
        }
    }
}

/// Cola ordenada con cursor de reproducción.
///
/// `tracks[..position]` ya sonó (el actual es `tracks[position - 1]`),
/// `tracks[position..]` está pendiente. Invariante: `position <= len`.
#[derive(Debug)]
pub struct Queue {
    tracks: Vec<Track>,
    position: usize,
    repeat: LoopType,
    queue_type: QueueType,
    allow_duplicates: bool,
    max_size: usize,
}

impl Queue {
    pub fn new(queue_type: QueueType, allow_duplicates: bool, max_size: usize) -> Self {
        Self {
            tracks: Vec::new(),
            position: 0,
            repeat: LoopType::Off,
            queue_type,
            allow_duplicates,
            max_size,
        }
    }

    /// Cantidad de tracks pendientes (sin contar el actual).
    pub fn len(&self) -> usize {
        self.tracks.len() - self.position
    }

    /// `true` si no queda nada pendiente por reproducir.
    pub fn is_empty(&self) -> bool {
        self.position >= self.tracks.len()
    }

    /// Total de tracks, historial incluido.
    pub fn count(&self) -> usize {
        self.tracks.len()
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn repeat(&self) -> LoopType {
        self.repeat
    }

    pub fn set_repeat(&mut self, mode: LoopType) {
        self.repeat = mode;
    }

    /// Avanza el modo de repetición un paso: Off → Track → Queue → Off.
    pub fn cycle_repeat(&mut self) -> LoopType {
        self.repeat = self.repeat.peek_next();
        self.repeat
    }

    /// Agrega un track al final (o intercalado si la cola es justa).
    ///
    /// Devuelve la posición 1-based en la que sonará, contando desde el
    /// próximo avance.
    pub fn put(&mut self, track: Track) -> Result<usize> {
        if self.tracks.len() >= self.max_size {
            return Err(Error::QueueFull(self.max_size));
        }
        if !self.allow_duplicates && self.contains_upcoming(&track) {
            return Err(Error::Duplicate(track.info.title.clone()));
        }

        let index = match self.queue_type {
            QueueType::Standard => self.tracks.len(),
            QueueType::Fair => self.fair_insert_index(track.requester),
        };
        self.tracks.insert(index, track);
        Ok(index - self.position + 1)
    }

    /// Inserta justo después del cursor: el próximo avance lo reproduce.
    pub fn put_at_front(&mut self, track: Track) -> Result<usize> {
        if self.tracks.len() >= self.max_size {
            return Err(Error::QueueFull(self.max_size));
        }
        if !self.allow_duplicates && self.contains_upcoming(&track) {
            return Err(Error::Duplicate(track.info.title.clone()));
        }
        self.tracks.insert(self.position, track);
        Ok(1)
    }

    /// Re-encola en el cursor sin pasar por los chequeos de duplicados.
    ///
    /// Uso interno del player para repetición de track.
    pub(crate) fn insert_at_cursor(&mut self, track: Track) {
        self.tracks.insert(self.position, track);
    }

    /// Candidato al próximo avance, sin mover el cursor.
    ///
    /// El cursor recién se confirma con [`Queue::confirm`] cuando el nodo
    /// reporta el inicio del track. En modo Queue una cola agotada vuelve
    /// a ofrecer el principio.
    pub fn next_pending(&self) -> Option<(usize, Track)> {
        if self.position < self.tracks.len() {
            return Some((self.position, self.tracks[self.position].clone()));
        }
        if self.repeat == LoopType::Queue && !self.tracks.is_empty() {
            debug!("🔁 Cola agotada en modo Queue, reiniciando cursor");
            return Some((0, self.tracks[0].clone()));
        }
        None
    }

    /// Confirma que el track en `index` empezó a sonar.
    pub fn confirm(&mut self, index: usize) {
        debug_assert!(index < self.tracks.len());
        self.position = index + 1;
    }

    /// Deja el cursor de forma que el próximo avance reproduzca el n-ésimo
    /// track pendiente. `n <= 1` equivale al avance normal.
    pub fn skip_to(&mut self, n: usize) {
        if n > 1 {
            self.position = (self.position + n - 1).min(self.tracks.len());
        }
    }

    /// Retrocede el cursor `n` posiciones dentro del historial.
    ///
    /// Fuera de rango recorta al track más viejo disponible. Sin historial
    /// es un no-op.
    pub fn back_to(&mut self, n: usize) {
        if self.position == 0 {
            return;
        }
        self.position = self.position.saturating_sub(n);
    }

    /// Elimina un índice, un rango inclusivo, o todo lo pedido por un
    /// miembro. Índices 1-based sobre la parte pendiente; una operación
    /// inválida no modifica nada.
    pub fn remove(
        &mut self,
        index1: usize,
        index2: Option<usize>,
        by_requester: Option<UserId>,
    ) -> Result<Vec<Track>> {
        if let Some(user) = by_requester {
            let mut removed = Vec::new();
            let mut i = self.position;
            while i < self.tracks.len() {
                if self.tracks[i].requester == user {
                    removed.push(self.tracks.remove(i));
                } else {
                    i += 1;
                }
            }
            info!("🗑️ Eliminadas {} canciones del usuario {}", removed.len(), user);
            return Ok(removed);
        }

        let upcoming = self.len();
        let end = index2.unwrap_or(index1);
        if index1 == 0 || index1 > end || end > upcoming {
            return Err(Error::OutOfRange {
                index: end.max(index1),
                len: upcoming,
            });
        }

        let start = self.position + index1 - 1;
        let removed: Vec<Track> = self.tracks.drain(start..self.position + end).collect();
        Ok(removed)
    }

    /// Mueve un track pendiente a otra posición pendiente (1-based).
    pub fn move_track(&mut self, from: usize, to: usize) -> Result<()> {
        let upcoming = self.len();
        if from == 0 || from > upcoming {
            return Err(Error::OutOfRange { index: from, len: upcoming });
        }
        if to == 0 || to > upcoming {
            return Err(Error::OutOfRange { index: to, len: upcoming });
        }
        if from != to {
            let track = self.tracks.remove(self.position + from - 1);
            self.tracks.insert(self.position + to - 1, track);
            debug!("📍 Track movido de posición {} a {}", from, to);
        }
        Ok(())
    }

    /// Mezcla la parte pedida sin tocar el track actual.
    pub fn shuffle(&mut self, scope: QueueScope) {
        let mut rng = rand::thread_rng();
        match scope {
            QueueScope::Queue => self.tracks[self.position..].shuffle(&mut rng),
            QueueScope::History => {
                let played = self.position.saturating_sub(1);
                self.tracks[..played].shuffle(&mut rng);
            }
        }
        info!("🔀 Cola mezclada ({:?})", scope);
    }

    /// Vacía la parte pedida; devuelve cuántos tracks se fueron.
    pub fn clear(&mut self, scope: QueueScope) -> usize {
        match scope {
            QueueScope::Queue => {
                let removed = self.len();
                self.tracks.truncate(self.position);
                removed
            }
            QueueScope::History => {
                let removed = self.position.saturating_sub(1);
                self.tracks.drain(..removed);
                self.position -= removed;
                removed
            }
        }
    }

    /// Copia instantánea para mostrar o exportar.
    pub fn tracks(&self, include_history: bool) -> Vec<Track> {
        if include_history {
            self.tracks.clone()
        } else {
            self.tracks[self.position..].to_vec()
        }
    }

    /// Tracks ya consumidos, el actual incluido.
    pub fn played(&self) -> &[Track] {
        &self.tracks[..self.position]
    }

    fn contains_upcoming(&self, track: &Track) -> bool {
        self.tracks[self.position..]
            .iter()
            .any(|t| t.encoded == track.encoded)
    }

    /// Punto de inserción justo: antes del primer track cuya ronda de
    /// turnos supere la del requester entrante.
    fn fair_insert_index(&self, requester: UserId) -> usize {
        let upcoming = &self.tracks[self.position..];
        let round = upcoming.iter().filter(|t| t.requester == requester).count();

        let mut rounds: HashMap<UserId, usize> = HashMap::new();
        for (i, track) in upcoming.iter().enumerate() {
            let seen = rounds.entry(track.requester).or_insert(0);
            if *seen > round {
                return self.position + i;
            }
            *seen += 1;
        }
        self.tracks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::track::TrackInfo;
    use pretty_assertions::assert_eq;

    fn track(id: &str, requester: u64) -> Track {
        let info = TrackInfo {
            title: format!("title-{id}"),
            author: "author".to_string(),
            length: 180_000,
            identifier: id.to_string(),
            is_stream: false,
            uri: Some(format!("https://example.com/{id}")),
            artwork_url: None,
            isrc: None,
            source_name: "youtube".to_string(),
            position: 0,
        };
        Track::from_info(info, UserId::new(requester))
    }

    fn queue() -> Queue {
        Queue::new(QueueType::Standard, true, 100)
    }

    fn ids(tracks: &[Track]) -> Vec<String> {
        tracks.iter().map(|t| t.info.identifier.clone()).collect()
    }

    #[test]
    fn put_reports_play_position() {
        let mut q = queue();
        assert_eq!(q.put(track("a", 1)).unwrap(), 1);
        assert_eq!(q.put(track("b", 1)).unwrap(), 2);

        // con "a" confirmado como actual, "c" queda segundo en la fila
        let (idx, _) = q.next_pending().unwrap();
        q.confirm(idx);
        assert_eq!(q.put(track("c", 1)).unwrap(), 2);
    }

    #[test]
    fn cursor_invariant_holds_over_mixed_operations() {
        let mut q = queue();
        for i in 0..5 {
            q.put(track(&format!("t{i}"), 1)).unwrap();
        }
        let check = |q: &Queue| assert!(q.position() <= q.count());

        let (idx, _) = q.next_pending().unwrap();
        q.confirm(idx);
        check(&q);
        q.skip_to(3);
        check(&q);
        q.back_to(10);
        check(&q);
        q.skip_to(100);
        check(&q);
        q.back_to(1);
        check(&q);
        q.remove(1, None, None).unwrap();
        check(&q);
    }

    #[test]
    fn duplicate_suppression_compares_by_identifier() {
        let mut q = Queue::new(QueueType::Standard, false, 100);
        q.put(track("same", 1)).unwrap();
        // mismo identifier, distinto requester: rechazado igual
        let err = q.put(track("same", 2)).unwrap_err();
        assert!(matches!(err, Error::Duplicate(_)));

        // una vez consumido ya no cuenta como pendiente
        let (idx, _) = q.next_pending().unwrap();
        q.confirm(idx);
        assert!(q.put(track("same", 2)).is_ok());
    }

    #[test]
    fn queue_full_is_rejected() {
        let mut q = Queue::new(QueueType::Standard, true, 2);
        q.put(track("a", 1)).unwrap();
        q.put(track("b", 1)).unwrap();
        assert!(matches!(q.put(track("c", 1)), Err(Error::QueueFull(2))));
    }

    #[test]
    fn at_front_plays_right_after_current() {
        // escenario: sonando A con [B, C] en fila, playnow de N
        let mut q = queue();
        q.put(track("a", 1)).unwrap();
        q.put(track("b", 1)).unwrap();
        q.put(track("c", 1)).unwrap();
        let (idx, _) = q.next_pending().unwrap();
        q.confirm(idx); // A es el actual

        assert_eq!(q.put_at_front(track("n", 2)).unwrap(), 1);
        assert_eq!(ids(&q.tracks(false)), vec!["n", "b", "c"]);
        assert_eq!(q.tracks(true)[0].info.identifier, "a");
    }

    #[test]
    fn skip_to_and_back_to_move_the_cursor() {
        let mut q = queue();
        for id in ["x", "y", "z"] {
            q.put(track(id, 1)).unwrap();
        }

        // arranca X
        let (idx, t) = q.next_pending().unwrap();
        assert_eq!(t.info.identifier, "x");
        assert_eq!(q.position(), 0);
        q.confirm(idx);
        assert_eq!(q.position(), 1);

        // avance normal: el siguiente es Y
        let (idx, t) = q.next_pending().unwrap();
        assert_eq!(t.info.identifier, "y");
        q.confirm(idx);

        // back(1) sonando Y: retrocede dos y el candidato vuelve a ser X
        q.back_to(2);
        let (_, t) = q.next_pending().unwrap();
        assert_eq!(t.info.identifier, "x");
    }

    #[test]
    fn back_to_on_fresh_queue_is_a_noop() {
        let mut q = queue();
        q.put(track("a", 1)).unwrap();
        q.back_to(3);
        assert_eq!(q.position(), 0);
    }

    #[test]
    fn remove_validates_range_and_is_all_or_nothing() {
        let mut q = queue();
        for id in ["a", "b", "c", "d"] {
            q.put(track(id, 1)).unwrap();
        }

        assert!(matches!(
            q.remove(2, Some(9), None),
            Err(Error::OutOfRange { .. })
        ));
        assert_eq!(q.len(), 4);

        let removed = q.remove(2, Some(3), None).unwrap();
        assert_eq!(ids(&removed), vec!["b", "c"]);
        assert_eq!(ids(&q.tracks(false)), vec!["a", "d"]);
    }

    #[test]
    fn remove_by_requester_takes_all_their_tracks() {
        let mut q = queue();
        q.put(track("a", 1)).unwrap();
        q.put(track("b", 2)).unwrap();
        q.put(track("c", 1)).unwrap();

        let removed = q.remove(1, None, Some(UserId::new(1))).unwrap();
        assert_eq!(removed.len(), 2);
        assert_eq!(ids(&q.tracks(false)), vec!["b"]);
    }

    #[test]
    fn clear_queue_is_idempotent() {
        let mut q = queue();
        q.put(track("a", 1)).unwrap();
        assert_eq!(q.clear(QueueScope::Queue), 1);
        assert_eq!(q.clear(QueueScope::Queue), 0);
    }

    #[test]
    fn clear_history_keeps_the_current_track() {
        let mut q = queue();
        for id in ["a", "b", "c"] {
            q.put(track(id, 1)).unwrap();
        }
        for _ in 0..2 {
            let (idx, _) = q.next_pending().unwrap();
            q.confirm(idx);
        }

        // B es el actual; solo A es historial
        assert_eq!(q.clear(QueueScope::History), 1);
        assert_eq!(q.position(), 1);
        assert_eq!(ids(&q.tracks(true)), vec!["b", "c"]);
    }

    #[test]
    fn shuffle_never_moves_the_current_track() {
        let mut q = queue();
        for i in 0..10 {
            q.put(track(&format!("t{i}"), 1)).unwrap();
        }
        let (idx, _) = q.next_pending().unwrap();
        q.confirm(idx);

        q.shuffle(QueueScope::Queue);
        assert_eq!(q.tracks(true)[0].info.identifier, "t0");
        assert_eq!(q.len(), 9);

        let mut upcoming = ids(&q.tracks(false));
        upcoming.sort();
        let mut expected: Vec<String> = (1..10).map(|i| format!("t{i}")).collect();
        expected.sort();
        assert_eq!(upcoming, expected);
    }

    #[test]
    fn repeat_cycles_back_to_off() {
        let mut q = queue();
        assert_eq!(q.repeat(), LoopType::Off);
        assert_eq!(q.repeat().peek_next(), LoopType::Track);
        q.cycle_repeat();
        q.cycle_repeat();
        assert_eq!(q.repeat(), LoopType::Queue);
        q.cycle_repeat();
        assert_eq!(q.repeat(), LoopType::Off);
    }

    #[test]
    fn queue_repeat_offers_the_start_when_exhausted() {
        let mut q = queue();
        q.put(track("a", 1)).unwrap();
        q.put(track("b", 1)).unwrap();
        q.set_repeat(LoopType::Queue);

        for _ in 0..2 {
            let (idx, _) = q.next_pending().unwrap();
            q.confirm(idx);
        }
        assert!(q.is_empty());

        let (idx, t) = q.next_pending().unwrap();
        assert_eq!(idx, 0);
        assert_eq!(t.info.identifier, "a");
        q.confirm(idx);
        assert_eq!(q.position(), 1);
    }

    #[test]
    fn fair_queue_interleaves_requesters() {
        let mut q = Queue::new(QueueType::Fair, true, 100);
        q.put(track("a1", 1)).unwrap();
        q.put(track("a2", 1)).unwrap();
        q.put(track("a3", 1)).unwrap();
        q.put(track("b1", 2)).unwrap();
        q.put(track("b2", 2)).unwrap();

        assert_eq!(ids(&q.tracks(false)), vec!["a1", "b1", "a2", "b2", "a3"]);
    }

    #[test]
    fn move_track_relocates_within_upcoming() {
        let mut q = queue();
        for id in ["a", "b", "c"] {
            q.put(track(id, 1)).unwrap();
        }
        q.move_track(3, 1).unwrap();
        assert_eq!(ids(&q.tracks(false)), vec!["c", "a", "b"]);
        assert!(matches!(q.move_track(5, 1), Err(Error::OutOfRange { .. })));
    }
}
