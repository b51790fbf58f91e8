use serde_json::{json, Map, Value};
use tracing::debug;

use crate::error::{Error, Result};

/// Efecto de audio soportado por el nodo.
///
/// Conjunto cerrado: la capa de configuración construye por nombre vía
/// [`Filter::from_name`], nunca con tags dinámicos.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    /// Bandas (0-14) con ganancia -0.25..=1.0.
    Equalizer { bands: Vec<(u8, f32)> },
    Karaoke {
        level: f32,
        mono_level: f32,
        filter_band: f32,
        filter_width: f32,
    },
    Timescale { speed: f32, pitch: f32, rate: f32 },
    Tremolo { frequency: f32, depth: f32 },
    Vibrato { frequency: f32, depth: f32 },
    Rotation { hertz: f32 },
    Distortion {
        sin_offset: f32,
        sin_scale: f32,
        cos_offset: f32,
        cos_scale: f32,
        tan_offset: f32,
        tan_scale: f32,
        offset: f32,
        scale: f32,
    },
    ChannelMix {
        left_to_left: f32,
        left_to_right: f32,
        right_to_left: f32,
        right_to_right: f32,
    },
    LowPass { smoothing: f32 },
}

impl Filter {
    /// Ecualizador validado banda por banda.
    pub fn equalizer(bands: Vec<(u8, f32)>) -> Result<Self> {
        for (band, gain) in &bands {
            if *band > 14 {
                return Err(Error::FilterArgument(format!("banda inválida: {band}")));
            }
            if !(-0.25..=1.0).contains(gain) {
                return Err(Error::FilterArgument(format!("ganancia inválida: {gain}")));
            }
        }
        Ok(Filter::Equalizer { bands })
    }

    pub fn timescale(speed: f32, pitch: f32, rate: f32) -> Result<Self> {
        if speed <= 0.0 || pitch <= 0.0 || rate <= 0.0 {
            return Err(Error::FilterArgument(
                "timescale requiere valores mayores a cero".into(),
            ));
        }
        Ok(Filter::Timescale { speed, pitch, rate })
    }

    pub fn tremolo(frequency: f32, depth: f32) -> Result<Self> {
        if frequency <= 0.0 || !(0.0..=1.0).contains(&depth) || depth == 0.0 {
            return Err(Error::FilterArgument(
                "tremolo requiere frequency > 0 y depth en (0, 1]".into(),
            ));
        }
        Ok(Filter::Tremolo { frequency, depth })
    }

    pub fn vibrato(frequency: f32, depth: f32) -> Result<Self> {
        if !(0.0..=14.0).contains(&frequency) || frequency == 0.0 || !(0.0..=1.0).contains(&depth) || depth == 0.0 {
            return Err(Error::FilterArgument(
                "vibrato requiere frequency en (0, 14] y depth en (0, 1]".into(),
            ));
        }
        Ok(Filter::Vibrato { frequency, depth })
    }

    pub fn rotation(hertz: f32) -> Result<Self> {
        if hertz < 0.0 {
            return Err(Error::FilterArgument("rotation no admite hertz negativos".into()));
        }
        Ok(Filter::Rotation { hertz })
    }

    pub fn low_pass(smoothing: f32) -> Result<Self> {
        if smoothing <= 1.0 {
            return Err(Error::FilterArgument("lowpass requiere smoothing > 1".into()));
        }
        Ok(Filter::LowPass { smoothing })
    }

    pub fn karaoke() -> Self {
        Filter::Karaoke {
            level: 1.0,
            mono_level: 1.0,
            filter_band: 220.0,
            filter_width: 100.0,
        }
    }

    /// Velocidad y pitch arriba: el clásico nightcore.
    pub fn nightcore() -> Self {
        Filter::Timescale { speed: 1.25, pitch: 1.3, rate: 1.0 }
    }

    pub fn vaporwave() -> Self {
        Filter::Timescale { speed: 0.8, pitch: 0.8, rate: 1.0 }
    }

    /// Paneo estéreo lento, el efecto "8D".
    pub fn eight_d() -> Self {
        Filter::Rotation { hertz: 0.2 }
    }

    pub fn bass_boost() -> Self {
        Filter::Equalizer {
            bands: vec![
                (0, -0.075),
                (1, 0.125),
                (2, 0.125),
                (3, 0.1),
                (4, 0.1),
                (5, 0.05),
                (6, 0.075),
                (12, 0.125),
                (13, 0.15),
                (14, 0.05),
            ],
        }
    }

    /// Construcción por nombre para la capa de configuración externa.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "nightcore" => Some(Self::nightcore()),
            "vaporwave" => Some(Self::vaporwave()),
            "8d" | "eightd" => Some(Self::eight_d()),
            "karaoke" => Some(Self::karaoke()),
            "bassboost" | "boost" => Some(Self::bass_boost()),
            "tremolo" => Self::tremolo(2.0, 0.5).ok(),
            "vibrato" => Self::vibrato(2.0, 0.5).ok(),
            "rotation" => Self::rotation(0.2).ok(),
            "lowpass" => Self::low_pass(20.0).ok(),
            "distortion" => Some(Filter::Distortion {
                sin_offset: 0.0,
                sin_scale: 1.0,
                cos_offset: 0.0,
                cos_scale: 1.0,
                tan_offset: 0.0,
                tan_scale: 1.0,
                offset: 0.0,
                scale: 1.0,
            }),
            _ => None,
        }
    }

    /// Clave del efecto dentro del objeto `filters` del protocolo.
    pub fn kind(&self) -> &'static str {
        match self {
            Filter::Equalizer { .. } => "equalizer",
            Filter::Karaoke { .. } => "karaoke",
            Filter::Timescale { .. } => "timescale",
            Filter::Tremolo { .. } => "tremolo",
            Filter::Vibrato { .. } => "vibrato",
            Filter::Rotation { .. } => "rotation",
            Filter::Distortion { .. } => "distortion",
            Filter::ChannelMix { .. } => "channelMix",
            Filter::LowPass { .. } => "lowPass",
        }
    }

    fn payload(&self) -> Value {
        match self {
            Filter::Equalizer { bands } => Value::Array(
                bands
                    .iter()
                    .map(|(band, gain)| json!({ "band": band, "gain": gain }))
                    .collect(),
            ),
            Filter::Karaoke { level, mono_level, filter_band, filter_width } => json!({
                "level": level,
                "monoLevel": mono_level,
                "filterBand": filter_band,
                "filterWidth": filter_width,
            }),
            Filter::Timescale { speed, pitch, rate } => {
                json!({ "speed": speed, "pitch": pitch, "rate": rate })
            }
            Filter::Tremolo { frequency, depth } => {
                json!({ "frequency": frequency, "depth": depth })
            }
            Filter::Vibrato { frequency, depth } => {
                json!({ "frequency": frequency, "depth": depth })
            }
            Filter::Rotation { hertz } => json!({ "rotationHz": hertz }),
            Filter::Distortion {
                sin_offset,
                sin_scale,
                cos_offset,
                cos_scale,
                tan_offset,
                tan_scale,
                offset,
                scale,
            } => json!({
                "sinOffset": sin_offset,
                "sinScale": sin_scale,
                "cosOffset": cos_offset,
                "cosScale": cos_scale,
                "tanOffset": tan_offset,
                "tanScale": tan_scale,
                "offset": offset,
                "scale": scale,
            }),
            Filter::ChannelMix {
                left_to_left,
                left_to_right,
                right_to_left,
                right_to_right,
            } => json!({
                "leftToLeft": left_to_left,
                "leftToRight": left_to_right,
                "rightToLeft": right_to_left,
                "rightToRight": right_to_right,
            }),
            Filter::LowPass { smoothing } => json!({ "smoothing": smoothing }),
        }
    }
}

/// Cadena ordenada de filtros, un efecto por tag.
///
/// El protocolo no aplica filtros incrementales: cada cambio re-envía la
/// cadena completa combinada en un solo objeto. Tags distintos con el mismo
/// kind colisionan en el wire; gana el último de la cadena.
#[derive(Debug, Default)]
pub struct FilterChain {
    entries: Vec<(String, Filter)>,
}

impl FilterChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// La cadena de "hall": rotación + lowpass + vibrato bajo tres tags.
    pub fn hall() -> Vec<(String, Filter)> {
        vec![
            ("hall_rotation".to_string(), Filter::Rotation { hertz: 0.1 }),
            ("hall_lowpass".to_string(), Filter::LowPass { smoothing: 50.0 }),
            ("hall_vibrato".to_string(), Filter::Vibrato { frequency: 0.5, depth: 0.1 }),
        ]
    }

    pub fn add(&mut self, tag: &str, filter: Filter) -> Result<()> {
        if self.has(tag) {
            return Err(Error::FilterTagInUse(tag.to_string()));
        }
        debug!("🎛️ Filtro agregado: {} ({})", tag, filter.kind());
        self.entries.push((tag.to_string(), filter));
        Ok(())
    }

    pub fn remove(&mut self, tag: &str) -> Result<Filter> {
        match self.entries.iter().position(|(t, _)| t == tag) {
            Some(i) => Ok(self.entries.remove(i).1),
            None => Err(Error::FilterTagNotFound(tag.to_string())),
        }
    }

    /// Vacía la cadena; devuelve cuántos filtros había.
    pub fn reset(&mut self) -> usize {
        let count = self.entries.len();
        self.entries.clear();
        count
    }

    pub fn has(&self, tag: &str) -> bool {
        self.entries.iter().any(|(t, _)| t == tag)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn tags(&self) -> Vec<String> {
        self.entries.iter().map(|(t, _)| t.clone()).collect()
    }

    /// Objeto `filters` combinado listo para enviar al nodo.
    pub fn payload(&self) -> Value {
        let mut combined = Map::new();
        for (_, filter) in &self.entries {
            combined.insert(filter.kind().to_string(), filter.payload());
        }
        Value::Object(combined)
    }
}
