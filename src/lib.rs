//! # Open Lava
//!
//! Núcleo de reproducción para bots de música de Discord que delegan el
//! audio en un nodo Lavalink. Acá viven el modelo de cola, el cliente del
//! nodo, la máquina de estados del player y la persistencia de sesiones; la
//! capa de comandos/UI del bot consume este crate y no al revés.
//!
//! ## Uso
//!
//! ```rust,no_run
//! use open_lava::{Config, NodePool, PlayerManager, PlayerRegistry, SessionManager};
//! use std::sync::Arc;
//!
//! # async fn example(
//! #     roster: Arc<dyn open_lava::VoiceRoster>,
//! #     settings: Arc<dyn open_lava::settings::SettingsStore>,
//! #     bot_user: serenity::model::id::UserId,
//! # ) -> open_lava::Result<()> {
//! let config = Config::load()?;
//! let registry = Arc::new(PlayerRegistry::new());
//! let pool = Arc::new(NodePool::new(
//!     config.nodes.clone(),
//!     bot_user,
//!     Arc::clone(&registry),
//!     config.request_timeout,
//! )?);
//! pool.start();
//!
//! let manager = Arc::new(PlayerManager::new(registry, pool, roster, settings));
//! let sessions = Arc::new(
//!     SessionManager::new(
//!         &config.data_dir,
//!         config.session_save_interval,
//!         config.session_timeout,
//!     )
//!     .await?,
//! );
//!
//! // restaurar primero, recién después arranca el loop de guardado
//! sessions.restore_all(&manager).await;
//! sessions.start_save_loop(Arc::clone(manager.registry()));
//! # Ok(())
//! # }
//! ```

pub mod audio;
pub mod config;
pub mod error;
pub mod events;
pub mod node;
pub mod session;
pub mod settings;

pub use crate::audio::filters::{Filter, FilterChain};
pub use crate::audio::manager::{PlayerManager, PlayerRegistry, VoiceMember, VoiceRoster};
pub use crate::audio::player::{Phase, Player, PlayerView, VoteOutcome};
pub use crate::audio::queue::{LoopType, Queue, QueueScope, QueueType};
pub use crate::audio::track::{decode, encode, LoadedTracks, Playlist, Track, TrackInfo};
pub use crate::config::Config;
pub use crate::error::{Error, Result};
pub use crate::events::PlayerEvent;
pub use crate::node::pool::NodePool;
pub use crate::node::protocol::VoiceServer;
pub use crate::node::{NodeConfig, NodeLink};
pub use crate::session::SessionManager;
pub use crate::settings::{GuildSettings, JsonSettingsStore};
