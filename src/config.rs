use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::node::NodeConfig;

/// Configuración del núcleo, cargada de variables de entorno.
#[derive(Debug, Clone)]
pub struct Config {
    /// Nodos de audio disponibles para el pool.
    pub nodes: Vec<NodeConfig>,

    // Paths
    pub data_dir: PathBuf,

    // Timeouts
    pub request_timeout: Duration,
    pub session_save_interval: Duration,
    pub session_timeout: Duration,
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parse<T: std::str::FromStr>(key: &str, value: String) -> Result<T> {
    value
        .parse()
        .map_err(|_| Error::Config(format!("{key} ilegible: {value}")))
}

impl Config {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        // Un nodo por variables sueltas, o varios vía LAVALINK_NODES (JSON)
        let nodes = match std::env::var("LAVALINK_NODES") {
            Ok(raw) => serde_json::from_str::<Vec<NodeConfig>>(&raw)
                .map_err(|e| Error::Config(format!("LAVALINK_NODES ilegible: {e}")))?,
            Err(_) => vec![NodeConfig {
                identifier: env_or("LAVALINK_IDENTIFIER", "main"),
                host: env_or("LAVALINK_HOST", "localhost"),
                port: parse("LAVALINK_PORT", env_or("LAVALINK_PORT", "2333"))?,
                password: env_or("LAVALINK_PASSWORD", "youshallnotpass"),
                secure: parse("LAVALINK_SECURE", env_or("LAVALINK_SECURE", "false"))?,
            }],
        };

        let config = Self {
            nodes,
            data_dir: env_or("DATA_DIR", "/app/data").into(),
            request_timeout: Duration::from_secs(parse(
                "REQUEST_TIMEOUT",
                env_or("REQUEST_TIMEOUT", "10"),
            )?),
            session_save_interval: Duration::from_secs(parse(
                "SESSION_SAVE_INTERVAL",
                env_or("SESSION_SAVE_INTERVAL", "5"),
            )?),
            session_timeout: Duration::from_secs(parse(
                "SESSION_TIMEOUT",
                env_or("SESSION_TIMEOUT", "900"),
            )?),
        };

        config.validate()?;
        Ok(config)
    }

    /// Chequeos de sanidad antes de arrancar.
    pub fn validate(&self) -> Result<()> {
        if self.nodes.is_empty() {
            return Err(Error::Config("se necesita al menos un nodo de audio".into()));
        }
        for node in &self.nodes {
            if node.identifier.is_empty() || node.host.is_empty() {
                return Err(Error::Config("nodo con identifier u host vacío".into()));
            }
            url::Url::parse(&format!("http://{}:{}/", node.host, node.port))
                .map_err(|e| Error::Config(format!("endpoint inválido para {}: {e}", node.identifier)))?;
        }
        if self.request_timeout.is_zero() {
            return Err(Error::Config("REQUEST_TIMEOUT tiene que ser mayor a cero".into()));
        }
        if self.session_save_interval.is_zero() {
            return Err(Error::Config(
                "SESSION_SAVE_INTERVAL tiene que ser mayor a cero".into(),
            ));
        }
        Ok(())
    }

    /// Resumen apto para logs, sin credenciales.
    pub fn summary(&self) -> String {
        format!(
            "Config: {} nodo(s) [{}], data en {}, timeout {}s, sesiones cada {}s (ttl {}s)",
            self.nodes.len(),
            self.nodes
                .iter()
                .map(|n| n.identifier.as_str())
                .collect::<Vec<_>>()
                .join(", "),
            self.data_dir.display(),
            self.request_timeout.as_secs(),
            self.session_save_interval.as_secs(),
            self.session_timeout.as_secs(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> Config {
        Config {
            nodes: vec![NodeConfig {
                identifier: "main".to_string(),
                host: "localhost".to_string(),
                port: 2333,
                password: "pass".to_string(),
                secure: false,
            }],
            data_dir: "/tmp/data".into(),
            request_timeout: Duration::from_secs(10),
            session_save_interval: Duration::from_secs(5),
            session_timeout: Duration::from_secs(900),
        }
    }

    #[test]
    fn valid_config_passes() {
        assert!(base_config().validate().is_ok());
        assert!(base_config().summary().contains("main"));
    }

    #[test]
    fn empty_node_list_is_rejected() {
        let mut config = base_config();
        config.nodes.clear();
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn zero_timeouts_are_rejected() {
        let mut config = base_config();
        config.request_timeout = Duration::ZERO;
        assert!(config.validate().is_err());
    }

    #[test]
    fn node_list_parses_from_json() {
        let raw = r#"[
            { "identifier": "a", "host": "n1.local", "port": 2333, "password": "x" },
            { "identifier": "b", "host": "n2.local", "port": 2444, "password": "y", "secure": true }
        ]"#;
        let nodes: Vec<NodeConfig> = serde_json::from_str(raw).unwrap();
        assert_eq!(nodes.len(), 2);
        assert!(!nodes[0].secure);
        assert!(nodes[1].secure);
    }
}
