//! Client-Konfiguration
//!
//! Standardwerte können über Umgebungsvariablen überschrieben werden
//! (analog zu `SIGNALING_URL` im Desktop-Client).

use std::time::Duration;

// ============================================================================
// CONSTANTS
// ============================================================================

/// Standard-Endpunkt des Chat-Servers
pub const DEFAULT_SERVER_URL: &str = "ws://localhost:8765/ws";

/// Standard STUN Server (Google, kostenlos)
pub const DEFAULT_ICE_SERVERS: &[&str] = &[
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
    "stun:stun2.l.google.com:19302",
];

const ENV_SERVER_URL: &str = "DECENTRA_SERVER_URL";
const ENV_CONNECT_TIMEOUT: &str = "DECENTRA_CONNECT_TIMEOUT_SECS";
const ENV_KEEPALIVE: &str = "DECENTRA_KEEPALIVE_SECS";
const ENV_OFFER_TIMEOUT: &str = "DECENTRA_OFFER_TIMEOUT_SECS";
const ENV_ICE_SERVERS: &str = "DECENTRA_ICE_SERVERS";

// ============================================================================
// CLIENT CONFIG
// ============================================================================

/// Laufzeit-Konfiguration des Clients
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// WebSocket-Endpunkt (ws:// oder wss://)
    pub server_url: String,

    /// Maximale Dauer eines Verbindungsaufbaus
    pub connect_timeout: Duration,

    /// Intervall für WebSocket-Pings, `None` deaktiviert Keep-Alive
    pub keepalive_interval: Option<Duration>,

    /// Wie lange ein Offer auf ein Answer wartet, `None` wartet unbegrenzt
    pub offer_timeout: Option<Duration>,

    /// STUN/TURN URLs für neue Peer Connections
    pub ice_servers: Vec<String>,

    /// Kapazität des Call-Event-Kanals
    pub event_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: DEFAULT_SERVER_URL.to_string(),
            connect_timeout: Duration::from_secs(10),
            keepalive_interval: Some(Duration::from_secs(25)),
            offer_timeout: Some(Duration::from_secs(30)),
            ice_servers: DEFAULT_ICE_SERVERS.iter().map(|s| s.to_string()).collect(),
            event_capacity: 256,
        }
    }
}

impl ClientConfig {
    /// Liest die Konfiguration aus der Prozess-Umgebung
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Baut die Konfiguration aus einer beliebigen Key-Value-Quelle
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(url) = lookup(ENV_SERVER_URL).filter(|u| !u.trim().is_empty()) {
            config.server_url = url.trim().to_string();
        }

        if let Some(secs) = parse_secs(&lookup, ENV_CONNECT_TIMEOUT) {
            if secs > 0 {
                config.connect_timeout = Duration::from_secs(secs);
            } else {
                tracing::warn!("{} must be positive, keeping default", ENV_CONNECT_TIMEOUT);
            }
        }

        if let Some(secs) = parse_secs(&lookup, ENV_KEEPALIVE) {
            config.keepalive_interval = (secs > 0).then(|| Duration::from_secs(secs));
        }

        if let Some(secs) = parse_secs(&lookup, ENV_OFFER_TIMEOUT) {
            config.offer_timeout = (secs > 0).then(|| Duration::from_secs(secs));
        }

        if let Some(list) = lookup(ENV_ICE_SERVERS) {
            let servers: Vec<String> = list
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
            if !servers.is_empty() {
                config.ice_servers = servers;
            }
        }

        config
    }
}

fn parse_secs<F>(lookup: &F, key: &str) -> Option<u64>
where
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(key)?;
    match raw.trim().parse::<u64>() {
        Ok(secs) => Some(secs),
        Err(e) => {
            tracing::warn!("Ignoring invalid {}='{}': {}", key, raw, e);
            None
        }
    }
}
