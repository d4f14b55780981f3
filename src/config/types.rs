// Host configuration types
// All settings with defaults matching the live broker deployment

use serde::{Deserialize, Serialize};

const POLY_VERSION: &str = "0.6.0-beta1";
const API_VERSION: &str = "v6";

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub host: HostConfig,
    #[serde(default)]
    pub tracks: TracksConfig,
    #[serde(default)]
    pub control: ControlConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            broker: BrokerConfig::default(),
            host: HostConfig::default(),
            tracks: TracksConfig::default(),
            control: ControlConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BrokerConfig {
    // Invite/signaling broker WebSocket URL
    pub websocket_url: String,

    // HTTPS endpoint returning the ICE server list, fetched once at startup
    pub ice_fetch_url: String,

    // Protocol version sent with every broker frame
    pub version: String,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            websocket_url: format!("wss://vps.kodub.com:43274/{API_VERSION}/multiplayer/host"),
            ice_fetch_url: format!(
                "https://vps.kodub.com:43274/{API_VERSION}/iceServers?version={POLY_VERSION}"
            ),
            version: POLY_VERSION.to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HostConfig {
    // Player cap advertised in NewSession packets
    pub max_players: u16,

    // "casual" or "competitive"
    pub game_mode: String,

    // Whether unmodded clients may join
    pub accept_vanilla_clients: bool,

    // Mods the host runs, echoed in acceptJoin
    pub mods: Vec<String>,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            max_players: 200,
            game_mode: "competitive".to_string(),
            accept_vanilla_clients: true,
            mods: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TracksConfig {
    // Directory holding one exported track string per file
    pub directory: String,
}

impl Default for TracksConfig {
    fn default() -> Self {
        Self {
            directory: "tracks/official".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ControlConfig {
    // Bind address of the local control API
    pub bind: String,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:9090".to_string(),
        }
    }
}
