// The current race session shared by every connected player

use std::sync::Arc;

use serde::Serialize;

use crate::track::Track;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[repr(u8)]
pub enum GameMode {
    Casual = 0,
    Competitive = 1,
}

impl GameMode {
    pub fn from_u8(value: u8) -> Option<GameMode> {
        match value {
            0 => Some(GameMode::Casual),
            1 => Some(GameMode::Competitive),
            _ => None,
        }
    }

    pub fn from_name(name: &str) -> Option<GameMode> {
        match name.to_ascii_lowercase().as_str() {
            "casual" => Some(GameMode::Casual),
            "competitive" => Some(GameMode::Competitive),
            _ => None,
        }
    }
}

impl std::fmt::Display for GameMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GameMode::Casual => write!(f, "Casual"),
            GameMode::Competitive => write!(f, "Competitive"),
        }
    }
}

/// Exactly one of these is current. The id strictly increases across
/// switches; while `switching` is set no `NewSession` is outstanding.
#[derive(Debug, Clone)]
pub struct GameSession {
    pub session_id: u32,
    pub game_mode: GameMode,
    pub switching: bool,
    pub track: Arc<Track>,
    pub max_players: u16,
}

/// What a caller supplies when replacing the session; the id is managed by
/// the server.
#[derive(Clone)]
pub struct SessionConfig {
    pub game_mode: GameMode,
    pub switching: bool,
    pub track: Arc<Track>,
    pub max_players: u16,
}

/// Session fields exposed over the control API.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub session_id: u32,
    pub game_mode: GameMode,
    pub switching: bool,
    pub max_players: u16,
}
