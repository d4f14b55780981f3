// Host configuration: TOML file plus command-line overrides

pub mod loader;
pub mod types;

pub use loader::{default_path, load};
pub use types::{BrokerConfig, Config, ControlConfig, HostConfig, TracksConfig};
