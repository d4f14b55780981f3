// Loading the host configuration
// A file named on the command line must already exist; the per-user default
// location is seeded with a commented template on first run instead

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{info, warn};

use super::types::Config;

const TEMPLATE_HEADER: &str = "\
# polyhost configuration
#
# broker:  the invite/signaling broker this host registers with
# host:    session defaults advertised to joining players
# tracks:  directory holding one exported track string per file
# control: bind address of the local control API

";

/// Per-user location used when no `--config` flag is given.
pub fn default_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("polyhost")
        .join("config.toml")
}

/// Resolve the effective configuration. An unreadable or missing explicit
/// file aborts startup; an unparsable file falls back to defaults so a
/// half-edited config never bricks a running deployment.
pub fn load(explicit: Option<&Path>) -> Result<Config> {
    let path = explicit.map(Path::to_path_buf).unwrap_or_else(default_path);

    match fs::read_to_string(&path) {
        Ok(contents) => match toml::from_str(&contents) {
            Ok(config) => Ok(config),
            Err(err) => {
                warn!("config file {} is invalid: {err}", path.display());
                warn!("falling back to defaults");
                Ok(Config::default())
            }
        },
        Err(err) if err.kind() == ErrorKind::NotFound && explicit.is_none() => {
            let config = Config::default();
            write_template(&path, &config)
                .with_context(|| format!("failed to seed {}", path.display()))?;
            info!("Wrote default config to {}", path.display());
            Ok(config)
        }
        Err(err) => Err(err)
            .with_context(|| format!("failed to read config file {}", path.display())),
    }
}

fn write_template(path: &Path, config: &Config) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let body = toml::to_string_pretty(config)?;
    fs::write(path, format!("{TEMPLATE_HEADER}{body}"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_survive_toml_round_trip() {
        let config = Config::default();
        let parsed: Config = toml::from_str(&toml::to_string_pretty(&config).unwrap()).unwrap();

        assert_eq!(parsed.broker.websocket_url, config.broker.websocket_url);
        assert_eq!(parsed.broker.version, config.broker.version);
        assert_eq!(parsed.host.max_players, config.host.max_players);
        assert_eq!(parsed.tracks.directory, config.tracks.directory);
        assert_eq!(parsed.control.bind, config.control.bind);
    }

    #[test]
    fn partial_file_keeps_other_sections_at_defaults() {
        let partial = r#"
            [host]
            max_players = 16
            game_mode = "casual"
            accept_vanilla_clients = false
            mods = []
        "#;

        let config: Config = toml::from_str(partial).unwrap();

        assert_eq!(config.host.max_players, 16);
        assert_eq!(config.host.game_mode, "casual");
        assert!(config.broker.websocket_url.starts_with("wss://"));
        assert_eq!(config.control.bind, "127.0.0.1:9090");
    }

    #[test]
    fn seeded_template_loads_back() {
        let path = std::env::temp_dir().join(format!(
            "polyhost-config-test-{}.toml",
            std::process::id()
        ));
        write_template(&path, &Config::default()).unwrap();

        let loaded = load(Some(&path)).unwrap();
        assert_eq!(
            loaded.broker.ice_fetch_url,
            Config::default().broker.ice_fetch_url
        );

        fs::remove_file(&path).ok();
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        let path = std::env::temp_dir().join(format!(
            "polyhost-no-such-config-{}.toml",
            std::process::id()
        ));
        fs::remove_file(&path).ok();
        assert!(load(Some(&path)).is_err());
    }

    #[test]
    fn version_appears_in_ice_url() {
        let config = Config::default();
        assert!(config
            .broker
            .ice_fetch_url
            .ends_with(&format!("version={}", config.broker.version)));
    }
}
