// Disk-backed track loading
// One export string per file; the file stem becomes the track's library name

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use super::Track;

/// The set of tracks available to the host, keyed by file stem. Decode
/// failures are fatal: a host with a broken track directory should not come
/// up at all.
pub struct TrackLibrary {
    tracks: BTreeMap<String, Arc<Track>>,
    names: Vec<String>,
}

impl TrackLibrary {
    pub fn load(dir: &Path) -> Result<TrackLibrary> {
        let entries = fs::read_dir(dir)
            .with_context(|| format!("could not read tracks directory {}", dir.display()))?;

        let mut tracks = BTreeMap::new();
        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            if path.is_dir() {
                continue;
            }

            let name = path
                .file_stem()
                .map(|stem| stem.to_string_lossy().into_owned())
                .unwrap_or_else(|| entry.file_name().to_string_lossy().into_owned());

            let raw = fs::read_to_string(&path)
                .with_context(|| format!("failed to read track file {}", path.display()))?;
            let track = Track::decode(raw.trim())
                .with_context(|| format!("failed to decode track {}", path.display()))?;

            info!("Loaded track {} ({})", name, track.id());
            tracks.insert(name, Arc::new(track));
        }

        let names = tracks.keys().cloned().collect();
        Ok(TrackLibrary { tracks, names })
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn get(&self, name: &str) -> Option<Arc<Track>> {
        self.tracks.get(name).cloned()
    }

    /// First track in name order, used as the default session track.
    pub fn first(&self) -> Option<Arc<Track>> {
        self.names.first().and_then(|name| self.get(name))
    }

    /// Reverse lookup for status reporting.
    pub fn name_of(&self, track: &Arc<Track>) -> Option<&str> {
        self.tracks
            .iter()
            .find(|(_, candidate)| Arc::ptr_eq(candidate, track))
            .map(|(name, _)| name.as_str())
    }
}
