use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Command;

use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::models::TrackRef;

/// One line of `yt-dlp --flat-playlist -j` output. Only the fields we map
/// onto a track.
#[derive(Deserialize)]
struct PlaylistEntry {
    id: String,
    url: String,
    title: Option<String>,
    #[serde(default)]
    duration: Option<f64>,
    #[serde(default)]
    channel: Option<String>,
    #[serde(default)]
    uploader: Option<String>,
}

/// Expands a playlist URL into its tracks without resolving each entry.
pub fn tracks_from_playlist_url(url: &str) -> Result<Vec<TrackRef>> {
    info!("Expanding playlist {url}");

    let output = Command::new("yt-dlp")
        .arg("-j")
        .arg("--flat-playlist")
        .arg(url)
        .output()
        .map_err(|e| Error::Backend(format!("yt-dlp failed to start: {e}")))?;

    let stdout = String::from_utf8(output.stdout)
        .map_err(|_| Error::Backend("yt-dlp produced invalid output".to_string()))?;

    if stdout.is_empty() {
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        return Err(Error::Backend(format!("playlist expansion failed: {stderr}")));
    }

    let lines: Vec<&str> = stdout.lines().filter(|l| !l.trim().is_empty()).collect();
    let tracks: Vec<TrackRef> = lines
        .iter()
        .filter_map(|line| {
            let entry: PlaylistEntry = serde_json::from_str(line).ok()?;
            Some(TrackRef {
                id: entry.id,
                title: entry.title.unwrap_or_else(|| "UNKNOWN TRACK".to_string()),
                author: entry
                    .channel
                    .or(entry.uploader)
                    .unwrap_or_default(),
                duration_ms: entry
                    .duration
                    .map(|secs| (secs * 1000.0) as u64)
                    .unwrap_or(0),
                source_uri: entry.url,
                is_local_file: false,
            })
        })
        .collect();

    if tracks.len() < lines.len() {
        warn!(
            "Skipped {} playlist entries that failed to parse",
            lines.len() - tracks.len()
        );
    }

    Ok(tracks)
}

type UserPlaylists = HashMap<String, Vec<TrackRef>>;

/// Named per-user playlists, persisted as json next to the process.
pub struct PlaylistStore {
    path: PathBuf,
    playlists: Mutex<HashMap<String, UserPlaylists>>,
}

impl PlaylistStore {
    pub fn load(path: PathBuf) -> Self {
        let playlists = read_store(&path);
        PlaylistStore {
            path,
            playlists: Mutex::new(playlists),
        }
    }

    pub async fn save_playlist(
        &self,
        user_id: u64,
        name: &str,
        tracks: Vec<TrackRef>,
    ) -> Result<()> {
        if tracks.is_empty() {
            return Err(Error::InvalidInput(
                "there are no songs to save".to_string(),
            ));
        }
        let mut playlists = self.playlists.lock().await;
        playlists
            .entry(user_id.to_string())
            .or_default()
            .insert(name.to_string(), tracks);
        self.persist(&playlists)
    }

    pub async fn playlist_names(&self, user_id: u64) -> Vec<String> {
        let playlists = self.playlists.lock().await;
        let mut names: Vec<String> = playlists
            .get(&user_id.to_string())
            .map(|user| user.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    pub async fn get(&self, user_id: u64, name: &str) -> Option<Vec<TrackRef>> {
        let playlists = self.playlists.lock().await;
        playlists
            .get(&user_id.to_string())
            .and_then(|user| user.get(name))
            .cloned()
    }

    /// Returns false when the user has no playlist by that name.
    pub async fn delete(&self, user_id: u64, name: &str) -> Result<bool> {
        let mut playlists = self.playlists.lock().await;
        let removed = playlists
            .get_mut(&user_id.to_string())
            .and_then(|user| user.remove(name))
            .is_some();
        if removed {
            self.persist(&playlists)?;
        }
        Ok(removed)
    }

    fn persist(&self, playlists: &HashMap<String, UserPlaylists>) -> Result<()> {
        let raw = serde_json::to_string(playlists)?;
        std::fs::write(&self.path, raw)?;
        Ok(())
    }
}

fn read_store(path: &Path) -> HashMap<String, UserPlaylists> {
    if !path.exists() {
        return HashMap::new();
    }
    match std::fs::read_to_string(path)
        .map_err(Error::from)
        .and_then(|raw| serde_json::from_str(&raw).map_err(Error::from))
    {
        Ok(playlists) => playlists,
        Err(e) => {
            warn!("Could not load playlist store {}: {e}", path.display());
            HashMap::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::track;

    #[tokio::test]
    async fn playlists_round_trip_through_the_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("playlists.json");

        {
            let store = PlaylistStore::load(path.clone());
            store
                .save_playlist(7, "mix", vec![track("a"), track("b")])
                .await
                .unwrap();
            store
                .save_playlist(7, "other", vec![track("c")])
                .await
                .unwrap();
            store
                .save_playlist(8, "mix", vec![track("d")])
                .await
                .unwrap();
        }

        let reloaded = PlaylistStore::load(path);
        assert_eq!(reloaded.playlist_names(7).await, ["mix", "other"]);
        let mix = reloaded.get(7, "mix").await.unwrap();
        assert_eq!(
            mix.iter().map(|t| t.id.as_str()).collect::<Vec<_>>(),
            ["a", "b"]
        );
        // Playlists are scoped per user.
        assert_eq!(reloaded.get(8, "mix").await.unwrap().len(), 1);
        assert!(reloaded.get(8, "other").await.is_none());
    }

    #[tokio::test]
    async fn delete_reports_whether_a_playlist_existed() {
        let dir = tempfile::tempdir().unwrap();
        let store = PlaylistStore::load(dir.path().join("playlists.json"));
        store.save_playlist(7, "mix", vec![track("a")]).await.unwrap();

        assert!(store.delete(7, "mix").await.unwrap());
        assert!(!store.delete(7, "mix").await.unwrap());
        assert!(store.get(7, "mix").await.is_none());
    }

    #[tokio::test]
    async fn empty_playlists_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = PlaylistStore::load(dir.path().join("playlists.json"));
        assert!(matches!(
            store.save_playlist(7, "mix", vec![]).await,
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn playlist_entries_parse_from_flat_json() {
        let line = r#"{"id":"abc123","url":"https://www.youtube.com/watch?v=abc123","title":"A Song","duration":213.0,"channel":"Some Channel"}"#;
        let entry: PlaylistEntry = serde_json::from_str(line).unwrap();
        assert_eq!(entry.id, "abc123");
        assert_eq!(entry.duration, Some(213.0));
    }
}
