use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::models::NowPlayingSnapshot;

const TOKEN_URL: &str = "https://accounts.spotify.com/api/token";
const CURRENTLY_PLAYING_URL: &str = "https://api.spotify.com/v1/me/player/currently-playing";
const DEFAULT_TOKEN_LIFETIME_SECS: u64 = 3600;

/// The external streaming service as seen by the mirroring loop.
#[async_trait]
pub trait NowPlayingSource: Send + Sync {
    /// A usable access token for the user, refreshing if needed. `None` when
    /// the user never authorized or the grant can no longer be refreshed.
    async fn access_token(&self, user_id: u64) -> Result<Option<String>>;

    /// The user's current playback, `None` when nothing is playing on any
    /// device.
    async fn currently_playing(&self, user_id: u64) -> Result<Option<NowPlayingSnapshot>>;
}

#[derive(Clone, Serialize, Deserialize)]
struct TokenEntry {
    access_token: String,
    refresh_token: String,
    #[serde(default)]
    expires_at: u64,
}

impl TokenEntry {
    fn is_expired(&self, now: u64) -> bool {
        self.expires_at <= now
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
    #[serde(default)]
    refresh_token: Option<String>,
}

#[derive(Deserialize)]
struct CurrentlyPlayingPayload {
    item: Option<PlayableItem>,
    #[serde(default)]
    is_playing: bool,
    #[serde(default)]
    progress_ms: Option<u64>,
}

#[derive(Deserialize)]
struct PlayableItem {
    id: Option<String>,
    name: String,
    #[serde(default)]
    artists: Vec<ArtistRef>,
}

#[derive(Deserialize)]
struct ArtistRef {
    name: String,
}

/// Web API client for the streaming service. Tokens come from a json cache
/// on disk (provisioned by the authorization flow) and are refreshed in
/// place when they expire.
pub struct SpotifyClient {
    http: reqwest::Client,
    client_id: String,
    client_secret: String,
    store_path: PathBuf,
    tokens: Mutex<HashMap<String, TokenEntry>>,
}

impl SpotifyClient {
    pub fn new(config: &Config) -> Self {
        SpotifyClient {
            http: reqwest::Client::new(),
            client_id: config.spotify_client_id.clone(),
            client_secret: config.spotify_client_secret.clone(),
            store_path: config.token_store_path.clone(),
            tokens: Mutex::new(load_tokens(&config.token_store_path)),
        }
    }

    async fn refresh(&self, entry: &TokenEntry) -> Result<TokenEntry> {
        let params = [
            ("grant_type", "refresh_token"),
            ("refresh_token", entry.refresh_token.as_str()),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
        ];
        let response = self.http.post(TOKEN_URL).form(&params).send().await?;
        if !response.status().is_success() {
            return Err(Error::Source(format!(
                "token refresh failed with status {}",
                response.status()
            )));
        }
        let refreshed: TokenResponse = response.json().await?;
        Ok(TokenEntry {
            access_token: refreshed.access_token,
            refresh_token: refreshed
                .refresh_token
                .unwrap_or_else(|| entry.refresh_token.clone()),
            expires_at: unix_now()
                + refreshed.expires_in.unwrap_or(DEFAULT_TOKEN_LIFETIME_SECS),
        })
    }

    fn persist(&self, tokens: &HashMap<String, TokenEntry>) -> Result<()> {
        let raw = serde_json::to_string(tokens)?;
        std::fs::write(&self.store_path, raw)?;
        Ok(())
    }
}

#[async_trait]
impl NowPlayingSource for SpotifyClient {
    async fn access_token(&self, user_id: u64) -> Result<Option<String>> {
        let key = user_id.to_string();
        let mut tokens = self.tokens.lock().await;
        let Some(entry) = tokens.get(&key).cloned() else {
            return Ok(None);
        };
        if !entry.is_expired(unix_now()) {
            return Ok(Some(entry.access_token));
        }

        match self.refresh(&entry).await {
            Ok(refreshed) => {
                info!("Refreshed access token for user {user_id}");
                let token = refreshed.access_token.clone();
                tokens.insert(key, refreshed);
                if let Err(e) = self.persist(&tokens) {
                    warn!("Could not persist refreshed tokens: {e}");
                }
                Ok(Some(token))
            }
            Err(e) => {
                warn!("Token refresh failed for user {user_id}: {e}");
                Ok(None)
            }
        }
    }

    async fn currently_playing(&self, user_id: u64) -> Result<Option<NowPlayingSnapshot>> {
        let token = self.access_token(user_id).await?.ok_or_else(|| {
            Error::Source("no valid access token; authorize the account first".to_string())
        })?;

        let response = self
            .http
            .get(CURRENTLY_PLAYING_URL)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    Error::SourceTimeout
                } else {
                    Error::Http(e)
                }
            })?;

        match response.status() {
            StatusCode::NO_CONTENT => Ok(None),
            status if status.is_success() => {
                let payload: CurrentlyPlayingPayload = response.json().await?;
                Ok(snapshot_from_payload(payload))
            }
            status => Err(Error::Source(format!(
                "currently-playing returned status {status}"
            ))),
        }
    }
}

fn snapshot_from_payload(payload: CurrentlyPlayingPayload) -> Option<NowPlayingSnapshot> {
    let item = payload.item?;
    // Items without a catalogue id (local files) cannot be mirrored.
    let track_id = item.id?;
    Some(NowPlayingSnapshot {
        track_id,
        title: item.name,
        artists: item.artists.into_iter().map(|a| a.name).collect(),
        is_playing: payload.is_playing,
        position_ms: payload.progress_ms.unwrap_or(0),
    })
}

fn load_tokens(path: &Path) -> HashMap<String, TokenEntry> {
    if !path.exists() {
        return HashMap::new();
    }
    match std::fs::read_to_string(path)
        .map_err(Error::from)
        .and_then(|raw| serde_json::from_str(&raw).map_err(Error::from))
    {
        Ok(tokens) => tokens,
        Err(e) => {
            warn!("Could not load token store {}: {e}", path.display());
            HashMap::new()
        }
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_parses_a_playing_payload() {
        let raw = r#"{
            "item": {
                "id": "4uLU6hMCjMI75M1A2tKUQC",
                "name": "Song Name",
                "artists": [{"name": "First"}, {"name": "Second"}]
            },
            "is_playing": true,
            "progress_ms": 42000
        }"#;
        let payload: CurrentlyPlayingPayload = serde_json::from_str(raw).unwrap();
        let snapshot = snapshot_from_payload(payload).unwrap();

        assert_eq!(snapshot.track_id, "4uLU6hMCjMI75M1A2tKUQC");
        assert_eq!(snapshot.title, "Song Name");
        assert_eq!(snapshot.artists, ["First", "Second"]);
        assert!(snapshot.is_playing);
        assert_eq!(snapshot.position_ms, 42_000);
    }

    #[test]
    fn snapshot_is_none_without_an_item_or_id() {
        let no_item: CurrentlyPlayingPayload =
            serde_json::from_str(r#"{"item": null, "is_playing": false}"#).unwrap();
        assert!(snapshot_from_payload(no_item).is_none());

        let local_file: CurrentlyPlayingPayload = serde_json::from_str(
            r#"{"item": {"id": null, "name": "ripped.mp3", "artists": []}, "is_playing": true}"#,
        )
        .unwrap();
        assert!(snapshot_from_payload(local_file).is_none());
    }

    #[test]
    fn token_expiry_is_checked_against_now() {
        let entry = TokenEntry {
            access_token: "a".into(),
            refresh_token: "r".into(),
            expires_at: 1000,
        };
        assert!(entry.is_expired(1000));
        assert!(entry.is_expired(2000));
        assert!(!entry.is_expired(999));
    }
}
