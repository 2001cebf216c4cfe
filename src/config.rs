use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};

use tracing::info;

use crate::error::{Error, Result};

const DEFAULT_PLAYLIST_STORE: &str = "playlists.json";
const DEFAULT_TOKEN_STORE: &str = "spotify_tokens.json";
const DEFAULT_OVERRIDES_FILE: &str = "track_overrides.json";

/// Process configuration, read once at startup from the environment
/// (after `dotenvy::dotenv()` has populated it from `.env`).
pub struct Config {
    pub discord_token: String,
    pub spotify_client_id: String,
    pub spotify_client_secret: String,
    pub playlist_store_path: PathBuf,
    pub token_store_path: PathBuf,
    /// Queries that should bypass search and resolve to a fixed URL.
    track_overrides: HashMap<String, String>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let discord_token = require("DISCORD_TOKEN")?;
        let spotify_client_id = env::var("SPOTIFY_CLIENT_ID").unwrap_or_default();
        let spotify_client_secret = env::var("SPOTIFY_CLIENT_SECRET").unwrap_or_default();

        let playlist_store_path =
            path_var("PLAYLIST_STORE_PATH", DEFAULT_PLAYLIST_STORE);
        let token_store_path = path_var("SPOTIFY_TOKEN_STORE_PATH", DEFAULT_TOKEN_STORE);

        let overrides_path = path_var("TRACK_OVERRIDES_PATH", DEFAULT_OVERRIDES_FILE);
        let track_overrides = load_overrides(&overrides_path)?;

        Ok(Config {
            discord_token,
            spotify_client_id,
            spotify_client_secret,
            playlist_store_path,
            token_store_path,
            track_overrides,
        })
    }

    /// Fixed URL for queries known to resolve badly via search. Exact match
    /// first, then any override key contained in the query.
    pub fn resolve_override(&self, query: &str) -> Option<&str> {
        let q = query.to_lowercase();
        let q = q.trim();
        if let Some(url) = self.track_overrides.get(q) {
            return Some(url);
        }
        self.track_overrides
            .iter()
            .find(|(key, _)| q.contains(key.as_str()))
            .map(|(_, url)| url.as_str())
    }
}

fn require(key: &str) -> Result<String> {
    env::var(key).map_err(|_| Error::InvalidInput(format!("{key} is not set")))
}

fn path_var(key: &str, default: &str) -> PathBuf {
    env::var(key).map_or_else(|_| PathBuf::from(default), PathBuf::from)
}

fn load_overrides(path: &Path) -> Result<HashMap<String, String>> {
    if !path.exists() {
        return Ok(HashMap::new());
    }
    let raw = std::fs::read_to_string(path)?;
    let overrides: HashMap<String, String> = serde_json::from_str(&raw)?;
    info!("Loaded {} track overrides from {}", overrides.len(), path.display());
    Ok(overrides
        .into_iter()
        .map(|(k, v)| (k.trim().to_lowercase(), v))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with_overrides(entries: &[(&str, &str)]) -> Config {
        Config {
            discord_token: String::new(),
            spotify_client_id: String::new(),
            spotify_client_secret: String::new(),
            playlist_store_path: PathBuf::new(),
            token_store_path: PathBuf::new(),
            track_overrides: entries
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    #[test]
    fn override_matches_exact_query_ignoring_case() {
        let config = config_with_overrides(&[("tom tom", "https://example.com/v")]);
        assert_eq!(
            config.resolve_override("  Tom Tom "),
            Some("https://example.com/v")
        );
    }

    #[test]
    fn override_matches_substring() {
        let config = config_with_overrides(&[("tom tom", "https://example.com/v")]);
        assert_eq!(
            config.resolve_override("play tom tom please"),
            Some("https://example.com/v")
        );
        assert_eq!(config.resolve_override("something else"), None);
    }
}
