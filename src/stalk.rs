use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::error::Error;
use crate::models::NowPlayingSnapshot;
use crate::player::Player;
use crate::spotify::NowPlayingSource;

const POLL_INTERVAL: Duration = Duration::from_millis(2500);
const FETCH_TIMEOUT: Duration = Duration::from_secs(10);
const ERROR_BACKOFF: Duration = Duration::from_secs(8);
const IDLE_BACKOFF: Duration = Duration::from_secs(3);
/// Playback needs a moment after a track swap before a seek lands.
const SETTLE_DELAY: Duration = Duration::from_millis(500);
/// Compensates the pipeline latency between the external source's reported
/// position and local playback becoming audible.
const POSITION_LEAD_MS: u64 = 1000;
/// Small drift is expected from polling jitter; only seek past this.
const DRIFT_THRESHOLD_MS: u64 = 1800;
const MAX_CONSECUTIVE_ERRORS: u32 = 5;

/// Mutable per-user state carried across polling ticks.
#[derive(Default)]
pub struct SyncSession {
    pub last_track_id: Option<String>,
    pub last_is_playing: Option<bool>,
    pub last_position_ms: Option<u64>,
    pub error_count: u32,
}

/// What one polling tick decided to do, in application order.
#[derive(Clone, Debug, PartialEq)]
pub enum SyncAction {
    SwitchTrack { query: String, seek_to_ms: u64 },
    Seek { position_ms: u64 },
    SetPaused { paused: bool },
}

/// Diffs the external snapshot against the session's last observation and
/// plans the corrective commands. Pure so the drift/resync rules are
/// testable without timers.
pub fn plan_tick(session: &mut SyncSession, snapshot: &NowPlayingSnapshot) -> Vec<SyncAction> {
    let seek_target_ms = snapshot.position_ms.saturating_add(POSITION_LEAD_MS);

    if session.last_track_id.as_deref() != Some(snapshot.track_id.as_str()) {
        session.last_track_id = Some(snapshot.track_id.clone());
        session.last_position_ms = Some(seek_target_ms);
        session.last_is_playing = Some(snapshot.is_playing);
        return vec![SyncAction::SwitchTrack {
            query: snapshot.search_query(),
            seek_to_ms: seek_target_ms,
        }];
    }

    let mut actions = Vec::new();
    let drifted = session
        .last_position_ms
        .map_or(false, |last| seek_target_ms.abs_diff(last) > DRIFT_THRESHOLD_MS);
    let play_state_changed = session.last_is_playing != Some(snapshot.is_playing);

    if drifted || play_state_changed {
        actions.push(SyncAction::Seek {
            position_ms: seek_target_ms,
        });
    }
    if play_state_changed {
        actions.push(SyncAction::SetPaused {
            paused: !snapshot.is_playing,
        });
        session.last_is_playing = Some(snapshot.is_playing);
    }
    session.last_position_ms = Some(seek_target_ms);

    actions
}

struct StalkHandle {
    cancel: watch::Sender<bool>,
}

/// Owner of every running mirroring session, one at most per user. Sessions
/// remove their own entry when they end; `stop` removes it up front, so the
/// release is idempotent either way.
#[derive(Default)]
pub struct StalkRegistry {
    sessions: Arc<StdMutex<HashMap<u64, StalkHandle>>>,
}

impl StalkRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawns the mirroring loop for `user_id`. Rejected when a session is
    /// already running for that user.
    pub fn start(
        &self,
        user_id: u64,
        source: Arc<dyn NowPlayingSource>,
        player: Arc<Mutex<Player>>,
        notices: mpsc::UnboundedSender<String>,
    ) -> crate::error::Result<()> {
        let mut sessions = self.sessions.lock().expect("stalk registry poisoned");
        if sessions.contains_key(&user_id) {
            return Err(Error::InvalidInput(
                "a mirroring session is already running for this user".to_string(),
            ));
        }

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let sessions_for_task = Arc::clone(&self.sessions);
        tokio::spawn(async move {
            run_sync_loop(user_id, source, player, notices, cancel_rx).await;
            sessions_for_task
                .lock()
                .expect("stalk registry poisoned")
                .remove(&user_id);
        });

        sessions.insert(user_id, StalkHandle { cancel: cancel_tx });
        Ok(())
    }

    /// Signals the user's session to stop. Returns false when none is
    /// running.
    pub fn stop(&self, user_id: u64) -> bool {
        let handle = self
            .sessions
            .lock()
            .expect("stalk registry poisoned")
            .remove(&user_id);
        match handle {
            Some(handle) => {
                let _ = handle.cancel.send(true);
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self, user_id: u64) -> bool {
        self.sessions
            .lock()
            .expect("stalk registry poisoned")
            .contains_key(&user_id)
    }
}

/// True when the session was cancelled during the sleep.
async fn sleep_or_cancelled(duration: Duration, cancel: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => false,
        _ = cancel.changed() => true,
    }
}

async fn run_sync_loop(
    user_id: u64,
    source: Arc<dyn NowPlayingSource>,
    player: Arc<Mutex<Player>>,
    notices: mpsc::UnboundedSender<String>,
    mut cancel: watch::Receiver<bool>,
) {
    let mut session = SyncSession::default();
    info!("Mirroring session started for user {user_id}");

    loop {
        // The fetch never holds the player lock; only the corrective
        // commands below do.
        let fetch = timeout(FETCH_TIMEOUT, source.currently_playing(user_id));
        let outcome = tokio::select! {
            _ = cancel.changed() => break,
            outcome = fetch => outcome,
        };

        let snapshot = match outcome {
            Err(_) => {
                warn!("User {user_id}: external source timed out, backing off");
                if sleep_or_cancelled(ERROR_BACKOFF, &mut cancel).await {
                    break;
                }
                continue;
            }
            Ok(Err(e)) => {
                session.error_count += 1;
                warn!(
                    "User {user_id}: external source error ({} consecutive): {e}",
                    session.error_count
                );
                if session.error_count > MAX_CONSECUTIVE_ERRORS {
                    error!("User {user_id}: mirroring stopped after repeated errors");
                    let _ = notices.send(
                        "Mirroring stopped due to repeated errors from the streaming service."
                            .to_string(),
                    );
                    break;
                }
                if sleep_or_cancelled(ERROR_BACKOFF, &mut cancel).await {
                    break;
                }
                continue;
            }
            Ok(Ok(None)) => {
                session.error_count = 0;
                debug!("User {user_id}: nothing playing on the external source");
                if sleep_or_cancelled(IDLE_BACKOFF, &mut cancel).await {
                    break;
                }
                continue;
            }
            Ok(Ok(Some(snapshot))) => {
                session.error_count = 0;
                snapshot
            }
        };

        let actions = plan_tick(&mut session, &snapshot);
        if apply_actions(user_id, &player, &actions, &mut cancel).await {
            break;
        }

        if sleep_or_cancelled(POLL_INTERVAL, &mut cancel).await {
            break;
        }
    }

    info!("Mirroring session ended for user {user_id}");
}

/// Applies planned actions against the guild player. Returns true when the
/// session was cancelled mid-application.
async fn apply_actions(
    user_id: u64,
    player: &Arc<Mutex<Player>>,
    actions: &[SyncAction],
    cancel: &mut watch::Receiver<bool>,
) -> bool {
    for action in actions {
        match action {
            SyncAction::SwitchTrack { query, seek_to_ms } => {
                info!("User {user_id}: mirroring track change, query '{query}'");
                let switched = {
                    let mut player = player.lock().await;
                    match player.clear_for_replacement().await {
                        Ok(()) => match player.resolve_query(query).await {
                            Ok(track) => player.enqueue_track(track, true).await.map(|_| ()),
                            Err(e) => Err(e),
                        },
                        Err(e) => Err(e),
                    }
                };
                match switched {
                    Ok(()) => {
                        if sleep_or_cancelled(SETTLE_DELAY, cancel).await {
                            return true;
                        }
                        let mut player = player.lock().await;
                        if let Err(e) = player.seek_ms(*seek_to_ms).await {
                            warn!("User {user_id}: post-switch seek failed: {e}");
                        }
                    }
                    Err(e) => warn!("User {user_id}: could not mirror track change: {e}"),
                }
            }
            SyncAction::Seek { position_ms } => {
                let mut player = player.lock().await;
                if let Err(e) = player.seek_ms(*position_ms).await {
                    warn!("User {user_id}: drift-correction seek failed: {e}");
                }
            }
            SyncAction::SetPaused { paused } => {
                let mut player = player.lock().await;
                if let Err(e) = player.set_paused(*paused).await {
                    warn!("User {user_id}: could not mirror play state: {e}");
                }
            }
        }
    }
    false
}
