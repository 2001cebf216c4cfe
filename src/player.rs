use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use rand::seq::SliceRandom;
use rand::thread_rng;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::backend::AudioBackend;
use crate::error::{Error, Result};
use crate::models::{EndReason, FilterSpec, LoopMode, TrackRef};

pub const DEFAULT_VOLUME: f32 = 0.2;
pub const HISTORY_CAPACITY: usize = 20;

/// Ordered play queue. Front is next to play; duplicates are allowed.
#[derive(Default)]
pub struct PlaybackQueue {
    items: VecDeque<TrackRef>,
}

impl PlaybackQueue {
    pub fn insert_front(&mut self, track: TrackRef) {
        self.items.push_front(track);
    }

    pub fn append(&mut self, track: TrackRef) {
        self.items.push_back(track);
    }

    pub fn extend(&mut self, tracks: impl IntoIterator<Item = TrackRef>) {
        self.items.extend(tracks);
    }

    pub fn pop_front(&mut self) -> Option<TrackRef> {
        self.items.pop_front()
    }

    pub fn shuffle(&mut self) {
        self.items.make_contiguous().shuffle(&mut thread_rng());
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TrackRef> {
        self.items.iter()
    }
}

/// Recently played tracks, oldest evicted past capacity. Feeds the replay
/// command and autoplay's random pick.
#[derive(Default)]
pub struct HistoryRing {
    items: Vec<TrackRef>,
}

impl HistoryRing {
    pub fn push(&mut self, track: TrackRef) {
        self.items.push(track);
        if self.items.len() > HISTORY_CAPACITY {
            let excess = self.items.len() - HISTORY_CAPACITY;
            self.items.drain(..excess);
        }
    }

    /// 0 is the most recently played track.
    pub fn nth_recent(&self, index: usize) -> Option<&TrackRef> {
        let len = self.items.len();
        if index < len {
            self.items.get(len - 1 - index)
        } else {
            None
        }
    }

    pub fn recent(&self, count: usize) -> impl Iterator<Item = &TrackRef> {
        self.items.iter().rev().take(count)
    }

    pub fn random(&self) -> Option<TrackRef> {
        self.items.choose(&mut thread_rng()).cloned()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Per-guild playback state machine. All mutation goes through the registry
/// mutex, so commands, track-end events and sync loops never race on it.
pub struct Player {
    guild_id: u64,
    queue: PlaybackQueue,
    history: HistoryRing,
    now_playing: Option<TrackRef>,
    paused: bool,
    loop_mode: LoopMode,
    volume: f32,
    autoplay_enabled: bool,
    nightcore_enabled: bool,
    bassboost_level: Option<u8>,
    backend: Option<Arc<dyn AudioBackend>>,
    /// Generation counter for the attached backend; events tagged with an
    /// older generation are discarded.
    session: u64,
}

impl Player {
    pub fn new(guild_id: u64) -> Self {
        Player {
            guild_id,
            queue: PlaybackQueue::default(),
            history: HistoryRing::default(),
            now_playing: None,
            paused: false,
            loop_mode: LoopMode::Off,
            volume: DEFAULT_VOLUME,
            autoplay_enabled: false,
            nightcore_enabled: false,
            bassboost_level: None,
            backend: None,
            session: 0,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.backend.is_some()
    }

    pub fn now_playing(&self) -> Option<&TrackRef> {
        self.now_playing.as_ref()
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn loop_mode(&self) -> LoopMode {
        self.loop_mode
    }

    pub fn volume_percent(&self) -> u8 {
        (self.volume * 100.0).round() as u8
    }

    pub fn autoplay_enabled(&self) -> bool {
        self.autoplay_enabled
    }

    pub fn queue(&self) -> &PlaybackQueue {
        &self.queue
    }

    pub fn queue_mut(&mut self) -> &mut PlaybackQueue {
        &mut self.queue
    }

    pub fn history(&self) -> &HistoryRing {
        &self.history
    }

    /// Opens a new backend generation. Call before constructing the backend
    /// so its events carry the right session tag.
    pub fn begin_session(&mut self) -> u64 {
        self.session += 1;
        self.session
    }

    pub fn attach_backend(&mut self, backend: Arc<dyn AudioBackend>) {
        self.backend = Some(backend);
    }

    /// Resets to defaults after the voice connection went away underneath us.
    pub fn reset_after_disconnect(&mut self) {
        self.backend = None;
        self.session += 1;
        self.queue.clear();
        self.now_playing = None;
        self.paused = false;
        self.loop_mode = LoopMode::Off;
    }

    fn backend(&self) -> Result<Arc<dyn AudioBackend>> {
        self.backend.clone().ok_or(Error::NotConnected)
    }

    /// Resolves a query to the first matching track.
    pub async fn resolve_query(&self, query: &str) -> Result<TrackRef> {
        let backend = self.backend()?;
        let mut tracks = backend.search(query).await?;
        if tracks.is_empty() {
            return Err(Error::NoResults(query.to_string()));
        }
        Ok(tracks.remove(0))
    }

    /// Adds a track to the queue (front or back) and starts playback when
    /// nothing is playing. Returns the track that started, if any.
    pub async fn enqueue_track(&mut self, track: TrackRef, front: bool) -> Result<Option<TrackRef>> {
        if front {
            self.queue.insert_front(track);
        } else {
            self.queue.append(track);
        }
        if self.now_playing.is_none() {
            self.start_playback().await
        } else {
            Ok(None)
        }
    }

    pub async fn enqueue_all(&mut self, tracks: Vec<TrackRef>) -> Result<Option<TrackRef>> {
        self.queue.extend(tracks);
        if self.now_playing.is_none() {
            self.start_playback().await
        } else {
            Ok(None)
        }
    }

    /// Stops whatever is playing and drops the queue, leaving the session
    /// connected and ready for a replacement track.
    pub async fn clear_for_replacement(&mut self) -> Result<()> {
        let backend = self.backend()?;
        if self.now_playing.take().is_some() {
            backend.stop().await?;
        }
        self.queue.clear();
        Ok(())
    }

    /// Destructive replace: drop whatever is queued and playing, then play
    /// this track immediately.
    pub async fn play_now(&mut self, track: TrackRef) -> Result<Option<TrackRef>> {
        self.clear_for_replacement().await?;
        self.queue.insert_front(track);
        self.start_playback().await
    }

    /// The queue-pop half of the advance algorithm: plays the next playable
    /// queue entry. Unplayable entries are logged and skipped. On exhaustion
    /// with autoplay enabled, one random history pick is queued and tried
    /// once before going idle.
    pub async fn start_playback(&mut self) -> Result<Option<TrackRef>> {
        let backend = self.backend()?;
        let mut autoplay_used = false;
        loop {
            match self.queue.pop_front() {
                Some(track) => match backend.play(&track).await {
                    Ok(()) => {
                        info!("Guild {}: now playing {}", self.guild_id, track);
                        self.paused = false;
                        self.history.push(track.clone());
                        self.now_playing = Some(track.clone());
                        return Ok(Some(track));
                    }
                    Err(e) => {
                        warn!(
                            "Guild {}: skipping unplayable track '{}': {e}",
                            self.guild_id, track.title
                        );
                    }
                },
                None => {
                    if self.autoplay_enabled && !autoplay_used {
                        autoplay_used = true;
                        if let Some(pick) = self.history.random() {
                            info!("Guild {}: autoplay queued '{}'", self.guild_id, pick.title);
                            self.queue.append(pick);
                            continue;
                        }
                    }
                    info!("Guild {}: queue exhausted, going idle", self.guild_id);
                    self.now_playing = None;
                    self.paused = false;
                    return Ok(None);
                }
            }
        }
    }

    /// Transition handler for backend end-of-track events.
    pub async fn handle_track_end(
        &mut self,
        ended: Option<TrackRef>,
        reason: EndReason,
        session: u64,
    ) -> Result<()> {
        if session != self.session {
            warn!(
                "Guild {}: discarding stale track-end event (session {session}, current {})",
                self.guild_id, self.session
            );
            return Ok(());
        }

        match reason {
            EndReason::Finished => {
                if self.loop_mode == LoopMode::Single {
                    if let Some(track) = ended {
                        // Same TrackRef, no re-search; queue and history stay
                        // untouched.
                        let backend = self.backend()?;
                        match backend.play(&track).await {
                            Ok(()) => {
                                self.paused = false;
                                self.now_playing = Some(track);
                                return Ok(());
                            }
                            Err(e) => {
                                warn!(
                                    "Guild {}: single-loop replay of '{}' failed: {e}",
                                    self.guild_id, track.title
                                );
                                self.now_playing = None;
                            }
                        }
                    }
                } else if self.loop_mode == LoopMode::Queue {
                    if let Some(track) = ended {
                        self.queue.append(track);
                    }
                }
                self.start_playback().await?;
            }
            EndReason::LoadFailed => {
                if ended.is_some() && self.now_playing == ended {
                    self.now_playing = None;
                }
                // A failed load never loops.
                if !self.queue.is_empty() {
                    self.start_playback().await?;
                }
            }
            EndReason::Stopped | EndReason::Replaced => {
                if self.loop_mode != LoopMode::Single
                    && ended.is_some()
                    && self.now_playing == ended
                {
                    self.now_playing = None;
                }
            }
            EndReason::Unknown => {
                debug!("Guild {}: track end with unhandled reason", self.guild_id);
            }
        }

        Ok(())
    }

    /// Stops the current track and immediately advances, without waiting for
    /// the backend's end event.
    pub async fn skip(&mut self) -> Result<Option<TrackRef>> {
        let backend = self.backend()?;
        if self.now_playing.take().is_some() {
            backend.stop().await?;
        }
        self.start_playback().await
    }

    /// Full stop: queue dropped, loop mode reset, backend detached. The
    /// session bump invalidates any in-flight end events.
    pub async fn stop(&mut self) -> Result<()> {
        let backend = self.backend.take().ok_or(Error::NotConnected)?;
        self.queue.clear();
        self.loop_mode = LoopMode::Off;
        let result = backend.stop().await;
        self.now_playing = None;
        self.paused = false;
        self.session += 1;
        result
    }

    pub async fn set_paused(&mut self, paused: bool) -> Result<()> {
        let backend = self.backend()?;
        if self.now_playing.is_none() {
            return Err(Error::NotConnected);
        }
        backend.pause(paused).await?;
        self.paused = paused;
        Ok(())
    }

    pub async fn seek_ms(&mut self, position_ms: u64) -> Result<()> {
        let backend = self.backend()?;
        if self.now_playing.is_none() {
            return Err(Error::NotConnected);
        }
        backend.seek(position_ms).await
    }

    pub async fn set_volume(&mut self, percent: u8) -> Result<()> {
        if !(1..=100).contains(&percent) {
            return Err(Error::InvalidInput(format!(
                "volume must be between 1 and 100, got {percent}"
            )));
        }
        self.volume = f32::from(percent) / 100.0;
        if let Some(backend) = self.backend.clone() {
            backend.set_volume(percent).await?;
        }
        Ok(())
    }

    /// Pushes the stored volume to a freshly attached backend.
    pub async fn sync_backend_volume(&self) -> Result<()> {
        let backend = self.backend()?;
        backend.set_volume(self.volume_percent()).await
    }

    pub fn set_loop_mode(&mut self, mode: LoopMode) {
        info!("Guild {}: loop mode set to {mode}", self.guild_id);
        self.loop_mode = mode;
    }

    pub fn set_autoplay(&mut self, enabled: bool) {
        self.autoplay_enabled = enabled;
    }

    pub async fn set_bassboost(&mut self, level: Option<u8>) -> Result<()> {
        if let Some(level) = level {
            if !(1..=100).contains(&level) {
                return Err(Error::InvalidInput(format!(
                    "bassboost must be 'off' or between 1 and 100, got {level}"
                )));
            }
        }
        if self.bassboost_level == level {
            return Ok(());
        }
        let backend = self.backend()?;
        let previous = self.bassboost_level;
        self.bassboost_level = level;
        if let Err(e) = backend.set_filters(&self.current_filters()).await {
            self.bassboost_level = previous;
            return Err(e);
        }
        Ok(())
    }

    pub async fn set_nightcore(&mut self, enabled: bool) -> Result<()> {
        if self.nightcore_enabled == enabled {
            return Ok(());
        }
        self.nightcore_enabled = enabled;
        if let Some(backend) = self.backend.clone() {
            if let Err(e) = backend.set_filters(&self.current_filters()).await {
                self.nightcore_enabled = !enabled;
                return Err(e);
            }
        }
        Ok(())
    }

    /// Default volume, nightcore off. Bassboost is left as-is.
    pub async fn normalize(&mut self) -> Result<()> {
        self.volume = DEFAULT_VOLUME;
        if let Some(backend) = self.backend.clone() {
            backend.set_volume(self.volume_percent()).await?;
        }
        self.set_nightcore(false).await
    }

    fn current_filters(&self) -> FilterSpec {
        let mut spec = FilterSpec::reset();
        if let Some(level) = self.bassboost_level {
            spec.equalizer = FilterSpec::bassboost(level).equalizer;
        }
        if self.nightcore_enabled {
            spec.timescale = FilterSpec::nightcore().timescale;
        }
        spec
    }

    /// Queues the index-th most recent history entry (0-based, newest first)
    /// to play next.
    pub fn replay_from_history(&mut self, index: usize) -> Result<TrackRef> {
        let track = self
            .history
            .nth_recent(index)
            .cloned()
            .ok_or_else(|| Error::InvalidInput(format!("no history entry {}", index + 1)))?;
        self.queue.insert_front(track.clone());
        Ok(track)
    }
}

/// Owner of every guild's player. The single place that hands out the
/// per-guild mutex, so every call site serializes through the same lock.
#[derive(Default)]
pub struct PlayerRegistry {
    players: Mutex<HashMap<u64, Arc<Mutex<Player>>>>,
}

impl PlayerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, guild_id: u64) -> Arc<Mutex<Player>> {
        let mut players = self.players.lock().await;
        players
            .entry(guild_id)
            .or_insert_with(|| Arc::new(Mutex::new(Player::new(guild_id))))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::{track, MockBackend, Recorded};

    fn queue_of(player: &Player) -> Vec<String> {
        player.queue().iter().map(|t| t.id.clone()).collect()
    }

    fn history_of(player: &Player) -> Vec<String> {
        let mut ids: Vec<String> = player
            .history()
            .recent(HISTORY_CAPACITY)
            .map(|t| t.id.clone())
            .collect();
        ids.reverse();
        ids
    }

    fn connected_player(backend: &Arc<MockBackend>) -> (Player, u64) {
        let mut player = Player::new(1);
        let session = player.begin_session();
        player.attach_backend(backend.clone());
        (player, session)
    }

    #[test]
    fn queue_pops_fifo_with_front_insert_priority() {
        let mut queue = PlaybackQueue::default();
        queue.append(track("a"));
        queue.append(track("b"));
        queue.insert_front(track("c"));
        queue.append(track("d"));

        let order: Vec<String> = std::iter::from_fn(|| queue.pop_front())
            .map(|t| t.id)
            .collect();
        assert_eq!(order, ["c", "a", "b", "d"]);
    }

    #[test]
    fn shuffle_preserves_multiset() {
        let mut queue = PlaybackQueue::default();
        for id in ["a", "b", "c", "d", "e", "a"] {
            queue.append(track(id));
        }
        queue.shuffle();

        let mut ids: Vec<String> = queue.iter().map(|t| t.id.clone()).collect();
        ids.sort();
        assert_eq!(ids, ["a", "a", "b", "c", "d", "e"]);

        // No-op sizes.
        let mut empty = PlaybackQueue::default();
        empty.shuffle();
        assert!(empty.is_empty());
        let mut single = PlaybackQueue::default();
        single.append(track("x"));
        single.shuffle();
        assert_eq!(single.len(), 1);
    }

    #[test]
    fn history_ring_evicts_oldest_past_capacity() {
        let mut history = HistoryRing::default();
        for i in 0..25 {
            history.push(track(&format!("t{i}")));
        }
        assert_eq!(history.len(), HISTORY_CAPACITY);
        assert_eq!(history.nth_recent(0).unwrap().id, "t24");
        let oldest = history.recent(HISTORY_CAPACITY).last().unwrap();
        assert_eq!(oldest.id, "t5");
    }

    #[tokio::test]
    async fn loop_single_replays_same_track_untouched() {
        let backend = Arc::new(MockBackend::new());
        let (mut player, session) = connected_player(&backend);
        player.set_loop_mode(LoopMode::Single);
        player.queue_mut().append(track("a"));

        player
            .handle_track_end(Some(track("t")), EndReason::Finished, session)
            .await
            .unwrap();

        assert_eq!(player.now_playing().unwrap().id, "t");
        assert_eq!(queue_of(&player), ["a"]);
        assert!(history_of(&player).is_empty());
        assert_eq!(backend.commands(), [Recorded::Play("t".into())]);
    }

    #[tokio::test]
    async fn loop_single_falls_back_to_queue_when_replay_fails() {
        let backend = Arc::new(MockBackend::new());
        backend.fail_play_for("t");
        let (mut player, session) = connected_player(&backend);
        player.set_loop_mode(LoopMode::Single);
        player.queue_mut().append(track("a"));

        player
            .handle_track_end(Some(track("t")), EndReason::Finished, session)
            .await
            .unwrap();

        assert_eq!(player.now_playing().unwrap().id, "a");
        // One-shot fallback: loop mode stays single.
        assert_eq!(player.loop_mode(), LoopMode::Single);
    }

    #[tokio::test]
    async fn loop_queue_reappends_ended_track() {
        let backend = Arc::new(MockBackend::new());
        let (mut player, session) = connected_player(&backend);
        player.set_loop_mode(LoopMode::Queue);
        player.queue_mut().append(track("a"));
        player.queue_mut().append(track("b"));

        player
            .handle_track_end(Some(track("t")), EndReason::Finished, session)
            .await
            .unwrap();

        assert_eq!(player.now_playing().unwrap().id, "a");
        assert_eq!(queue_of(&player), ["b", "t"]);
    }

    #[tokio::test]
    async fn load_failed_advances_without_looping() {
        let backend = Arc::new(MockBackend::new());
        let (mut player, session) = connected_player(&backend);
        player.set_loop_mode(LoopMode::Single);
        player.queue_mut().append(track("a"));

        player
            .handle_track_end(Some(track("t")), EndReason::LoadFailed, session)
            .await
            .unwrap();

        // The failed track is never replayed, even in single-loop mode.
        assert_eq!(player.now_playing().unwrap().id, "a");
        assert_eq!(backend.commands(), [Recorded::Play("a".into())]);
    }

    #[tokio::test]
    async fn load_failed_with_empty_queue_goes_idle() {
        let backend = Arc::new(MockBackend::new());
        let (mut player, session) = connected_player(&backend);

        // Simulate the failed track being current.
        player.queue_mut().append(track("t"));
        player.start_playback().await.unwrap();
        player
            .handle_track_end(Some(track("t")), EndReason::LoadFailed, session)
            .await
            .unwrap();

        assert!(player.now_playing().is_none());
        assert_eq!(backend.play_count(), 1);
    }

    #[tokio::test]
    async fn stopped_does_not_advance() {
        let backend = Arc::new(MockBackend::new());
        let (mut player, session) = connected_player(&backend);
        player.queue_mut().append(track("t"));
        player.start_playback().await.unwrap();
        player.queue_mut().append(track("a"));

        player
            .handle_track_end(Some(track("t")), EndReason::Stopped, session)
            .await
            .unwrap();

        assert!(player.now_playing().is_none());
        assert_eq!(queue_of(&player), ["a"]);
        assert_eq!(backend.play_count(), 1);
    }

    #[tokio::test]
    async fn replaced_does_not_clear_successor_track() {
        let backend = Arc::new(MockBackend::new());
        let (mut player, session) = connected_player(&backend);
        player.queue_mut().append(track("new"));
        player.start_playback().await.unwrap();

        // Late Replaced event for the previous track must not clobber the
        // track that replaced it.
        player
            .handle_track_end(Some(track("old")), EndReason::Replaced, session)
            .await
            .unwrap();

        assert_eq!(player.now_playing().unwrap().id, "new");
    }

    #[tokio::test]
    async fn autoplay_picks_from_history_on_exhaustion() {
        let backend = Arc::new(MockBackend::new());
        let (mut player, session) = connected_player(&backend);
        player.set_autoplay(true);

        for id in ["a", "b", "c"] {
            player.queue_mut().append(track(id));
            player.start_playback().await.unwrap();
        }

        player
            .handle_track_end(Some(track("c")), EndReason::Finished, session)
            .await
            .unwrap();

        let playing = player.now_playing().expect("autoplay should keep playing");
        assert!(["a", "b", "c"].contains(&playing.id.as_str()));
    }

    #[tokio::test]
    async fn autoplay_attempts_at_most_one_history_pick() {
        let backend = Arc::new(MockBackend::new());
        let (mut player, session) = connected_player(&backend);
        player.set_autoplay(true);

        // Put one track into history, then make every further play fail so
        // the autoplay pick cannot start.
        player.queue_mut().append(track("a"));
        player.start_playback().await.unwrap();
        backend.fail_play_for("a");

        player
            .handle_track_end(Some(track("a")), EndReason::Finished, session)
            .await
            .unwrap();

        // One autoplay pick was tried and failed; no second attempt.
        assert!(player.now_playing().is_none());
        assert_eq!(backend.play_count(), 1);
    }

    #[tokio::test]
    async fn autoplay_with_empty_history_goes_idle() {
        let backend = Arc::new(MockBackend::new());
        let (mut player, session) = connected_player(&backend);
        player.set_autoplay(true);

        player
            .handle_track_end(Some(track("t")), EndReason::Finished, session)
            .await
            .unwrap();

        assert!(player.now_playing().is_none());
        assert!(backend.commands().is_empty());
    }

    #[tokio::test]
    async fn advance_sequence_builds_history_in_play_order() {
        let backend = Arc::new(MockBackend::new());
        let (mut player, session) = connected_player(&backend);

        for id in ["a", "b", "c"] {
            player.queue_mut().append(track(id));
        }

        let mut observed = Vec::new();
        player.start_playback().await.unwrap();
        observed.push(player.now_playing().map(|t| t.id.clone()));
        for ended in ["a", "b", "c"] {
            player
                .handle_track_end(Some(track(ended)), EndReason::Finished, session)
                .await
                .unwrap();
            observed.push(player.now_playing().map(|t| t.id.clone()));
        }

        assert_eq!(
            observed,
            [
                Some("a".to_string()),
                Some("b".to_string()),
                Some("c".to_string()),
                None
            ]
        );
        assert_eq!(history_of(&player), ["a", "b", "c"]);
    }

    #[tokio::test]
    async fn stale_session_events_are_discarded() {
        let backend = Arc::new(MockBackend::new());
        let (mut player, session) = connected_player(&backend);
        player.queue_mut().append(track("a"));
        player.begin_session();

        player
            .handle_track_end(Some(track("t")), EndReason::Finished, session)
            .await
            .unwrap();

        assert!(player.now_playing().is_none());
        assert_eq!(queue_of(&player), ["a"]);
        assert!(backend.commands().is_empty());
    }

    #[tokio::test]
    async fn unknown_end_reason_changes_nothing() {
        let backend = Arc::new(MockBackend::new());
        let (mut player, session) = connected_player(&backend);
        player.queue_mut().append(track("t"));
        player.start_playback().await.unwrap();

        player
            .handle_track_end(Some(track("t")), EndReason::Unknown, session)
            .await
            .unwrap();

        assert_eq!(player.now_playing().unwrap().id, "t");
        assert_eq!(backend.play_count(), 1);
    }

    #[tokio::test]
    async fn skip_stops_and_advances_immediately() {
        let backend = Arc::new(MockBackend::new());
        let (mut player, _session) = connected_player(&backend);
        player.queue_mut().append(track("t"));
        player.queue_mut().append(track("a"));
        player.start_playback().await.unwrap();

        let next = player.skip().await.unwrap();

        assert_eq!(next.unwrap().id, "a");
        assert_eq!(
            backend.commands(),
            [
                Recorded::Play("t".into()),
                Recorded::Stop,
                Recorded::Play("a".into())
            ]
        );
    }

    #[tokio::test]
    async fn unplayable_tracks_are_skipped_during_advance() {
        let backend = Arc::new(MockBackend::new());
        backend.fail_play_for("bad");
        let (mut player, _session) = connected_player(&backend);
        player.queue_mut().append(track("bad"));
        player.queue_mut().append(track("good"));

        let started = player.start_playback().await.unwrap();

        assert_eq!(started.unwrap().id, "good");
        assert_eq!(history_of(&player), ["good"]);
    }

    #[tokio::test]
    async fn stop_resets_state_and_invalidates_session() {
        let backend = Arc::new(MockBackend::new());
        let (mut player, session) = connected_player(&backend);
        player.queue_mut().append(track("t"));
        player.set_loop_mode(LoopMode::Queue);
        player.start_playback().await.unwrap();

        player.stop().await.unwrap();

        assert!(player.now_playing().is_none());
        assert!(player.queue().is_empty());
        assert_eq!(player.loop_mode(), LoopMode::Off);
        assert!(!player.is_connected());

        // An end event from before the stop is stale now and changes nothing.
        player.queue_mut().append(track("a"));
        player
            .handle_track_end(Some(track("t")), EndReason::Finished, session)
            .await
            .unwrap();
        assert!(player.now_playing().is_none());
        assert_eq!(queue_of(&player), ["a"]);
    }

    #[tokio::test]
    async fn play_now_replaces_queue_and_current_track() {
        let backend = Arc::new(MockBackend::new());
        let (mut player, _session) = connected_player(&backend);
        player.queue_mut().append(track("t"));
        player.queue_mut().append(track("a"));
        player.start_playback().await.unwrap();

        let started = player.play_now(track("x")).await.unwrap();

        assert_eq!(started.unwrap().id, "x");
        assert!(player.queue().is_empty());
        assert_eq!(
            backend.commands(),
            [
                Recorded::Play("t".into()),
                Recorded::Stop,
                Recorded::Play("x".into())
            ]
        );
    }

    #[tokio::test]
    async fn volume_rejects_out_of_range_values() {
        let backend = Arc::new(MockBackend::new());
        let (mut player, _session) = connected_player(&backend);

        assert!(matches!(
            player.set_volume(0).await,
            Err(Error::InvalidInput(_))
        ));
        assert!(matches!(
            player.set_volume(101).await,
            Err(Error::InvalidInput(_))
        ));

        player.set_volume(55).await.unwrap();
        assert_eq!(player.volume_percent(), 55);
        assert_eq!(backend.commands(), [Recorded::SetVolume(55)]);
    }

    #[tokio::test]
    async fn bassboost_validates_and_composes_filters() {
        let backend = Arc::new(MockBackend::new());
        let (mut player, _session) = connected_player(&backend);

        assert!(matches!(
            player.set_bassboost(Some(0)).await,
            Err(Error::InvalidInput(_))
        ));
        assert!(matches!(
            player.set_bassboost(Some(101)).await,
            Err(Error::InvalidInput(_))
        ));

        player.set_bassboost(Some(40)).await.unwrap();
        player.set_nightcore(true).await.unwrap();

        let commands = backend.commands();
        let Recorded::SetFilters(spec) = commands.last().unwrap() else {
            panic!("expected a filter command");
        };
        assert!(spec.equalizer.is_some());
        assert!(spec.timescale.is_some());

        // Turning bassboost off keeps nightcore applied.
        player.set_bassboost(None).await.unwrap();
        let commands = backend.commands();
        let Recorded::SetFilters(spec) = commands.last().unwrap() else {
            panic!("expected a filter command");
        };
        assert!(spec.equalizer.is_none());
        assert!(spec.timescale.is_some());
    }

    #[tokio::test]
    async fn replay_from_history_queues_next() {
        let backend = Arc::new(MockBackend::new());
        let (mut player, _session) = connected_player(&backend);
        for id in ["a", "b", "c"] {
            player.queue_mut().append(track(id));
            player.start_playback().await.unwrap();
        }

        // Index 0 is the newest entry.
        let replayed = player.replay_from_history(1).unwrap();
        assert_eq!(replayed.id, "b");
        assert_eq!(queue_of(&player), ["b"]);

        assert!(player.replay_from_history(10).is_err());
    }

    #[tokio::test]
    async fn commands_require_an_attached_backend() {
        let mut player = Player::new(1);
        assert!(matches!(player.skip().await, Err(Error::NotConnected)));
        assert!(matches!(player.stop().await, Err(Error::NotConnected)));
        assert!(matches!(
            player.set_paused(true).await,
            Err(Error::NotConnected)
        ));
        assert!(matches!(player.seek_ms(1000).await, Err(Error::NotConnected)));
    }
}
