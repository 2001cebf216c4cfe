use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use songbird::input::{ffmpeg, ytdl_search};
use songbird::tracks::TrackHandle;
use songbird::{ytdl, Call, Event, EventContext, EventHandler as VoiceEventHandler, TrackEvent};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::models::{EndReason, FilterSpec, TrackRef};

pub const UNKNOWN_TRACK_TITLE: &str = "UNKNOWN TRACK";

/// The audio server as seen by the playback state machine. One instance is
/// bound to one voice session; reconnecting produces a fresh instance with a
/// new session generation.
#[async_trait]
pub trait AudioBackend: Send + Sync {
    async fn search(&self, query: &str) -> Result<Vec<TrackRef>>;
    async fn play(&self, track: &TrackRef) -> Result<()>;
    async fn stop(&self) -> Result<()>;
    async fn pause(&self, paused: bool) -> Result<()>;
    async fn seek(&self, position_ms: u64) -> Result<()>;
    async fn set_volume(&self, percent: u8) -> Result<()>;
    async fn set_filters(&self, spec: &FilterSpec) -> Result<()>;
}

/// End-of-track notification, tagged with the session generation it belongs
/// to so handlers can discard events from a connection that was torn down.
#[derive(Clone, Debug)]
pub struct TrackEndEvent {
    pub guild_id: u64,
    pub session: u64,
    pub track: TrackRef,
    pub reason: EndReason,
}

struct ActiveTrack {
    handle: TrackHandle,
    /// Reason the *next* end event for this track should carry. Written just
    /// before a deliberate stop/replace; a natural end finds it empty.
    expectation: Arc<StdMutex<Option<EndReason>>>,
}

impl ActiveTrack {
    fn expect_end(&self, reason: EndReason) {
        if let Ok(mut slot) = self.expectation.lock() {
            *slot = Some(reason);
        }
    }
}

/// Production backend: drives the guild's songbird call. Search resolves via
/// yt-dlp metadata; playback re-resolves by URL at play time.
pub struct SongbirdBackend {
    guild_id: u64,
    session: u64,
    call: Arc<Mutex<Call>>,
    current: Mutex<Option<ActiveTrack>>,
    volume: StdMutex<f32>,
    events: mpsc::UnboundedSender<TrackEndEvent>,
}

impl SongbirdBackend {
    pub fn new(
        guild_id: u64,
        session: u64,
        call: Arc<Mutex<Call>>,
        volume: f32,
        events: mpsc::UnboundedSender<TrackEndEvent>,
    ) -> Self {
        SongbirdBackend {
            guild_id,
            session,
            call,
            current: Mutex::new(None),
            volume: StdMutex::new(volume),
            events,
        }
    }

    fn current_volume(&self) -> f32 {
        self.volume.lock().map(|v| *v).unwrap_or(1.0)
    }
}

#[async_trait]
impl AudioBackend for SongbirdBackend {
    async fn search(&self, query: &str) -> Result<Vec<TrackRef>> {
        let input = if query.starts_with("http") {
            ytdl(query).await
        } else {
            ytdl_search(query).await
        }
        .map_err(|e| Error::Backend(format!("search failed for '{query}': {e:?}")))?;

        let metadata = &input.metadata;
        let source_uri = metadata
            .source_url
            .clone()
            .ok_or_else(|| Error::Backend(format!("no source URL for '{query}'")))?;

        let track = TrackRef {
            id: source_uri.clone(),
            title: metadata
                .title
                .clone()
                .unwrap_or_else(|| UNKNOWN_TRACK_TITLE.to_string()),
            author: metadata
                .artist
                .clone()
                .or_else(|| metadata.channel.clone())
                .unwrap_or_default(),
            duration_ms: metadata
                .duration
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0),
            source_uri,
            is_local_file: false,
        };

        Ok(vec![track])
    }

    async fn play(&self, track: &TrackRef) -> Result<()> {
        let source = if track.is_local_file {
            ffmpeg(&track.source_uri).await
        } else {
            ytdl(&track.source_uri).await
        }
        .map_err(|e| Error::Backend(format!("could not load '{}': {e:?}", track.title)))?;

        let mut current = self.current.lock().await;
        if let Some(active) = current.take() {
            active.expect_end(EndReason::Replaced);
            if let Err(e) = active.handle.stop() {
                debug!("Stopping replaced track failed: {e:?}");
            }
        }

        let handle = {
            let mut call = self.call.lock().await;
            call.stop(); // Just in case something was playing before
            call.play_source(source)
        };

        if let Err(e) = handle.set_volume(self.current_volume()) {
            warn!("Setting volume on new track failed: {e:?}");
        }

        let expectation = Arc::new(StdMutex::new(None));
        handle
            .add_event(
                Event::Track(TrackEvent::End),
                EndNotifier {
                    guild_id: self.guild_id,
                    session: self.session,
                    track: track.clone(),
                    expectation: expectation.clone(),
                    events: self.events.clone(),
                },
            )
            .map_err(|e| Error::Backend(format!("could not watch track end: {e:?}")))?;

        info!("Playing {} - {}", track.title, track.source_uri);
        *current = Some(ActiveTrack { handle, expectation });

        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let mut current = self.current.lock().await;
        if let Some(active) = current.take() {
            active.expect_end(EndReason::Stopped);
            active
                .handle
                .stop()
                .map_err(|e| Error::Backend(format!("stop failed: {e:?}")))?;
        }
        Ok(())
    }

    async fn pause(&self, paused: bool) -> Result<()> {
        let current = self.current.lock().await;
        let active = current.as_ref().ok_or(Error::NotConnected)?;
        let result = if paused {
            active.handle.pause()
        } else {
            active.handle.play()
        };
        result.map_err(|e| Error::Backend(format!("pause({paused}) failed: {e:?}")))
    }

    async fn seek(&self, position_ms: u64) -> Result<()> {
        let current = self.current.lock().await;
        let active = current.as_ref().ok_or(Error::NotConnected)?;
        active
            .handle
            .seek_time(Duration::from_millis(position_ms))
            .map_err(|e| Error::Backend(format!("seek to {position_ms}ms failed: {e:?}")))
    }

    async fn set_volume(&self, percent: u8) -> Result<()> {
        let volume = f32::from(percent) / 100.0;
        if let Ok(mut slot) = self.volume.lock() {
            *slot = volume;
        }
        let current = self.current.lock().await;
        if let Some(active) = current.as_ref() {
            active
                .handle
                .set_volume(volume)
                .map_err(|e| Error::Backend(format!("set_volume failed: {e:?}")))?;
        }
        Ok(())
    }

    async fn set_filters(&self, _spec: &FilterSpec) -> Result<()> {
        // The local mixer has no equalizer/timescale stage; a filter-capable
        // node is required for these.
        Err(Error::Backend(
            "this audio backend cannot apply equalizer/timescale filters".to_string(),
        ))
    }
}

struct EndNotifier {
    guild_id: u64,
    session: u64,
    track: TrackRef,
    expectation: Arc<StdMutex<Option<EndReason>>>,
    events: mpsc::UnboundedSender<TrackEndEvent>,
}

#[async_trait]
impl VoiceEventHandler for EndNotifier {
    async fn act(&self, _ctx: &EventContext<'_>) -> Option<Event> {
        let reason = match self.expectation.lock() {
            Ok(mut slot) => slot.take().unwrap_or(EndReason::Finished),
            Err(_) => EndReason::Unknown,
        };

        info!(
            "Track ended in guild {}: {} ({reason:?})",
            self.guild_id, self.track.title
        );

        let _ = self.events.send(TrackEndEvent {
            guild_id: self.guild_id,
            session: self.session,
            track: self.track.clone(),
            reason,
        });

        None
    }
}
