use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// A playable item as resolved by the audio backend. Identity is the `id`
/// assigned by the source; two refs with equal fields are the same track.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackRef {
    pub id: String,
    pub title: String,
    pub author: String,
    /// 0 when the source reports no length (live streams, local files).
    pub duration_ms: u64,
    pub source_uri: String,
    #[serde(default)]
    pub is_local_file: bool,
}

impl TrackRef {
    pub fn duration_text(&self) -> String {
        if self.duration_ms == 0 {
            return "?".to_string();
        }
        let mins = self.duration_ms / 60_000;
        let secs = (self.duration_ms / 1000) % 60;
        format!("{mins}:{secs:02}")
    }
}

impl fmt::Display for TrackRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]", self.title, self.author)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum LoopMode {
    #[default]
    Off,
    Single,
    Queue,
}

impl FromStr for LoopMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "off" => Ok(LoopMode::Off),
            "single" => Ok(LoopMode::Single),
            "queue" => Ok(LoopMode::Queue),
            other => Err(format!("unknown loop mode '{other}'")),
        }
    }
}

impl fmt::Display for LoopMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoopMode::Off => write!(f, "off"),
            LoopMode::Single => write!(f, "single"),
            LoopMode::Queue => write!(f, "queue"),
        }
    }
}

/// Why the backend reported end-of-track.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EndReason {
    Finished,
    LoadFailed,
    Stopped,
    Replaced,
    Unknown,
}

/// Filter chain understood by filter-capable backends.
#[derive(Clone, Debug, PartialEq)]
pub struct FilterSpec {
    pub equalizer: Option<Vec<EqBand>>,
    pub timescale: Option<Timescale>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct EqBand {
    pub band: u8,
    pub gain: f32,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Timescale {
    pub speed: f32,
    pub pitch: f32,
    pub rate: f32,
}

pub const EQ_BAND_COUNT: u8 = 15;
/// Bands 0..7 carry the low end; bassboost only raises these.
const BASS_BANDS: u8 = 7;

impl FilterSpec {
    /// Boost the low bands proportionally to `level` (1-100).
    pub fn bassboost(level: u8) -> Self {
        let boost = (f32::from(level) / 100.0) * 0.5;
        let bands = (0..EQ_BAND_COUNT)
            .map(|band| EqBand {
                band,
                gain: if band < BASS_BANDS { boost } else { 0.0 },
            })
            .collect();
        FilterSpec {
            equalizer: Some(bands),
            timescale: None,
        }
    }

    pub fn nightcore() -> Self {
        FilterSpec {
            equalizer: None,
            timescale: Some(Timescale {
                speed: 1.1,
                pitch: 1.2,
                rate: 1.0,
            }),
        }
    }

    /// Clears every filter the backend has applied.
    pub fn reset() -> Self {
        FilterSpec {
            equalizer: None,
            timescale: None,
        }
    }
}

/// What the external streaming service reports as playing right now.
#[derive(Clone, Debug, PartialEq)]
pub struct NowPlayingSnapshot {
    pub track_id: String,
    pub title: String,
    pub artists: Vec<String>,
    pub is_playing: bool,
    pub position_ms: u64,
}

impl NowPlayingSnapshot {
    /// Textual query used to resolve this track against the audio backend.
    pub fn search_query(&self) -> String {
        let artists = self.artists.join(" ");
        if artists.is_empty() {
            self.title.clone()
        } else {
            format!("{} {}", self.title, artists)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loop_mode_parses_case_insensitively() {
        assert_eq!("Single".parse::<LoopMode>().unwrap(), LoopMode::Single);
        assert_eq!("QUEUE".parse::<LoopMode>().unwrap(), LoopMode::Queue);
        assert_eq!("off".parse::<LoopMode>().unwrap(), LoopMode::Off);
        assert!("shuffle".parse::<LoopMode>().is_err());
    }

    #[test]
    fn bassboost_raises_only_low_bands() {
        let spec = FilterSpec::bassboost(40);
        let bands = spec.equalizer.expect("equalizer set");
        assert_eq!(bands.len(), usize::from(EQ_BAND_COUNT));
        for band in &bands {
            if band.band < 7 {
                assert!((band.gain - 0.2).abs() < f32::EPSILON);
            } else {
                assert_eq!(band.gain, 0.0);
            }
        }
    }

    #[test]
    fn snapshot_query_joins_title_and_artists() {
        let snap = NowPlayingSnapshot {
            track_id: "t1".into(),
            title: "Song".into(),
            artists: vec!["A".into(), "B".into()],
            is_playing: true,
            position_ms: 0,
        };
        assert_eq!(snap.search_query(), "Song A B");
    }
}
