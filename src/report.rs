//! Incident report produced by one sampling run.

use serde::ser::{SerializeStruct, Serializer};
use serde::Serialize;
use std::fmt;

use crate::frame::Frame;

/// Whole seconds from the start of the video.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VideoTimestamp {
    seconds: u64,
}

impl VideoTimestamp {
    pub fn from_secs(seconds: u64) -> Self {
        Self { seconds }
    }

    /// `floor(frame_index / fps)`. `fps` must be positive and finite.
    pub fn for_frame(frame_index: u64, fps: f64) -> Self {
        let seconds = (frame_index as f64 / fps).floor();
        Self {
            seconds: if seconds.is_finite() && seconds > 0.0 {
                seconds as u64
            } else {
                0
            },
        }
    }

    pub fn as_secs(&self) -> u64 {
        self.seconds
    }
}

/// Formats as `H:MM:SS`, with a `N day, ` / `N days, ` prefix past 24 hours.
impl fmt::Display for VideoTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let days = self.seconds / 86_400;
        let rem = self.seconds % 86_400;
        let (h, m, s) = (rem / 3600, (rem % 3600) / 60, rem % 60);
        match days {
            0 => write!(f, "{h}:{m:02}:{s:02}"),
            1 => write!(f, "1 day, {h}:{m:02}:{s:02}"),
            n => write!(f, "{n} days, {h}:{m:02}:{s:02}"),
        }
    }
}

impl Serialize for VideoTimestamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// A sampled frame the classifier judged positive.
#[derive(Clone, Debug)]
pub struct Incident {
    pub frame_index: u64,
    pub timestamp: VideoTimestamp,
    /// The frame as decoded, before any annotation.
    pub frame: Frame,
    /// Reply text that produced the positive verdict.
    pub reply: String,
}

impl Incident {
    pub fn caption(&self) -> String {
        format!("Accident at {}", self.timestamp)
    }
}

impl Serialize for Incident {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("Incident", 4)?;
        state.serialize_field("frame_index", &self.frame_index)?;
        state.serialize_field("timestamp", &self.timestamp)?;
        state.serialize_field("seconds", &self.timestamp.as_secs())?;
        state.serialize_field("reply", &self.reply)?;
        state.end()
    }
}

/// Accumulated incidents for one run, in stream order.
#[derive(Clone, Debug, Default, Serialize)]
pub struct IncidentReport {
    incidents: Vec<Incident>,
    pub frames_decoded: u64,
    pub frames_classified: u64,
    pub effective_fps: f64,
    pub stride: u64,
}

impl IncidentReport {
    pub(crate) fn new(effective_fps: f64, stride: u64) -> Self {
        Self {
            effective_fps,
            stride,
            ..Self::default()
        }
    }

    /// Append an incident. Sequential traversal keeps timestamps non-decreasing.
    pub(crate) fn push(&mut self, incident: Incident) {
        debug_assert!(self
            .incidents
            .last()
            .map_or(true, |last| last.timestamp <= incident.timestamp));
        self.incidents.push(incident);
    }

    pub fn incidents(&self) -> &[Incident] {
        &self.incidents
    }

    pub fn timestamps(&self) -> Vec<VideoTimestamp> {
        self.incidents.iter().map(|i| i.timestamp).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.incidents.is_empty()
    }

    pub fn len(&self) -> usize {
        self.incidents.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamps_match_timedelta_layout() {
        assert_eq!(VideoTimestamp::from_secs(0).to_string(), "0:00:00");
        assert_eq!(VideoTimestamp::from_secs(1).to_string(), "0:00:01");
        assert_eq!(VideoTimestamp::from_secs(3661).to_string(), "1:01:01");
        assert_eq!(VideoTimestamp::from_secs(86_400).to_string(), "1 day, 0:00:00");
        assert_eq!(
            VideoTimestamp::from_secs(2 * 86_400 + 59).to_string(),
            "2 days, 0:00:59"
        );
    }

    #[test]
    fn frame_timestamp_floors() {
        assert_eq!(VideoTimestamp::for_frame(0, 30.0).as_secs(), 0);
        assert_eq!(VideoTimestamp::for_frame(29, 30.0).as_secs(), 0);
        assert_eq!(VideoTimestamp::for_frame(30, 30.0).as_secs(), 1);
        assert_eq!(VideoTimestamp::for_frame(60, 29.97).as_secs(), 2);
        assert_eq!(VideoTimestamp::for_frame(89, 29.97).as_secs(), 2);
        assert_eq!(VideoTimestamp::for_frame(90, 29.97).as_secs(), 3);
    }

    #[test]
    fn incident_serializes_without_pixels() {
        let frame = Frame::from_rgb(30, 1, 1, vec![0, 0, 0]).unwrap();
        let incident = Incident {
            frame_index: 30,
            timestamp: VideoTimestamp::from_secs(1),
            frame,
            reply: "yes".to_string(),
        };
        let value = serde_json::to_value(&incident).unwrap();
        assert_eq!(value["timestamp"], "0:00:01");
        assert_eq!(value["seconds"], 1);
        assert!(value.get("frame").is_none());
        assert_eq!(incident.caption(), "Accident at 0:00:01");
    }
}
