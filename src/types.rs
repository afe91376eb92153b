use serde::{Deserialize, Serialize};
use std::fmt;

/// Unit of measure attached to every aggregated value
///
/// Downstream consumers render values directly from the label instead of
/// re-deriving units from field names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Unit {
    /// Heart beats per minute
    Bpm,
    /// Meters
    Meters,
    /// Meters per second
    MetersPerSecond,
    /// Steps per minute
    StepsPerMinute,
    /// Step count
    Steps,
    /// Seconds
    Seconds,
    /// Kilocalories
    Kilocalories,
    /// Decimal degrees
    Degrees,
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bpm => write!(f, "bpm"),
            Self::Meters => write!(f, "m"),
            Self::MetersPerSecond => write!(f, "m/s"),
            Self::StepsPerMinute => write!(f, "spm"),
            Self::Steps => write!(f, "steps"),
            Self::Seconds => write!(f, "s"),
            Self::Kilocalories => write!(f, "kcal"),
            Self::Degrees => write!(f, "deg"),
        }
    }
}

/// A value tagged with its unit of measure
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    /// Numeric value
    pub value: f64,
    /// Unit the value is expressed in
    pub unit: Unit,
}

impl Measurement {
    /// Create a new measurement
    #[must_use]
    pub const fn new(value: f64, unit: Unit) -> Self {
        Self { value, unit }
    }
}

impl fmt::Display for Measurement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.value, self.unit)
    }
}

/// Family of a recorded-data file, used to look up the matching decoder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FileKind {
    /// Daily activity data (steps, rest heart rate)
    Activity = 0,
    /// Per-second workout samples
    Sport = 1,
    /// Sleep stage data
    Sleep = 2,
    /// Unrecognized file kind
    Unknown = 0xFF,
}

impl From<u8> for FileKind {
    fn from(value: u8) -> Self {
        match value {
            0 => Self::Activity,
            1 => Self::Sport,
            2 => Self::Sleep,
            _ => Self::Unknown,
        }
    }
}

/// Identifier of one fetchable unit of recorded sensor data
///
/// Seven bytes on the wire: a little-endian seconds timestamp, a timezone
/// offset in quarter hours, a layout version, and the file kind byte. The
/// derived ordering is chronological, which is also the fetch queue priority.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct ActivityFileId {
    /// Device-local seconds timestamp of the recording
    pub timestamp: u32,
    /// Timezone offset in quarter hours
    pub timezone: i8,
    /// Layout version of the file contents
    pub version: u8,
    /// Raw file kind byte (dispatch key)
    pub kind: u8,
}

/// Length of the identifier block on the wire
pub const FILE_ID_LEN: usize = 7;

impl ActivityFileId {
    /// Parse an identifier from its 7-byte wire form
    #[must_use]
    pub fn from_bytes(data: &[u8; FILE_ID_LEN]) -> Self {
        Self {
            timestamp: u32::from_le_bytes([data[0], data[1], data[2], data[3]]),
            timezone: data[4] as i8,
            version: data[5],
            kind: data[6],
        }
    }

    /// Serialize the identifier to its 7-byte wire form
    #[must_use]
    pub fn to_bytes(&self) -> [u8; FILE_ID_LEN] {
        let ts = self.timestamp.to_le_bytes();
        [
            ts[0],
            ts[1],
            ts[2],
            ts[3],
            self.timezone as u8,
            self.version,
            self.kind,
        ]
    }

    /// The decoder family this file belongs to
    #[must_use]
    pub fn file_kind(&self) -> FileKind {
        FileKind::from(self.kind)
    }
}

impl fmt::Display for ActivityFileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "file[ts={}, tz={}, v={}, kind={:02X}]",
            self.timestamp, self.timezone, self.version, self.kind
        )
    }
}

/// One decoded per-sample record from a workout or activity file
///
/// Fields the device did not report for a sample are `None`; aggregation
/// skips them rather than counting them as zero.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivitySample {
    /// Absolute sample time, seconds since the Unix epoch
    pub timestamp: i64,
    /// Latitude in decimal degrees
    pub latitude: Option<f64>,
    /// Longitude in decimal degrees
    pub longitude: Option<f64>,
    /// Altitude in meters
    pub altitude: Option<f64>,
    /// Heart rate in beats per minute
    pub heart_rate: Option<u8>,
    /// Speed in meters per second
    pub speed: Option<f64>,
    /// Steps taken during this sample interval
    pub steps: Option<u16>,
    /// Kilocalories burned during this sample interval
    pub calories: Option<u16>,
    /// Cumulative distance in meters
    pub distance: Option<f64>,
}

impl ActivitySample {
    /// Create an empty sample at a point in time
    #[must_use]
    pub const fn at(timestamp: i64) -> Self {
        Self {
            timestamp,
            latitude: None,
            longitude: None,
            altitude: None,
            heart_rate: None,
            speed: None,
            steps: None,
            calories: None,
            distance: None,
        }
    }
}

/// Aggregated statistics for one workout session
///
/// Built wholly in memory by one reduction pass over the session's samples
/// and handed off complete; absent statistics stay `None`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkoutSummary {
    /// Identifier of the workout the samples belong to
    pub workout_id: u32,
    /// Session duration
    pub duration: Measurement,
    /// Average heart rate over samples that reported one
    pub heart_rate_avg: Option<Measurement>,
    /// Minimum reported heart rate
    pub heart_rate_min: Option<Measurement>,
    /// Maximum reported heart rate
    pub heart_rate_max: Option<Measurement>,
    /// Average speed over samples that reported one
    pub speed_avg: Option<Measurement>,
    /// Total steps
    pub step_total: Option<Measurement>,
    /// Steps per minute; absent when the session is shorter than a minute
    pub step_rate_avg: Option<Measurement>,
    /// Total kilocalories
    pub calorie_total: Option<Measurement>,
    /// Final cumulative distance
    pub distance_total: Option<Measurement>,
    /// Average altitude
    pub altitude_avg: Option<Measurement>,
    /// Minimum altitude
    pub altitude_min: Option<Measurement>,
    /// Maximum altitude
    pub altitude_max: Option<Measurement>,
    /// Cumulative ascent across consecutive altitude readings
    pub ascent: Option<Measurement>,
    /// Cumulative descent across consecutive altitude readings
    pub descent: Option<Measurement>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_id_round_trip() {
        let id = ActivityFileId {
            timestamp: 1_700_000_000,
            timezone: 8,
            version: 2,
            kind: 1,
        };
        assert_eq!(ActivityFileId::from_bytes(&id.to_bytes()), id);
        assert_eq!(id.file_kind(), FileKind::Sport);
    }

    #[test]
    fn test_file_id_wire_layout_little_endian() {
        let id = ActivityFileId::from_bytes(&[0x01, 0x02, 0x03, 0x04, 0xFC, 0x05, 0x00]);
        assert_eq!(id.timestamp, 0x0403_0201);
        assert_eq!(id.timezone, -4);
        assert_eq!(id.version, 5);
        assert_eq!(id.file_kind(), FileKind::Activity);
    }

    #[test]
    fn test_file_id_chronological_ordering() {
        let earlier = ActivityFileId {
            timestamp: 100,
            timezone: 0,
            version: 1,
            kind: 1,
        };
        let later = ActivityFileId {
            timestamp: 200,
            timezone: 0,
            version: 1,
            kind: 0,
        };
        assert!(earlier < later);
    }

    #[test]
    fn test_file_kind_from_u8() {
        assert_eq!(FileKind::from(0), FileKind::Activity);
        assert_eq!(FileKind::from(1), FileKind::Sport);
        assert_eq!(FileKind::from(2), FileKind::Sleep);
        assert_eq!(FileKind::from(99), FileKind::Unknown);
    }

    #[test]
    fn test_measurement_display() {
        let m = Measurement::new(70.0, Unit::Bpm);
        assert_eq!(format!("{m}"), "70 bpm");
    }

    #[test]
    fn test_empty_sample() {
        let sample = ActivitySample::at(42);
        assert_eq!(sample.timestamp, 42);
        assert!(sample.heart_rate.is_none());
        assert!(sample.altitude.is_none());
    }
}
