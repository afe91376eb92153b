use crate::{
    error::{BandlinkError, Result},
    fetch::RecordedDataDecoder,
    types::{ActivityFileId, ActivitySample},
};
use bytes::Buf;
use std::collections::HashMap;
use tracing::debug;

/// Scale factor between semicircles and degrees: 2^31 units per 180 degrees
const SEMICIRCLES_PER_DEGREE: f64 = 2_147_483_648.0 / 180.0;

/// Convert a device-native semicircle angle to decimal degrees
#[must_use]
pub fn semicircles_to_degrees(semicircles: i64) -> f64 {
    semicircles as f64 / SEMICIRCLES_PER_DEGREE
}

/// Offset between the device's epoch and the Unix epoch, in seconds
///
/// Recorded timestamps are seconds since a device-specific epoch; the session
/// layer knows which device family is connected and supplies the offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceEpoch {
    offset_secs: i64,
}

impl DeviceEpoch {
    /// Create an epoch with the given offset from the Unix epoch
    #[must_use]
    pub const fn new(offset_secs: i64) -> Self {
        Self { offset_secs }
    }

    /// Convert a device-relative timestamp to seconds since the Unix epoch
    #[must_use]
    pub const fn to_unix(&self, device_ts: u32) -> i64 {
        self.offset_secs + device_ts as i64
    }
}

/// Wire type of one record field
///
/// Scalars are little-endian. Each fixed-width kind reserves an all-ones
/// (or max-positive, for signed) bit pattern as its "not present" sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// Unsigned byte, absent when 0xFF
    U8,
    /// Unsigned 16-bit, absent when 0xFFFF
    U16,
    /// Unsigned 32-bit, absent when 0xFFFF_FFFF
    U32,
    /// Signed 32-bit, absent when 0x7FFF_FFFF
    I32,
    /// Variable-width unsigned integer, 7 bits per byte, high bit continues
    Varint,
    /// Fixed-width NUL-padded string, absent when empty
    Str(u8),
}

/// A typed value extracted from a record field slot
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    /// Unsigned integer value
    Uint(u64),
    /// Signed integer value
    Int(i64),
    /// String value
    Text(String),
}

/// One field slot in a record layout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldDef {
    /// Numeric field index the field is addressed by
    pub number: u8,
    /// Wire type of the slot
    pub kind: FieldKind,
}

impl FieldDef {
    /// Create a field definition
    #[must_use]
    pub const fn new(number: u8, kind: FieldKind) -> Self {
        Self { number, kind }
    }
}

/// Layout of one record family, keyed by its global message number
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordDefinition {
    /// Global message number identifying the record family
    pub global_number: u16,
    /// Field slots in wire order
    pub fields: Vec<FieldDef>,
}

/// A parsed record: typed field values addressed by field number
///
/// Fields whose slot held the kind's "not present" sentinel are simply
/// missing from the record; accessors return `None` instead of failing,
/// since optional fields are routine across firmware and record variants.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordData {
    global_number: u16,
    values: HashMap<u8, FieldValue>,
    wire_size: usize,
}

impl RecordData {
    /// Parse one record from the front of a buffer
    ///
    /// # Errors
    ///
    /// Returns [`BandlinkError::RecordDecode`] when the buffer is shorter than
    /// the layout requires or a varint is malformed.
    pub fn parse(definition: &RecordDefinition, data: &[u8]) -> Result<Self> {
        let mut buf = data;
        let mut values = HashMap::new();

        for field in &definition.fields {
            let value = match field.kind {
                FieldKind::U8 => {
                    let v = take_u8(&mut buf, field.number)?;
                    (v != 0xFF).then(|| FieldValue::Uint(v as u64))
                }
                FieldKind::U16 => {
                    need(&mut buf, 2, field.number)?;
                    let v = buf.get_u16_le();
                    (v != 0xFFFF).then(|| FieldValue::Uint(v as u64))
                }
                FieldKind::U32 => {
                    need(&mut buf, 4, field.number)?;
                    let v = buf.get_u32_le();
                    (v != 0xFFFF_FFFF).then(|| FieldValue::Uint(v as u64))
                }
                FieldKind::I32 => {
                    need(&mut buf, 4, field.number)?;
                    let v = buf.get_i32_le();
                    (v != 0x7FFF_FFFF).then(|| FieldValue::Int(v as i64))
                }
                FieldKind::Varint => Some(FieldValue::Uint(take_varint(&mut buf, field.number)?)),
                FieldKind::Str(width) => {
                    need(&mut buf, width as usize, field.number)?;
                    let raw = &buf[..width as usize];
                    let trimmed: Vec<u8> =
                        raw.iter().copied().take_while(|b| *b != 0).collect();
                    buf.advance(width as usize);
                    if trimmed.is_empty() {
                        None
                    } else {
                        let text = String::from_utf8(trimmed).map_err(|_| {
                            BandlinkError::RecordDecode(format!(
                                "field {} is not valid UTF-8",
                                field.number
                            ))
                        })?;
                        Some(FieldValue::Text(text))
                    }
                }
            };
            if let Some(value) = value {
                values.insert(field.number, value);
            }
        }

        Ok(Self {
            global_number: definition.global_number,
            values,
            wire_size: data.len() - buf.remaining(),
        })
    }

    /// Global message number this record was parsed as
    #[must_use]
    pub const fn global_number(&self) -> u16 {
        self.global_number
    }

    /// Bytes this record occupied on the wire
    #[must_use]
    pub const fn wire_size(&self) -> usize {
        self.wire_size
    }

    /// Look up a field by its numeric index
    #[must_use]
    pub fn field(&self, number: u8) -> Option<&FieldValue> {
        self.values.get(&number)
    }

    fn field_u64(&self, number: u8) -> Option<u64> {
        match self.field(number)? {
            FieldValue::Uint(v) => Some(*v),
            _ => None,
        }
    }

    fn field_i64(&self, number: u8) -> Option<i64> {
        match self.field(number)? {
            FieldValue::Int(v) => Some(*v),
            FieldValue::Uint(v) => i64::try_from(*v).ok(),
            FieldValue::Text(_) => None,
        }
    }
}

fn need(buf: &mut &[u8], n: usize, field: u8) -> Result<()> {
    if buf.remaining() < n {
        return Err(BandlinkError::RecordDecode(format!(
            "buffer ends inside field {field}: need {n} byte(s), have {}",
            buf.remaining()
        )));
    }
    Ok(())
}

fn take_u8(buf: &mut &[u8], field: u8) -> Result<u8> {
    need(buf, 1, field)?;
    Ok(buf.get_u8())
}

fn take_varint(buf: &mut &[u8], field: u8) -> Result<u64> {
    let mut value = 0u64;
    for shift in (0..64).step_by(7) {
        let byte = take_u8(buf, field)?;
        value |= ((byte & 0x7F) as u64) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
    }
    Err(BandlinkError::RecordDecode(format!(
        "varint in field {field} exceeds 64 bits"
    )))
}

/// Per-sample workout record (global message number 20)
///
/// Field numbers follow the device's sport telemetry layout: position in
/// semicircles, heart rate, cumulative distance, enhanced speed and altitude,
/// and a device-epoch timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleRecord {
    data: RecordData,
}

impl SampleRecord {
    /// Global message number of per-sample workout records
    pub const GLOBAL_NUMBER: u16 = 20;

    /// Canonical field layout for this record family
    #[must_use]
    pub fn definition() -> RecordDefinition {
        RecordDefinition {
            global_number: Self::GLOBAL_NUMBER,
            fields: vec![
                FieldDef::new(0, FieldKind::I32),  // latitude, semicircles
                FieldDef::new(1, FieldKind::I32),  // longitude, semicircles
                FieldDef::new(3, FieldKind::U8),   // heart rate, bpm
                FieldDef::new(5, FieldKind::U32),  // distance, cm
                FieldDef::new(73, FieldKind::U32), // enhanced speed, device-scaled
                FieldDef::new(78, FieldKind::U32), // enhanced altitude, decimeters
                FieldDef::new(253, FieldKind::U32), // timestamp, device epoch
            ],
        }
    }

    /// Wrap a parsed record in typed accessors
    ///
    /// # Panics
    ///
    /// Panics if the record was parsed under a different global message
    /// number. That is a mis-dispatch upstream, not a data problem, and must
    /// surface during development rather than be silently recovered.
    #[must_use]
    pub fn new(data: RecordData) -> Self {
        assert_eq!(
            data.global_number(),
            Self::GLOBAL_NUMBER,
            "SampleRecord expects global message {}, got {}",
            Self::GLOBAL_NUMBER,
            data.global_number()
        );
        Self { data }
    }

    /// Latitude in semicircles
    #[must_use]
    pub fn latitude(&self) -> Option<i64> {
        self.data.field_i64(0)
    }

    /// Longitude in semicircles
    #[must_use]
    pub fn longitude(&self) -> Option<i64> {
        self.data.field_i64(1)
    }

    /// Heart rate in beats per minute
    #[must_use]
    pub fn heart_rate(&self) -> Option<u8> {
        self.data.field_u64(3).map(|v| v as u8)
    }

    /// Cumulative distance in centimeters
    #[must_use]
    pub fn distance(&self) -> Option<u64> {
        self.data.field_u64(5)
    }

    /// Speed, already scaled by the device; passed through unchanged
    #[must_use]
    pub fn enhanced_speed(&self) -> Option<u64> {
        self.data.field_u64(73)
    }

    /// Altitude in decimeters
    #[must_use]
    pub fn enhanced_altitude(&self) -> Option<u64> {
        self.data.field_u64(78)
    }

    /// Timestamp in seconds since the device epoch
    #[must_use]
    pub fn timestamp(&self) -> Option<u32> {
        self.data.field_u64(253).map(|v| v as u32)
    }

    /// Bytes this record occupied on the wire
    #[must_use]
    pub const fn wire_size(&self) -> usize {
        self.data.wire_size()
    }

    /// Convert to a domain sample, applying unit conversions
    ///
    /// Coordinates become decimal degrees, altitude becomes meters (stored
    /// value divided by 10), distance becomes meters (divided by 100), speed
    /// is passed through, and the timestamp is shifted onto the Unix epoch.
    #[must_use]
    pub fn to_sample(&self, epoch: DeviceEpoch) -> ActivitySample {
        let mut sample = ActivitySample::at(epoch.to_unix(self.timestamp().unwrap_or(0)));
        if let (Some(lat), Some(lon)) = (self.latitude(), self.longitude()) {
            sample.latitude = Some(semicircles_to_degrees(lat));
            sample.longitude = Some(semicircles_to_degrees(lon));
        }
        sample.altitude = self.enhanced_altitude().map(|alt| alt as f64 / 10.0);
        sample.speed = self.enhanced_speed().map(|v| v as f64);
        sample.heart_rate = self.heart_rate();
        sample.distance = self.distance().map(|d| d as f64 / 100.0);
        sample
    }
}

/// Decodes a sport file's data block as consecutive sample records
///
/// Registered with the fetcher for [`crate::types::FileKind::Sport`] files.
/// The block must be an exact sequence of [`SampleRecord`] layouts; leftover
/// bytes that cannot form a record fail the whole file, which the fetch loop
/// then skips.
#[derive(Debug, Clone, Copy)]
pub struct SportSampleDecoder {
    epoch: DeviceEpoch,
}

impl SportSampleDecoder {
    /// Create a decoder converting timestamps via the given device epoch
    #[must_use]
    pub const fn new(epoch: DeviceEpoch) -> Self {
        Self { epoch }
    }
}

impl RecordedDataDecoder for SportSampleDecoder {
    fn decode(&self, id: &ActivityFileId, data: &[u8]) -> Result<Vec<ActivitySample>> {
        let definition = SampleRecord::definition();
        let mut samples = Vec::new();
        let mut offset = 0;
        while offset < data.len() {
            let record = RecordData::parse(&definition, &data[offset..])?;
            offset += record.wire_size();
            samples.push(SampleRecord::new(record).to_sample(self.epoch));
        }
        debug!("Decoded {} sample record(s) from {}", samples.len(), id);
        Ok(samples)
    }
}
