#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(rust_2018_idioms)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

//! # Bandlink
//!
//! A Rust library for encoding and decoding the wire protocols spoken by BLE
//! wearable fitness devices (bands and watches).
//!
//! Bandlink is the codec core only: it turns raw characteristic notifications
//! into typed, validated records and turns typed requests back into
//! MTU-sized wire frames. Everything around it — the GATT connection, the
//! pairing/session crypto, persistence, and progress UI — is modeled as an
//! external collaborator trait the embedding application implements.
//!
//! ## Layers
//!
//! - **TLV codec** ([`tlv`]): the tag-length-value trees used by structured
//!   command payloads, with forward-compatible decoding of unknown tags
//! - **Packet framing** ([`packet`]): service/command headers, optional
//!   payload encryption via a delegate, and MTU-driven fragmentation
//! - **Chunked fetch** ([`fetch`]): reassembly of multi-chunk recorded-data
//!   files with CRC32 validation and a skip-and-continue dispatch queue
//! - **Record decoding** ([`record`]): fixed-layout binary sample records
//!   with typed, optional field accessors and GPS/altitude/time conversions
//! - **Summaries** ([`summary`]): absent-skipping reduction of a workout's
//!   samples into unit-tagged statistics
//!
//! ## Quick Start
//!
//! ```
//! use bandlink::{ActivitySample, SummaryBuilder};
//!
//! let mut sample = ActivitySample::at(1_700_000_000);
//! sample.heart_rate = Some(72);
//! sample.altitude = Some(104.5);
//!
//! let summary = SummaryBuilder::new(1).build(&[sample], 120);
//! assert_eq!(summary.heart_rate_avg.unwrap().value, 72.0);
//! ```

/// Error types and handling
pub mod error;
/// Chunked recorded-data fetching and reassembly
pub mod fetch;
/// Packet framing, encryption delegation, and MTU fragmentation
pub mod packet;
/// Fixed-layout binary record decoding
pub mod record;
/// Workout summary aggregation
pub mod summary;
/// Tag-length-value tree encoding and decoding
pub mod tlv;
/// Type definitions and data structures
pub mod types;

// Re-export the main types for convenient usage
pub use error::{BandlinkError, Result};
pub use fetch::{
    ActivityFetcher, FetchState, FetchTransport, FileOutcome, ProgressSink, RecordedDataDecoder,
    SampleSink,
};
pub use packet::{CommandId, Packet, Payload, PayloadCipher, ResponseAssembler};
pub use record::{DeviceEpoch, RecordData, RecordDefinition, SampleRecord, SportSampleDecoder};
pub use summary::SummaryBuilder;
pub use tlv::{Tlv, TlvValue};
pub use types::{
    ActivityFileId, ActivitySample, FileKind, Measurement, Unit, WorkoutSummary,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
