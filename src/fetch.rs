use crate::{
    error::{BandlinkError, Result},
    types::{ActivityFileId, ActivitySample, FileKind, FILE_ID_LEN},
};
use async_trait::async_trait;
use bytes::BytesMut;
use std::{
    cmp::Reverse,
    collections::{BinaryHeap, HashMap, HashSet},
};
use tracing::{debug, error, info, warn};

/// Minimum length of a reassembled payload: identifier block, separator,
/// at least one data byte, and the CRC32 trailer
pub const MIN_PAYLOAD_LEN: usize = 13;

/// Length of the CRC32 trailer
const CRC_LEN: usize = 4;

/// Length of the per-chunk header: total count and index, both u16 LE
const CHUNK_HEADER_LEN: usize = 4;

/// Offset of the data block inside a validated payload
const DATA_OFFSET: usize = FILE_ID_LEN + 1;

/// Transport collaborator that asks the device for one recorded file
///
/// The transport owns connection management and timeouts; the fetcher only
/// issues requests and consumes the chunks the transport delivers back
/// through [`ActivityFetcher::add_chunk`].
#[async_trait]
pub trait FetchTransport: Send + Sync {
    /// Request the chunked contents of one recorded file
    ///
    /// # Errors
    ///
    /// Returns a transport-level error when the request cannot be issued;
    /// such errors abort the session rather than a single file.
    async fn request_file(&self, id: &ActivityFileId) -> Result<()>;
}

/// Decoder for one recorded-data file family
pub trait RecordedDataDecoder: Send + Sync {
    /// Decode a validated data block into samples
    ///
    /// # Errors
    ///
    /// Returns [`BandlinkError::RecordDecode`] when the block's internal
    /// structure is malformed. The fetch loop treats this as skippable.
    fn decode(&self, id: &ActivityFileId, data: &[u8]) -> Result<Vec<ActivitySample>>;
}

/// Storage collaborator receiving decoded samples
///
/// Persistence itself (database, files) lives outside the protocol layer;
/// this trait only hands over plain structured records.
pub trait SampleSink: Send + Sync {
    /// Store the samples decoded from one file
    fn store(&self, id: &ActivityFileId, samples: Vec<ActivitySample>);
}

/// Progress collaborator for busy-state reporting
///
/// All methods default to no-ops so callers only observe what they need.
pub trait ProgressSink: Send + Sync {
    /// The fetch queue started draining
    fn fetch_started(&self) {}

    /// One file finished, successfully or not
    fn file_done(&self, id: &ActivityFileId, outcome: &FileOutcome) {
        let _ = (id, outcome);
    }

    /// The fetch queue drained and the fetcher is idle again
    fn fetch_finished(&self) {}
}

/// Outcome of processing one reassembled payload
///
/// Every outcome advances the queue: a single bad file never stalls the
/// remaining fetches. A skipped file keeps the error that disqualified it.
#[derive(Debug)]
pub enum FileOutcome {
    /// The payload validated, decoded, and was handed to the sample sink
    Parsed {
        /// Number of samples decoded from the file
        sample_count: usize,
    },
    /// The payload was discarded and the queue moved on
    Skipped(BandlinkError),
}

impl FileOutcome {
    /// Whether the file produced stored samples
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Parsed { .. })
    }
}

/// Fetch session state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchState {
    /// No fetch in flight; the queue is empty
    Idle,
    /// Waiting for the chunks of one requested file
    Fetching(ActivityFileId),
}

/// Drives fetching of recorded-data files too large for one transport write
///
/// Callers enqueue file identifiers with [`fetch`](Self::fetch); the fetcher
/// requests them one at a time in chronological order, reassembles the chunk
/// stream the transport delivers, validates length and CRC32, and dispatches
/// each validated payload to the decoder registered for its file kind.
///
/// Malformed payloads, unknown file kinds, and decoder failures are logged
/// and skipped — the queue always advances, preferring partial data over a
/// stalled sync. Calling `fetch` while a fetch is in flight merges the new
/// identifiers into the queue instead of restarting.
///
/// Chunks must arrive serialized from a single transport callback context;
/// the accumulation buffer has no interior locking.
pub struct ActivityFetcher {
    transport: Box<dyn FetchTransport>,
    sink: Box<dyn SampleSink>,
    progress: Box<dyn ProgressSink>,
    decoders: HashMap<FileKind, Box<dyn RecordedDataDecoder>>,
    queue: BinaryHeap<Reverse<ActivityFileId>>,
    queued: HashSet<ActivityFileId>,
    buffer: BytesMut,
    state: FetchState,
}

impl ActivityFetcher {
    /// Create a fetcher wired to its collaborators
    #[must_use]
    pub fn new(
        transport: Box<dyn FetchTransport>,
        sink: Box<dyn SampleSink>,
        progress: Box<dyn ProgressSink>,
    ) -> Self {
        Self {
            transport,
            sink,
            progress,
            decoders: HashMap::new(),
            queue: BinaryHeap::new(),
            queued: HashSet::new(),
            buffer: BytesMut::new(),
            state: FetchState::Idle,
        }
    }

    /// Register the decoder responsible for one file kind
    pub fn register_decoder(&mut self, kind: FileKind, decoder: Box<dyn RecordedDataDecoder>) {
        self.decoders.insert(kind, decoder);
    }

    /// Current session state
    #[must_use]
    pub const fn state(&self) -> FetchState {
        self.state
    }

    /// Number of identifiers waiting in the queue
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.queue.len()
    }

    /// Enqueue file identifiers and start fetching if idle
    ///
    /// Identifiers already queued or in flight are dropped (the identifier is
    /// the dedup key). When a fetch is already in flight the new identifiers
    /// merge into the existing queue — at most one fetch runs at a time.
    ///
    /// # Errors
    ///
    /// Returns a transport error if issuing the first request fails.
    pub async fn fetch(&mut self, ids: Vec<ActivityFileId>) -> Result<()> {
        for id in ids {
            if self.queued.insert(id) {
                self.queue.push(Reverse(id));
            } else {
                debug!("Already queued, skipping {}", id);
            }
        }

        if self.state == FetchState::Idle && !self.queue.is_empty() {
            info!("Starting recorded-data fetch, {} file(s)", self.queue.len());
            self.progress.fetch_started();
            self.trigger_next_fetch().await?;
        }
        Ok(())
    }

    /// Feed one received chunk into the accumulation buffer
    ///
    /// Each chunk starts with a 2-byte total count and a 2-byte 1-based index
    /// (both little-endian). The payload completes when the index equals the
    /// total; it is then validated and dispatched, and the next queued file is
    /// requested regardless of the outcome.
    ///
    /// # Errors
    ///
    /// Returns [`BandlinkError::Framing`] for a chunk shorter than its header,
    /// or a transport error if requesting the next file fails. Payload-level
    /// problems are not errors here; they become a [`FileOutcome`].
    pub async fn add_chunk(&mut self, chunk: &[u8]) -> Result<()> {
        if chunk.len() < CHUNK_HEADER_LEN {
            return Err(BandlinkError::Framing(format!(
                "chunk of {} byte(s) is shorter than its header",
                chunk.len()
            )));
        }

        let total = u16::from_le_bytes([chunk[0], chunk[1]]);
        let index = u16::from_le_bytes([chunk[2], chunk[3]]);
        debug!("Got activity chunk {}/{}", index, total);

        self.buffer.extend_from_slice(&chunk[CHUNK_HEADER_LEN..]);

        if index != total {
            return Ok(());
        }

        let data = std::mem::take(&mut self.buffer).to_vec();

        let (file_id, outcome) = match Self::validate_payload(&data) {
            Ok((file_id, block)) => match self.dispatch_block(&file_id, block) {
                Ok(sample_count) => (Some(file_id), FileOutcome::Parsed { sample_count }),
                Err(e) => {
                    if matches!(e, BandlinkError::RecordDecode(_)) {
                        error!("Failed to decode {}: {}", file_id, e);
                    } else {
                        warn!("Skipping {}: {}", file_id, e);
                    }
                    (Some(file_id), FileOutcome::Skipped(e))
                }
            },
            Err(e) => {
                warn!("Discarding reassembled payload: {}", e);
                (None, FileOutcome::Skipped(e))
            }
        };

        // report against the payload's own identifier when it validated far
        // enough to carry one, else against the file we asked for
        let reported = file_id.or(match self.state {
            FetchState::Fetching(id) => Some(id),
            FetchState::Idle => None,
        });
        if let Some(id) = reported {
            self.queued.remove(&id);
            self.progress.file_done(&id, &outcome);
        }

        // skip-and-continue: the queue advances no matter how this file ended
        self.trigger_next_fetch().await
    }

    /// Check length and CRC32, then split off the identifier block
    ///
    /// # Errors
    ///
    /// Returns [`BandlinkError::PayloadTooShort`] or
    /// [`BandlinkError::ChecksumMismatch`]; both are skippable and only ever
    /// cost the one file.
    fn validate_payload(data: &[u8]) -> Result<(ActivityFileId, &[u8])> {
        if data.len() < MIN_PAYLOAD_LEN {
            return Err(BandlinkError::PayloadTooShort { len: data.len() });
        }

        let crc_start = data.len() - CRC_LEN;
        let actual = crc32fast::hash(&data[..crc_start]);
        let expected = u32::from_le_bytes([
            data[crc_start],
            data[crc_start + 1],
            data[crc_start + 2],
            data[crc_start + 3],
        ]);
        if actual != expected {
            return Err(BandlinkError::ChecksumMismatch { expected, actual });
        }

        if data[FILE_ID_LEN] != 0 {
            warn!(
                "Unexpected activity payload byte 0x{:02X} at position {} - parsing might fail",
                data[FILE_ID_LEN],
                FILE_ID_LEN
            );
        }

        let mut id_bytes = [0u8; FILE_ID_LEN];
        id_bytes.copy_from_slice(&data[..FILE_ID_LEN]);
        Ok((
            ActivityFileId::from_bytes(&id_bytes),
            &data[DATA_OFFSET..crc_start],
        ))
    }

    /// Look up the decoder for a validated payload and store what it yields
    ///
    /// # Errors
    ///
    /// Returns [`BandlinkError::UnknownDecoder`] for an unregistered file
    /// kind, or the decoder's own error. Both are skippable.
    fn dispatch_block(&self, file_id: &ActivityFileId, block: &[u8]) -> Result<usize> {
        let decoder = self
            .decoders
            .get(&file_id.file_kind())
            .ok_or(BandlinkError::UnknownDecoder { kind: file_id.kind })?;

        let samples = decoder.decode(file_id, block)?;
        let sample_count = samples.len();
        info!("Decoded {} sample(s) from {}", sample_count, file_id);
        self.sink.store(file_id, samples);
        Ok(sample_count)
    }

    /// Request the next queued file or go idle
    async fn trigger_next_fetch(&mut self) -> Result<()> {
        let Some(Reverse(file_id)) = self.queue.pop() else {
            debug!("Nothing more to fetch");
            self.state = FetchState::Idle;
            self.progress.fetch_finished();
            return Ok(());
        };

        debug!("Triggering next fetch for: {}", file_id);
        self.state = FetchState::Fetching(file_id);
        self.transport.request_file(&file_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn file_id(ts: u32) -> ActivityFileId {
        ActivityFileId {
            timestamp: ts,
            timezone: 0,
            version: 1,
            kind: FileKind::Sport as u8,
        }
    }

    /// identifier block + separator + data + CRC32 trailer
    fn build_payload(id: &ActivityFileId, data: &[u8]) -> Vec<u8> {
        let mut payload = id.to_bytes().to_vec();
        payload.push(0x00);
        payload.extend_from_slice(data);
        let crc = crc32fast::hash(&payload);
        payload.extend_from_slice(&crc.to_le_bytes());
        payload
    }

    /// split a payload into `n` chunks with (total, index) headers
    fn chunks_of(payload: &[u8], n: usize) -> Vec<Vec<u8>> {
        let size = payload.len().div_ceil(n);
        payload
            .chunks(size)
            .enumerate()
            .map(|(i, slice)| {
                let mut chunk = Vec::with_capacity(4 + slice.len());
                chunk.extend_from_slice(&(n as u16).to_le_bytes());
                chunk.extend_from_slice(&(i as u16 + 1).to_le_bytes());
                chunk.extend_from_slice(slice);
                chunk
            })
            .collect()
    }

    #[derive(Default)]
    struct MockTransport {
        requests: Arc<Mutex<Vec<ActivityFileId>>>,
    }

    #[async_trait]
    impl FetchTransport for MockTransport {
        async fn request_file(&self, id: &ActivityFileId) -> Result<()> {
            self.requests.lock().unwrap().push(*id);
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingDecoder {
        received: Arc<Mutex<Vec<(ActivityFileId, Vec<u8>)>>>,
        fail: bool,
    }

    impl RecordedDataDecoder for RecordingDecoder {
        fn decode(&self, id: &ActivityFileId, data: &[u8]) -> Result<Vec<ActivitySample>> {
            self.received.lock().unwrap().push((*id, data.to_vec()));
            if self.fail {
                return Err(BandlinkError::RecordDecode("corrupt block".to_string()));
            }
            Ok(vec![ActivitySample::at(i64::from(id.timestamp))])
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        stored: Arc<Mutex<Vec<(ActivityFileId, usize)>>>,
    }

    impl SampleSink for RecordingSink {
        fn store(&self, id: &ActivityFileId, samples: Vec<ActivitySample>) {
            self.stored.lock().unwrap().push((*id, samples.len()));
        }
    }

    #[derive(Default)]
    struct RecordingProgress {
        events: Arc<Mutex<Vec<String>>>,
    }

    impl ProgressSink for RecordingProgress {
        fn fetch_started(&self) {
            self.events.lock().unwrap().push("started".to_string());
        }

        fn file_done(&self, id: &ActivityFileId, outcome: &FileOutcome) {
            self.events
                .lock()
                .unwrap()
                .push(format!("done ts={} ok={}", id.timestamp, outcome.is_success()));
        }

        fn fetch_finished(&self) {
            self.events.lock().unwrap().push("finished".to_string());
        }
    }

    struct Harness {
        fetcher: ActivityFetcher,
        requests: Arc<Mutex<Vec<ActivityFileId>>>,
        received: Arc<Mutex<Vec<(ActivityFileId, Vec<u8>)>>>,
        stored: Arc<Mutex<Vec<(ActivityFileId, usize)>>>,
        events: Arc<Mutex<Vec<String>>>,
    }

    fn harness(decoder_fails: bool) -> Harness {
        let transport = MockTransport::default();
        let requests = transport.requests.clone();
        let sink = RecordingSink::default();
        let stored = sink.stored.clone();
        let progress = RecordingProgress::default();
        let events = progress.events.clone();

        let decoder = RecordingDecoder {
            fail: decoder_fails,
            ..Default::default()
        };
        let received = decoder.received.clone();

        let mut fetcher =
            ActivityFetcher::new(Box::new(transport), Box::new(sink), Box::new(progress));
        fetcher.register_decoder(FileKind::Sport, Box::new(decoder));

        Harness {
            fetcher,
            requests,
            received,
            stored,
            events,
        }
    }

    #[tokio::test]
    async fn test_in_order_chunks_dispatch_exactly_once() {
        let mut h = harness(false);
        let id = file_id(100);
        let data = vec![0xAB; 40];
        let payload = build_payload(&id, &data);

        h.fetcher.fetch(vec![id]).await.unwrap();
        assert_eq!(h.fetcher.state(), FetchState::Fetching(id));

        for chunk in chunks_of(&payload, 3) {
            h.fetcher.add_chunk(&chunk).await.unwrap();
        }

        // decoder saw the concatenated payload minus headers and CRC
        let received = h.received.lock().unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].0, id);
        assert_eq!(received[0].1, data);
        drop(received);

        assert_eq!(h.stored.lock().unwrap().len(), 1);
        assert_eq!(h.fetcher.state(), FetchState::Idle);
        assert_eq!(
            *h.events.lock().unwrap(),
            vec!["started", "done ts=100 ok=true", "finished"]
        );
    }

    #[tokio::test]
    async fn test_corrupted_crc_skips_file_and_advances() {
        let mut h = harness(false);
        let first = file_id(100);
        let second = file_id(200);

        h.fetcher.fetch(vec![first, second]).await.unwrap();

        let mut payload = build_payload(&first, &[0x01; 20]);
        let len = payload.len();
        payload[len - 1] ^= 0xFF; // corrupt the CRC trailer

        for chunk in chunks_of(&payload, 2) {
            h.fetcher.add_chunk(&chunk).await.unwrap();
        }

        // nothing decoded or stored, but the queue advanced to the next file
        assert!(h.received.lock().unwrap().is_empty());
        assert!(h.stored.lock().unwrap().is_empty());
        assert_eq!(h.fetcher.state(), FetchState::Fetching(second));
        assert_eq!(
            *h.requests.lock().unwrap(),
            vec![first, second]
        );
        assert_eq!(
            *h.events.lock().unwrap(),
            vec!["started", "done ts=100 ok=false"]
        );
    }

    #[tokio::test]
    async fn test_queue_drains_in_chronological_order() {
        let mut h = harness(false);
        let a = file_id(100);
        let b = file_id(200);
        let c = file_id(300);

        // enqueued out of order
        h.fetcher.fetch(vec![b, a, c]).await.unwrap();

        for id in [a, b, c] {
            assert_eq!(h.fetcher.state(), FetchState::Fetching(id));
            let payload = build_payload(&id, &[0x22; 8]);
            for chunk in chunks_of(&payload, 1) {
                h.fetcher.add_chunk(&chunk).await.unwrap();
            }
        }

        assert_eq!(*h.requests.lock().unwrap(), vec![a, b, c]);
        assert_eq!(h.fetcher.state(), FetchState::Idle);
    }

    #[tokio::test]
    async fn test_short_payload_skipped() {
        let mut h = harness(false);
        let id = file_id(100);
        h.fetcher.fetch(vec![id]).await.unwrap();

        // 8 bytes total, under the 13-byte minimum
        let chunk = {
            let mut c = vec![0x01, 0x00, 0x01, 0x00];
            c.extend_from_slice(&[0u8; 8]);
            c
        };
        h.fetcher.add_chunk(&chunk).await.unwrap();

        assert!(h.received.lock().unwrap().is_empty());
        assert_eq!(h.fetcher.state(), FetchState::Idle);
        assert_eq!(
            *h.events.lock().unwrap(),
            vec!["started", "done ts=100 ok=false", "finished"]
        );
    }

    #[tokio::test]
    async fn test_unregistered_kind_skipped_without_store() {
        let mut h = harness(false);
        let mut id = file_id(100);
        id.kind = 0x42; // no decoder registered for this kind

        h.fetcher.fetch(vec![id]).await.unwrap();
        let payload = build_payload(&id, &[0x05; 10]);
        for chunk in chunks_of(&payload, 1) {
            h.fetcher.add_chunk(&chunk).await.unwrap();
        }

        assert!(h.received.lock().unwrap().is_empty());
        assert!(h.stored.lock().unwrap().is_empty());
        assert_eq!(h.fetcher.state(), FetchState::Idle);
    }

    #[tokio::test]
    async fn test_decoder_error_never_stalls_the_queue() {
        let mut h = harness(true);
        let first = file_id(100);
        let second = file_id(200);
        h.fetcher.fetch(vec![first, second]).await.unwrap();

        let payload = build_payload(&first, &[0x07; 10]);
        for chunk in chunks_of(&payload, 1) {
            h.fetcher.add_chunk(&chunk).await.unwrap();
        }

        // decoder ran and failed; nothing stored; queue moved on
        assert_eq!(h.received.lock().unwrap().len(), 1);
        assert!(h.stored.lock().unwrap().is_empty());
        assert_eq!(h.fetcher.state(), FetchState::Fetching(second));
    }

    #[tokio::test]
    async fn test_fetch_while_fetching_merges_without_restart() {
        let mut h = harness(false);
        let first = file_id(100);
        let second = file_id(200);

        h.fetcher.fetch(vec![first]).await.unwrap();
        h.fetcher.fetch(vec![second]).await.unwrap();

        // still waiting on the first file; the second only joined the queue
        assert_eq!(*h.requests.lock().unwrap(), vec![first]);
        assert_eq!(h.fetcher.pending_count(), 1);
        assert_eq!(
            h.events.lock().unwrap().iter().filter(|e| *e == "started").count(),
            1
        );

        let payload = build_payload(&first, &[0x01; 8]);
        for chunk in chunks_of(&payload, 1) {
            h.fetcher.add_chunk(&chunk).await.unwrap();
        }
        assert_eq!(*h.requests.lock().unwrap(), vec![first, second]);
    }

    #[tokio::test]
    async fn test_duplicate_ids_deduplicated() {
        let mut h = harness(false);
        let id = file_id(100);

        h.fetcher.fetch(vec![id, id]).await.unwrap();
        assert_eq!(h.fetcher.pending_count(), 0); // one in flight, none queued

        let payload = build_payload(&id, &[0x01; 8]);
        for chunk in chunks_of(&payload, 1) {
            h.fetcher.add_chunk(&chunk).await.unwrap();
        }

        assert_eq!(h.requests.lock().unwrap().len(), 1);
        assert_eq!(h.fetcher.state(), FetchState::Idle);
    }

    #[tokio::test]
    async fn test_runt_chunk_is_a_framing_error() {
        let mut h = harness(false);
        let result = h.fetcher.add_chunk(&[0x01, 0x00]).await;
        assert!(matches!(result, Err(BandlinkError::Framing(_))));
    }
}
