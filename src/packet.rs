use crate::{
    error::{BandlinkError, Result},
    tlv::Tlv,
    types::ActivityFileId,
};
use bytes::{Buf, BufMut, BytesMut};
use tracing::debug;

/// Frame header size in bytes: service id, command id, flags
pub const HEADER_SIZE: usize = 3;

/// Per-chunk header size in bytes: total count and index, both u16 LE
pub const CHUNK_HEADER_SIZE: usize = 4;

/// Flags bit marking an encrypted payload
pub const FLAG_ENCRYPTED: u8 = 0x01;

/// Flags bit marking a raw-record payload instead of a TLV tree
pub const FLAG_RAW: u8 = 0x02;

/// Service identifier for the recorded-data sync service
pub const RECORDED_DATA_SERVICE_ID: u8 = 0x12;

/// Command identifiers within the recorded-data sync service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CommandId {
    /// Request the list of recorded files newer than a timestamp
    RequestFileList = 0x01,
    /// Request the contents of one recorded file
    RequestFileData = 0x02,
    /// Acknowledge a fully received file so the device may free it
    AckFileReceived = 0x03,
}

impl CommandId {
    /// Convert from u8
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::RequestFileList),
            0x02 => Some(Self::RequestFileData),
            0x03 => Some(Self::AckFileReceived),
            _ => None,
        }
    }
}

/// Encryption collaborator supplied by the session/pairing subsystem
///
/// The framing layer never touches key material; it hands payload bytes to
/// whatever cipher the active session negotiated.
pub trait PayloadCipher: Send + Sync {
    /// Encrypt payload bytes before framing
    ///
    /// # Errors
    ///
    /// Returns [`BandlinkError::Cipher`] when the payload cannot be encrypted.
    fn encrypt(&self, plain: &[u8]) -> Result<Vec<u8>>;

    /// Decrypt payload bytes after the header is stripped
    ///
    /// # Errors
    ///
    /// Returns [`BandlinkError::Cipher`] when the payload cannot be decrypted.
    fn decrypt(&self, cipher: &[u8]) -> Result<Vec<u8>>;
}

/// Payload carried by a packet
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Structured tag-length-value tree
    Tlv(Tlv),
    /// Raw record bytes handed to a record decoder unchanged
    Raw(Vec<u8>),
}

/// One protocol packet: service/command identifiers plus a payload
///
/// Requests are built complete; responses parsed off the wire only become
/// `complete` once the whole payload was consumed. Callers must not read a
/// response that is not yet complete.
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    /// Service identifier
    pub service_id: u8,
    /// Command identifier within the service
    pub command_id: u8,
    /// Decoded or to-be-encoded payload
    pub payload: Payload,
    complete: bool,
}

impl Packet {
    /// Create a request packet carrying a TLV payload
    #[must_use]
    pub const fn new(service_id: u8, command_id: u8, tlv: Tlv) -> Self {
        Self {
            service_id,
            command_id,
            payload: Payload::Tlv(tlv),
            complete: true,
        }
    }

    /// Create a request packet carrying raw bytes
    #[must_use]
    pub const fn new_raw(service_id: u8, command_id: u8, data: Vec<u8>) -> Self {
        Self {
            service_id,
            command_id,
            payload: Payload::Raw(data),
            complete: true,
        }
    }

    /// Build a request for the recorded-file list newer than `since`
    #[must_use]
    pub fn request_file_list(since: u32) -> Self {
        Self::new(
            RECORDED_DATA_SERVICE_ID,
            CommandId::RequestFileList as u8,
            Tlv::new().put_int(0x01, since as i32),
        )
    }

    /// Build a request for one recorded file's contents
    #[must_use]
    pub fn request_file_data(id: &ActivityFileId) -> Self {
        Self::new(
            RECORDED_DATA_SERVICE_ID,
            CommandId::RequestFileData as u8,
            Tlv::new().put_bytes(0x01, id.to_bytes().to_vec()),
        )
    }

    /// Build an acknowledgement for a fully received file
    #[must_use]
    pub fn ack_file_received(id: &ActivityFileId) -> Self {
        Self::new(
            RECORDED_DATA_SERVICE_ID,
            CommandId::AckFileReceived as u8,
            Tlv::new()
                .put_int(0x7F, 0x0001_86A0)
                .put_bytes(0x01, id.to_bytes().to_vec()),
        )
    }

    /// Whether all expected fields of this packet have been consumed
    #[must_use]
    pub const fn is_complete(&self) -> bool {
        self.complete
    }

    /// Borrow the TLV payload of a complete packet
    ///
    /// # Errors
    ///
    /// Returns [`BandlinkError::Incomplete`] if the packet is not complete, or
    /// [`BandlinkError::Protocol`] if the payload is raw bytes.
    pub fn tlv(&self) -> Result<&Tlv> {
        if !self.complete {
            return Err(BandlinkError::Incomplete);
        }
        match &self.payload {
            Payload::Tlv(tlv) => Ok(tlv),
            Payload::Raw(_) => Err(BandlinkError::Protocol(
                "packet carries a raw payload, not TLV".to_string(),
            )),
        }
    }

    /// Borrow the raw payload of a complete packet
    ///
    /// # Errors
    ///
    /// Returns [`BandlinkError::Incomplete`] if the packet is not complete, or
    /// [`BandlinkError::Protocol`] if the payload is a TLV tree.
    pub fn raw(&self) -> Result<&[u8]> {
        if !self.complete {
            return Err(BandlinkError::Incomplete);
        }
        match &self.payload {
            Payload::Raw(data) => Ok(data),
            Payload::Tlv(_) => Err(BandlinkError::Protocol(
                "packet carries a TLV payload, not raw bytes".to_string(),
            )),
        }
    }

    /// Serialize to wire frames no larger than the negotiated MTU
    ///
    /// When the header plus payload fits in one write, the single frame is the
    /// header followed by the payload. Larger payloads are split into chunk
    /// frames, each prefixed with the total chunk count and a 1-based index
    /// (both u16 little-endian) — the same layout the receive side reassembles.
    ///
    /// When a cipher is supplied the payload bytes are encrypted before
    /// framing and the encrypted flag is set in the header.
    ///
    /// # Errors
    ///
    /// Returns [`BandlinkError::Framing`] if the MTU cannot hold a header, or
    /// a cipher error from the encryption collaborator.
    pub fn to_frames(
        &self,
        mtu: usize,
        cipher: Option<&dyn PayloadCipher>,
    ) -> Result<Vec<Vec<u8>>> {
        if mtu <= HEADER_SIZE.max(CHUNK_HEADER_SIZE) {
            return Err(BandlinkError::Framing(format!(
                "MTU of {mtu} cannot hold a frame header"
            )));
        }

        let mut flags = 0u8;
        let mut payload = match &self.payload {
            Payload::Tlv(tlv) => tlv.encode(),
            Payload::Raw(data) => {
                flags |= FLAG_RAW;
                data.clone()
            }
        };
        if let Some(cipher) = cipher {
            payload = cipher.encrypt(&payload)?;
            flags |= FLAG_ENCRYPTED;
        }

        let mut body = BytesMut::with_capacity(HEADER_SIZE + payload.len());
        body.put_u8(self.service_id);
        body.put_u8(self.command_id);
        body.put_u8(flags);
        body.extend_from_slice(&payload);
        let body = body.to_vec();

        if body.len() <= mtu {
            return Ok(vec![body]);
        }

        let chunk_size = mtu - CHUNK_HEADER_SIZE;
        let total = body.len().div_ceil(chunk_size);
        let total = u16::try_from(total).map_err(|_| {
            BandlinkError::Framing(format!("payload needs {total} chunks, limit is 65535"))
        })?;

        let mut frames = Vec::with_capacity(total as usize);
        for (i, slice) in body.chunks(chunk_size).enumerate() {
            let mut frame = BytesMut::with_capacity(CHUNK_HEADER_SIZE + slice.len());
            frame.put_u16_le(total);
            frame.put_u16_le(i as u16 + 1);
            frame.extend_from_slice(slice);
            frames.push(frame.to_vec());
        }

        debug!(
            "Framed service 0x{:02X} command 0x{:02X} into {} frame(s)",
            self.service_id, self.command_id, frames.len()
        );
        Ok(frames)
    }

    /// Parse a single-shot packet from a received buffer
    ///
    /// Strips the service/command/flags header, decrypts when the encrypted
    /// flag is set, and decodes the remainder as TLV unless the raw flag marks
    /// it as record bytes for a raw decoder.
    ///
    /// # Errors
    ///
    /// Returns [`BandlinkError::Framing`] on a short buffer,
    /// [`BandlinkError::Cipher`] when the encrypted flag is set but no cipher
    /// is configured, or a TLV parse error for a malformed payload.
    pub fn from_bytes(data: &[u8], cipher: Option<&dyn PayloadCipher>) -> Result<Self> {
        if data.len() < HEADER_SIZE {
            return Err(BandlinkError::Framing(format!(
                "frame of {} byte(s) is shorter than the header",
                data.len()
            )));
        }

        let mut buf = data;
        let service_id = buf.get_u8();
        let command_id = buf.get_u8();
        let flags = buf.get_u8();

        let payload_bytes = if flags & FLAG_ENCRYPTED != 0 {
            let cipher = cipher.ok_or_else(|| {
                BandlinkError::Cipher("encrypted payload but no cipher configured".to_string())
            })?;
            cipher.decrypt(buf)?
        } else {
            buf.to_vec()
        };

        let payload = if flags & FLAG_RAW != 0 {
            Payload::Raw(payload_bytes)
        } else {
            Payload::Tlv(Tlv::decode(&payload_bytes)?)
        };

        Ok(Self {
            service_id,
            command_id,
            payload,
            complete: true,
        })
    }
}

/// Reassembles the chunk frames of one command response into a [`Packet`]
///
/// Large responses arrive as chunk frames carrying the same (total, index)
/// headers [`Packet::to_frames`] emits. The assembled packet is only handed
/// out once the final chunk arrived; asking earlier fails, so a caller cannot
/// act on a response that is not yet complete.
#[derive(Debug, Default)]
pub struct ResponseAssembler {
    buffer: BytesMut,
    complete: bool,
}

impl ResponseAssembler {
    /// Create an empty assembler
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk frame, returning whether the response is now complete
    ///
    /// # Errors
    ///
    /// Returns [`BandlinkError::Framing`] for a frame shorter than its chunk
    /// header.
    pub fn push(&mut self, frame: &[u8]) -> Result<bool> {
        if frame.len() < CHUNK_HEADER_SIZE {
            return Err(BandlinkError::Framing(format!(
                "chunk frame of {} byte(s) is shorter than its header",
                frame.len()
            )));
        }

        let total = u16::from_le_bytes([frame[0], frame[1]]);
        let index = u16::from_le_bytes([frame[2], frame[3]]);
        debug!("Got response chunk {}/{}", index, total);

        self.buffer.extend_from_slice(&frame[CHUNK_HEADER_SIZE..]);
        if index == total {
            self.complete = true;
        }
        Ok(self.complete)
    }

    /// Whether the final chunk has arrived
    #[must_use]
    pub const fn is_complete(&self) -> bool {
        self.complete
    }

    /// Parse the assembled body into a packet
    ///
    /// # Errors
    ///
    /// Returns [`BandlinkError::Incomplete`] while chunks are still missing,
    /// or any parse error from [`Packet::from_bytes`].
    pub fn packet(&self, cipher: Option<&dyn PayloadCipher>) -> Result<Packet> {
        if !self.complete {
            return Err(BandlinkError::Incomplete);
        }
        Packet::from_bytes(&self.buffer, cipher)
    }
}
