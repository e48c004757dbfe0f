//! File transfer codec: CRC-32 checksummed, base64-encoded JSON envelope for config and log files.
//!
//! The sender writes [`TransferHeader::render`], then the file in [`CHUNK_SIZE`] pieces each
//! encoded with [`encode_chunk`], then [`TRAILER`]. Because `CHUNK_SIZE` is a multiple of 3,
//! the concatenated chunk encodings equal the base64 encoding of the whole file, so the
//! receiver can decode with [`decode_file`].

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use crc::{Crc, Digest, CRC_32_ISO_HDLC};
use serde::Deserialize;

use crate::protocol::{Command, PROVIDER};

/// Transport encoding identifier carried in `Encoding`.
pub const ENCODING: &str = "base64";

/// Raw bytes per streamed chunk. Multiple of 3 so chunk encodings concatenate without padding.
pub const CHUNK_SIZE: usize = 768;

/// Closes the `Data` string, the `Parameter` object and the envelope.
pub const TRAILER: &str = "\"}}";

static CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// CRC-32 (ISO-HDLC, as in zip/ethernet) of a whole buffer.
pub fn crc32(data: &[u8]) -> u32 {
    CRC32.checksum(data)
}

/// Checksum wire text: 8 uppercase hex digits.
pub fn format_checksum(crc: u32) -> String {
    format!("{:08X}", crc)
}

/// Parse checksum text (either case).
pub fn parse_checksum(text: &str) -> Option<u32> {
    if text.len() != 8 {
        return None;
    }
    u32::from_str_radix(text, 16).ok()
}

/// Incremental CRC-32 over a file read in pieces.
pub struct Checksum {
    digest: Digest<'static, u32>,
    len: u64,
}

impl Checksum {
    pub fn new() -> Self {
        Self {
            digest: CRC32.digest(),
            len: 0,
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.digest.update(data);
        self.len += data.len() as u64;
    }

    /// Bytes fed so far.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn finalize(self) -> u32 {
        self.digest.finalize()
    }
}

impl Default for Checksum {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything in the envelope except `Data`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferHeader {
    pub command: Command,
    pub filename: String,
    pub mac_address: String,
    /// Decoded payload length.
    pub size: u64,
    pub checksum: u32,
}

impl TransferHeader {
    /// Opening JSON text, ending just inside the `Data` string.
    pub fn render(&self) -> String {
        format!(
            "{{\"Provider\":{},\"Command\":{},\"Parameter\":{{\"Filename\":{},\"MAC Address\":{},\"Size\":{},\"Encoding\":{},\"Checksum\":{},\"Data\":\"",
            json_str(PROVIDER),
            json_str(self.command.as_str()),
            json_str(&self.filename),
            json_str(&self.mac_address),
            self.size,
            json_str(ENCODING),
            json_str(&format_checksum(self.checksum)),
        )
    }
}

fn json_str(s: &str) -> String {
    // Serializing a &str cannot fail.
    serde_json::to_string(s).unwrap_or_else(|_| String::from("\"\""))
}

/// Base64 text for one chunk.
pub fn encode_chunk(chunk: &[u8]) -> String {
    STANDARD.encode(chunk)
}

/// Whole envelope for an in-memory file. Identical to what the streaming sender emits.
pub fn encode_file(command: Command, filename: &str, mac_address: &str, data: &[u8]) -> Vec<u8> {
    let header = TransferHeader {
        command,
        filename: filename.to_string(),
        mac_address: mac_address.to_string(),
        size: data.len() as u64,
        checksum: crc32(data),
    };
    let mut out = header.render().into_bytes();
    for chunk in data.chunks(CHUNK_SIZE) {
        out.extend_from_slice(encode_chunk(chunk).as_bytes());
    }
    out.extend_from_slice(TRAILER.as_bytes());
    out
}

#[derive(Deserialize)]
struct TransferEnvelope {
    #[serde(rename = "Command", default)]
    command: Option<String>,
    #[serde(rename = "Parameter")]
    parameter: TransferParameter,
}

#[derive(Deserialize)]
struct TransferParameter {
    #[serde(rename = "Filename", default)]
    filename: String,
    #[serde(rename = "MAC Address", default)]
    mac_address: Option<String>,
    #[serde(rename = "Size")]
    size: u64,
    #[serde(rename = "Encoding")]
    encoding: String,
    #[serde(rename = "Checksum")]
    checksum: String,
    #[serde(rename = "Data")]
    data: String,
}

/// A decoded, checksum-verified file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFile {
    pub command: Option<String>,
    pub filename: String,
    pub mac_address: Option<String>,
    pub checksum: u32,
    pub data: Vec<u8>,
}

/// Whether a decoded document is a file transfer envelope (has `Parameter.Encoding`).
pub fn is_transfer_envelope(value: &serde_json::Value) -> bool {
    value
        .get("Parameter")
        .and_then(|p| p.get("Encoding"))
        .is_some()
}

/// Decode and validate a file transfer envelope.
pub fn decode_file(bytes: &[u8]) -> Result<ReceivedFile, TransferError> {
    let env: TransferEnvelope = serde_json::from_slice(bytes)?;
    let p = env.parameter;
    if p.encoding != ENCODING {
        return Err(TransferError::UnsupportedEncoding(p.encoding));
    }
    let expected = parse_checksum(&p.checksum).ok_or(TransferError::BadChecksumField)?;
    let data = STANDARD.decode(p.data.as_bytes())?;
    if data.len() as u64 != p.size {
        return Err(TransferError::SizeMismatch {
            declared: p.size,
            actual: data.len() as u64,
        });
    }
    let actual = crc32(&data);
    if actual != expected {
        return Err(TransferError::ChecksumMismatch { expected, actual });
    }
    Ok(ReceivedFile {
        command: env.command,
        filename: p.filename,
        mac_address: p.mac_address,
        checksum: actual,
        data,
    })
}

/// Error decoding or validating a transferred file.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("malformed transfer envelope: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("unsupported encoding {0:?}")]
    UnsupportedEncoding(String),
    #[error("checksum field is not 8 hex digits")]
    BadChecksumField,
    #[error("data is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("size mismatch: declared {declared}, decoded {actual}")]
    SizeMismatch { declared: u64, actual: u64 },
    #[error("checksum mismatch: expected {expected:08X}, computed {actual:08X}")]
    ChecksumMismatch { expected: u32, actual: u32 },
}
