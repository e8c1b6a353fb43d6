//! Wire format shared by the scheduler and worker processes.
//!
//! Every message travels as a self-delimited frame:
//!
//! ```text
//! +--------+----------------+---------------------------+
//! | "KILN" | u32 LE length  | MessagePack payload bytes |
//! +--------+----------------+---------------------------+
//! ```
//!
//! A frame is complete only when the payload length matches the header,
//! which lets a reader tell a half-written response from a finished one.

use std::ffi::OsString;
use std::fs;
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::compiler::CompileOutput;
use crate::error::KilnError;
use crate::job::WorkerTypeKey;

pub const FRAME_MAGIC: &[u8; 4] = b"KILN";
pub const FRAME_HEADER_LEN: usize = 8;
/// Largest payload a frame may announce.
pub const MAX_FRAME_LEN: usize = 256 * 1024 * 1024;

/// One batch of jobs sent to a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchRequest {
    pub batch_id: u64,
    pub jobs: Vec<RequestEntry>,
}

/// A job as the worker sees it. `index` is the job's position in the
/// batch and is echoed back in the matching [`ResponseEntry`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestEntry {
    pub index: u32,
    pub worker_type: WorkerTypeKey,
    pub input: Value,
}

/// The worker's answer to a [`BatchRequest`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchResponse {
    pub batch_id: u64,
    pub results: Vec<ResponseEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseEntry {
    pub index: u32,
    pub succeeded: bool,
    pub output: Option<Value>,
    #[serde(default)]
    pub errors: Vec<String>,
}

impl ResponseEntry {
    pub fn from_output(index: u32, out: CompileOutput) -> Self {
        Self {
            index,
            succeeded: out.succeeded,
            output: out.output,
            errors: out.errors,
        }
    }

    pub fn into_output(self) -> CompileOutput {
        CompileOutput {
            succeeded: self.succeeded,
            output: self.output,
            errors: self.errors,
        }
    }
}

/// How much of a frame a buffer holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameStatus {
    /// Fewer bytes than the header announces; the writer may still be busy.
    Incomplete,
    Complete,
    /// Bad magic or trailing bytes. Will never become valid.
    Invalid(String),
}

/// Serialize `msg` into a single frame.
pub fn encode_frame<T: Serialize>(msg: &T) -> Result<Vec<u8>, KilnError> {
    let payload = rmp_serde::to_vec_named(msg)?;
    if payload.len() > MAX_FRAME_LEN {
        return Err(KilnError::Frame(format!("payload too large: {} bytes", payload.len())));
    }
    let len = payload.len() as u32;

    let mut buf = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    buf.extend_from_slice(FRAME_MAGIC);
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(&payload);
    Ok(buf)
}

fn payload_len(header: &[u8; FRAME_HEADER_LEN]) -> Result<usize, KilnError> {
    if &header[..4] != FRAME_MAGIC {
        return Err(KilnError::Frame("bad magic".into()));
    }
    let len = u32::from_le_bytes([header[4], header[5], header[6], header[7]]) as usize;
    if len > MAX_FRAME_LEN {
        return Err(KilnError::Frame(format!(
            "frame announces {len} bytes, limit is {MAX_FRAME_LEN}"
        )));
    }
    Ok(len)
}

/// Inspect a buffer without decoding the payload.
pub fn frame_status(bytes: &[u8]) -> FrameStatus {
    if bytes.len() < FRAME_HEADER_LEN {
        if !FRAME_MAGIC.starts_with(&bytes[..bytes.len().min(4)]) {
            return FrameStatus::Invalid("bad magic".into());
        }
        return FrameStatus::Incomplete;
    }
    let mut header = [0u8; FRAME_HEADER_LEN];
    header.copy_from_slice(&bytes[..FRAME_HEADER_LEN]);
    let len = match payload_len(&header) {
        Ok(len) => len,
        Err(e) => return FrameStatus::Invalid(e.to_string()),
    };
    let body = bytes.len() - FRAME_HEADER_LEN;
    match body.cmp(&len) {
        std::cmp::Ordering::Less => FrameStatus::Incomplete,
        std::cmp::Ordering::Equal => FrameStatus::Complete,
        std::cmp::Ordering::Greater => {
            FrameStatus::Invalid(format!("{} trailing bytes after frame", body - len))
        }
    }
}

/// Decode a buffer holding exactly one frame.
pub fn decode_frame<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, KilnError> {
    match frame_status(bytes) {
        FrameStatus::Complete => Ok(rmp_serde::from_slice(&bytes[FRAME_HEADER_LEN..])?),
        FrameStatus::Incomplete => Err(KilnError::Frame("truncated frame".into())),
        FrameStatus::Invalid(reason) => Err(KilnError::Frame(reason)),
    }
}

/// Write one frame to a stream and flush it.
pub fn write_frame<W: Write, T: Serialize>(w: &mut W, msg: &T) -> Result<(), KilnError> {
    w.write_all(&encode_frame(msg)?)?;
    w.flush()?;
    Ok(())
}

/// Read the next frame from a stream.
///
/// Returns `Ok(None)` on a clean end of stream between frames.
pub fn read_frame<R: Read, T: DeserializeOwned>(r: &mut R) -> Result<Option<T>, KilnError> {
    let mut header = [0u8; FRAME_HEADER_LEN];
    let mut filled = 0;
    while filled < FRAME_HEADER_LEN {
        match r.read(&mut header[filled..]) {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => return Err(KilnError::Frame("truncated header".into())),
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }

    let len = payload_len(&header)?;
    let mut body = vec![0u8; len];
    r.read_exact(&mut body).map_err(|e| match e.kind() {
        ErrorKind::UnexpectedEof => KilnError::Frame("truncated payload".into()),
        _ => KilnError::Io(e),
    })?;
    Ok(Some(rmp_serde::from_slice(&body)?))
}

/// Path a file frame is staged at before it is renamed into place.
pub fn staging_path(path: &Path) -> PathBuf {
    let mut tmp = OsString::from(path.as_os_str());
    tmp.push(".tmp");
    PathBuf::from(tmp)
}

/// Write a frame to `path` atomically: stage next to it, then rename.
/// Readers never observe a partially written file at `path`.
pub fn write_frame_file<T: Serialize>(path: &Path, msg: &T) -> Result<(), KilnError> {
    let tmp = staging_path(path);
    fs::write(&tmp, encode_frame(msg)?)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Read a frame file, `Ok(None)` when the file does not exist yet.
pub fn read_frame_file<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, KilnError> {
    match fs::read(path) {
        Ok(bytes) => decode_frame(&bytes).map(Some),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Cursor;

    fn sample_request() -> BatchRequest {
        BatchRequest {
            batch_id: 9,
            jobs: vec![
                RequestEntry {
                    index: 0,
                    worker_type: WorkerTypeKey::from("vs"),
                    input: json!({"source": "a", "defines": ["X=1"]}),
                },
                RequestEntry {
                    index: 1,
                    worker_type: WorkerTypeKey::from("ps"),
                    input: json!({"source": "b", "level": 3}),
                },
            ],
        }
    }

    #[test]
    fn request_survives_a_frame() {
        let req = sample_request();
        let bytes = encode_frame(&req).unwrap();
        assert_eq!(&bytes[..4], FRAME_MAGIC);
        assert_eq!(frame_status(&bytes), FrameStatus::Complete);
        let back: BatchRequest = decode_frame(&bytes).unwrap();
        assert_eq!(back, req);
    }

    #[test]
    fn truncated_frame_is_incomplete() {
        let bytes = encode_frame(&sample_request()).unwrap();
        assert_eq!(frame_status(&bytes[..3]), FrameStatus::Incomplete);
        assert_eq!(frame_status(&bytes[..bytes.len() - 1]), FrameStatus::Incomplete);
        assert!(decode_frame::<BatchRequest>(&bytes[..bytes.len() - 1]).is_err());
    }

    #[test]
    fn trailing_bytes_are_invalid() {
        let mut bytes = encode_frame(&sample_request()).unwrap();
        bytes.push(0);
        assert!(matches!(frame_status(&bytes), FrameStatus::Invalid(_)));
    }

    #[test]
    fn bad_magic_is_invalid() {
        assert!(matches!(frame_status(b"NOPE\0\0\0\0"), FrameStatus::Invalid(_)));
        assert!(matches!(frame_status(b"XY"), FrameStatus::Invalid(_)));
    }

    #[test]
    fn stream_reads_consecutive_frames() {
        let mut buf = Vec::new();
        write_frame(&mut buf, &sample_request()).unwrap();
        let resp = BatchResponse {
            batch_id: 9,
            results: vec![ResponseEntry::from_output(
                1,
                CompileOutput::failure(vec!["boom".into()]),
            )],
        };
        write_frame(&mut buf, &resp).unwrap();

        let mut cursor = Cursor::new(buf);
        let first: BatchRequest = read_frame(&mut cursor).unwrap().unwrap();
        assert_eq!(first.jobs.len(), 2);
        let second: BatchResponse = read_frame(&mut cursor).unwrap().unwrap();
        assert_eq!(second, resp);
        assert!(read_frame::<_, BatchResponse>(&mut cursor).unwrap().is_none());
    }

    #[test]
    fn stream_truncated_mid_payload_errors() {
        let bytes = encode_frame(&sample_request()).unwrap();
        let mut cursor = Cursor::new(bytes[..bytes.len() - 2].to_vec());
        assert!(read_frame::<_, BatchRequest>(&mut cursor).is_err());
    }

    #[test]
    fn oversized_header_is_rejected_before_reading() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(FRAME_MAGIC);
        bytes.extend_from_slice(&u32::MAX.to_le_bytes());
        bytes.extend_from_slice(b"short");

        let mut cursor = Cursor::new(bytes.clone());
        match read_frame::<_, BatchRequest>(&mut cursor) {
            Err(KilnError::Frame(reason)) => assert!(reason.contains("limit")),
            other => panic!("expected frame error, got {other:?}"),
        };
        assert!(matches!(frame_status(&bytes), FrameStatus::Invalid(_)));
    }

    #[test]
    fn frame_file_is_written_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("1-0-1.out");
        assert!(read_frame_file::<BatchRequest>(&path).unwrap().is_none());

        write_frame_file(&path, &sample_request()).unwrap();
        assert!(!staging_path(&path).exists());
        let back: BatchRequest = read_frame_file(&path).unwrap().unwrap();
        assert_eq!(back.batch_id, 9);
    }
}
