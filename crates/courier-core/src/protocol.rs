//! Wire protocol definitions
//!
//! Every record on an archive or job stream is serialized with bincode and
//! prefixed with a 4-byte little-endian length. File content is not framed:
//! it follows its `Entry` record as exactly `size` raw bytes plus a BLAKE3
//! digest.

use std::path::PathBuf;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{ProtocolError, RemoteFailure};
use crate::types::{FileEntry, TransferId, TransferSpec};
use crate::{MAX_MESSAGE_SIZE, PROTOCOL_VERSION};

/// One record of an archive stream
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArchiveRecord {
    /// An entry header; file content follows for `EntryKind::File`
    Entry(FileEntry),
    /// Clean end of the archive with the number of entries written
    End { entries: u64 },
}

/// Work sent to a worker node, first frame on a job connection
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobEnvelope {
    pub protocol_version: u32,
    pub transfer_id: TransferId,
    pub job: Job,
}

impl JobEnvelope {
    pub fn new(transfer_id: TransferId, job: Job) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            transfer_id,
            job,
        }
    }
}

/// The half of a transfer a worker runs
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Job {
    /// Read an archive from the job stream and materialize it under `root`
    Extract { root: PathBuf, flatten: bool },
    /// Select under `root` and write the archive to a new stream
    Archive { root: PathBuf, spec: TransferSpec },
    /// Both ends live on the worker
    Copy {
        source_root: PathBuf,
        destination_root: PathBuf,
        spec: TransferSpec,
    },
}

impl Job {
    pub fn name(&self) -> &'static str {
        match self {
            Job::Extract { .. } => "extract",
            Job::Archive { .. } => "archive",
            Job::Copy { .. } => "copy",
        }
    }
}

/// Final answer from a worker
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Completed { entries: u64 },
    Failed(RemoteFailure),
}

impl JobStatus {
    pub fn into_result(self) -> Result<u64, RemoteFailure> {
        match self {
            JobStatus::Completed { entries } => Ok(entries),
            JobStatus::Failed(failure) => Err(failure),
        }
    }
}

impl From<Result<u64, RemoteFailure>> for JobStatus {
    fn from(result: Result<u64, RemoteFailure>) -> Self {
        match result {
            Ok(entries) => JobStatus::Completed { entries },
            Err(failure) => JobStatus::Failed(failure),
        }
    }
}

/// Serialize a record with its length prefix
pub fn encode_frame<T: Serialize>(msg: &T) -> Result<Vec<u8>, ProtocolError> {
    let payload =
        bincode::serialize(msg).map_err(|e| ProtocolError::Serialization(e.to_string()))?;
    if payload.len() > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::MessageTooLarge {
            size: payload.len(),
            max: MAX_MESSAGE_SIZE,
        });
    }

    let len = payload.len() as u32;
    let mut result = Vec::with_capacity(4 + payload.len());
    result.extend_from_slice(&len.to_le_bytes());
    result.extend_from_slice(&payload);
    Ok(result)
}

/// Write one length-prefixed record
pub async fn write_frame<W, T>(writer: &mut W, msg: &T) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin + ?Sized,
    T: Serialize,
{
    let frame = encode_frame(msg)?;
    writer.write_all(&frame).await?;
    Ok(())
}

/// Read one length-prefixed record.
///
/// Returns `Ok(None)` when the stream ends cleanly before a length prefix;
/// EOF in the middle of a frame is `Truncated`.
pub async fn read_frame<R, T>(reader: &mut R) -> Result<Option<T>, ProtocolError>
where
    R: AsyncRead + Unpin + ?Sized,
    T: DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    let mut filled = 0;
    while filled < len_buf.len() {
        let n = reader.read(&mut len_buf[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(ProtocolError::Truncated);
        }
        filled += n;
    }

    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::MessageTooLarge {
            size: len,
            max: MAX_MESSAGE_SIZE,
        });
    }

    let mut payload = vec![0u8; len];
    read_exact_or_truncated(reader, &mut payload).await?;
    Ok(Some(bincode::deserialize(&payload)?))
}

/// `read_exact`, mapping a premature EOF to `Truncated`
pub async fn read_exact_or_truncated<R>(reader: &mut R, buf: &mut [u8]) -> Result<(), ProtocolError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    match reader.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(ProtocolError::Truncated),
        Err(e) => Err(e.into()),
    }
}

/// Reject an envelope from a peer speaking another protocol version
pub fn check_version(envelope: &JobEnvelope) -> Result<(), ProtocolError> {
    if envelope.protocol_version != PROTOCOL_VERSION {
        return Err(ProtocolError::VersionMismatch {
            expected: PROTOCOL_VERSION,
            actual: envelope.protocol_version,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureSide;

    #[tokio::test]
    async fn test_frame_roundtrip_and_clean_eof() {
        let mut buf = Vec::new();
        write_frame(&mut buf, &ArchiveRecord::End { entries: 7 })
            .await
            .unwrap();
        assert_eq!(
            u32::from_le_bytes(buf[..4].try_into().unwrap()) as usize,
            buf.len() - 4
        );

        let mut reader = &buf[..];
        let record: Option<ArchiveRecord> = read_frame(&mut reader).await.unwrap();
        assert_eq!(record, Some(ArchiveRecord::End { entries: 7 }));
        let record: Option<ArchiveRecord> = read_frame(&mut reader).await.unwrap();
        assert_eq!(record, None);
    }

    #[tokio::test]
    async fn test_truncated_frame() {
        let frame = encode_frame(&ArchiveRecord::End { entries: 1 }).unwrap();
        let mut reader = &frame[..frame.len() - 1];
        let result: Result<Option<ArchiveRecord>, _> = read_frame(&mut reader).await;
        assert!(matches!(result, Err(ProtocolError::Truncated)));

        let mut reader = &frame[..2];
        let result: Result<Option<ArchiveRecord>, _> = read_frame(&mut reader).await;
        assert!(matches!(result, Err(ProtocolError::Truncated)));
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let len = (MAX_MESSAGE_SIZE as u32 + 1).to_le_bytes();
        let mut reader = &len[..];
        let result: Result<Option<ArchiveRecord>, _> = read_frame(&mut reader).await;
        assert!(matches!(result, Err(ProtocolError::MessageTooLarge { .. })));
    }

    #[test]
    fn test_version_check() {
        let mut envelope = JobEnvelope::new(
            TransferId([0; 16]),
            Job::Extract {
                root: PathBuf::from("/ws"),
                flatten: false,
            },
        );
        assert!(check_version(&envelope).is_ok());
        envelope.protocol_version = PROTOCOL_VERSION + 1;
        assert!(matches!(
            check_version(&envelope),
            Err(ProtocolError::VersionMismatch { .. })
        ));
    }

    #[test]
    fn test_status_result() {
        assert_eq!(JobStatus::Completed { entries: 3 }.into_result(), Ok(3));
        let failure = RemoteFailure::new(FailureSide::Channel, "boom");
        assert_eq!(
            JobStatus::from(Err(failure.clone())),
            JobStatus::Failed(failure)
        );
    }
}
