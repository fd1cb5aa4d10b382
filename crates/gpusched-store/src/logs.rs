//! Incremental reads of captured job output

use gpusched_core::GpuschedResult;
use std::io::SeekFrom;
use std::path::Path;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

/// A slice of a job log
#[derive(Debug, Clone, Default)]
pub struct LogChunk {
    /// Bytes read
    pub data: Vec<u8>,
    /// Offset to pass to the next read
    pub next_offset: u64,
}

/// Read at most `max_bytes` starting at `offset`.
///
/// A log that does not exist yet reads as empty.
pub async fn read_from(path: &Path, offset: u64, max_bytes: usize) -> GpuschedResult<LogChunk> {
    let mut file = match tokio::fs::File::open(path).await {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(LogChunk {
                data: Vec::new(),
                next_offset: offset,
            })
        }
        Err(e) => return Err(e.into()),
    };

    file.seek(SeekFrom::Start(offset)).await?;
    let mut data = Vec::new();
    file.take(max_bytes as u64).read_to_end(&mut data).await?;

    Ok(LogChunk {
        next_offset: offset + data.len() as u64,
        data,
    })
}
