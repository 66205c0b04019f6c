//! Replay: pull entries back out of a segment file.
//!
//! The reader is deliberately forgiving. Torn tails, padding, recycled files
//! and bit rot all show up in real logs; every checksum failure is contained
//! to its chunk, valid entries found before the failure are still delivered,
//! and only once the file is exhausted does the accumulated damage surface as
//! a single error.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, trace, warn};

use crate::crc::Crc32Be;
use crate::descriptor::Descriptor;
use crate::error::{CommitlogError, CommitlogResult};
use crate::position::ReplayPosition;
use crate::segment::{
    DESCRIPTOR_HEADER_SIZE, ENTRY_OVERHEAD_SIZE, SEGMENT_MAGIC, SEGMENT_OVERHEAD_SIZE,
};

/// Streaming reader over one segment file.
///
/// `next` yields entries in write order until the file is exhausted; the final
/// call reports corruption, if any was encountered, after every recoverable
/// entry has been delivered.
pub struct SegmentReplayer {
    file: File,
    path: PathBuf,
    id: u64,
    file_size: u64,
    /// Next unread file offset.
    pos: u64,
    /// End of the current chunk; `pos == chunk_end` means the next read is a
    /// chunk header.
    chunk_end: u64,
    start_off: u64,
    corrupt_bytes: u64,
    exhausted: bool,
    reported: bool,
}

impl SegmentReplayer {
    /// Opens a segment for replay, validating the descriptor header. Entries
    /// below `start_off` are skipped.
    pub async fn open(
        path: impl AsRef<Path>,
        filename_prefix: &str,
        start_off: u64,
    ) -> CommitlogResult<Self> {
        let path = path.as_ref().to_path_buf();
        let desc = Descriptor::parse(path.to_string_lossy().as_ref(), filename_prefix)?;

        let file = File::open(&path).await?;
        let file_size = file.metadata().await?.len();

        let mut replayer = Self {
            file,
            path,
            id: desc.id,
            file_size,
            pos: DESCRIPTOR_HEADER_SIZE as u64,
            chunk_end: DESCRIPTOR_HEADER_SIZE as u64,
            start_off,
            corrupt_bytes: 0,
            exhausted: false,
            reported: false,
        };

        if file_size < DESCRIPTOR_HEADER_SIZE as u64 {
            // Too short to ever have held a header; treat as empty.
            replayer.exhausted = true;
            return Ok(replayer);
        }

        let mut header = [0u8; DESCRIPTOR_HEADER_SIZE];
        replayer.file.seek(SeekFrom::Start(0)).await?;
        replayer.file.read_exact(&mut header).await?;

        if header.iter().all(|b| *b == 0) {
            // Pre-allocated but never written to.
            debug!(file = %replayer.path.display(), "replaying unwritten segment");
            replayer.exhausted = true;
            return Ok(replayer);
        }

        let magic = u32::from_be_bytes(header[0..4].try_into().unwrap());
        if magic != SEGMENT_MAGIC {
            return Err(CommitlogError::InvalidSegmentFormat(
                replayer.path.display().to_string(),
            ));
        }
        let version = u32::from_be_bytes(header[4..8].try_into().unwrap());
        let id = u64::from_be_bytes(header[8..16].try_into().unwrap());
        let crc = u32::from_be_bytes(header[16..20].try_into().unwrap());

        let mut expected = Crc32Be::new();
        expected.write_u32(version);
        expected.write_u64(id);
        if crc != expected.checksum() {
            return Err(CommitlogError::HeaderChecksum(
                replayer.path.display().to_string(),
            ));
        }

        if id != desc.id {
            // A recycled file carries the header of its previous life; the
            // name is authoritative, the content is stale.
            debug!(file = %replayer.path.display(), header_id = id, "stale segment header, skipping");
            replayer.exhausted = true;
        }
        Ok(replayer)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn corrupt_bytes(&self) -> u64 {
        self.corrupt_bytes
    }

    /// Yields the next entry as `(payload, position)`, or `None` at the clean
    /// end of the file. Corruption found along the way is reported exactly
    /// once, by the call that exhausts the file.
    pub async fn next(&mut self) -> CommitlogResult<Option<(Vec<u8>, ReplayPosition)>> {
        loop {
            if self.exhausted {
                return self.finish();
            }
            if self.pos >= self.chunk_end {
                self.advance_chunk().await?;
                continue;
            }
            if let Some(entry) = self.read_entry().await? {
                return Ok(Some(entry));
            }
        }
    }

    fn finish(&mut self) -> CommitlogResult<Option<(Vec<u8>, ReplayPosition)>> {
        if self.corrupt_bytes > 0 && !self.reported {
            self.reported = true;
            return Err(CommitlogError::DataCorruption {
                bytes: self.corrupt_bytes,
            });
        }
        Ok(None)
    }

    /// Reads and validates the chunk header at `pos`. A zeroed header is the
    /// termination sentinel; a checksum failure writes off the rest of the
    /// file.
    async fn advance_chunk(&mut self) -> CommitlogResult<()> {
        let header_pos = self.pos;
        if header_pos + SEGMENT_OVERHEAD_SIZE as u64 > self.file_size {
            self.exhausted = true;
            return Ok(());
        }

        let mut header = [0u8; SEGMENT_OVERHEAD_SIZE];
        self.file.seek(SeekFrom::Start(header_pos)).await?;
        self.file.read_exact(&mut header).await?;

        let next = u32::from_be_bytes(header[0..4].try_into().unwrap()) as u64;
        let crc = u32::from_be_bytes(header[4..8].try_into().unwrap());

        if next == 0 && crc == 0 {
            trace!(file = %self.path.display(), pos = header_pos, "termination marker");
            self.exhausted = true;
            return Ok(());
        }

        let mut expected = Crc32Be::new();
        expected.write_u64(self.id);
        expected.write_u32(next as u32);
        if crc != expected.checksum() || next <= header_pos + SEGMENT_OVERHEAD_SIZE as u64 || next > self.file_size {
            warn!(file = %self.path.display(), pos = header_pos, "invalid chunk header");
            self.corrupt_bytes += self.file_size - header_pos;
            self.exhausted = true;
            return Ok(());
        }

        self.pos = header_pos + SEGMENT_OVERHEAD_SIZE as u64;
        self.chunk_end = next;
        if self.chunk_end <= self.start_off {
            // Entire chunk is before the resume point.
            self.pos = self.chunk_end;
        }
        Ok(())
    }

    /// Reads one entry at `pos`. Returns `None` when the rest of the chunk is
    /// padding or was written off as corrupt; `pos` then sits at `chunk_end`.
    async fn read_entry(&mut self) -> CommitlogResult<Option<(Vec<u8>, ReplayPosition)>> {
        let entry_pos = self.pos;
        if entry_pos + ENTRY_OVERHEAD_SIZE as u64 > self.chunk_end {
            // Tail slack from alignment padding.
            self.pos = self.chunk_end;
            return Ok(None);
        }

        let mut header = [0u8; 8];
        self.file.seek(SeekFrom::Start(entry_pos)).await?;
        self.file.read_exact(&mut header).await?;
        let size = u32::from_be_bytes(header[0..4].try_into().unwrap());
        let size_crc = u32::from_be_bytes(header[4..8].try_into().unwrap());

        if size == 0 {
            // Zero fill after the last entry of the chunk.
            self.pos = self.chunk_end;
            return Ok(None);
        }

        let mut expected = Crc32Be::new();
        expected.write_u32(size);
        if (size as usize) < ENTRY_OVERHEAD_SIZE
            || entry_pos + size as u64 > self.chunk_end
            || size_crc != expected.checksum()
        {
            warn!(file = %self.path.display(), pos = entry_pos, size, "invalid entry header");
            self.corrupt_bytes += self.chunk_end - entry_pos;
            self.pos = self.chunk_end;
            return Ok(None);
        }

        let payload_size = size as usize - ENTRY_OVERHEAD_SIZE;
        let mut payload = vec![0u8; payload_size];
        self.file.read_exact(&mut payload).await?;
        let mut crc_buf = [0u8; 4];
        self.file.read_exact(&mut crc_buf).await?;
        let payload_crc = u32::from_be_bytes(crc_buf);

        let mut expected = Crc32Be::new();
        expected.write_bytes(&payload);
        if payload_crc != expected.checksum() {
            // The damage may extend past this entry; give up on the chunk.
            warn!(file = %self.path.display(), pos = entry_pos, "entry checksum mismatch");
            self.corrupt_bytes += self.chunk_end - entry_pos;
            self.pos = self.chunk_end;
            return Ok(None);
        }

        self.pos = entry_pos + size as u64;
        if entry_pos < self.start_off {
            return Ok(None);
        }
        Ok(Some((payload, ReplayPosition::new(self.id, entry_pos as u32))))
    }
}

/// Replays every entry of one segment file through `on_entry`, returning the
/// number of entries delivered. Corruption is reported only after every
/// recoverable entry was seen.
pub async fn read_log_file<F>(
    path: impl AsRef<Path>,
    filename_prefix: &str,
    start_off: u64,
    mut on_entry: F,
) -> CommitlogResult<u64>
where
    F: FnMut(Vec<u8>, ReplayPosition) -> CommitlogResult<()>,
{
    let mut replayer = SegmentReplayer::open(path, filename_prefix, start_off).await?;
    let mut delivered = 0u64;
    loop {
        match replayer.next().await? {
            Some((payload, rp)) => {
                on_entry(payload, rp)?;
                delivered += 1;
            }
            None => return Ok(delivered),
        }
    }
}
