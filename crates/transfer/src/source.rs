//! Sequential slicing of an upload source into parts.

use std::sync::{Arc, Mutex};

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::buffer::BufferAllocator;
use crate::hash::{IncrementalHasher, md5_hex};
use crate::types::FilePart;
use crate::{TransferError, lock};

/// Size of the scratch buffer used when hashing a resume prefix.
const PREFIX_READ_SIZE: usize = 64 * 1024;

/// Reads a source in parts of caller-chosen size.
///
/// Parts are issued in strictly increasing offset order. Each part carries
/// its own MD5 and its bytes are fed to the shared whole-file hasher at
/// claim time, so the file hash does not depend on completion order. The
/// whole-file hasher is finalized together with the last part.
pub struct FilePartSource<R> {
    reader: R,
    allocator: Arc<dyn BufferAllocator>,
    file_hash: Arc<Mutex<IncrementalHasher>>,
    length: u64,
    position: u64,
    next_index: u64,
    has_more: bool,
}

impl<R: AsyncRead + Unpin + Send> FilePartSource<R> {
    /// Creates a source over `reader`, which must be positioned at
    /// `start_offset` of a file `length` bytes long.
    pub fn new(
        reader: R,
        length: u64,
        start_offset: u64,
        start_index: u64,
        allocator: Arc<dyn BufferAllocator>,
        file_hash: Arc<Mutex<IncrementalHasher>>,
    ) -> Self {
        Self {
            reader,
            allocator,
            file_hash,
            length,
            position: start_offset.min(length),
            next_index: start_index,
            has_more: true,
        }
    }

    pub fn has_more(&self) -> bool {
        self.has_more
    }

    /// Offset the next part starts at.
    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn length(&self) -> u64 {
        self.length
    }

    /// Claims the next part, at most `requested_size` bytes long.
    ///
    /// A zero-length remainder yields a single empty last part. After an
    /// I/O error the source is exhausted and must not be used again.
    pub async fn next_part(&mut self, requested_size: u64) -> Result<FilePart, TransferError> {
        if !self.has_more {
            return Err(TransferError::Io(std::io::Error::other(
                "part source is exhausted",
            )));
        }

        let remaining = self.length - self.position;
        let size = requested_size.max(1).min(remaining);
        let mut buffer = self.allocator.allocate(size as usize);
        if let Err(e) = self.reader.read_exact(buffer.as_mut_slice()).await {
            self.has_more = false;
            return Err(e.into());
        }

        let is_last_part = self.position + size == self.length;
        let hash = md5_hex(buffer.as_ref());
        {
            let mut file_hash = lock(&self.file_hash);
            if is_last_part {
                file_hash.finalize(buffer.as_ref());
            } else {
                file_hash.append(buffer.as_ref());
            }
        }

        let part = FilePart {
            index: self.next_index,
            offset: self.position,
            length: size,
            hash,
            is_last_part,
            data: buffer.into_bytes(),
        };

        self.position += size;
        self.next_index += 1;
        self.has_more = !is_last_part;
        Ok(part)
    }
}

/// Feeds the first `length` bytes of `reader` into `hasher`.
///
/// Returns the hex MD5 of just that prefix; `hasher` stays open so the rest
/// of the file can follow.
pub async fn hash_prefix<R: AsyncRead + Unpin>(
    reader: &mut R,
    length: u64,
    hasher: &mut IncrementalHasher,
) -> Result<String, TransferError> {
    let mut buf = vec![0u8; PREFIX_READ_SIZE];
    let mut left = length;
    while left > 0 {
        let n = left.min(buf.len() as u64) as usize;
        reader.read_exact(&mut buf[..n]).await?;
        hasher.append(&buf[..n]);
        left -= n as u64;
    }

    let mut probe = hasher.clone();
    probe.finalize(&[]);
    Ok(probe.computed_hash().unwrap_or_default().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{BufferPool, HeapAllocator};
    use std::io::Cursor;

    fn data(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    fn source(bytes: &[u8]) -> (FilePartSource<Cursor<Vec<u8>>>, Arc<Mutex<IncrementalHasher>>) {
        let hasher = Arc::new(Mutex::new(IncrementalHasher::new()));
        let src = FilePartSource::new(
            Cursor::new(bytes.to_vec()),
            bytes.len() as u64,
            0,
            0,
            Arc::new(HeapAllocator),
            Arc::clone(&hasher),
        );
        (src, hasher)
    }

    #[tokio::test]
    async fn parts_cover_file_exactly_once() {
        let bytes = data(10_000);
        for sizes in [vec![1000u64], vec![3, 7000, 1], vec![4096, 1, 20_000], vec![0, 9999]] {
            let (mut src, hasher) = source(&bytes);
            let mut joined = Vec::new();
            let mut last_count = 0;
            let mut expected_offset = 0;
            let mut i = 0;
            while src.has_more() {
                let size = sizes[i % sizes.len()];
                let part = src.next_part(size).await.unwrap();
                assert_eq!(part.offset, expected_offset);
                assert_eq!(part.index, i as u64);
                assert_eq!(part.hash, md5_hex(&part.data));
                expected_offset += part.length;
                joined.extend_from_slice(&part.data);
                if part.is_last_part {
                    last_count += 1;
                }
                i += 1;
            }
            assert_eq!(joined, bytes, "sizes {sizes:?}");
            assert_eq!(last_count, 1);
            let hasher = lock(&hasher);
            assert!(hasher.is_finalized());
            assert_eq!(hasher.computed_hash().unwrap(), md5_hex(&bytes));
        }
    }

    #[tokio::test]
    async fn empty_file_yields_one_empty_last_part() {
        let (mut src, hasher) = source(&[]);
        let part = src.next_part(1024).await.unwrap();
        assert!(part.is_last_part);
        assert_eq!(part.length, 0);
        assert!(!src.has_more());
        assert_eq!(
            lock(&hasher).computed_hash().unwrap(),
            "d41d8cd98f00b204e9800998ecf8427e"
        );
    }

    #[tokio::test]
    async fn continues_from_resume_point() {
        let bytes = data(300);
        let mut cursor = Cursor::new(bytes.clone());
        let mut hasher = IncrementalHasher::new();
        let prefix_hash = hash_prefix(&mut cursor, 100, &mut hasher).await.unwrap();
        assert_eq!(prefix_hash, md5_hex(&bytes[..100]));

        let hasher = Arc::new(Mutex::new(hasher));
        let mut src = FilePartSource::new(
            cursor,
            300,
            100,
            5,
            Arc::new(BufferPool::new(4)),
            Arc::clone(&hasher),
        );
        let a = src.next_part(150).await.unwrap();
        let b = src.next_part(150).await.unwrap();
        assert_eq!((a.index, a.offset, a.length), (5, 100, 150));
        assert_eq!((b.index, b.offset, b.length), (6, 250, 50));
        assert!(b.is_last_part);
        assert_eq!(lock(&hasher).computed_hash().unwrap(), md5_hex(&bytes));
    }

    #[tokio::test]
    async fn short_reader_exhausts_source() {
        // Declared length exceeds what the reader holds.
        let hasher = Arc::new(Mutex::new(IncrementalHasher::new()));
        let mut src = FilePartSource::new(
            Cursor::new(vec![1u8; 10]),
            20,
            0,
            0,
            Arc::new(HeapAllocator),
            hasher,
        );
        let err = src.next_part(20).await.unwrap_err();
        assert!(matches!(err, TransferError::Io(_)));
        assert!(!src.has_more());
        assert!(src.next_part(1).await.is_err());
    }
}
