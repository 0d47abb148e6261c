//! BlockFile module - abstraction layer for a single on-disk file divided into fixed-size blocks.

use std::{
    fmt, fs,
    io::{self, Cursor, ErrorKind, Read, Seek, SeekFrom, Write},
    path::Path,
};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use thiserror::Error;

/// Byte offset of a block inside a [`BlockFile`].
///
/// Offset 0 always points into the file header, so it can never address a block. It is used as
/// the on-disk representation of "no block" ([`BlockPtr::NULL`]).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockPtr(u64);

impl BlockPtr {
    /// Pointer that never addresses a block.
    pub const NULL: BlockPtr = BlockPtr(0);

    pub fn new(offset: u64) -> Self {
        Self(offset)
    }

    pub fn offset(&self) -> u64 {
        self.0
    }

    pub fn is_null(&self) -> bool {
        *self == Self::NULL
    }

    /// Maps the null pointer to `None`.
    pub fn non_null(self) -> Option<BlockPtr> {
        if self.is_null() { None } else { Some(self) }
    }
}

impl From<Option<BlockPtr>> for BlockPtr {
    fn from(value: Option<BlockPtr>) -> Self {
        value.unwrap_or(BlockPtr::NULL)
    }
}

impl fmt::Display for BlockPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            write!(f, "null")
        } else {
            write!(f, "@{}", self.0)
        }
    }
}

/// Responsible for managing a single on-disk file.
/// Only this structure should be responsible for directly communicating with disk.
///
/// The file starts with a fixed-size header ([`BlockFile::HEADER_SIZE`] bytes) holding a magic number and
/// the block size. Blocks follow the header back to back; a block is addressed by its byte offset
/// ([`BlockPtr`]). Blocks are only ever appended, never freed.
pub struct BlockFile {
    /// handle to underlying file
    handle: fs::File,
    /// size of every block in bytes
    block_size: u32,
    /// offset at which the next allocated block will start (current logical end of file)
    end_offset: u64,
    /// maximal number of blocks this file may hold, `None` when unlimited
    max_blocks: Option<u64>,
}

/// Error for [`BlockFile`] related operations.
#[derive(Error, Debug)]
pub enum BlockFileError {
    /// Provided block pointer was invalid, e.g. pointed into the header or past the end of file
    #[error("invalid block pointer: {0}")]
    InvalidBlock(BlockPtr),
    /// File used for loading [`BlockFile`] has invalid format
    #[error("file has invalid format: {0}")]
    InvalidFileFormat(&'static str),
    /// No more blocks can be allocated
    #[error("block limit of {limit} blocks reached")]
    Exhausted { limit: u64 },
    /// Underlying IO module returned error
    #[error("io error occured: {0}")]
    IoError(#[from] io::Error),
}

impl BlockFile {
    /// Magic number - used for checking if file is (has high chances to be) our file.
    const MAGIC_NUMBER: [u8; 4] = [0xB1, 0x0C, 0xF1, 0x1E];

    /// Size of the header: magic number (4 bytes) + block size (4 bytes).
    pub const HEADER_SIZE: u64 = 8;

    /// Creates a new file at `file_path` (truncating any existing one) whose blocks are `block_size` bytes long.
    pub fn create<P>(file_path: P, block_size: u32) -> Result<BlockFile, BlockFileError>
    where
        P: AsRef<Path>,
    {
        if block_size == 0 {
            return Err(BlockFileError::InvalidFileFormat("block size must not be zero"));
        }
        let mut handle = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&file_path)?;

        let mut header = Vec::with_capacity(Self::HEADER_SIZE as usize);
        header.extend_from_slice(&Self::MAGIC_NUMBER);
        header.write_u32::<BigEndian>(block_size)?;
        handle.write_all(&header)?;

        log::info!(
            "created block file {} with block size {block_size}",
            file_path.as_ref().display()
        );
        Ok(BlockFile {
            handle,
            block_size,
            end_offset: Self::HEADER_SIZE,
            max_blocks: None,
        })
    }

    /// Opens an existing file at `file_path` and reads its block size back from the header.
    pub fn open<P>(file_path: P) -> Result<BlockFile, BlockFileError>
    where
        P: AsRef<Path>,
    {
        let file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&file_path)?;
        let block_file = BlockFile::try_from(file)?;
        log::info!(
            "opened block file {} with block size {} and {} blocks",
            file_path.as_ref().display(),
            block_file.block_size,
            block_file.block_count()
        );
        Ok(block_file)
    }

    /// Caps the number of blocks that may exist in the file. Further [`BlockFile::allocate_block`] calls fail
    /// with [`BlockFileError::Exhausted`] once the limit is reached.
    pub fn set_block_limit(&mut self, max_blocks: Option<u64>) {
        self.max_blocks = max_blocks;
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    /// Offset of the first block, located right after the header.
    pub fn first_block_offset(&self) -> BlockPtr {
        BlockPtr(Self::HEADER_SIZE)
    }

    /// Number of allocated blocks.
    pub fn block_count(&self) -> u64 {
        (self.end_offset - Self::HEADER_SIZE) / self.block_size as u64
    }

    /// Offsets of all allocated blocks in file order.
    pub fn block_offsets(&self) -> impl Iterator<Item = BlockPtr> + use<> {
        let block_size = self.block_size as u64;
        (0..self.block_count()).map(move |i| BlockPtr(Self::HEADER_SIZE + i * block_size))
    }

    /// Reserves a new block at the end of the file and returns its offset. The block is zero-filled.
    pub fn allocate_block(&mut self) -> Result<BlockPtr, BlockFileError> {
        if let Some(limit) = self.max_blocks {
            if self.block_count() >= limit {
                return Err(BlockFileError::Exhausted { limit });
            }
        }
        let ptr = BlockPtr(self.end_offset);
        let new_end = self
            .end_offset
            .checked_add(self.block_size as u64)
            .ok_or(BlockFileError::Exhausted {
                limit: self.block_count(),
            })?;
        self.handle.set_len(new_end)?;
        self.end_offset = new_end;
        log::trace!("allocated block {ptr}");
        Ok(ptr)
    }

    /// Reads the whole block at `ptr` into `buffer`, which must be exactly one block long.
    pub fn read_block(&mut self, ptr: BlockPtr, buffer: &mut [u8]) -> Result<(), BlockFileError> {
        self.check_block(ptr)?;
        if buffer.len() != self.block_size as usize {
            return Err(BlockFileError::IoError(io::Error::new(
                ErrorKind::InvalidInput,
                "buffer length differs from block size",
            )));
        }
        self.handle.seek(SeekFrom::Start(ptr.offset()))?;
        self.handle.read_exact(buffer)?;
        Ok(())
    }

    /// Writes `bytes` to the block at `ptr`. Shorter input is zero-padded to the block size,
    /// longer input is truncated to it. Block at `ptr` must be allocated before writing to it.
    pub fn write_block(&mut self, ptr: BlockPtr, bytes: &[u8]) -> Result<(), BlockFileError> {
        self.check_block(ptr)?;
        let block_size = self.block_size as usize;
        self.handle.seek(SeekFrom::Start(ptr.offset()))?;
        if bytes.len() >= block_size {
            self.handle.write_all(&bytes[..block_size])?;
        } else {
            let mut block = vec![0u8; block_size];
            block[..bytes.len()].copy_from_slice(bytes);
            self.handle.write_all(&block)?;
        }
        Ok(())
    }

    /// Flushes file content to disk ensuring it's synced with in-memory state. Can fail if io error occurs.
    pub fn flush(&mut self) -> Result<(), BlockFileError> {
        self.handle.sync_all()?;
        Ok(())
    }

    /// Helper to check if block at `ptr` can be read from/written to.
    fn check_block(&self, ptr: BlockPtr) -> Result<(), BlockFileError> {
        let offset = ptr.offset();
        let in_header = offset < Self::HEADER_SIZE;
        let unallocated = offset >= self.end_offset;
        let misaligned = !in_header && (offset - Self::HEADER_SIZE) % self.block_size as u64 != 0;
        if in_header || unallocated || misaligned {
            return Err(BlockFileError::InvalidBlock(ptr));
        }
        Ok(())
    }
}

/// Try to deserialize existing [`BlockFile`] from file. Can fail if io error occurrs or if underlying file
/// has invalid format.
impl TryFrom<fs::File> for BlockFile {
    type Error = BlockFileError;

    fn try_from(mut value: fs::File) -> Result<Self, Self::Error> {
        let mut header = [0u8; Self::HEADER_SIZE as usize];
        if let Err(e) = value.read_exact(&mut header) {
            return match e.kind() {
                ErrorKind::UnexpectedEof => {
                    Err(BlockFileError::InvalidFileFormat("file shorter than header"))
                }
                _ => Err(BlockFileError::IoError(e)),
            };
        }
        let mut cursor = Cursor::new(header);
        let mut magic_number = [0u8; 4];
        cursor.read_exact(&mut magic_number)?;
        if magic_number != Self::MAGIC_NUMBER {
            return Err(BlockFileError::InvalidFileFormat("invalid magic number"));
        }
        let block_size = cursor.read_u32::<BigEndian>()?;
        if block_size == 0 {
            return Err(BlockFileError::InvalidFileFormat("block size must not be zero"));
        }
        let len = value.metadata()?.len();
        let body = len - Self::HEADER_SIZE;
        if body % block_size as u64 != 0 {
            return Err(BlockFileError::InvalidFileFormat(
                "file length is not a whole number of blocks",
            ));
        }
        Ok(BlockFile {
            handle: value,
            block_size,
            end_offset: len,
            max_blocks: None,
        })
    }
}

/// Make sure that all in-memory changes have been flushed to disk before dropping [`BlockFile`].
impl Drop for BlockFile {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            log::error!("failed to flush file content while dropping BlockFile: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::{NamedTempFile, tempdir};

    fn write_temp_file_with_content(contents: &[u8]) -> NamedTempFile {
        let temp_file = NamedTempFile::new().unwrap();
        std::fs::write(temp_file.path(), contents).unwrap();
        temp_file
    }

    fn header(block_size: u32) -> Vec<u8> {
        let mut buffer = Vec::new();
        buffer.extend_from_slice(&BlockFile::MAGIC_NUMBER);
        buffer.write_u32::<BigEndian>(block_size).unwrap();
        buffer
    }

    #[test]
    fn block_file_create_then_open_reads_back_block_size() {
        // given a freshly created file
        let dir = tempdir().unwrap();
        let path = dir.path().join("blocks.idx");
        let file = BlockFile::create(&path, 123).unwrap();
        drop(file);

        // when opening it again
        let file = BlockFile::open(&path).unwrap();

        // then the same block size is reported and there are no blocks
        assert_eq!(file.block_size(), 123);
        assert_eq!(file.block_count(), 0);
        assert_eq!(file.first_block_offset(), BlockPtr::new(BlockFile::HEADER_SIZE));
    }

    #[test]
    fn block_file_open_file_too_small() {
        // given file shorter than the header
        let temp_file = write_temp_file_with_content(&[1, 2, 3]);

        // when try to load `BlockFile` from it
        let result = BlockFile::open(temp_file.path());

        // then error is returned
        assert!(matches!(
            result.err().unwrap(),
            BlockFileError::InvalidFileFormat(msg) if msg == "file shorter than header"
        ));
    }

    #[test]
    fn block_file_open_invalid_magic_number() {
        // given header with invalid magic number
        let temp_file = write_temp_file_with_content(&[0xDE, 0xAD, 0xBE, 0xEF, 0, 0, 0, 16]);

        // when try to load `BlockFile` from it
        let result = BlockFile::open(temp_file.path());

        // then error is returned
        assert!(matches!(
            result.err().unwrap(),
            BlockFileError::InvalidFileFormat(msg) if msg == "invalid magic number"
        ));
    }

    #[test]
    fn block_file_open_partial_block() {
        // given a header announcing 16-byte blocks followed by 10 bytes
        let mut content = header(16);
        content.extend_from_slice(&[0u8; 10]);
        let temp_file = write_temp_file_with_content(&content);

        // when try to load `BlockFile` from it
        let result = BlockFile::open(temp_file.path());

        // then error is returned
        assert!(matches!(
            result.err().unwrap(),
            BlockFileError::InvalidFileFormat(_)
        ));
    }

    #[test]
    fn block_file_allocate_appends_blocks() {
        // given an empty file with 16-byte blocks
        let dir = tempdir().unwrap();
        let path = dir.path().join("blocks");
        let mut file = BlockFile::create(&path, 16).unwrap();

        // when allocating three blocks
        let first = file.allocate_block().unwrap();
        let second = file.allocate_block().unwrap();
        let third = file.allocate_block().unwrap();

        // then they are laid out back to back after the header
        assert_eq!(first, file.first_block_offset());
        assert_eq!(second.offset(), first.offset() + 16);
        assert_eq!(third.offset(), second.offset() + 16);
        assert_eq!(file.block_count(), 3);
        assert_eq!(
            std::fs::metadata(&path).unwrap().len(),
            BlockFile::HEADER_SIZE + 48
        );
        assert_eq!(
            file.block_offsets().collect::<Vec<_>>(),
            vec![first, second, third]
        );
    }

    #[test]
    fn block_file_allocate_respects_limit() {
        // given a file limited to two blocks
        let dir = tempdir().unwrap();
        let mut file = BlockFile::create(dir.path().join("blocks"), 16).unwrap();
        file.set_block_limit(Some(2));

        // when allocating three blocks
        file.allocate_block().unwrap();
        file.allocate_block().unwrap();
        let result = file.allocate_block();

        // then the third allocation fails
        assert!(matches!(result, Err(BlockFileError::Exhausted { limit: 2 })));
    }

    #[test]
    fn block_file_write_pads_and_truncates() {
        // given a file with two allocated 8-byte blocks
        let dir = tempdir().unwrap();
        let mut file = BlockFile::create(dir.path().join("blocks"), 8).unwrap();
        let first = file.allocate_block().unwrap();
        let second = file.allocate_block().unwrap();

        // when writing a short and a long buffer
        file.write_block(first, &[1, 2, 3]).unwrap();
        file.write_block(second, &[9u8; 12]).unwrap();

        // then the short one is zero padded and the long one truncated
        let mut buffer = [0u8; 8];
        file.read_block(first, &mut buffer).unwrap();
        assert_eq!(buffer, [1, 2, 3, 0, 0, 0, 0, 0]);
        file.read_block(second, &mut buffer).unwrap();
        assert_eq!(buffer, [9u8; 8]);
    }

    #[test]
    fn block_file_rejects_invalid_pointers() {
        // given a file with one allocated 8-byte block
        let dir = tempdir().unwrap();
        let mut file = BlockFile::create(dir.path().join("blocks"), 8).unwrap();
        let block = file.allocate_block().unwrap();
        let mut buffer = [0u8; 8];

        // when accessing the null pointer, a misaligned pointer and an unallocated one
        let null = file.read_block(BlockPtr::NULL, &mut buffer);
        let misaligned = file.read_block(BlockPtr::new(block.offset() + 3), &mut buffer);
        let unallocated = file.write_block(BlockPtr::new(block.offset() + 8), &[1]);

        // then every access is rejected
        assert!(matches!(null, Err(BlockFileError::InvalidBlock(_))));
        assert!(matches!(misaligned, Err(BlockFileError::InvalidBlock(_))));
        assert!(matches!(unallocated, Err(BlockFileError::InvalidBlock(_))));
    }

    #[test]
    fn block_file_data_survives_reopen() {
        // given a block written before closing the file
        let dir = tempdir().unwrap();
        let path = dir.path().join("blocks");
        let block = {
            let mut file = BlockFile::create(&path, 4).unwrap();
            let block = file.allocate_block().unwrap();
            file.write_block(block, &[4, 3, 2, 1]).unwrap();
            block
        };

        // when reopening it
        let mut file = BlockFile::open(&path).unwrap();

        // then the content is the same
        let mut buffer = [0u8; 4];
        file.read_block(block, &mut buffer).unwrap();
        assert_eq!(buffer, [4, 3, 2, 1]);
        assert_eq!(file.block_count(), 1);
    }
}
