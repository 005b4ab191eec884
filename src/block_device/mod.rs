//! sdspi-diskio - Block Device support
//!
//! Generic code for handling block devices.

/// Implement [`BlockDevice`] for a wrapper type, handing every call on to
/// the device that `$inner` reaches through `$this`.
macro_rules! forward_block_device {
    (impl<$t:ident> for $wrapper:ty => |$this:ident| $inner:expr) => {
        impl<$t> BlockDevice for $wrapper
        where
            $t: BlockDevice,
        {
            type Error = $t::Error;

            fn read(
                &mut self,
                blocks: &mut [Block],
                start_block_idx: BlockIdx,
                reason: &str,
            ) -> Result<(), Self::Error> {
                let $this = self;
                $inner.read(blocks, start_block_idx, reason)
            }

            #[cfg(feature = "write")]
            fn write(&mut self, blocks: &[Block], start_block_idx: BlockIdx) -> Result<(), Self::Error> {
                let $this = self;
                $inner.write(blocks, start_block_idx)
            }

            fn num_blocks(&mut self) -> Result<BlockCount, Self::Error> {
                let $this = self;
                $inner.num_blocks()
            }
        }
    };
}

#[cfg(feature = "refcell-blockdevice")]
mod refcell;

mod block;
pub use block::*;

/// Represents a block device - a device which can read and write blocks (or
/// sectors). Only supports devices which are <= 2 TiB in size.
pub trait BlockDevice {
    /// The errors that the `BlockDevice` can return. Must be debug formattable.
    type Error: core::fmt::Debug;
    /// Read one or more blocks, starting at the given block index.
    fn read(
        &mut self,
        blocks: &mut [Block],
        start_block_idx: BlockIdx,
        reason: &str,
    ) -> Result<(), Self::Error>;
    /// Write one or more blocks, starting at the given block index.
    #[cfg(feature = "write")]
    fn write(&mut self, blocks: &[Block], start_block_idx: BlockIdx) -> Result<(), Self::Error>;
    /// Determine how many blocks this device can hold.
    fn num_blocks(&mut self) -> Result<BlockCount, Self::Error>;

    /// Read a single block.
    fn read_block(&mut self, block_idx: BlockIdx) -> Result<Block, Self::Error> {
        let mut blocks = [Block::new()];
        self.read(&mut blocks, block_idx, "read_block")?;
        let [block] = blocks;
        Ok(block)
    }
}

forward_block_device!(impl<T> for &mut T => |dev| (**dev));

/// The errors a `MemoryBlockDevice` can return.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MemoryError {
    /// The request runs past the end of the memory
    OutOfRange,
}

/// A block device held in RAM.
#[derive(Debug)]
pub struct MemoryBlockDevice<'a> {
    memory: &'a mut [u8],
}

impl<'a> MemoryBlockDevice<'a> {
    /// Use `memory` as the disk. Any partial block at the end is ignored.
    pub fn new(memory: &'a mut [u8]) -> Self {
        Self { memory }
    }

    /// The bytes of the block `offset` blocks past `start`.
    fn block_range(
        &self,
        start: BlockIdx,
        offset: usize,
    ) -> Result<core::ops::Range<usize>, MemoryError> {
        let begin = (start.0 as usize)
            .checked_add(offset)
            .and_then(|idx| idx.checked_mul(Block::LEN))
            .ok_or(MemoryError::OutOfRange)?;
        match begin.checked_add(Block::LEN) {
            Some(end) if end <= self.memory.len() => Ok(begin..end),
            _ => Err(MemoryError::OutOfRange),
        }
    }
}

impl<'a> BlockDevice for MemoryBlockDevice<'a> {
    type Error = MemoryError;

    fn read(
        &mut self,
        blocks: &mut [Block],
        start_block_idx: BlockIdx,
        _reason: &str,
    ) -> Result<(), Self::Error> {
        for (idx, block) in blocks.iter_mut().enumerate() {
            let range = self.block_range(start_block_idx, idx)?;
            block.contents.copy_from_slice(&self.memory[range])
        }

        Ok(())
    }

    #[cfg(feature = "write")]
    fn write(&mut self, blocks: &[Block], start_block_idx: BlockIdx) -> Result<(), Self::Error> {
        for (idx, block) in blocks.iter().enumerate() {
            let range = self.block_range(start_block_idx, idx)?;
            self.memory[range].copy_from_slice(&block.contents);
        }
        Ok(())
    }

    fn num_blocks(&mut self) -> Result<BlockCount, Self::Error> {
        Ok(BlockCount((self.memory.len() / Block::LEN) as u32))
    }
}
