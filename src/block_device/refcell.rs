//! Share one block device between several owners, e.g. the card driver and
//! whatever else lives on the same SPI bus.
//!
//! Going through `&RefCell<T>` panics if the device is already borrowed,
//! which can only happen if a caller re-enters the device from inside one of
//! its own operations.

use core::cell::RefCell;

use super::{Block, BlockCount, BlockDevice, BlockIdx};

forward_block_device!(impl<T> for RefCell<T> => |cell| cell.get_mut());

forward_block_device!(impl<T> for &RefCell<T> => |cell| cell.borrow_mut());

#[cfg(test)]
mod test {
    use super::*;
    use crate::MemoryBlockDevice;

    #[test]
    fn every_handle_sees_the_same_disk() {
        let mut memory = [0u8; 4 * 512];
        memory[512] = 0x42;
        let shared = RefCell::new(MemoryBlockDevice::new(&mut memory));

        let mut reader = &shared;
        let mut counter = &shared;
        assert_eq!(reader.read_block(BlockIdx(1)).unwrap()[0], 0x42);
        assert_eq!(counter.num_blocks(), Ok(BlockCount(4)));
        // the borrow is over once the call returns
        assert!(shared.try_borrow_mut().is_ok());
    }

    #[cfg(feature = "write")]
    #[test]
    fn writes_through_an_owned_cell() {
        let mut memory = [0u8; 2 * 512];
        let mut owned = RefCell::new(MemoryBlockDevice::new(&mut memory));
        let mut block = Block::new();
        block[7] = 7;
        owned.write(&[block], BlockIdx(1)).unwrap();
        assert_eq!(owned.read_block(BlockIdx(1)).unwrap()[7], 7);
    }
}
