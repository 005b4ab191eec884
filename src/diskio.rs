//! sdspi-diskio - Disk I/O surface
//!
//! The five entry points a FatFs-style filesystem expects from a physical
//! drive, plus the status and result codes it understands. Only drive
//! [`DRIVE`] exists; anything addressed to another drive is refused
//! without touching the bus.

use core::convert::TryFrom;

use crate::sdmmc::{Error, SdSpi};
use crate::transport::{Clock, Transport};
use crate::{Block, BlockIdx};

#[cfg(feature = "log")]
use log::warn;

#[cfg(feature = "defmt-log")]
use defmt::warn;

/// The only physical drive number we answer to.
pub const DRIVE: u8 = 0;

bitflags::bitflags! {
    /// Drive status bits.
    pub struct Status: u8 {
        /// The drive has not been initialized (or initialization failed).
        const NOT_INITIALIZED = 0x01;
    }
}

/// Why a disk operation failed.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DiskError {
    /// A hard error occurred during the operation
    Error,
    /// The drive is not ready, or does not exist
    NotReady,
    /// The request itself is invalid
    ParameterError,
}

impl From<Error> for DiskError {
    fn from(e: Error) -> Self {
        match e {
            Error::BadState => DiskError::NotReady,
            Error::AddressOutOfRange => DiskError::ParameterError,
            _ => DiskError::Error,
        }
    }
}

/// Control codes for [`DiskIo::disk_ioctl`], numbered as FatFs numbers them.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum IoctlCmd {
    /// Complete any pending write
    CtrlSync = 0,
    /// Number of sectors on the drive
    GetSectorCount = 1,
    /// Size of a sector in bytes
    GetSectorSize = 2,
    /// Erase block size in sectors
    GetBlockSize = 3,
    /// Tell the drive a range of sectors is no longer in use
    CtrlTrim = 4,
}

impl TryFrom<u8> for IoctlCmd {
    type Error = DiskError;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(IoctlCmd::CtrlSync),
            1 => Ok(IoctlCmd::GetSectorCount),
            2 => Ok(IoctlCmd::GetSectorSize),
            3 => Ok(IoctlCmd::GetBlockSize),
            4 => Ok(IoctlCmd::CtrlTrim),
            _ => Err(DiskError::ParameterError),
        }
    }
}

/// What a successful [`DiskIo::disk_ioctl`] hands back.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum IoctlValue {
    /// The command completed and has nothing to report
    Done,
    /// Bytes per sector
    SectorSize(u16),
    /// Sectors per erase block
    BlockSize(u32),
}

/// A physical drive as seen by the filesystem.
pub trait DiskIo {
    /// Bring the drive up and return the resulting status.
    fn disk_initialize(&mut self, drive: u8) -> Status;

    /// The status of the drive. Never talks to the hardware.
    fn disk_status(&self, drive: u8) -> Status;

    /// Read `count` sectors starting at `sector` into the front of `buf`.
    fn disk_read(&mut self, drive: u8, buf: &mut [u8], sector: u32, count: usize) -> Result<(), DiskError>;

    /// Write `count` sectors starting at `sector` from the front of `buf`.
    #[cfg(feature = "write")]
    fn disk_write(&mut self, drive: u8, buf: &[u8], sector: u32, count: usize) -> Result<(), DiskError>;

    /// Miscellaneous drive controls.
    fn disk_ioctl(&mut self, drive: u8, cmd: IoctlCmd) -> Result<IoctlValue, DiskError>;
}

/// How many bytes of a caller's buffer `count` sectors occupy.
fn transfer_len(buf_len: usize, count: usize) -> Result<usize, DiskError> {
    match count.checked_mul(Block::LEN) {
        Some(len) if count > 0 && len <= buf_len => Ok(len),
        _ => Err(DiskError::ParameterError),
    }
}

impl<T, C> SdSpi<T, C>
where
    T: Transport,
    C: Clock,
{
    fn check_drive(&self, drive: u8) -> Result<(), DiskError> {
        if drive == DRIVE && self.is_ready() {
            Ok(())
        } else {
            Err(DiskError::NotReady)
        }
    }
}

impl<T, C> DiskIo for SdSpi<T, C>
where
    T: Transport,
    C: Clock,
{
    fn disk_initialize(&mut self, drive: u8) -> Status {
        if drive != DRIVE {
            return Status::NOT_INITIALIZED;
        }
        // Failures are logged by `initialize` and show up in the status
        let _ = self.initialize();
        self.disk_status(drive)
    }

    fn disk_status(&self, drive: u8) -> Status {
        if drive == DRIVE && self.is_ready() {
            Status::empty()
        } else {
            Status::NOT_INITIALIZED
        }
    }

    fn disk_read(&mut self, drive: u8, buf: &mut [u8], sector: u32, count: usize) -> Result<(), DiskError> {
        self.check_drive(drive)?;
        let len = transfer_len(buf.len(), count)?;
        self.read_sectors(BlockIdx(sector), buf[..len].chunks_exact_mut(Block::LEN))
            .map_err(|e| {
                warn!("disk_read of {} sector(s) at {} failed: {:?}", count, sector, e);
                DiskError::from(e)
            })
    }

    #[cfg(feature = "write")]
    fn disk_write(&mut self, drive: u8, buf: &[u8], sector: u32, count: usize) -> Result<(), DiskError> {
        self.check_drive(drive)?;
        let len = transfer_len(buf.len(), count)?;
        self.write_sectors(BlockIdx(sector), buf[..len].chunks_exact(Block::LEN))
            .map_err(|e| {
                warn!("disk_write of {} sector(s) at {} failed: {:?}", count, sector, e);
                DiskError::from(e)
            })
    }

    fn disk_ioctl(&mut self, drive: u8, cmd: IoctlCmd) -> Result<IoctlValue, DiskError> {
        self.check_drive(drive)?;
        match cmd {
            IoctlCmd::CtrlSync => self.sync().map(|_| IoctlValue::Done).map_err(|e| {
                warn!("disk_ioctl sync failed: {:?}", e);
                DiskError::from(e)
            }),
            IoctlCmd::GetSectorSize => Ok(IoctlValue::SectorSize(Block::LEN as u16)),
            // The true erase block size is never read from the card
            IoctlCmd::GetBlockSize => Ok(IoctlValue::BlockSize(1)),
            IoctlCmd::GetSectorCount | IoctlCmd::CtrlTrim => Err(DiskError::ParameterError),
        }
    }
}
