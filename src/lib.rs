//! # sdspi-diskio
//!
//! > An SD/MMC over SPI block driver written in Embedded Rust
//!
//! This crate drives an SD or MMC card over a plain SPI bus and hands the
//! card to a FatFs-style filesystem through the [`DiskIo`] trait. It is
//! `#![no_std]`, does not allocate, and only ever blocks on the bus: there
//! are no interrupts and no DMA.
//!
//! ## Using the crate
//!
//! You will need something that implements [`Transport`] (the
//! [`SpiTransport`] adaptor builds one out of the usual `embedded-hal` SPI
//! and GPIO traits) and a [`Clock`] that the driver measures its timeouts
//! on.
//!
//! ```rust,ignore
//! let transport = sdspi_diskio::SpiTransport::new(spi, cs, |spi: &mut Spi, profile| match profile {
//!     ClockProfile::Slow => spi.set_baud(400.kHz()),
//!     ClockProfile::Fast => spi.set_baud(24.MHz()),
//! });
//! let mut card = sdspi_diskio::SdSpi::new(transport, timer);
//! if card.disk_initialize(sdspi_diskio::DRIVE).is_empty() {
//!     let mut sector = [0u8; 512];
//!     card.disk_read(sdspi_diskio::DRIVE, &mut sector, 0, 1).unwrap();
//! }
//! ```
//!
//! The typed [`BlockDevice`] API works on the same driver, once it has been
//! initialized.
//!
//! ## Features
//!
//! * `defmt-log`: By turning off the default features and enabling the `defmt-log` feature you can
//! configure this crate to log messages over defmt instead.
//! * `write`: the write half of the API. Turn off the default features to get
//! a read-only driver.
//! * `refcell-blockdevice`: implements [`BlockDevice`] for `RefCell`s of
//! block devices.
//!
//! Make sure that either the `log` feature or the `defmt-log` feature is enabled.

#![cfg_attr(not(test), no_std)]
// #![deny(missing_docs)]

// ****************************************************************************
//
// Imports
//
// ****************************************************************************


#[macro_use]
mod structure;

pub mod block_device;
pub mod diskio;
pub mod sdmmc;
pub mod transport;

pub use crate::block_device::{
    Block, BlockCount, BlockDevice, BlockIdx, MemoryBlockDevice, MemoryError,
};
pub use crate::diskio::{DiskError, DiskIo, IoctlCmd, IoctlValue, Status, DRIVE};
pub use crate::sdmmc::Error as SdMmcError;
pub use crate::sdmmc::{CardType, DriverOpts, DriverState, SdSpi};
pub use crate::transport::{
    Clock, ClockControl, ClockProfile, FixedRate, SpiTransport, SpiTransportError, Transport,
};

// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
