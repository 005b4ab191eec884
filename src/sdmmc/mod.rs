//! sdspi-diskio - SDMMC Protocol
//!
//! Implements the SD/MMC protocol on top of a [`Transport`].
//!
//! This is currently optimised for readability and debugability, not
//! performance.

mod bus;
pub mod proto;

use bus::Bus;
pub use bus::{READY_TIMEOUT_MS, R1_POLL_LIMIT, TOKEN_TIMEOUT_MS};

use proto::*;

use crate::transport::{Clock, ClockProfile, Transport, FILLER};
use crate::{Block, BlockCount, BlockDevice, BlockIdx};

#[cfg(feature = "log")]
use log::{debug, trace, warn};

#[cfg(feature = "defmt-log")]
use defmt::{debug, trace, warn};

/// How many filler bytes go out with chip select high at power up (at least
/// 74 clock cycles are required).
const POWER_UP_FILLER_BYTES: usize = 10;

/// How many times we ask the card to leave the idle state.
pub const OP_COND_ATTEMPTS: usize = 1_000;

/// The possible errors `SdSpi` can generate.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Error {
    /// We got an error from the SPI peripheral
    Transport,
    /// Couldn't set the chip select line
    GpioError,
    /// We didn't get a response when waiting for the card to not be busy
    TimeoutWaitNotBusy,
    /// We didn't get a response when executing this command
    TimeoutCommand(u8),
    /// The card answered this command with a non-zero R1
    CommandRejected {
        /// The command index
        command: u8,
        /// What the card said
        r1: u8,
    },
    /// The card never left the idle state while we sent this command
    TimeoutACommand(u8),
    /// The card did not echo our CMD8 check pattern
    IfCondEchoMismatch,
    /// We got a bad response from Command 58
    Cmd58Error,
    /// The card did not answer GO_IDLE_STATE with the idle state
    CardNotFound,
    /// The card rejected every initialization command we know
    UnsupportedCard,
    /// We didn't get a response when reading data from the card
    TimeoutReadBuffer,
    /// We got this instead of a start block token
    ReadError(u8),
    /// The card answered a data block with this data response
    WriteError(u8),
    /// We failed to read a card register
    RegisterReadError,
    /// The sector number does not fit the card's address space
    AddressOutOfRange,
    /// Can't perform this operation with the card in this state
    BadState,
}

/// The different types of card we support.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CardType {
    /// Not identified (yet).
    Unknown,
    /// A MultiMediaCard, version 3.
    ///
    /// Uses byte-addressing.
    MMC3,
    /// A standard-capacity SD Card supporting v1.x of the standard.
    ///
    /// Uses byte-addressing internally, so limited to 2GiB in size.
    SD1,
    /// A standard-capacity SD Card supporting v2.x of the standard.
    ///
    /// Uses byte-addressing internally, so limited to 2GiB in size.
    SD2,
    /// A high-capacity 'SDHC' or 'SDXC' Card.
    ///
    /// Uses block-addressing internally to support capacities above 2GiB.
    SDHC,
}

impl CardType {
    /// Does this card take block numbers (rather than byte offsets) as
    /// data command arguments?
    pub fn is_block_addressed(self) -> bool {
        self == CardType::SDHC
    }
}

/// Where the driver is in its life.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DriverState {
    /// [`SdSpi::initialize`] has not been called.
    Uninitialized,
    /// The card is identified and running at the fast clock.
    Ready,
    /// The last initialization failed.
    Fault,
}

/// Options for the driver.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Default, Copy, Clone)]
pub struct DriverOpts {
    /// Fail a multi-block write when the card does not accept one of the
    /// blocks.
    ///
    /// Off by default: the data response of every block after the first is
    /// clocked out but not checked, which keeps the card streaming.
    pub check_multi_block_response: bool,
}

/// An SD/MMC card on a [`Transport`].
///
/// Built from a transport (SPI bus plus chip select) and a [`Clock`] that
/// all timeouts are measured on.
pub struct SdSpi<T, C>
where
    T: Transport,
    C: Clock,
{
    bus: Bus<T, C>,
    card_type: CardType,
    state: DriverState,
    options: DriverOpts,
}

impl<T, C> SdSpi<T, C>
where
    T: Transport,
    C: Clock,
{
    /// Create a new SD/MMC driver using the default options.
    ///
    /// Nothing is sent to the card until [`SdSpi::initialize`].
    pub fn new(transport: T, clock: C) -> Self {
        Self::new_with_options(transport, clock, DriverOpts::default())
    }

    /// Create a new SD/MMC driver using the given options.
    pub fn new_with_options(transport: T, clock: C, options: DriverOpts) -> Self {
        SdSpi {
            bus: Bus::new(transport, clock),
            card_type: CardType::Unknown,
            state: DriverState::Uninitialized,
            options,
        }
    }

    /// Give back the transport and the clock.
    pub fn free(self) -> (T, C) {
        self.bus.free()
    }

    /// The type of card found by the last successful initialization.
    pub fn card_type(&self) -> CardType {
        self.card_type
    }

    /// Where the driver is in its life.
    pub fn state(&self) -> DriverState {
        self.state
    }

    /// Can data be moved?
    pub fn is_ready(&self) -> bool {
        self.state == DriverState::Ready
    }

    fn check_ready(&self) -> Result<(), Error> {
        if self.is_ready() {
            Ok(())
        } else {
            Err(Error::BadState)
        }
    }

    /// The argument for a data command addressing `block_idx`.
    pub fn wire_address(&self, block_idx: BlockIdx) -> Result<u32, Error> {
        if self.card_type.is_block_addressed() {
            Ok(block_idx.0)
        } else {
            block_idx
                .0
                .checked_mul(Block::LEN_U32)
                .ok_or(Error::AddressOutOfRange)
        }
    }

    /// Identify the card and bring it out of the idle state.
    ///
    /// Runs at the slow clock and switches to the fast clock on success. On
    /// failure the driver is left in [`DriverState::Fault`] with the card
    /// type unknown.
    pub fn initialize(&mut self) -> Result<CardType, Error> {
        debug!("Initializing card with opts: {:?}", self.options);
        self.card_type = CardType::Unknown;
        self.state = DriverState::Uninitialized;

        let identified = Self::identify(&mut self.bus);
        let released = self.bus.release();
        let bus = &mut self.bus;
        let result = identified
            .and_then(|card_type| released.map(|_| card_type))
            .and_then(|card_type| bus.set_clock(ClockProfile::Fast).map(|_| card_type));

        match result {
            Ok(card_type) => {
                debug!("Card version: {:?}", card_type);
                self.card_type = card_type;
                self.state = DriverState::Ready;
                Ok(card_type)
            }
            Err(e) => {
                warn!("Card initialization failed: {:?}", e);
                self.state = DriverState::Fault;
                Err(e)
            }
        }
    }

    fn identify(bus: &mut Bus<T, C>) -> Result<CardType, Error> {
        bus.set_clock(ClockProfile::Slow)?;

        trace!("Reset card..");
        // Supply minimum of 74 clock cycles without CS asserted.
        bus.cs_high()?;
        for _ in 0..POWER_UP_FILLER_BYTES {
            bus.send(FILLER)?;
        }

        // Enter SPI mode
        match bus.card_command(Command::GoIdleState, 0) {
            Ok(R1_IDLE_STATE) => {}
            Ok(r1) => {
                warn!("Got response: {:x} to GO_IDLE_STATE", r1);
                return Err(Error::CardNotFound);
            }
            Err(Error::TimeoutCommand(_)) | Err(Error::TimeoutWaitNotBusy) => {
                return Err(Error::CardNotFound);
            }
            Err(e) => return Err(e),
        }

        // Check card version
        match bus.card_command(Command::SendIfCond, IF_COND_ARG) {
            Ok(R1_IDLE_STATE) => Self::identify_v2(bus),
            Ok(r1) => {
                debug!("SEND_IF_COND answered {:x}, not a v2 card", r1);
                Self::identify_legacy(bus)
            }
            Err(Error::TimeoutCommand(_)) => Self::identify_legacy(bus),
            Err(e) => Err(e),
        }
    }

    /// SD cards of version 2.00 or later.
    fn identify_v2(bus: &mut Bus<T, C>) -> Result<CardType, Error> {
        let mut echo = [0u8; 4];
        for b in echo.iter_mut() {
            *b = bus.receive()?;
        }
        if echo[2] != IF_COND_VOLTAGE_ACCEPTED || echo[3] != IF_COND_CHECK_PATTERN {
            warn!("Bad SEND_IF_COND echo {:x} {:x}", echo[2], echo[3]);
            return Err(Error::IfCondEchoMismatch);
        }

        Self::wait_op_cond(bus, Command::SdSendOpCond, OCR_HCS)?;

        if bus.card_command(Command::ReadOcr, 0)? != R1_READY_STATE {
            return Err(Error::Cmd58Error);
        }
        let mut data = [0u8; 4];
        for b in data.iter_mut() {
            *b = bus.receive()?;
        }
        let ocr = Ocr::new(data);
        trace!("OCR {:?}", ocr);
        if ocr.card_capacity_status() {
            Ok(CardType::SDHC)
        } else {
            Ok(CardType::SD2)
        }
    }

    /// SD v1 cards know ACMD41, MMC cards only know CMD1.
    fn identify_legacy(bus: &mut Bus<T, C>) -> Result<CardType, Error> {
        if let Some(r1) = Self::op_cond(bus, Command::SdSendOpCond, 0)? {
            if r1 <= R1_IDLE_STATE {
                if r1 != R1_READY_STATE {
                    Self::wait_op_cond(bus, Command::SdSendOpCond, 0)?;
                }
                return Ok(CardType::SD1);
            }
        }
        if let Some(r1) = Self::op_cond(bus, Command::SendOpCond, 0)? {
            if r1 <= R1_IDLE_STATE {
                if r1 != R1_READY_STATE {
                    Self::wait_op_cond(bus, Command::SendOpCond, 0)?;
                }
                return Ok(CardType::MMC3);
            }
        }
        Err(Error::UnsupportedCard)
    }

    /// Send an operating condition command once.
    ///
    /// `Ok(None)` means the card didn't answer, or refused the APP_CMD
    /// prefix; the caller may try again.
    fn op_cond(bus: &mut Bus<T, C>, command: Command, arg: u32) -> Result<Option<u8>, Error> {
        let result = if command.is_app_command() {
            bus.card_acmd(command, arg)
        } else {
            bus.card_command(command, arg)
        };
        match result {
            Ok(r1) => Ok(Some(r1)),
            Err(Error::TimeoutCommand(_)) | Err(Error::CommandRejected { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Repeat an operating condition command until the card leaves the idle
    /// state.
    fn wait_op_cond(bus: &mut Bus<T, C>, command: Command, arg: u32) -> Result<(), Error> {
        for attempt in 0..OP_COND_ATTEMPTS {
            match Self::op_cond(bus, command, arg)? {
                Some(R1_READY_STATE) => {
                    trace!("CMD{} ready after {} attempts", command.index(), attempt + 1);
                    return Ok(());
                }
                Some(r1) => trace!("CMD{} busy: {:x}", command.index(), r1),
                None => trace!("CMD{} no answer", command.index()),
            }
        }
        Err(Error::TimeoutACommand(command.index()))
    }

    /// Run a command sequence, then release chip select and clock one more
    /// byte, whether the sequence worked or not.
    fn with_chip_select<F, R>(&mut self, func: F) -> Result<R, Error>
    where
        F: FnOnce(&mut Bus<T, C>) -> Result<R, Error>,
    {
        let result = func(&mut self.bus);
        let released = self.bus.release();
        result.and_then(|r| released.map(|_| r))
    }

    /// Read consecutive sectors, one buffer of [`Block::LEN`] bytes per
    /// sector, starting at `start_block_idx`.
    ///
    /// Stops at the first sector that fails. For more than one sector the
    /// card is always sent STOP_TRANSMISSION afterwards.
    pub fn read_sectors<'b, I>(&mut self, start_block_idx: BlockIdx, mut sectors: I) -> Result<(), Error>
    where
        I: ExactSizeIterator<Item = &'b mut [u8]>,
    {
        self.check_ready()?;
        let count = sectors.len();
        if count == 0 {
            return Ok(());
        }
        let address = self.wire_address(start_block_idx)?;
        trace!("Read {} sector(s) from {} (arg {:x})", count, start_block_idx.0, address);

        self.with_chip_select(|bus| {
            if count == 1 {
                // Start a single-block read
                let r1 = bus.card_command(Command::ReadSingleBlock, address)?;
                if r1 != R1_READY_STATE {
                    return Err(Error::CommandRejected {
                        command: Command::ReadSingleBlock.index(),
                        r1,
                    });
                }
                if let Some(sector) = sectors.next() {
                    bus.read_data(sector)?;
                }
                Ok(())
            } else {
                // Start a multi-block read
                let r1 = bus.card_command(Command::ReadMultipleBlock, address)?;
                if r1 != R1_READY_STATE {
                    return Err(Error::CommandRejected {
                        command: Command::ReadMultipleBlock.index(),
                        r1,
                    });
                }
                let result = sectors.try_for_each(|sector| bus.read_data(sector));
                // Stop the read
                if let Err(e) = bus.card_command(Command::StopTransmission, 0) {
                    warn!("STOP_TRANSMISSION failed: {:?}", e);
                }
                result
            }
        })
    }

    /// Write consecutive sectors, one buffer of [`Block::LEN`] bytes per
    /// sector, starting at `start_block_idx`.
    ///
    /// Stops at the first sector that fails. For more than one sector the
    /// stop token is always sent afterwards.
    #[cfg(feature = "write")]
    pub fn write_sectors<'b, I>(&mut self, start_block_idx: BlockIdx, mut sectors: I) -> Result<(), Error>
    where
        I: ExactSizeIterator<Item = &'b [u8]>,
    {
        self.check_ready()?;
        let count = sectors.len();
        if count == 0 {
            return Ok(());
        }
        let address = self.wire_address(start_block_idx)?;
        let verify_each = self.options.check_multi_block_response;
        trace!("Write {} sector(s) to {} (arg {:x})", count, start_block_idx.0, address);

        self.with_chip_select(|bus| {
            if count == 1 {
                // Start a single-block write
                let r1 = bus.card_command(Command::WriteBlock, address)?;
                if r1 != R1_READY_STATE {
                    return Err(Error::CommandRejected {
                        command: Command::WriteBlock.index(),
                        r1,
                    });
                }
                if let Some(sector) = sectors.next() {
                    bus.write_data(DATA_START_BLOCK, sector, true)?;
                }
                Ok(())
            } else {
                // Start a multi-block write
                let r1 = bus.card_command(Command::WriteMultipleBlock, address)?;
                if r1 != R1_READY_STATE {
                    return Err(Error::CommandRejected {
                        command: Command::WriteMultipleBlock.index(),
                        r1,
                    });
                }
                let result = sectors
                    .try_for_each(|sector| bus.write_data(WRITE_MULTIPLE_TOKEN, sector, verify_each));
                // Stop the write
                let stopped = bus.stop_multi_block_write();
                result.and(stopped)
            }
        })
    }

    /// Wait until the card has finished any internal write.
    pub fn sync(&mut self) -> Result<(), Error> {
        self.check_ready()?;
        self.with_chip_select(|bus| {
            bus.cs_low()?;
            bus.wait_ready()
        })
    }

    /// Read one of the 16-byte card registers.
    fn read_register(&mut self, command: Command) -> Result<[u8; 16], Error> {
        self.check_ready()?;
        self.with_chip_select(|bus| {
            if bus.card_command(command, 0)? != R1_READY_STATE {
                return Err(Error::RegisterReadError);
            }
            let mut data = [0u8; 16];
            bus.read_data(&mut data)?;
            Ok(data)
        })
    }

    /// Read the 'card specific data' block.
    pub fn read_csd(&mut self) -> Result<Csd, Error> {
        let data = self.read_register(Command::SendCsd)?;
        match self.card_type {
            // MMC uses the CSD_STRUCTURE bits for its own versioning, but the
            // capacity fields are always laid out as in version 1
            CardType::MMC3 => Ok(Csd::V1(CsdV1 { data })),
            _ => Ok(Csd::from_bytes(data)),
        }
    }

    /// Read the 'card identification' block.
    pub fn read_cid(&mut self) -> Result<Cid, Error> {
        let data = self.read_register(Command::SendCid)?;
        Ok(Cid { data })
    }

    /// Read the two-byte R2 card status.
    pub fn card_status(&mut self) -> Result<u16, Error> {
        self.check_ready()?;
        self.with_chip_select(|bus| {
            let r1 = bus.card_command(Command::SendStatus, 0)?;
            let r2 = bus.receive()?;
            Ok(u16::from_be_bytes([r1, r2]))
        })
    }

    /// Return the usable size of this SD card in bytes.
    pub fn card_size_bytes(&mut self) -> Result<u64, Error> {
        Ok(self.read_csd()?.card_capacity_bytes())
    }

    /// Can this card erase single blocks?
    pub fn erase_single_block_enabled(&mut self) -> Result<bool, Error> {
        Ok(self.read_csd()?.erase_single_block_enabled())
    }
}

impl<T, C> BlockDevice for SdSpi<T, C>
where
    T: Transport,
    C: Clock,
{
    type Error = Error;

    /// Read one or more blocks, starting at the given block index.
    fn read(
        &mut self,
        blocks: &mut [Block],
        start_block_idx: BlockIdx,
        reason: &str,
    ) -> Result<(), Self::Error> {
        trace!("Read {} block(s) for {}", blocks.len(), reason);
        self.read_sectors(start_block_idx, blocks.iter_mut().map(|b| &mut b.contents[..]))
    }

    /// Write one or more blocks, starting at the given block index.
    #[cfg(feature = "write")]
    fn write(&mut self, blocks: &[Block], start_block_idx: BlockIdx) -> Result<(), Self::Error> {
        self.write_sectors(start_block_idx, blocks.iter().map(|b| &b.contents[..]))
    }

    /// Determine how many blocks this device can hold.
    fn num_blocks(&mut self) -> Result<BlockCount, Self::Error> {
        self.read_csd()?
            .card_capacity_blocks()
            .map(BlockCount)
            .ok_or(Error::RegisterReadError)
    }
}

// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
