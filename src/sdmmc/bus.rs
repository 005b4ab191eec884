//! sdspi-diskio - the byte-level side of the SD/MMC protocol
//!
//! Readiness polling, command framing and data block framing. Nothing in
//! here knows what kind of card is attached.

use super::proto::*;
use super::Error;
use crate::transport::{Clock, ClockProfile, Transport, FILLER};

#[cfg(feature = "log")]
use log::{trace, warn};

#[cfg(feature = "defmt-log")]
use defmt::{trace, warn};

/// How long the card may stay busy before we give up on it.
pub const READY_TIMEOUT_MS: u32 = 5_000;

/// How long we wait for the start of a data block.
pub const TOKEN_TIMEOUT_MS: u32 = 1_000;

/// How many bytes we clock in looking for an R1 after sending a command.
pub const R1_POLL_LIMIT: usize = 10;

/// A timeout, measured on the injected clock.
///
/// Every call to [`Deadline::delay`] sleeps for a millisecond, unless the
/// budget is already spent.
struct Deadline {
    started: u32,
    budget_ms: u32,
}

impl Deadline {
    fn new<C: Clock>(clock: &mut C, budget_ms: u32) -> Deadline {
        Deadline {
            started: clock.now_ms(),
            budget_ms,
        }
    }

    fn delay<C: Clock>(&self, clock: &mut C, err: Error) -> Result<(), Error> {
        if clock.now_ms().wrapping_sub(self.started) >= self.budget_ms {
            Err(err)
        } else {
            clock.delay_ms(1);
            Ok(())
        }
    }
}

/// The transport and clock, plus the primitives every card operation is
/// built from.
///
/// Chip select is *not* managed automatically here: [`Bus::card_command`]
/// asserts it and the caller must [`Bus::release`] it when the sequence is
/// over.
pub struct Bus<T, C>
where
    T: Transport,
    C: Clock,
{
    transport: T,
    clock: C,
}

impl<T, C> Bus<T, C>
where
    T: Transport,
    C: Clock,
{
    pub fn new(transport: T, clock: C) -> Self {
        Bus { transport, clock }
    }

    pub fn free(self) -> (T, C) {
        (self.transport, self.clock)
    }

    pub fn cs_high(&mut self) -> Result<(), Error> {
        self.transport.deselect().map_err(|_| Error::GpioError)
    }

    pub fn cs_low(&mut self) -> Result<(), Error> {
        self.transport.select().map_err(|_| Error::GpioError)
    }

    /// Deassert chip select, then clock one more byte so the card lets go
    /// of the data line.
    pub fn release(&mut self) -> Result<(), Error> {
        self.cs_high()?;
        self.receive()?;
        Ok(())
    }

    pub fn set_clock(&mut self, profile: ClockProfile) -> Result<(), Error> {
        trace!("Clock profile {:?}", profile);
        self.transport
            .set_clock(profile)
            .map_err(|_e| Error::Transport)
    }

    /// Send one byte and receive one byte.
    fn transfer(&mut self, out: u8) -> Result<u8, Error> {
        self.transport.transfer(out).map_err(|_e| Error::Transport)
    }

    /// Receive a byte from the SD card by clocking in an 0xFF byte.
    pub fn receive(&mut self) -> Result<u8, Error> {
        self.transfer(FILLER)
    }

    /// Send a byte to the SD card.
    pub fn send(&mut self, out: u8) -> Result<(), Error> {
        let _ = self.transfer(out)?;
        Ok(())
    }

    /// Spin until the card returns 0xFF, or we spin too long and timeout.
    pub fn wait_ready(&mut self) -> Result<(), Error> {
        let deadline = Deadline::new(&mut self.clock, READY_TIMEOUT_MS);
        loop {
            if self.receive()? == IDLE_MARKER {
                return Ok(());
            }
            deadline.delay(&mut self.clock, Error::TimeoutWaitNotBusy)?;
        }
    }

    /// Perform a command.
    ///
    /// Returns the R1 with chip select still asserted, so any trailing
    /// register bytes can be read. If the card never answers, chip select is
    /// released before returning the error.
    pub fn card_command(&mut self, command: Command, arg: u32) -> Result<u8, Error> {
        // STOP_TRANSMISSION goes out while the card is still streaming data
        if command != Command::StopTransmission {
            self.wait_ready()?;
        }

        self.cs_low()?;
        for b in command.frame(arg).iter() {
            self.send(*b)?;
        }

        for _ in 0..R1_POLL_LIMIT {
            let result = self.receive()?;
            if (result & R1_START_BIT_MASK) == 0 {
                trace!("CMD{} {:x} -> R1 {:x}", command.index(), arg, result);
                return Ok(result);
            }
        }

        self.cs_high()?;
        Err(Error::TimeoutCommand(command.index()))
    }

    /// Perform an application-specific command.
    pub fn card_acmd(&mut self, command: Command, arg: u32) -> Result<u8, Error> {
        let r1 = self.card_command(Command::AppCmd, 0)?;
        if r1 > R1_IDLE_STATE {
            return Err(Error::CommandRejected {
                command: Command::AppCmd.index(),
                r1,
            });
        }
        self.card_command(command, arg)
    }

    /// Receive one data block into `buffer`.
    ///
    /// The whole buffer is clocked in as a single burst. Chip select is
    /// released afterwards.
    pub fn read_data(&mut self, buffer: &mut [u8]) -> Result<(), Error> {
        self.cs_low()?;
        let deadline = Deadline::new(&mut self.clock, TOKEN_TIMEOUT_MS);
        let token = loop {
            let s = self.receive()?;
            if s != IDLE_MARKER {
                break s;
            }
            deadline.delay(&mut self.clock, Error::TimeoutReadBuffer)?;
        };
        if token != DATA_START_BLOCK {
            return Err(Error::ReadError(token));
        }

        for b in buffer.iter_mut() {
            *b = FILLER;
        }
        self.transport
            .transfer_in_place(buffer)
            .map_err(|_e| Error::Transport)?;

        // CRC is disabled in SPI mode, so the checksum is just clocked past
        self.receive()?;
        self.receive()?;

        self.release()
    }

    /// Send one data block, framed by `token`.
    ///
    /// With `verify` unset, a data response other than "accepted" is logged
    /// and otherwise ignored.
    pub fn write_data(&mut self, token: u8, buffer: &[u8], verify: bool) -> Result<(), Error> {
        self.wait_ready()?;
        self.send(token)?;
        self.transport
            .write(buffer)
            .map_err(|_e| Error::Transport)?;
        self.send(FILLER)?;
        self.send(FILLER)?;

        let status = self.receive()?;
        if (status & DATA_RES_MASK) == DATA_RES_ACCEPTED {
            Ok(())
        } else if verify {
            Err(Error::WriteError(status))
        } else {
            warn!("Data response {:x} ignored", status);
            Ok(())
        }
    }

    /// Close a multi-block write.
    pub fn stop_multi_block_write(&mut self) -> Result<(), Error> {
        self.wait_ready()?;
        self.send(STOP_TRAN_TOKEN)
    }
}
