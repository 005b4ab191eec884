//! sdspi-diskio - Transport capabilities
//!
//! The driver never touches peripheral registers. Everything it needs from
//! the hardware goes through the [`Transport`] and [`Clock`] traits defined
//! here. [`SpiTransport`] builds a [`Transport`] out of the usual
//! `embedded-hal` blocking SPI and GPIO traits.

use embedded_hal::blocking::delay::DelayMs;
use embedded_hal::blocking::spi::{Transfer, Write};
use embedded_hal::digital::v2::OutputPin;

/// The byte the host clocks out when it only wants to listen.
pub const FILLER: u8 = 0xFF;

/// SPI clock rate profiles.
///
/// The card must be identified at 100-400 kHz. Once it has left the idle
/// state it can run at the full rate of the bus.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ClockProfile {
    /// Identification rate
    Slow,
    /// Data transfer rate
    Fast,
}

/// Everything the driver needs from the bus.
///
/// Implementations block until each exchange has completed (or the
/// peripheral has given up).
pub trait Transport {
    /// The errors the transport can return.
    type Error: core::fmt::Debug;

    /// Assert the card's chip select line.
    fn select(&mut self) -> Result<(), Self::Error>;

    /// Release the card's chip select line.
    fn deselect(&mut self) -> Result<(), Self::Error>;

    /// Send one byte and receive one byte.
    fn transfer(&mut self, out: u8) -> Result<u8, Self::Error>;

    /// Clock out the contents of `words`, replacing each byte with the one
    /// received in its place.
    fn transfer_in_place(&mut self, words: &mut [u8]) -> Result<(), Self::Error> {
        for word in words.iter_mut() {
            *word = self.transfer(*word)?;
        }
        Ok(())
    }

    /// Clock out `words`, discarding whatever comes back.
    fn write(&mut self, words: &[u8]) -> Result<(), Self::Error> {
        for &word in words {
            self.transfer(word)?;
        }
        Ok(())
    }

    /// Switch the bus to the given clock rate.
    fn set_clock(&mut self, profile: ClockProfile) -> Result<(), Self::Error>;
}

impl<T> Transport for &mut T
where
    T: Transport,
{
    type Error = T::Error;

    fn select(&mut self) -> Result<(), Self::Error> {
        (*self).select()
    }

    fn deselect(&mut self) -> Result<(), Self::Error> {
        (*self).deselect()
    }

    fn transfer(&mut self, out: u8) -> Result<u8, Self::Error> {
        (*self).transfer(out)
    }

    fn transfer_in_place(&mut self, words: &mut [u8]) -> Result<(), Self::Error> {
        (*self).transfer_in_place(words)
    }

    fn write(&mut self, words: &[u8]) -> Result<(), Self::Error> {
        (*self).write(words)
    }

    fn set_clock(&mut self, profile: ClockProfile) -> Result<(), Self::Error> {
        (*self).set_clock(profile)
    }
}

/// A monotonic millisecond clock that can also sleep.
///
/// All of the driver's timeouts are measured against this, so tests can
/// supply a clock where sleeping simply advances time.
pub trait Clock: DelayMs<u32> {
    /// Milliseconds since some fixed point. Allowed to wrap.
    fn now_ms(&mut self) -> u32;
}

/// Changes the SPI clock rate.
///
/// How that is done is entirely up to the HAL, so the driver only ever
/// asks for a [`ClockProfile`].
pub trait ClockControl<SPI> {
    /// Reconfigure `spi` for the given profile.
    fn set_clock(&mut self, spi: &mut SPI, profile: ClockProfile);
}

/// For buses that are already running at a rate safe for identification.
#[derive(Debug, Default, Copy, Clone)]
pub struct FixedRate;

impl<SPI> ClockControl<SPI> for FixedRate {
    fn set_clock(&mut self, _spi: &mut SPI, _profile: ClockProfile) {}
}

impl<SPI, F> ClockControl<SPI> for F
where
    F: FnMut(&mut SPI, ClockProfile),
{
    fn set_clock(&mut self, spi: &mut SPI, profile: ClockProfile) {
        self(spi, profile)
    }
}

/// The possible errors `SpiTransport` can generate.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SpiTransportError {
    /// We got an error from the SPI peripheral
    Spi,
    /// Couldn't set the chip select pin
    ChipSelect,
}

/// A [`Transport`] over an `embedded-hal` SPI bus and chip select pin.
///
/// We need Chip Select to be separate so we can clock out some bytes
/// without Chip Select asserted (which puts the card into SPI mode).
pub struct SpiTransport<SPI, CS, CC>
where
    SPI: Transfer<u8> + Write<u8>,
    CS: OutputPin,
    CC: ClockControl<SPI>,
{
    spi: SPI,
    cs: CS,
    clock_control: CC,
}

impl<SPI, CS, CC> SpiTransport<SPI, CS, CC>
where
    SPI: Transfer<u8> + Write<u8>,
    CS: OutputPin,
    CC: ClockControl<SPI>,
{
    /// Wrap an SPI peripheral, its chip select pin, and something that knows
    /// how to re-clock the peripheral.
    pub fn new(spi: SPI, cs: CS, clock_control: CC) -> Self {
        SpiTransport {
            spi,
            cs,
            clock_control,
        }
    }

    /// Get a temporary borrow on the underlying SPI device, e.g. to talk to
    /// another device on the same bus.
    pub fn spi<T, F>(&mut self, func: F) -> T
    where
        F: FnOnce(&mut SPI) -> T,
    {
        func(&mut self.spi)
    }

    /// Give back the parts.
    pub fn free(self) -> (SPI, CS, CC) {
        (self.spi, self.cs, self.clock_control)
    }
}

impl<SPI, CS, CC> Transport for SpiTransport<SPI, CS, CC>
where
    SPI: Transfer<u8> + Write<u8>,
    CS: OutputPin,
    CC: ClockControl<SPI>,
{
    type Error = SpiTransportError;

    fn select(&mut self) -> Result<(), Self::Error> {
        self.cs.set_low().map_err(|_| SpiTransportError::ChipSelect)
    }

    fn deselect(&mut self) -> Result<(), Self::Error> {
        self.cs.set_high().map_err(|_| SpiTransportError::ChipSelect)
    }

    fn transfer(&mut self, out: u8) -> Result<u8, Self::Error> {
        self.spi
            .transfer(&mut [out])
            .map(|b| b[0])
            .map_err(|_e| SpiTransportError::Spi)
    }

    fn transfer_in_place(&mut self, words: &mut [u8]) -> Result<(), Self::Error> {
        self.spi
            .transfer(words)
            .map(|_| ())
            .map_err(|_e| SpiTransportError::Spi)
    }

    fn write(&mut self, words: &[u8]) -> Result<(), Self::Error> {
        Write::write(&mut self.spi, words).map_err(|_e| SpiTransportError::Spi)
    }

    fn set_clock(&mut self, profile: ClockProfile) -> Result<(), Self::Error> {
        self.clock_control.set_clock(&mut self.spi, profile);
        Ok(())
    }
}
