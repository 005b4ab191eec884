//! sdspi-diskio - Constants and register layouts from the SD Specifications
//!
//! Everything in here describes bytes on the wire. Nothing in here touches
//! the bus.

use core::convert::TryFrom;

//==============================================================================

// SD Card Commands

/// The commands this driver sends to the card.
///
/// The discriminant is the 6-bit command index; the frame start byte on the
/// wire is `0x40 | index`.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    /// CMD0 GO_IDLE_STATE - init card in spi mode if CS low
    GoIdleState = 0,
    /// CMD1 SEND_OP_COND - start initialization of an MMC card
    SendOpCond = 1,
    /// CMD8 SEND_IF_COND - verify SD Memory Card interface operating condition
    SendIfCond = 8,
    /// CMD9 SEND_CSD - read the Card Specific Data (CSD register)
    SendCsd = 9,
    /// CMD10 SEND_CID - read the Card Identification (CID register)
    SendCid = 10,
    /// CMD12 STOP_TRANSMISSION - end multiple block read sequence
    StopTransmission = 12,
    /// CMD13 SEND_STATUS - read the card status register
    SendStatus = 13,
    /// CMD17 READ_SINGLE_BLOCK - read a single data block from the card
    ReadSingleBlock = 17,
    /// CMD18 READ_MULTIPLE_BLOCK - read multiple data blocks from the card
    ReadMultipleBlock = 18,
    /// CMD24 WRITE_BLOCK - write a single data block to the card
    WriteBlock = 24,
    /// CMD25 WRITE_MULTIPLE_BLOCK - write blocks of data until a stop token
    WriteMultipleBlock = 25,
    /// ACMD41 SD_SEND_OP_COND - sends host capacity support information and
    /// activates the card's initialization process. Must follow `AppCmd`.
    SdSendOpCond = 41,
    /// CMD55 APP_CMD - escape for application specific command
    AppCmd = 55,
    /// CMD58 READ_OCR - read the OCR register of a card
    ReadOcr = 58,
}

impl Command {
    /// The 6-bit command index.
    pub const fn index(self) -> u8 {
        self as u8
    }

    /// First byte of the command frame: start bit 0, transmission bit 1.
    pub const fn frame_start(self) -> u8 {
        0x40 | self as u8
    }

    /// Last byte of the command frame.
    ///
    /// The card only checks the CRC of CMD0 and CMD8 in SPI mode, so those
    /// two carry the precomputed value for the only argument we ever send
    /// them. Everything else gets the end bit and nothing more.
    pub const fn trailer(self) -> u8 {
        match self {
            Command::GoIdleState => 0x95,
            Command::SendIfCond => 0x87,
            _ => 0x01,
        }
    }

    /// Does this command have to be preceded by `AppCmd`?
    pub const fn is_app_command(self) -> bool {
        matches!(self, Command::SdSendOpCond)
    }

    /// Build the six bytes that go on the wire.
    pub fn frame(self, arg: u32) -> [u8; 6] {
        let arg = arg.to_be_bytes();
        [
            self.frame_start(),
            arg[0],
            arg[1],
            arg[2],
            arg[3],
            self.trailer(),
        ]
    }
}

//==============================================================================

/// status for card in the ready state
pub const R1_READY_STATE: u8 = 0x00;

/// status for card in the idle state
pub const R1_IDLE_STATE: u8 = 0x01;

/// status bit for illegal command
pub const R1_ILLEGAL_COMMAND: u8 = 0x04;

/// a valid R1 always has the top bit clear
pub const R1_START_BIT_MASK: u8 = 0x80;

/// what the card drives on MISO when it has nothing to say
pub const IDLE_MARKER: u8 = 0xFF;

/// start data token for read or write single block
pub const DATA_START_BLOCK: u8 = 0xFE;

/// stop token for write multiple blocks
pub const STOP_TRAN_TOKEN: u8 = 0xFD;

/// start data token for write multiple blocks
pub const WRITE_MULTIPLE_TOKEN: u8 = 0xFC;

/// mask for data response tokens after a write block operation
pub const DATA_RES_MASK: u8 = 0x1F;

/// write data accepted token
pub const DATA_RES_ACCEPTED: u8 = 0x05;

/// write data rejected due to a CRC error
pub const DATA_RES_CRC_ERROR: u8 = 0x0B;

/// write data rejected due to a write error
pub const DATA_RES_WRITE_ERROR: u8 = 0x0D;

/// CMD8 argument: 2.7-3.6V supply, check pattern 0xAA
pub const IF_COND_ARG: u32 = 0x0000_01AA;

/// the voltage byte a compatible card echoes back for CMD8
pub const IF_COND_VOLTAGE_ACCEPTED: u8 = 0x01;

/// the check pattern a working card echoes back for CMD8
pub const IF_COND_CHECK_PATTERN: u8 = 0xAA;

/// ACMD41 argument bit: the host supports high capacity cards
pub const OCR_HCS: u32 = 1 << 30;

//==============================================================================

/// The Operation Conditions Register, as returned by CMD58
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct Ocr {
    /// The 4 bytes of the OCR, most significant first
    pub data: [u8; 4],
}

impl Ocr {
    /// Wrap the four bytes read after a CMD58 response
    pub fn new(data: [u8; 4]) -> Ocr {
        Ocr { data }
    }

    fn data(&self) -> &[u8] {
        &self.data
    }

    define_field!(power_up_complete, bool, 0, 7);
    define_field!(card_capacity_status, bool, 0, 6);
    define_field!(voltage_window, u16, [(1, 0, 8), (2, 7, 1)]);
}

/// Card Specific Data, version 1
#[derive(Default)]
pub struct CsdV1 {
    /// The 16-bytes of data in this Card Specific Data block
    pub data: [u8; 16],
}

/// Card Specific Data, version 2
#[derive(Default)]
pub struct CsdV2 {
    /// The 16-bytes of data in this Card Specific Data block
    pub data: [u8; 16],
}

/// A capacity in bytes as a count of 512-byte blocks.
fn blocks_from_bytes(bytes: u64) -> Option<u32> {
    u32::try_from(bytes / 512).ok()
}

/// Card Specific Data
pub enum Csd {
    /// A version 1 CSD
    V1(CsdV1),
    /// A version 2 CSD
    V2(CsdV2),
}

impl Csd {
    /// Pick the right layout from the CSD_STRUCTURE bits of a raw register.
    pub fn from_bytes(data: [u8; 16]) -> Csd {
        if data[0] >> 6 == 0 {
            Csd::V1(CsdV1 { data })
        } else {
            Csd::V2(CsdV2 { data })
        }
    }

    /// Returns the card capacity in bytes
    pub fn card_capacity_bytes(&self) -> u64 {
        match self {
            Csd::V1(csd) => csd.card_capacity_bytes(),
            Csd::V2(csd) => csd.card_capacity_bytes(),
        }
    }

    /// Returns the card capacity in 512-byte blocks, or `None` if that
    /// does not fit a 32-bit block number.
    pub fn card_capacity_blocks(&self) -> Option<u32> {
        blocks_from_bytes(self.card_capacity_bytes())
    }

    /// Can this card erase single blocks?
    pub fn erase_single_block_enabled(&self) -> bool {
        match self {
            Csd::V1(csd) => csd.erase_single_block_enabled(),
            Csd::V2(csd) => csd.erase_single_block_enabled(),
        }
    }
}

impl CsdV1 {
    /// Create a new, empty, CSD
    pub fn new() -> CsdV1 {
        CsdV1::default()
    }

    fn data(&self) -> &[u8] {
        &self.data
    }

    define_field!(csd_ver, u8, 0, 6, 2);
    define_field!(data_read_access_time1, u8, 1, 0, 8);
    define_field!(data_read_access_time2, u8, 2, 0, 8);
    define_field!(max_data_transfer_rate, u8, 3, 0, 8);
    define_field!(card_command_classes, u16, [(4, 0, 8), (5, 4, 4)]);
    define_field!(read_block_length, u8, 5, 0, 4);
    define_field!(read_partial_blocks, bool, 6, 7);
    define_field!(device_size, u32, [(6, 0, 2), (7, 0, 8), (8, 6, 2)]);
    define_field!(device_size_multiplier, u8, [(9, 0, 2), (10, 7, 1)]);
    define_field!(erase_single_block_enabled, bool, 10, 6);
    define_field!(erase_sector_size, u8, [(10, 0, 6), (11, 7, 1)]);
    define_field!(max_write_data_length, u8, [(12, 0, 2), (13, 6, 2)]);
    define_field!(permanent_write_protection, bool, 14, 5);
    define_field!(temporary_write_protection, bool, 14, 4);

    /// Returns the card capacity in bytes
    ///
    /// Every field is bounded by its width, so even a garbled register gives
    /// at most (4096 << 24) bytes.
    pub fn card_capacity_bytes(&self) -> u64 {
        let multiplier =
            u32::from(self.device_size_multiplier()) + u32::from(self.read_block_length()) + 2;
        (u64::from(self.device_size()) + 1) << multiplier
    }

    /// Returns the card capacity in 512-byte blocks
    pub fn card_capacity_blocks(&self) -> Option<u32> {
        blocks_from_bytes(self.card_capacity_bytes())
    }
}

impl CsdV2 {
    /// Create a new, empty, CSD
    pub fn new() -> CsdV2 {
        CsdV2::default()
    }

    fn data(&self) -> &[u8] {
        &self.data
    }

    define_field!(csd_ver, u8, 0, 6, 2);
    define_field!(data_read_access_time1, u8, 1, 0, 8);
    define_field!(max_data_transfer_rate, u8, 3, 0, 8);
    define_field!(card_command_classes, u16, [(4, 0, 8), (5, 4, 4)]);
    define_field!(read_block_length, u8, 5, 0, 4);
    define_field!(device_size, u32, [(7, 0, 6), (8, 0, 8), (9, 0, 8)]);
    define_field!(erase_single_block_enabled, bool, 10, 6);
    define_field!(erase_sector_size, u8, [(10, 0, 6), (11, 7, 1)]);
    define_field!(permanent_write_protection, bool, 14, 5);
    define_field!(temporary_write_protection, bool, 14, 4);

    /// Returns the card capacity in bytes
    pub fn card_capacity_bytes(&self) -> u64 {
        (u64::from(self.device_size()) + 1) * 512 * 1024
    }

    /// Returns the card capacity in 512-byte blocks
    pub fn card_capacity_blocks(&self) -> Option<u32> {
        blocks_from_bytes(self.card_capacity_bytes())
    }
}

/// Card Identification register
#[derive(Default)]
pub struct Cid {
    /// The 16-bytes of data in this Card Identification block
    pub data: [u8; 16],
}

impl Cid {
    fn data(&self) -> &[u8] {
        &self.data
    }

    define_field!(manufacturer_id, u8, 0, 0, 8);
    define_field!(product_revision, u8, 8, 0, 8);
    define_field!(serial_number, u32, [(9, 0, 8), (10, 0, 8), (11, 0, 8), (12, 0, 8)]);
    define_field!(manufacturing_month, u8, 14, 0, 4);

    /// Two ASCII characters identifying the OEM
    pub fn oem_id(&self) -> &[u8] {
        &self.data[1..3]
    }

    /// Five ASCII characters of product name
    pub fn product_name(&self) -> &[u8] {
        &self.data[3..8]
    }

    /// Year of manufacture
    pub fn manufacturing_year(&self) -> u16 {
        let offset = (u16::from(self.data[13] & 0x0F) << 4) | u16::from(self.data[14] >> 4);
        2000 + offset
    }
}
