//! Bootloader wire protocol: one method per command, one blocking
//! request/response round trip per call.

use log::{debug, trace};

use crate::error::{Error, Result};
use crate::transport::Transport;

const SYNC_BYTE: u8 = 0x80;

pub const RESPONSE_ACK: u8 = b'a';
pub const RESPONSE_FAIL: u8 = b'f';

const ATS_SIZE: usize = 14;
const VERSION_SIZE: usize = 6;
const SETTING_SET_RESPONSE_SIZE: usize = 4;

/// A bootloader option recognized by `setting_set`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u16)]
pub enum Option_ {
    /// Current erase length in bytes; value `0x2` selects 64 KiB blocks.
    CurrentEraseLenBytes = 0x0000,
    /// Current write length in bytes; value `0x2` selects a 16-bit length field.
    CurrentWriteLenBytes = 0x0002,
    /// Current baud-rate code; value `0xA` selects 1 000 000 baud.
    CurrentBaudrate = 0x0005,
}

/// Thin request/response wrapper over a [`Transport`]. Holds no session
/// state of its own; every method is one bootloader transaction.
pub struct BootloaderClient<'t> {
    transport: &'t mut dyn Transport,
}

impl<'t> BootloaderClient<'t> {
    pub fn new(transport: &'t mut dyn Transport) -> Self {
        Self { transport }
    }

    /// Sends the sync byte and reads the 14-byte ATS identification.
    pub fn sync(&mut self) -> Result<[u8; ATS_SIZE]> {
        trace!("sync");
        self.transport.write(&[SYNC_BYTE])?;
        let mut ats = [0u8; ATS_SIZE];
        self.transport.read_exact(&mut ats)?;
        Ok(ats)
    }

    /// Sends a single acknowledge byte and returns the byte read back.
    pub fn acknowledge(&mut self) -> Result<u8> {
        trace!("acknowledge");
        self.transport.write(&[RESPONSE_ACK])?;
        self.read_byte()
    }

    /// Sends `'p' ‖ platform_id` and returns the raw response byte.
    pub fn platform_check(&mut self, platform_id: &[u8]) -> Result<u8> {
        trace!("platform_check: {platform_id:02X?}");
        let mut bytes = Vec::with_capacity(1 + platform_id.len());
        bytes.push(b'p');
        bytes.extend_from_slice(platform_id);
        self.transport.write(&bytes)?;
        self.read_byte()
    }

    /// Sends `'V'` and returns the 6-byte ASCII version reply.
    pub fn version(&mut self) -> Result<[u8; VERSION_SIZE]> {
        trace!("version");
        self.transport.write(&[b'V'])?;
        let mut reply = [0u8; VERSION_SIZE];
        self.transport.read_exact(&mut reply)?;
        Ok(reply)
    }

    /// Sends `'s' ‖ opt_lo ‖ opt_hi ‖ val ‖ 0 ‖ 0 ‖ 0`.
    pub fn setting_set(&mut self, option: u16, value: u8) -> Result<[u8; SETTING_SET_RESPONSE_SIZE]> {
        trace!("setting_set: 0x{option:04X} = 0x{value:02X}");
        let bytes = [
            b's',
            (option & 0xff) as u8,
            ((option & 0xff00) >> 8) as u8,
            value,
            0,
            0,
            0,
        ];
        self.transport.write(&bytes)?;
        let mut reply = [0u8; SETTING_SET_RESPONSE_SIZE];
        self.transport.read_exact(&mut reply)?;
        Ok(reply)
    }

    /// Sends `'e' ‖ addr(4)` (legacy) or `'e' ‖ addr(4) ‖ block_code(4)`
    /// (enhanced-64K) and returns the raw ack/nack byte.
    pub fn erase_sector(&mut self, addr: u32, block_code: Option<u32>) -> Result<u8> {
        trace!("erase_sector: 0x{addr:08X} block_code={block_code:?}");
        let mut bytes = Vec::with_capacity(9);
        bytes.push(b'e');
        bytes.extend_from_slice(&addr.to_le_bytes());
        if let Some(code) = block_code {
            bytes.extend_from_slice(&code.to_le_bytes());
        }
        self.transport.write(&bytes)?;
        self.read_byte()
    }

    /// Sends `'w' ‖ addr(4) ‖ len(1)` (legacy) or `'w' ‖ addr(4) ‖ len_lo ‖
    /// len_hi` (enhanced) and returns the raw ack/nack byte.
    pub fn write_command(&mut self, addr: u32, len: u16, enhanced: bool) -> Result<u8> {
        trace!("write_command: 0x{addr:08X} len={len} enhanced={enhanced}");
        let mut bytes = Vec::with_capacity(9);
        bytes.push(b'w');
        bytes.extend_from_slice(&addr.to_le_bytes());
        if enhanced {
            bytes.extend_from_slice(&len.to_le_bytes());
        } else {
            bytes.push(len as u8);
        }
        self.transport.write(&bytes)?;
        self.read_byte()
    }

    /// Sends `'d' ‖ data(len) ‖ checksum_lsb(1)` where the checksum is the
    /// byte-sum of `data` truncated to its low 8 bits.
    pub fn data_section(&mut self, data: &[u8]) -> Result<u8> {
        trace!("data_section: {} bytes", data.len());
        let checksum = data.iter().fold(0u32, |acc, b| acc + *b as u32) as u8;
        let mut bytes = Vec::with_capacity(1 + data.len() + 1);
        bytes.push(b'd');
        bytes.extend_from_slice(data);
        bytes.push(checksum);
        self.transport.write(&bytes)?;
        self.read_byte()
    }

    /// Sends `'v' ‖ start_addr(4) ‖ cumulative_size(4) ‖ cumulative_checksum(4)`.
    pub fn verify(&mut self, start_addr: u32, cumulative_size: u32, cumulative_checksum: u32) -> Result<u8> {
        trace!(
            "verify: start=0x{start_addr:08X} size={cumulative_size} checksum={cumulative_checksum}"
        );
        let mut bytes = Vec::with_capacity(13);
        bytes.push(b'v');
        bytes.extend_from_slice(&start_addr.to_le_bytes());
        bytes.extend_from_slice(&cumulative_size.to_le_bytes());
        bytes.extend_from_slice(&cumulative_checksum.to_le_bytes());
        self.transport.write(&bytes)?;
        self.read_byte()
    }

    fn read_byte(&mut self) -> Result<u8> {
        let mut byte = [0u8];
        self.transport.read_exact(&mut byte)?;
        debug!("read byte: 0x{:02X}", byte[0]);
        Ok(byte[0])
    }
}

/// Parses the major version number out of a `"vX.Y…"` reply, returning
/// [`Error::Sync`] if the reply is not well-formed ASCII of that shape.
pub fn parse_major_version(reply: &[u8]) -> Result<u32> {
    let text = std::str::from_utf8(reply)
        .map_err(|_| Error::Sync("non-UTF8 version reply".to_string()))?;
    let text = text.strip_prefix('v').unwrap_or(text);
    let major = text
        .split('.')
        .next()
        .ok_or_else(|| Error::Sync("malformed version reply".to_string()))?;
    major
        .trim()
        .parse::<u32>()
        .map_err(|_| Error::Sync(format!("malformed version reply: {major:?}")))
}
