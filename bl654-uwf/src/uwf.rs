//! UWF container stream reader.
//!
//! A UWF file is a flat sequence of records, each `(u8 command_id, u32 LE
//! length, u8[length] payload)`. The reader never buffers more than one
//! record's payload at a time.

use std::io::Read;

use crate::error::{Error, Result};

/// The record command ids this driver recognizes.
///
/// These concrete byte values are this reader's own convention (the UWF
/// producer is out of scope for this crate); they are fixed here so that
/// test fixtures and the reader agree on wire bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum CommandId {
    TargetPlatform = 0x01,
    RegisterDevice = 0x02,
    SelectDevice = 0x03,
    SectorMap = 0x04,
    EraseBlocks = 0x05,
    WriteBlocks = 0x06,
    Unregister = 0x07,
    Reboot = 0x08,
}

impl TryFrom<u8> for CommandId {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x01 => Ok(Self::TargetPlatform),
            0x02 => Ok(Self::RegisterDevice),
            0x03 => Ok(Self::SelectDevice),
            0x04 => Ok(Self::SectorMap),
            0x05 => Ok(Self::EraseBlocks),
            0x06 => Ok(Self::WriteBlocks),
            0x07 => Ok(Self::Unregister),
            0x08 => Ok(Self::Reboot),
            other => Err(Error::UnknownCommand(other)),
        }
    }
}

/// A record header: command id plus the declared payload length.
#[derive(Clone, Copy, Debug)]
pub struct RecordHeader {
    pub command: CommandId,
    pub length: u32,
}

/// Pulls `(command_id, length, payload)` records out of a byte stream.
///
/// Payloads are read on demand via [`UwfReader::read_payload`], so a large
/// write-blocks record never forces the whole firmware image into memory at
/// once; callers that only need the header to dispatch never pay for the
/// payload they haven't asked for yet.
pub struct UwfReader<R: Read> {
    inner: R,
}

impl<R: Read> UwfReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    /// Reads the next record's header, or `None` at a clean end of file.
    pub fn next_header(&mut self) -> Result<Option<RecordHeader>> {
        let mut command_byte = [0u8; 1];
        match self.inner.read(&mut command_byte)? {
            0 => return Ok(None),
            _ => {}
        }

        let command = CommandId::try_from(command_byte[0])?;

        let mut length_bytes = [0u8; 4];
        self.inner.read_exact(&mut length_bytes)?;
        let length = u32::from_le_bytes(length_bytes);

        Ok(Some(RecordHeader { command, length }))
    }

    /// Reads exactly `length` bytes of the current record's payload.
    pub fn read_payload(&mut self, length: u32) -> Result<Vec<u8>> {
        let mut payload = vec![0u8; length as usize];
        self.inner.read_exact(&mut payload)?;
        Ok(payload)
    }
}
