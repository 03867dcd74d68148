//! Framed byte I/O to the bootloader, with a fixed read timeout.

use std::time::Duration;

use log::{debug, info};

use crate::error::{Error, Result};

/// Default read timeout applied to every serial transport, per the UWF
/// bootloader protocol's 3-second command timeout.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(3);

/// A blocking byte-level link to the bootloader.
///
/// Implementations are not required to be cancel-safe mid-command; the
/// session never issues a second command before the first one's response
/// (or timeout) has been observed.
#[cfg_attr(test, mockall::automock)]
pub trait Transport {
    /// Writes `bytes` to the link.
    fn write(&mut self, bytes: &[u8]) -> Result<()>;

    /// Reads exactly `buf.len()` bytes, blocking up to the transport's read
    /// timeout. Returns fewer bytes than requested only via an `Io` error
    /// (the underlying port timed out short); callers that require a
    /// specific response size treat a short read as failure.
    fn read_exact(&mut self, buf: &mut [u8]) -> Result<()>;

    /// Closes the underlying link. Safe to call more than once.
    fn close(&mut self) -> Result<()>;

    /// Closes the current link and reopens it at `baud`. The old handle is
    /// always released before the new one is acquired; at most one
    /// transport handle is ever live.
    fn reopen(&mut self, baud: u32) -> Result<()>;
}

/// A `Transport` backed by a real `serialport::SerialPort`.
pub struct SerialTransport {
    port_name: String,
    timeout: Duration,
    serial: Option<Box<dyn serialport::SerialPort>>,
}

impl SerialTransport {
    /// Opens `port_name` at `baud` with the default read timeout.
    pub fn open(port_name: &str, baud: u32) -> Result<Self> {
        Self::open_with_timeout(port_name, baud, DEFAULT_READ_TIMEOUT)
    }

    /// Opens `port_name` at `baud` with an explicit read timeout.
    pub fn open_with_timeout(port_name: &str, baud: u32, timeout: Duration) -> Result<Self> {
        let mut transport = Self {
            port_name: port_name.to_string(),
            timeout,
            serial: None,
        };
        transport.open_serial(baud)?;
        Ok(transport)
    }

    fn open_serial(&mut self, baud: u32) -> Result<()> {
        info!("opening serial port: {} {baud} 8N1", self.port_name);
        let serial = serialport::new(&self.port_name, baud)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .data_bits(serialport::DataBits::Eight)
            .timeout(self.timeout)
            .open()
            .map_err(|e| Error::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?;
        self.serial = Some(serial);
        Ok(())
    }
}

impl Transport for SerialTransport {
    fn write(&mut self, bytes: &[u8]) -> Result<()> {
        debug!("sending {} bytes: {:02X?}", bytes.len(), bytes);
        let serial = self
            .serial
            .as_mut()
            .ok_or_else(|| Error::Io(std::io::Error::new(std::io::ErrorKind::NotConnected, "transport closed")))?;
        serial.write_all(bytes)?;
        Ok(())
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        debug!("reading exactly {} bytes", buf.len());
        let serial = self
            .serial
            .as_mut()
            .ok_or_else(|| Error::Io(std::io::Error::new(std::io::ErrorKind::NotConnected, "transport closed")))?;
        serial.read_exact(buf)?;
        debug!("read {} bytes: {:02X?}", buf.len(), buf);
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        info!("closing serial port: {}", self.port_name);
        self.serial = None;
        Ok(())
    }

    fn reopen(&mut self, baud: u32) -> Result<()> {
        info!("reopening serial port {} at {baud} baud", self.port_name);
        self.close()?;
        self.open_serial(baud)
    }
}
