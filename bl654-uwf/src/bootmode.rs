//! Platform-specific side channel for switching the BL654 in and out of
//! bootloader mode.

use std::fs;
use std::path::PathBuf;
use std::process::Command;

use log::{debug, info, warn};

use crate::error::{Error, Result};
use crate::transport::Transport;

const GPIO_BASE_PATH: &str = "/sys/devices/platform/gpio/";
const GPIO_CARD_NRESET: &str = "card_nreset";
const GPIO_BT_BOOT_MODE: &str = "bt_boot_mode";

const BT_BOOTLOADER_MODE: i32 = 0;
const BT_FIRMWARE_MODE: i32 = 1;

/// A capability for moving the module between bootloader mode and its
/// normal firmware mode.
///
/// Entering must succeed before any protocol traffic is exchanged; on
/// failure the session aborts with [`Error::BootloaderEntry`].
#[cfg_attr(test, mockall::automock)]
pub trait BootModeChannel {
    /// Switches the module into bootloader mode and clears any banner the
    /// bootloader prints on the serial line once it comes up.
    fn enter_bootloader(&mut self, transport: &mut dyn Transport) -> Result<()>;

    /// Switches the module back to its normal firmware mode.
    fn leave_bootloader(&mut self, transport: &mut dyn Transport) -> Result<()>;
}

/// Reads and discards a single line from `transport`, tolerating any error
/// (clearing a banner is a courtesy, not a precondition).
fn clear_banner(transport: &mut dyn Transport) {
    let mut byte = [0u8];
    for _ in 0..256 {
        match transport.read_exact(&mut byte) {
            Ok(()) if byte[0] == b'\n' => break,
            Ok(()) => continue,
            Err(_) => break,
        }
    }
}

/// Direct GPIO sysfs toggling, used by the generic device profile.
pub struct GpioBootModeChannel {
    base_path: PathBuf,
}

impl GpioBootModeChannel {
    pub fn new() -> Self {
        Self {
            base_path: PathBuf::from(GPIO_BASE_PATH),
        }
    }

    /// Points the channel at an alternate sysfs root, for use in tests that
    /// want to exercise the real file-writing path against a tmpdir.
    pub fn with_base_path(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    fn set_gpio_value(&self, gpio_name: &str, value: i32) -> Result<()> {
        let path = self.base_path.join(gpio_name).join("value");
        debug!("writing {value} to {}", path.display());
        fs::write(&path, value.to_string())?;
        Ok(())
    }

    fn pulse_reset(&self) -> Result<()> {
        self.set_gpio_value(GPIO_CARD_NRESET, 0)?;
        self.set_gpio_value(GPIO_CARD_NRESET, 1)
    }
}

impl Default for GpioBootModeChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl BootModeChannel for GpioBootModeChannel {
    fn enter_bootloader(&mut self, transport: &mut dyn Transport) -> Result<()> {
        info!("entering bootloader mode via GPIO");
        self.set_gpio_value(GPIO_BT_BOOT_MODE, BT_BOOTLOADER_MODE)
            .map_err(|e| Error::BootloaderEntry(e.to_string()))?;
        self.pulse_reset()
            .map_err(|e| Error::BootloaderEntry(e.to_string()))?;
        clear_banner(transport);
        Ok(())
    }

    fn leave_bootloader(&mut self, transport: &mut dyn Transport) -> Result<()> {
        info!("leaving bootloader mode via GPIO");
        self.set_gpio_value(GPIO_BT_BOOT_MODE, BT_FIRMWARE_MODE)
            .map_err(|e| Error::BootloaderEntry(e.to_string()))?;
        self.pulse_reset()
            .map_err(|e| Error::BootloaderEntry(e.to_string()))?;
        let _ = transport;
        Ok(())
    }
}

/// The one-method RPC capability the system-service boot-mode channel needs:
/// set the module's boot mode and report the service's return code.
///
/// Abstracted behind a trait so the default `busctl`-shelling implementation
/// can be swapped for a real D-Bus binding, or for a scripted double in
/// tests, without touching [`DeviceServiceBootModeChannel`] itself.
#[cfg_attr(test, mockall::automock)]
pub trait BootModeRpc {
    /// Calls `SetBtBootMode(mode)` and returns the service's result code.
    /// `Ok(0)` is success; any other code or an `Err` is a failed call.
    fn set_bt_boot_mode(&mut self, mode: i32) -> Result<i32>;
}

const DEVICE_SERVICE_BUS_NAME: &str = "com.lairdtech.device.DeviceService";
const DEVICE_SERVICE_OBJECT_PATH: &str = "/com/lairdtech/device/DeviceService";
const DEVICE_SERVICE_INTERFACE: &str = "com.lairdtech.device.public.DeviceInterface";

/// A [`BootModeRpc`] that shells out to `busctl call` against the gateway's
/// device-management service, rather than linking a full D-Bus client.
pub struct BusctlBootModeRpc;

impl BootModeRpc for BusctlBootModeRpc {
    fn set_bt_boot_mode(&mut self, mode: i32) -> Result<i32> {
        let output = Command::new("busctl")
            .args([
                "call",
                DEVICE_SERVICE_BUS_NAME,
                DEVICE_SERVICE_OBJECT_PATH,
                DEVICE_SERVICE_INTERFACE,
                "SetBtBootMode",
                "i",
                &mode.to_string(),
            ])
            .output()
            .map_err(|_| Error::Unsupported)?;

        if !output.status.success() {
            warn!("busctl SetBtBootMode({mode}) exited with {}", output.status);
            return Ok(-1);
        }

        // busctl prints "i <value>" for an integer reply.
        let stdout = String::from_utf8_lossy(&output.stdout);
        let code = stdout
            .split_whitespace()
            .last()
            .and_then(|s| s.parse::<i32>().ok())
            .unwrap_or(-1);
        Ok(code)
    }
}

/// System-service RPC toggling, used by the BL654 gateway device profile.
pub struct DeviceServiceBootModeChannel<R: BootModeRpc = BusctlBootModeRpc> {
    rpc: R,
}

impl DeviceServiceBootModeChannel<BusctlBootModeRpc> {
    pub fn new() -> Self {
        Self {
            rpc: BusctlBootModeRpc,
        }
    }
}

impl Default for DeviceServiceBootModeChannel<BusctlBootModeRpc> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: BootModeRpc> DeviceServiceBootModeChannel<R> {
    pub fn with_rpc(rpc: R) -> Self {
        Self { rpc }
    }
}

impl<R: BootModeRpc> BootModeChannel for DeviceServiceBootModeChannel<R> {
    fn enter_bootloader(&mut self, transport: &mut dyn Transport) -> Result<()> {
        info!("entering bootloader mode via device service");
        match self.rpc.set_bt_boot_mode(BT_BOOTLOADER_MODE) {
            Ok(0) => {}
            Ok(code) => {
                return Err(Error::BootloaderEntry(format!(
                    "SetBtBootMode returned {code}"
                )))
            }
            Err(e) => return Err(Error::BootloaderEntry(e.to_string())),
        }
        clear_banner(transport);
        Ok(())
    }

    fn leave_bootloader(&mut self, transport: &mut dyn Transport) -> Result<()> {
        info!("leaving bootloader mode via device service");
        let _ = transport;
        // Best-effort: handing control back to the application is not a
        // failure the caller can do anything about at this point.
        if let Err(e) = self.rpc.set_bt_boot_mode(BT_FIRMWARE_MODE) {
            warn!("failed to leave bootloader mode: {e}");
        }
        Ok(())
    }
}
