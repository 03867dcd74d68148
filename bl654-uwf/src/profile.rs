//! Device profile: the capability bundle that varies between a generic UWF
//! target and the gateway-hosted BL654.

use crate::bootmode::{BootModeChannel, DeviceServiceBootModeChannel, GpioBootModeChannel};
use crate::error::{Error, Result};
use crate::session::Registration;

/// The 64 KiB erase-block stride used by enhanced-mode bootloaders.
pub const ERASE_BLOCK_64K: u32 = 0x1_0000;

/// How a device profile wants a given erase size carried out.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ErasePlan {
    /// Address stride between successive erase-sector commands.
    pub stride: u32,
    /// If set, the erase-length-in-bytes option must be set to this value
    /// before issuing erase-sector commands (the 64 KiB fast path).
    pub block_code: Option<u32>,
}

/// The capability bundle a session holds for profile-specific behavior:
/// registration validation, erase strategy, and the boot-mode channel.
///
/// No inheritance hierarchy is needed — profiles differ only in these three
/// small interfaces.
pub trait DeviceProfile {
    /// Validates a decoded registration tuple. The generic profile accepts
    /// anything; the BL654 profile enforces the fixed expected tuple.
    fn validate_registration(&self, registration: &Registration) -> Result<()>;

    /// Chooses the erase stride for an erase-blocks record of `size` bytes,
    /// given the sector size from the UWF sector map and whether the
    /// session is currently in enhanced mode.
    fn erase_plan(&self, size: u32, sector_size: u32, enhanced_mode: bool) -> ErasePlan;

    /// The capability used to switch the module into and out of bootloader
    /// mode.
    fn boot_mode_channel(&mut self) -> &mut dyn BootModeChannel;
}

/// The generic profile: any registration tuple is accepted, erase always
/// uses the UWF sector map's stride (no 64 KiB fast path), and mode
/// switching goes through GPIO.
pub struct GenericProfile {
    boot_mode: GpioBootModeChannel,
}

impl GenericProfile {
    pub fn new() -> Self {
        Self {
            boot_mode: GpioBootModeChannel::new(),
        }
    }
}

impl Default for GenericProfile {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceProfile for GenericProfile {
    fn validate_registration(&self, _registration: &Registration) -> Result<()> {
        // The original generic processor performs no validation here at
        // all; preserve that rather than inventing a check the spec never
        // asked for.
        Ok(())
    }

    fn erase_plan(&self, _size: u32, sector_size: u32, _enhanced_mode: bool) -> ErasePlan {
        ErasePlan {
            stride: sector_size,
            block_code: None,
        }
    }

    fn boot_mode_channel(&mut self) -> &mut dyn BootModeChannel {
        &mut self.boot_mode
    }
}


/// Expected registration tuple for a gateway-hosted BL654.
const EXPECTED_HANDLE: u8 = 0;
const EXPECTED_NUM_BANKS: u8 = 1;
const EXPECTED_BANK_ALGO: u8 = 1;

/// The BL654 gateway profile: enforces the registration invariant, enables
/// the 64 KiB erase fast path in enhanced mode, and switches boot mode
/// through the gateway's device-management service rather than GPIO.
pub struct Bl654Profile<R: crate::bootmode::BootModeRpc = crate::bootmode::BusctlBootModeRpc> {
    boot_mode: DeviceServiceBootModeChannel<R>,
}

impl Bl654Profile<crate::bootmode::BusctlBootModeRpc> {
    pub fn new() -> Self {
        Self {
            boot_mode: DeviceServiceBootModeChannel::new(),
        }
    }
}

impl Default for Bl654Profile<crate::bootmode::BusctlBootModeRpc> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: crate::bootmode::BootModeRpc> Bl654Profile<R> {
    pub fn with_boot_mode_channel(boot_mode: DeviceServiceBootModeChannel<R>) -> Self {
        Self { boot_mode }
    }
}

impl<R: crate::bootmode::BootModeRpc> DeviceProfile for Bl654Profile<R> {
    fn validate_registration(&self, registration: &Registration) -> Result<()> {
        if registration.handle == EXPECTED_HANDLE
            && registration.num_banks == EXPECTED_NUM_BANKS
            && registration.bank_size > 0
            && registration.bank_algo == EXPECTED_BANK_ALGO
        {
            Ok(())
        } else {
            Err(Error::RegisterDevice("unexpected registration data".to_string()))
        }
    }

    fn erase_plan(&self, size: u32, sector_size: u32, enhanced_mode: bool) -> ErasePlan {
        if enhanced_mode && size % ERASE_BLOCK_64K == 0 {
            ErasePlan {
                stride: ERASE_BLOCK_64K,
                block_code: Some(0x2),
            }
        } else {
            ErasePlan {
                stride: sector_size,
                block_code: None,
            }
        }
    }

    fn boot_mode_channel(&mut self) -> &mut dyn BootModeChannel {
        &mut self.boot_mode
    }
}

#[cfg(test)]
mod bl654_profile_tests {
    use super::*;
    use crate::bootmode::MockBootModeRpc;

    fn profile() -> Bl654Profile<MockBootModeRpc> {
        Bl654Profile::with_boot_mode_channel(DeviceServiceBootModeChannel::with_rpc(
            MockBootModeRpc::new(),
        ))
    }

    fn valid_registration() -> Registration {
        Registration {
            handle: EXPECTED_HANDLE,
            base_address: 0x1000,
            num_banks: EXPECTED_NUM_BANKS,
            bank_size: 0x4000,
            bank_algo: EXPECTED_BANK_ALGO,
        }
    }

    #[test]
    fn accepts_the_expected_registration_tuple() {
        assert!(profile().validate_registration(&valid_registration()).is_ok());
    }

    #[test]
    fn rejects_unexpected_handle() {
        let mut registration = valid_registration();
        registration.handle = 5;
        let err = profile().validate_registration(&registration).unwrap_err();
        assert!(matches!(err, Error::RegisterDevice(_)));
    }

    #[test]
    fn rejects_zero_bank_size() {
        let mut registration = valid_registration();
        registration.bank_size = 0;
        assert!(profile().validate_registration(&registration).is_err());
    }

    #[test]
    fn enhanced_mode_with_64k_aligned_size_uses_fast_path() {
        let plan = profile().erase_plan(0x2_0000, 0x1000, true);
        assert_eq!(plan.stride, ERASE_BLOCK_64K);
        assert_eq!(plan.block_code, Some(0x2));
    }

    #[test]
    fn enhanced_mode_with_unaligned_size_falls_back_to_sector_stride() {
        let plan = profile().erase_plan(0x1_8000, 0x1000, true);
        assert_eq!(plan.stride, 0x1000);
        assert_eq!(plan.block_code, None);
    }

    #[test]
    fn legacy_mode_never_uses_the_fast_path() {
        let plan = profile().erase_plan(0x2_0000, 0x1000, false);
        assert_eq!(plan.stride, 0x1000);
        assert_eq!(plan.block_code, None);
    }
}
