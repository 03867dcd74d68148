//! Upgrade session state machine: owns the session invariants and dispatches
//! each UWF record to its handler, advancing session state only on
//! ack-bearing success.

use std::io::Read;

use log::{info, warn};

use crate::error::{Error, Result};
use crate::profile::DeviceProfile;
use crate::protocol::{parse_major_version, BootloaderClient, Option_, RESPONSE_ACK};
use crate::transport::Transport;
use crate::uwf::{CommandId, UwfReader};

/// Bootloader major version at or above which the enhanced protocol
/// (16-bit write lengths, higher baud, 64 KiB erase blocks) is in effect.
const FUP_EXTENDED_VERSION_NUMBER: u32 = 6;

/// Baud-rate code for 1 000 000 baud, as set via [`Option_::CurrentBaudrate`].
const BAUD_CODE_1_000_000: u8 = 0xA;
const ENHANCED_BAUD_RATE: u32 = 1_000_000;
const ENHANCED_WRITE_BLOCK_SIZE: u32 = 8192;
const DEFAULT_WRITE_BLOCK_SIZE: u32 = 252;
const DEFAULT_VERIFY_WRITE_LIMIT: u32 = 8;

fn read_u32_le(buf: &[u8], offset: usize, field: &str) -> Result<u32> {
    let slice = buf
        .get(offset..offset + 4)
        .ok_or_else(|| Error::Io(std::io::Error::new(std::io::ErrorKind::UnexpectedEof, format!("truncated {field}"))))?;
    Ok(u32::from_le_bytes(slice.try_into().unwrap()))
}

fn read_u8(buf: &[u8], offset: usize, field: &str) -> Result<u8> {
    buf.get(offset)
        .copied()
        .ok_or_else(|| Error::Io(std::io::Error::new(std::io::ErrorKind::UnexpectedEof, format!("truncated {field}"))))
}

/// A decoded register-device payload.
#[derive(Clone, Copy, Debug)]
pub struct Registration {
    pub handle: u8,
    pub base_address: u32,
    pub num_banks: u8,
    pub bank_size: u32,
    pub bank_algo: u8,
}

impl Registration {
    fn decode(buf: &[u8]) -> Result<Self> {
        Ok(Self {
            handle: read_u8(buf, 0, "handle")?,
            base_address: read_u32_le(buf, 1, "base_address")?,
            num_banks: read_u8(buf, 5, "num_banks")?,
            bank_size: read_u32_le(buf, 6, "bank_size")?,
            bank_algo: read_u8(buf, 10, "bank_algo")?,
        })
    }
}

/// A decoded select-device payload; recorded for informational purposes
/// only, never validated.
#[derive(Clone, Copy, Debug)]
pub struct SelectDevice {
    pub handle: u8,
    pub bank: u8,
}

impl SelectDevice {
    fn decode(buf: &[u8]) -> Result<Self> {
        Ok(Self {
            handle: read_u8(buf, 0, "handle")?,
            bank: read_u8(buf, 1, "bank")?,
        })
    }
}

/// A decoded sector-map payload.
#[derive(Clone, Copy, Debug, Default)]
pub struct SectorMap {
    pub sectors: u32,
    pub sector_size: u32,
}

impl SectorMap {
    fn decode(buf: &[u8]) -> Result<Self> {
        Ok(Self {
            sectors: read_u32_le(buf, 0, "sectors")?,
            sector_size: read_u32_le(buf, 4, "sector_size")?,
        })
    }
}

/// The session's mutable state: flags, registration/sector-map fields, and
/// the write tuning parameters enhanced mode overrides.
#[derive(Debug, Default)]
pub struct SessionState {
    pub synchronized: bool,
    pub registered: bool,
    pub erased: bool,
    pub write_complete: bool,
    pub enhanced_mode: bool,

    pub registration: Option<Registration>,
    pub select_device: Option<SelectDevice>,
    pub sector_map: SectorMap,

    pub write_block_size: u32,
    pub verify_write_limit: u32,
}

impl SessionState {
    fn new() -> Self {
        Self {
            write_block_size: DEFAULT_WRITE_BLOCK_SIZE,
            verify_write_limit: DEFAULT_VERIFY_WRITE_LIMIT,
            ..Default::default()
        }
    }

    fn base_address(&self) -> u32 {
        self.registration.map(|r| r.base_address).unwrap_or(0)
    }

    fn bank_size(&self) -> u32 {
        self.registration.map(|r| r.bank_size).unwrap_or(0)
    }
}

fn precondition(flag: bool, handler: &'static str, reason: &str) -> Result<()> {
    if flag {
        Ok(())
    } else {
        Err(Error::Precondition {
            handler,
            reason: reason.to_string(),
        })
    }
}

/// Drives a single UWF upgrade from open to close.
///
/// Owns the transport, the device profile (and through it the boot-mode
/// channel), and the UWF record reader. Records are processed strictly in
/// file order; within a record, bootloader commands are emitted in the
/// fixed order the protocol requires and each completes before the next
/// begins — there is no concurrency here.
pub struct UpgradeSession<T: Transport, R: Read> {
    transport: T,
    profile: Box<dyn DeviceProfile>,
    reader: UwfReader<R>,
    state: SessionState,
}

impl<T: Transport, R: Read> UpgradeSession<T, R> {
    /// Opens the session: asks the profile to switch the module into
    /// bootloader mode, then returns a session ready to run the UWF file in
    /// `reader`.
    pub fn open(mut transport: T, mut profile: Box<dyn DeviceProfile>, reader: R) -> Result<Self> {
        profile
            .boot_mode_channel()
            .enter_bootloader(&mut transport)
            .map_err(|e| Error::BootloaderEntry(e.to_string()))?;
        Ok(Self {
            transport,
            profile,
            reader: UwfReader::new(reader),
            state: SessionState::new(),
        })
    }

    /// Exposes the current session state, mostly for tests.
    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// Runs the session to completion: pulls records until end of file or a
    /// reboot/terminator record, dispatching each to its handler. Resources
    /// are released on every exit path, including errors.
    pub fn run(&mut self) -> Result<()> {
        let result = self.dispatch_loop();
        let cleanup_result = self.cleanup();
        match result {
            Ok(()) => cleanup_result,
            Err(e) => {
                if let Err(cleanup_err) = cleanup_result {
                    warn!("cleanup after error also failed: {cleanup_err}");
                }
                Err(e)
            }
        }
    }

    fn cleanup(&mut self) -> Result<()> {
        let leave = self
            .profile
            .boot_mode_channel()
            .leave_bootloader(&mut self.transport);
        let close = self.transport.close();
        leave?;
        close
    }

    fn dispatch_loop(&mut self) -> Result<()> {
        loop {
            let header = match self.reader.next_header()? {
                Some(header) => header,
                None => break,
            };
            let payload = self.reader.read_payload(header.length)?;

            match header.command {
                CommandId::TargetPlatform => self.handle_target_platform(&payload)?,
                CommandId::RegisterDevice => self.handle_register_device(&payload)?,
                CommandId::SelectDevice => self.handle_select_device(&payload)?,
                CommandId::SectorMap => self.handle_sector_map(&payload)?,
                CommandId::EraseBlocks => self.handle_erase_blocks(&payload)?,
                CommandId::WriteBlocks => self.handle_write_blocks(&payload)?,
                CommandId::Unregister => self.handle_unregister(&payload)?,
                CommandId::Reboot => {
                    self.handle_reboot()?;
                    break;
                }
            }
        }
        Ok(())
    }

    fn handle_target_platform(&mut self, platform_id: &[u8]) -> Result<()> {
        info!("process_command_target_platform: {} byte platform id", platform_id.len());
        let mut client = BootloaderClient::new(&mut self.transport);

        let ats = client
            .sync()
            .map_err(|e| Error::Sync(format!("failed to sync with the bootloader: {e}")))?;
        let _ = ats;

        let ack = client
            .acknowledge()
            .map_err(|e| Error::Sync(format!("non-ack or error in ATS acknowledge response: {e}")))?;
        if ack != RESPONSE_ACK {
            return Err(Error::Sync(
                "non-ack or error in ATS acknowledge response".to_string(),
            ));
        }

        let response = client.platform_check(platform_id)?;
        match response {
            RESPONSE_ACK => self.state.synchronized = true,
            crate::protocol::RESPONSE_FAIL => return Err(Error::PlatformInvalid),
            other => return Err(Error::PlatformFatal(other)),
        }

        self.enhanced_mode_check()
    }

    fn enhanced_mode_check(&mut self) -> Result<()> {
        let version_reply = {
            let mut client = BootloaderClient::new(&mut self.transport);
            client.version()?
        };
        let major = parse_major_version(&version_reply)?;

        if major >= FUP_EXTENDED_VERSION_NUMBER {
            self.state.enhanced_mode = true;
            self.state.write_block_size = ENHANCED_WRITE_BLOCK_SIZE;

            {
                let mut client = BootloaderClient::new(&mut self.transport);
                client.setting_set(Option_::CurrentBaudrate as u16, BAUD_CODE_1_000_000)?;
            }

            self.transport.reopen(ENHANCED_BAUD_RATE)?;

            {
                let mut client = BootloaderClient::new(&mut self.transport);
                client.setting_set(Option_::CurrentWriteLenBytes as u16, 0x2)?;
            }
        } else {
            self.state.enhanced_mode = false;
        }
        Ok(())
    }

    fn handle_register_device(&mut self, payload: &[u8]) -> Result<()> {
        precondition(
            self.state.synchronized,
            "process_command_register_device",
            "target platform command not yet processed",
        )?;

        let registration = Registration::decode(payload)?;
        self.profile.validate_registration(&registration)?;
        self.state.registration = Some(registration);
        self.state.registered = true;
        Ok(())
    }

    fn handle_select_device(&mut self, payload: &[u8]) -> Result<()> {
        precondition(
            self.state.synchronized,
            "process_command_select_device",
            "target platform command not yet processed",
        )?;
        self.state.select_device = Some(SelectDevice::decode(payload)?);
        Ok(())
    }

    fn handle_sector_map(&mut self, payload: &[u8]) -> Result<()> {
        precondition(
            self.state.synchronized,
            "process_command_sector_map",
            "target platform command not yet processed",
        )?;
        self.state.sector_map = SectorMap::decode(payload)?;
        Ok(())
    }

    fn handle_erase_blocks(&mut self, payload: &[u8]) -> Result<()> {
        precondition(
            self.state.synchronized
                && self.state.registered
                && self.state.sector_map.sectors > 0
                && self.state.sector_map.sector_size > 0,
            "process_command_erase_blocks",
            "target platform, register device, or sector map commands not yet processed",
        )?;

        let start_offset = read_u32_le(payload, 0, "start_offset")?;
        let size = read_u32_le(payload, 4, "size")?;
        let start = self.state.base_address().wrapping_add(start_offset);

        if size >= self.state.bank_size() {
            return Err(Error::EraseSize);
        }

        let plan = self
            .profile
            .erase_plan(size, self.state.sector_map.sector_size, self.state.enhanced_mode);

        let mut client = BootloaderClient::new(&mut self.transport);

        if let Some(block_code) = plan.block_code {
            client.setting_set(Option_::CurrentEraseLenBytes as u16, block_code as u8)?;
        }

        let count = size.div_ceil(plan.stride);
        for i in 0..count {
            let addr = start.wrapping_add(i.wrapping_mul(plan.stride));
            let response = client.erase_sector(addr, plan.block_code)?;
            if response != RESPONSE_ACK {
                return Err(Error::EraseNack);
            }
        }

        self.state.erased = true;
        Ok(())
    }

    fn handle_write_blocks(&mut self, payload: &[u8]) -> Result<()> {
        precondition(
            self.state.erased,
            "process_command_write_blocks",
            "erase command not yet processed",
        )?;

        let write_offset = read_u32_le(payload, 0, "offset")?;
        let _flags = read_u32_le(payload, 4, "flags")?;
        let data = payload
            .get(8..)
            .ok_or_else(|| Error::Io(std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "truncated write-blocks header")))?;

        if data.len() as u32 >= self.state.bank_size() {
            return Err(Error::WriteSize);
        }

        let mut offset = self.state.base_address().wrapping_add(write_offset);
        let mut client = BootloaderClient::new(&mut self.transport);

        let chunks: Vec<&[u8]> = data.chunks(self.state.write_block_size as usize).collect();
        let chunk_count = chunks.len();

        let mut verify_start = offset;
        let mut verify_count: u32 = 0;
        let mut verify_checksum: u32 = 0;
        let mut verify_size: u32 = 0;

        for (index, chunk) in chunks.into_iter().enumerate() {
            let is_last_chunk = index + 1 == chunk_count;

            let response = client.write_command(offset, chunk.len() as u16, self.state.enhanced_mode)?;
            if response != RESPONSE_ACK {
                return Err(Error::WriteNack);
            }

            let response = client.data_section(chunk)?;
            if response != RESPONSE_ACK {
                return Err(Error::DataNack);
            }

            let chunk_checksum = chunk.iter().fold(0u32, |acc, b| acc.wrapping_add(*b as u32));
            offset = offset.wrapping_add(chunk.len() as u32);
            verify_count += 1;
            verify_checksum = verify_checksum.wrapping_add(chunk_checksum);
            verify_size = verify_size.wrapping_add(chunk.len() as u32);

            if is_last_chunk || verify_count >= self.state.verify_write_limit {
                let response = client.verify(verify_start, verify_size, verify_checksum)?;
                if response != RESPONSE_ACK {
                    return Err(Error::VerifyNack);
                }
                verify_start = offset;
                verify_count = 0;
                verify_checksum = 0;
                verify_size = 0;
            }
        }

        self.state.write_complete = true;
        Ok(())
    }

    fn handle_unregister(&mut self, _payload: &[u8]) -> Result<()> {
        precondition(
            self.state.write_complete,
            "process_command_unregister",
            "write blocks command not yet processed",
        )?;
        Ok(())
    }

    fn handle_reboot(&mut self) -> Result<()> {
        precondition(
            self.state.write_complete,
            "process_reboot",
            "write blocks command not yet processed",
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::io::Cursor;
    use std::rc::Rc;

    use super::*;
    use crate::bootmode::{BootModeChannel, MockBootModeChannel};
    use crate::profile::ErasePlan;
    use crate::transport::MockTransport;

    /// Records every byte sequence handed to `Transport::write` and answers
    /// `read_exact` from a pre-scripted queue of responses, the way a real
    /// bootloader's replies would be scripted for one scenario.
    struct ScriptedLink {
        responses: RefCell<VecDeque<Vec<u8>>>,
        writes: RefCell<Vec<Vec<u8>>>,
    }

    impl ScriptedLink {
        fn new(responses: Vec<Vec<u8>>) -> Rc<Self> {
            Rc::new(Self {
                responses: RefCell::new(responses.into()),
                writes: RefCell::new(Vec::new()),
            })
        }
    }

    fn mock_transport(link: Rc<ScriptedLink>) -> MockTransport {
        let mut transport = MockTransport::new();

        let write_link = link.clone();
        transport.expect_write().returning(move |bytes| {
            write_link.writes.borrow_mut().push(bytes.to_vec());
            Ok(())
        });

        let read_link = link.clone();
        transport.expect_read_exact().returning(move |buf| {
            let response = read_link
                .responses
                .borrow_mut()
                .pop_front()
                .expect("scripted response queue exhausted");
            if response.len() < buf.len() {
                return Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "short read",
                )));
            }
            buf.copy_from_slice(&response[..buf.len()]);
            Ok(())
        });

        transport.expect_reopen().returning(|_| Ok(()));
        transport.expect_close().returning(|| Ok(()));
        transport
    }

    fn noop_boot_mode() -> MockBootModeChannel {
        let mut boot_mode = MockBootModeChannel::new();
        boot_mode.expect_enter_bootloader().returning(|_| Ok(()));
        boot_mode.expect_leave_bootloader().returning(|_| Ok(()));
        boot_mode
    }

    /// A device profile that accepts any registration and never applies the
    /// 64 KiB erase fast path, with a no-op boot-mode channel so tests don't
    /// touch real GPIO/D-Bus side channels.
    struct TestGenericProfile(MockBootModeChannel);

    impl DeviceProfile for TestGenericProfile {
        fn validate_registration(&self, _registration: &Registration) -> Result<()> {
            Ok(())
        }

        fn erase_plan(&self, _size: u32, sector_size: u32, _enhanced_mode: bool) -> ErasePlan {
            ErasePlan {
                stride: sector_size,
                block_code: None,
            }
        }

        fn boot_mode_channel(&mut self) -> &mut dyn BootModeChannel {
            &mut self.0
        }
    }

    /// A device profile mirroring the BL654 gateway's registration
    /// invariant and 64 KiB erase fast path, with a no-op boot-mode channel.
    struct TestBl654Profile(MockBootModeChannel);

    impl DeviceProfile for TestBl654Profile {
        fn validate_registration(&self, registration: &Registration) -> Result<()> {
            if registration.handle == 0
                && registration.num_banks == 1
                && registration.bank_size > 0
                && registration.bank_algo == 1
            {
                Ok(())
            } else {
                Err(Error::RegisterDevice("unexpected registration data".to_string()))
            }
        }

        fn erase_plan(&self, size: u32, sector_size: u32, enhanced_mode: bool) -> ErasePlan {
            if enhanced_mode && size % 0x1_0000 == 0 {
                ErasePlan {
                    stride: 0x1_0000,
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
            &mut self.0
        }
    }

    /// Builds a raw UWF byte stream one record at a time.
    #[derive(Default)]
    struct UwfBuilder {
        bytes: Vec<u8>,
    }

    impl UwfBuilder {
        fn record(&mut self, command: CommandId, payload: &[u8]) -> &mut Self {
            self.bytes.push(command as u8);
            self.bytes.extend_from_slice(&(payload.len() as u32).to_le_bytes());
            self.bytes.extend_from_slice(payload);
            self
        }

        fn target_platform(&mut self, platform_id: &[u8]) -> &mut Self {
            self.record(CommandId::TargetPlatform, platform_id)
        }

        fn register_device(
            &mut self,
            handle: u8,
            base_address: u32,
            num_banks: u8,
            bank_size: u32,
            bank_algo: u8,
        ) -> &mut Self {
            let mut payload = Vec::with_capacity(11);
            payload.push(handle);
            payload.extend_from_slice(&base_address.to_le_bytes());
            payload.push(num_banks);
            payload.extend_from_slice(&bank_size.to_le_bytes());
            payload.push(bank_algo);
            self.record(CommandId::RegisterDevice, &payload)
        }

        fn sector_map(&mut self, sectors: u32, sector_size: u32) -> &mut Self {
            let mut payload = Vec::with_capacity(8);
            payload.extend_from_slice(&sectors.to_le_bytes());
            payload.extend_from_slice(&sector_size.to_le_bytes());
            self.record(CommandId::SectorMap, &payload)
        }

        fn erase_blocks(&mut self, start_offset: u32, size: u32) -> &mut Self {
            let mut payload = Vec::with_capacity(8);
            payload.extend_from_slice(&start_offset.to_le_bytes());
            payload.extend_from_slice(&size.to_le_bytes());
            self.record(CommandId::EraseBlocks, &payload)
        }

        fn write_blocks(&mut self, offset: u32, flags: u32, data: &[u8]) -> &mut Self {
            let mut payload = Vec::with_capacity(8 + data.len());
            payload.extend_from_slice(&offset.to_le_bytes());
            payload.extend_from_slice(&flags.to_le_bytes());
            payload.extend_from_slice(data);
            self.record(CommandId::WriteBlocks, &payload)
        }

        fn finish(&mut self) -> Vec<u8> {
            std::mem::take(&mut self.bytes)
        }
    }

    /// Appends the scripted responses for a non-enhanced target-platform
    /// handshake: a 14-byte ATS, the post-ATS ack, the platform-check ack,
    /// and a "v1.0" version reply (major < 6, so enhanced mode never
    /// triggers and no baud renegotiation traffic follows).
    fn push_legacy_handshake(responses: &mut Vec<Vec<u8>>) {
        responses.push(vec![0u8; 14]);
        responses.push(vec![RESPONSE_ACK]);
        responses.push(vec![RESPONSE_ACK]);
        responses.push(b"v1.0\r\n".to_vec());
    }

    /// Same as [`push_legacy_handshake`] but with an enhanced-mode version
    /// reply, followed by the two `setting_set` responses the enhanced-mode
    /// check issues around the baud reopen.
    fn push_enhanced_handshake(responses: &mut Vec<Vec<u8>>) {
        responses.push(vec![0u8; 14]);
        responses.push(vec![RESPONSE_ACK]);
        responses.push(vec![RESPONSE_ACK]);
        responses.push(b"v6.1\r\n".to_vec());
        responses.push(vec![0u8; 4]); // setting_set(baud) response
        responses.push(vec![0u8; 4]); // setting_set(write len) response
    }

    fn count_writes_starting_with(writes: &[Vec<u8>], tag: u8) -> usize {
        writes.iter().filter(|w| w.first() == Some(&tag)).count()
    }

    #[test]
    fn happy_path_legacy_erase_and_write() {
        let mut file = UwfBuilder::default();
        file.target_platform(b"IG60")
            .register_device(0, 0x0001_0000, 1, 0x0004_0000, 1)
            .sector_map(4, 0x1000)
            .erase_blocks(0, 0x4000)
            .write_blocks(0, 0, &vec![0xABu8; 1024]);
        let uwf = file.finish();

        let mut responses = Vec::new();
        push_legacy_handshake(&mut responses);
        // 4 erase acks
        responses.extend(std::iter::repeat(vec![RESPONSE_ACK]).take(4));
        // 5 write/data pairs: (write ack, data ack) x5, interleaved with a
        // single trailing verify ack.
        for _ in 0..5 {
            responses.push(vec![RESPONSE_ACK]); // write_command
            responses.push(vec![RESPONSE_ACK]); // data_section
        }
        responses.push(vec![RESPONSE_ACK]); // verify

        let link = ScriptedLink::new(responses);
        let transport = mock_transport(link.clone());
        let profile: Box<dyn DeviceProfile> = Box::new(TestGenericProfile(noop_boot_mode()));

        let mut session = UpgradeSession::open(transport, profile, Cursor::new(uwf)).unwrap();
        session.run().expect("happy path should succeed");

        assert!(session.state().erased);
        assert!(session.state().write_complete);

        let writes = link.writes.borrow();
        let erase_addrs: Vec<u32> = writes
            .iter()
            .filter(|w| w.first() == Some(&b'e'))
            .map(|w| u32::from_le_bytes(w[1..5].try_into().unwrap()))
            .collect();
        assert_eq!(
            erase_addrs,
            vec![0x0001_0000, 0x0001_1000, 0x0001_2000, 0x0001_3000]
        );

        let write_lengths: Vec<u8> = writes
            .iter()
            .filter(|w| w.first() == Some(&b'w'))
            .map(|w| w[5])
            .collect();
        assert_eq!(write_lengths, vec![252, 252, 252, 252, 16]);

        assert_eq!(count_writes_starting_with(&writes, b'v'), 1);
    }

    #[test]
    fn enhanced_64k_erase_reopens_baud_and_uses_block_code() {
        let mut file = UwfBuilder::default();
        file.target_platform(b"IG60")
            .register_device(0, 0x0001_0000, 1, 0x0010_0000, 1)
            .sector_map(4, 0x1000)
            .erase_blocks(0, 0x2_0000);
        let uwf = file.finish();

        let mut responses = Vec::new();
        push_enhanced_handshake(&mut responses);
        responses.push(vec![0u8; 4]); // setting_set(erase len) response
        responses.push(vec![RESPONSE_ACK]);
        responses.push(vec![RESPONSE_ACK]);

        let link = ScriptedLink::new(responses);
        let transport = mock_transport(link.clone());
        let profile: Box<dyn DeviceProfile> = Box::new(TestBl654Profile(noop_boot_mode()));

        let mut session = UpgradeSession::open(transport, profile, Cursor::new(uwf)).unwrap();
        session.run().expect("enhanced erase should succeed");

        assert!(session.state().enhanced_mode);
        assert!(session.state().erased);

        let writes = link.writes.borrow();
        let erase_writes: Vec<&Vec<u8>> = writes.iter().filter(|w| w.first() == Some(&b'e')).collect();
        assert_eq!(erase_writes.len(), 2);
        for (i, w) in erase_writes.iter().enumerate() {
            assert_eq!(w.len(), 9, "enhanced erase command carries a 4-byte block code");
            let addr = u32::from_le_bytes(w[1..5].try_into().unwrap());
            assert_eq!(addr, 0x0001_0000 + (i as u32) * 0x1_0000);
            let block_code = u32::from_le_bytes(w[5..9].try_into().unwrap());
            assert_eq!(block_code, 0x2);
        }

        assert_eq!(count_writes_starting_with(&writes, b's'), 3);
    }

    #[test]
    fn verify_window_rolls_over_at_the_configured_limit() {
        let write_block_size = DEFAULT_WRITE_BLOCK_SIZE as usize;
        let data = vec![0x11u8; write_block_size * 9];

        let mut file = UwfBuilder::default();
        file.target_platform(b"IG60")
            .register_device(0, 0x0001_0000, 1, 0x0100_0000, 1)
            .sector_map(4, 0x1000)
            .erase_blocks(0, 0x1000)
            .write_blocks(0, 0, &data);
        let uwf = file.finish();

        let mut responses = Vec::new();
        push_legacy_handshake(&mut responses);
        responses.push(vec![RESPONSE_ACK]); // single erase ack
        for _ in 0..9 {
            responses.push(vec![RESPONSE_ACK]); // write_command
            responses.push(vec![RESPONSE_ACK]); // data_section
        }
        responses.push(vec![RESPONSE_ACK]); // verify after chunk 8
        responses.push(vec![RESPONSE_ACK]); // verify after chunk 9

        let link = ScriptedLink::new(responses);
        let transport = mock_transport(link.clone());
        let profile: Box<dyn DeviceProfile> = Box::new(TestGenericProfile(noop_boot_mode()));

        let mut session = UpgradeSession::open(transport, profile, Cursor::new(uwf)).unwrap();
        session.run().expect("write should succeed");

        let writes = link.writes.borrow();
        let verify_writes: Vec<&Vec<u8>> = writes.iter().filter(|w| w.first() == Some(&b'v')).collect();
        assert_eq!(verify_writes.len(), 2);

        let first_size = u32::from_le_bytes(verify_writes[0][5..9].try_into().unwrap());
        let first_checksum = u32::from_le_bytes(verify_writes[0][9..13].try_into().unwrap());
        assert_eq!(first_size, (write_block_size * 8) as u32);
        assert_eq!(first_checksum, 0x11u32 * (write_block_size * 8) as u32);

        let second_size = u32::from_le_bytes(verify_writes[1][5..9].try_into().unwrap());
        let second_checksum = u32::from_le_bytes(verify_writes[1][9..13].try_into().unwrap());
        assert_eq!(second_size, write_block_size as u32);
        assert_eq!(second_checksum, 0x11u32 * write_block_size as u32);
    }

    #[test]
    fn registration_mismatch_is_rejected_before_any_erase() {
        let mut file = UwfBuilder::default();
        file.target_platform(b"IG60")
            .register_device(0, 0x0001_0000, 2, 0x0004_0000, 1)
            .sector_map(4, 0x1000)
            .erase_blocks(0, 0x4000);
        let uwf = file.finish();

        let mut responses = Vec::new();
        push_legacy_handshake(&mut responses);

        let link = ScriptedLink::new(responses);
        let transport = mock_transport(link.clone());
        let profile: Box<dyn DeviceProfile> = Box::new(TestBl654Profile(noop_boot_mode()));

        let mut session = UpgradeSession::open(transport, profile, Cursor::new(uwf)).unwrap();
        let err = session.run().expect_err("mismatched registration must fail");
        assert!(matches!(err, Error::RegisterDevice(_)));

        let writes = link.writes.borrow();
        assert_eq!(count_writes_starting_with(&writes, b'e'), 0);
    }

    #[test]
    fn erase_nack_mid_stream_stops_after_three_commands() {
        let mut file = UwfBuilder::default();
        file.target_platform(b"IG60")
            .register_device(0, 0x0001_0000, 1, 0x0010_0000, 1)
            .sector_map(5, 0x1000)
            .erase_blocks(0, 0x5000);
        let uwf = file.finish();

        let mut responses = Vec::new();
        push_legacy_handshake(&mut responses);
        responses.push(vec![RESPONSE_ACK]);
        responses.push(vec![RESPONSE_ACK]);
        responses.push(vec![crate::protocol::RESPONSE_FAIL]);

        let link = ScriptedLink::new(responses);
        let transport = mock_transport(link.clone());
        let profile: Box<dyn DeviceProfile> = Box::new(TestGenericProfile(noop_boot_mode()));

        let mut session = UpgradeSession::open(transport, profile, Cursor::new(uwf)).unwrap();
        let err = session.run().expect_err("nack must abort the erase");
        assert!(matches!(err, Error::EraseNack));
        assert!(!session.state().erased);

        let writes = link.writes.borrow();
        assert_eq!(count_writes_starting_with(&writes, b'e'), 3);
        assert_eq!(count_writes_starting_with(&writes, b'w'), 0);
    }

    #[test]
    fn sync_timeout_aborts_before_platform_check() {
        let mut file = UwfBuilder::default();
        file.target_platform(b"IG60");
        let uwf = file.finish();

        // Only 8 of the 14 expected ATS bytes arrive.
        let responses = vec![vec![0u8; 8]];

        let link = ScriptedLink::new(responses);
        let transport = mock_transport(link.clone());
        let profile: Box<dyn DeviceProfile> = Box::new(TestGenericProfile(noop_boot_mode()));

        let mut session = UpgradeSession::open(transport, profile, Cursor::new(uwf)).unwrap();
        let err = session.run().expect_err("short ATS read must fail sync");
        assert!(matches!(err, Error::Sync(_)));

        let writes = link.writes.borrow();
        assert_eq!(writes.len(), 1, "only the sync byte itself should be written");
        assert_eq!(count_writes_starting_with(&writes, b'p'), 0);
    }

    #[test]
    fn precondition_blocks_erase_before_synchronization() {
        let mut file = UwfBuilder::default();
        file.erase_blocks(0, 0x1000);
        let uwf = file.finish();

        let link = ScriptedLink::new(Vec::new());
        let transport = mock_transport(link.clone());
        let profile: Box<dyn DeviceProfile> = Box::new(TestGenericProfile(noop_boot_mode()));

        let mut session = UpgradeSession::open(transport, profile, Cursor::new(uwf)).unwrap();
        let err = session.run().expect_err("erase without sync must be rejected");
        assert!(matches!(err, Error::Precondition { .. }));
        assert!(link.writes.borrow().is_empty());
    }
}
