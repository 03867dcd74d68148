use thiserror::Error as ThisError;

/// Errors produced while driving a UWF upgrade session.
///
/// Every variant is terminal: the session halts at the first error, releases
/// its resources, and hands the message back to the caller. Nothing here is
/// retried or resumed.
#[derive(ThisError, Debug)]
pub enum Error {
    #[error("enter_bootloader: {0}")]
    BootloaderEntry(String),

    #[error("process_command_target_platform: {0}")]
    Sync(String),

    #[error("process_command_target_platform: invalid platform ID")]
    PlatformInvalid,

    #[error("process_command_target_platform: unexpected response to platform ID: 0x{0:02X}")]
    PlatformFatal(u8),

    #[error("process_command_register_device: {0}")]
    RegisterDevice(String),

    #[error("{handler}: {reason}")]
    Precondition { handler: &'static str, reason: String },

    #[error("process_command_erase_blocks: erase block size > bank size")]
    EraseSize,

    #[error("process_command_erase_blocks: non-ack to erase command")]
    EraseNack,

    #[error("process_command_write_blocks: data to write > bank size")]
    WriteSize,

    #[error("process_command_write_blocks: non-ack to write command")]
    WriteNack,

    #[error("process_command_write_blocks: non-ack to data write")]
    DataNack,

    #[error("process_command_write_blocks: non-ack to verify command")]
    VerifyNack,

    #[error("unrecognized UWF command id: 0x{0:02X}")]
    UnknownCommand(u8),

    #[error("operation not supported by this boot-mode channel")]
    Unsupported,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
