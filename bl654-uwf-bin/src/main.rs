use std::fs;

use anyhow::Context;
use clap::Parser;
use log::info;

use bl654_uwf::{Bl654Profile, DeviceProfile, GenericProfile, SerialTransport, UpgradeSession};

#[derive(clap::ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum DeviceProfileKind {
    /// Generic UWF target: no registration validation, GPIO mode switch.
    Generic,
    /// Gateway-hosted BL654: strict registration, device-service mode switch.
    Bl654,
}

#[derive(clap::Parser)]
#[command(author, version, about, long_about = None)]
struct Opt {
    /// Device profile to apply
    #[arg(long, value_enum, default_value_t = DeviceProfileKind::Generic)]
    device_profile: DeviceProfileKind,

    /// Serial port
    #[arg(short, long)]
    serial_port: String,

    /// Baud rate
    #[arg(short, long, default_value_t = 115_200)]
    baud_rate: u32,

    /// Path to the UWF file describing the upgrade
    uwf_file_path: String,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let opt = Opt::parse();

    let profile: Box<dyn DeviceProfile> = match opt.device_profile {
        DeviceProfileKind::Generic => Box::new(GenericProfile::new()),
        DeviceProfileKind::Bl654 => Box::new(Bl654Profile::new()),
    };

    info!("opening serial port: {} {}", opt.serial_port, opt.baud_rate);
    let transport = SerialTransport::open(&opt.serial_port, opt.baud_rate)
        .context("Failed to open serial port")?;

    let file = fs::File::open(&opt.uwf_file_path)
        .with_context(|| format!("Failed to open UWF file: {}", opt.uwf_file_path))?;

    info!("entering bootloader mode");
    let mut session =
        UpgradeSession::open(transport, profile, file).context("Failed to enter bootloader mode")?;

    info!("running upgrade from: {}", opt.uwf_file_path);
    session.run().context("Firmware upgrade failed")?;

    info!("firmware upgrade complete");
    Ok(())
}
