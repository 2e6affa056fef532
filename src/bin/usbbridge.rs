use anyhow::Context;
use clap::{ArgAction, Parser};
use log::LevelFilter;

use aoa_bridge::{Bridge, ModuleConfig, ShutdownToken};

/// Turns a connected Android device into a USB accessory and forwards data
/// between the local module sockets and the app on the device.
#[derive(Parser, Debug)]
#[command(name = "usbbridge", disable_help_flag = true)]
struct Cli {
    /// Set to Y to listen for video module data
    #[arg(short = 'v', value_name = "Y")]
    video: Option<String>,

    /// Set to Y to listen for communication module data
    #[arg(short = 'c', value_name = "Y")]
    communication: Option<String>,

    /// Set to Y to listen for proxy module data
    #[arg(short = 'p', value_name = "Y")]
    proxy: Option<String>,

    /// Set to Y to listen for status module data
    #[arg(short = 's', value_name = "Y")]
    status: Option<String>,

    /// Print usage
    #[arg(short = '?', long = "help", action = ArgAction::Help)]
    help: Option<bool>,
}

fn enabled(flag: &Option<String>) -> bool {
    flag.as_deref() == Some("Y")
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_default_env()
        .filter_level(LevelFilter::Info)
        .format_timestamp_millis()
        .init();

    let cli = Cli::parse();
    let config = ModuleConfig {
        video: enabled(&cli.video),
        communication: enabled(&cli.communication),
        proxy: enabled(&cli.proxy),
        status: enabled(&cli.status),
    };

    let shutdown = ShutdownToken::new();
    {
        let shutdown = shutdown.clone();
        ctrlc::set_handler(move || shutdown.trigger())
            .context("installing termination handler")?;
    }

    let bridge = Bridge::new(config, shutdown).context("initializing usb backend")?;
    bridge.run().context("bridge loop failed")?;
    log::info!("terminated");
    Ok(())
}
