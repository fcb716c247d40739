use clap::{Parser, Subcommand};
use std::error::Error;
use std::path::PathBuf;
use te_lib::types::{ScreenId, Status, VariableData, VariableId};
use te_lib::update::UpdateStatus;
use te_lib::{TouchEncoder, discover_all};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Touch Encoder service tool")]
struct Args {
    /// Only talk to the device with this interface ID (e.g. usb:SN123 or can0:0x80)
    #[arg(short, long)]
    device: Option<String>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List attached Touch Encoders with their metadata
    Ls,
    /// Show version/hardware/project info for one device
    Info,
    /// Set the display brightness
    Brightness {
        /// Brightness level, 0..=127
        level: u8,
        /// Persist the level across restarts
        #[arg(short, long)]
        store: bool,
    },
    /// Get or set the active GUIDE screen
    Screen {
        /// Screen ID to switch to; prints the current screen when omitted
        screen_id: Option<u8>,
    },
    /// Get or set a GUIDE variable
    Variable {
        screen_id: u8,
        variable_id: u8,
        /// Value to write (integer, or a string with --string); reads when omitted
        value: Option<String>,
        /// Treat the value as a string instead of an integer
        #[arg(long)]
        string: bool,
    },
    /// Restart devices
    Restart {
        /// Restart into the utility app (authenticates as service tool)
        #[arg(short, long)]
        utility: bool,
        /// Return immediately instead of waiting for the device to come back
        #[arg(long)]
        no_wait: bool,
    },
    /// Upload and apply a firmware/project package (.tepkg or .zip)
    Update {
        package: PathBuf,
    },
}

async fn select_devices(filter: Option<&str>) -> Vec<TouchEncoder> {
    let mut devices = discover_all().await;
    if let Some(filter) = filter {
        devices.retain(|d| d.interface_id() == filter);
    }
    if devices.is_empty() {
        error!("no Touch Encoders found");
    }
    devices
}

async fn disconnect_all(mut devices: Vec<TouchEncoder>) {
    for device in &mut devices {
        device.disconnect().await;
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();
    let default_level = if args.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| default_level.into()))
        .init();

    match args.command {
        Command::Ls => {
            let mut devices = select_devices(args.device.as_deref()).await;
            for device in &mut devices {
                device.refresh_info().await;
                let utility = if device.in_utility_app().await { " [utility app]" } else { "" };
                println!(
                    "{}  fw {}  project {}{}",
                    device.interface_id(),
                    device.version().firmware,
                    device.project_info(),
                    utility,
                );
            }
            disconnect_all(devices).await;
        }
        Command::Info => {
            let mut devices = select_devices(args.device.as_deref()).await;
            if let Some(device) = devices.first_mut() {
                device.refresh_info().await;
                println!("Interface:          {}", device.interface_id());
                match device.hardware_id() {
                    Some(id) => println!("Hardware ID:        {id}"),
                    None => println!("Hardware ID:        Not Found"),
                }
                println!("Firmware Version:   v{}", device.version().firmware);
                println!("Bootloader Version: v{}", device.version().bootloader);
                println!("Project Info:       {}", device.project_info());
            }
            disconnect_all(devices).await;
        }
        Command::Brightness { level, store } => {
            let mut devices = select_devices(args.device.as_deref()).await;
            if let Some(device) = devices.first_mut() {
                match device.set_brightness(level, store).await {
                    Status::Success => println!("Brightness set to {level}."),
                    status => println!("Could not set brightness: {status}"),
                }
            }
            disconnect_all(devices).await;
        }
        Command::Screen { screen_id } => {
            let mut devices = select_devices(args.device.as_deref()).await;
            if let Some(device) = devices.first_mut() {
                match screen_id {
                    None => match device.get_screen().await {
                        Ok(screen) => println!("Current screen: {screen}"),
                        Err(e) => println!("Could not read screen: {e}"),
                    },
                    Some(id) => match device.set_screen(ScreenId::new(id)).await {
                        Status::Success => println!("Screen set to {id}."),
                        status => println!("Could not set screen: {status}"),
                    },
                }
            }
            disconnect_all(devices).await;
        }
        Command::Variable {
            screen_id,
            variable_id,
            value,
            string,
        } => {
            let mut devices = select_devices(args.device.as_deref()).await;
            if let Some(device) = devices.first_mut() {
                let screen = ScreenId::new(screen_id);
                let variable = VariableId::new(variable_id);
                match value {
                    None => match device.get_var(screen, variable).await {
                        Ok(data) => match data.to_int() {
                            Some(value) => println!("Screen {screen} variable {variable}: {value}"),
                            None => println!(
                                "Screen {screen} variable {variable}: {:?}",
                                data.to_string()
                            ),
                        },
                        Err(e) => println!("Could not read variable: {e}"),
                    },
                    Some(raw) => {
                        let data = if string {
                            VariableData::from_str(&raw)
                        } else {
                            VariableData::from_int(raw.parse()?)
                        };
                        match device.set_var(screen, variable, &data).await {
                            Status::Success => println!("Variable set to {raw}."),
                            status => println!("Could not set variable: {status}"),
                        }
                    }
                }
            }
            disconnect_all(devices).await;
        }
        Command::Restart { utility, no_wait } => {
            let mut devices = select_devices(args.device.as_deref()).await;
            for device in &mut devices {
                let id = device.interface_id();
                let status = device.restart(utility, !no_wait, utility).await;
                println!("{id}: {status}");
            }
            disconnect_all(devices).await;
        }
        Command::Update { package } => {
            let mut devices = select_devices(args.device.as_deref()).await;
            for device in &mut devices {
                let id = device.interface_id();
                info!("{id}: updating from {}", package.display());
                let mut progress = |state: te_lib::UpdateState,
                                    completed: Option<u64>,
                                    total: Option<u64>| {
                    match (completed, total) {
                        (Some(completed), Some(total)) if total > 0 => {
                            println!("{id}: {state} {completed}/{total}")
                        }
                        _ => println!("{id}: {state}"),
                    }
                };
                match device.update(&package, &mut progress).await {
                    Ok(UpdateStatus::SuccessUptodate) => println!("{id}: already up to date"),
                    Ok(status) if matches!(status, UpdateStatus::Success | UpdateStatus::SuccessRestart) => {
                        println!("{id}: update complete")
                    }
                    Ok(status) => println!("{id}: update failed ({status})"),
                    Err(e) => println!("{id}: update failed ({e})"),
                }
            }
            disconnect_all(devices).await;
        }
    }

    Ok(())
}
