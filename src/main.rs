use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing::{debug, error};
use tracing_subscriber::EnvFilter;

use ble_dfu::commands::firmware::validate_firmware_package;
use ble_dfu::dfu::FirmwareType;
use ble_dfu::settings::SettingsManager;

#[derive(Parser)]
#[command(name = "ble-dfu", version, about = "Legacy Nordic BLE DFU tools")]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Validate a firmware package and print its parts as JSON
    Inspect {
        /// Distribution .zip, or a single .bin/.hex image
        package: PathBuf,

        /// Init packet (.dat) for a .bin/.hex image
        #[arg(long)]
        dat: Option<PathBuf>,

        /// Components to take from a .zip, e.g. "sd,bl", or the type of a .bin/.hex image
        #[arg(short, long, default_value = "all")]
        types: String,
    },
    /// Print the effective DFU settings as JSON
    Settings {
        /// Directory holding dfu_settings.json
        #[arg(short, long, default_value = ".")]
        dir: PathBuf,
    },
}

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(command: Command) -> Result<String, String> {
    match command {
        Command::Inspect {
            package,
            dat,
            types,
        } => {
            let types = FirmwareType::parse_list(&types)
                .ok_or_else(|| format!("Invalid firmware types: {}", types))?;
            debug!("Inspecting {} for {}", package.display(), types);

            let info = validate_firmware_package(
                package.to_string_lossy().to_string(),
                dat.map(|path| path.to_string_lossy().to_string()),
                types,
            )
            .await?;
            serde_json::to_string_pretty(&info).map_err(|e| format!("Failed to serialize: {}", e))
        }
        Command::Settings { dir } => {
            let manager = SettingsManager::new(&dir);
            debug!("Loading settings from {}", manager.settings_path().display());

            let settings = manager.load()?;
            settings.validate()?;
            serde_json::to_string_pretty(&settings)
                .map_err(|e| format!("Failed to serialize: {}", e))
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match run(cli.command).await {
        Ok(output) => {
            println!("{}", output);
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
