use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use env_logger::Env;
use log::{debug, info, warn};
use tokio::sync::mpsc;

mod engine;
mod env;
mod error;
mod networking;
mod release;
mod settings;
mod storage;
mod transfer;
mod ui;
mod updater;
mod util;

use engine::OtaOrchestrator;
use engine::state::{OtaState, Stage};
use error::{OtaError, Result};
use networking::{DeviceClient, FetchStrategy, HttpAssetFetcher};
use release::GithubReleaseFeed;
use storage::{ConsoleConfig, StorageManager};

#[derive(Parser, Debug)]
#[command(
    name = "axe-console",
    author,
    version,
    about = "Settings and over-the-air update console for AxeOS mining devices"
)]
struct Cli {
    /// Print console version and exit.
    #[arg(long)]
    version_only: bool,

    /// Device base URL, e.g. http://192.168.1.50
    #[arg(long, global = true)]
    device: Option<String>,

    /// Release feed URL (GitHub releases API).
    #[arg(long, global = true)]
    feed: Option<String>,

    /// Prefix prepended to release asset URLs, e.g. a CORS relay.
    /// `default` picks the built-in relay, `none` downloads directly.
    #[arg(long, global = true)]
    relay: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show what the device reports about itself.
    Info,
    /// Compare the latest release with the device firmware.
    Check {
        /// Open the release page in the browser.
        #[arg(long)]
        open: bool,
    },
    /// Download the latest release and flash firmware, then web assets.
    Update {
        /// Flash even when the device is not older than the release.
        #[arg(long)]
        force: bool,
    },
    /// Flash a local binary.
    Flash(FlashArgs),
    /// View or change system settings.
    #[command(subcommand)]
    Settings(SettingsCommand),
    /// View or change autotune limits.
    #[command(subcommand)]
    Autotune(SettingsCommand),
    /// Restart the device.
    Restart,
    /// View or change the saved console configuration.
    #[command(subcommand)]
    Config(ConfigCommand),
}

#[derive(Args, Debug)]
#[group(required = true, multiple = false)]
struct FlashArgs {
    /// Firmware image (esp-miner.bin).
    #[arg(long)]
    firmware: Option<PathBuf>,
    /// Web asset image (www.bin).
    #[arg(long)]
    www: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum SettingsCommand {
    Show,
    /// Apply KEY=VALUE pairs.
    Set {
        #[arg(required = true)]
        values: Vec<String>,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigCommand {
    Show,
    Set { key: String, value: String },
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    if cli.version_only {
        println!("axe-console {}", env!("CARGO_PKG_VERSION"));
        return ExitCode::SUCCESS;
    }

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{}", failure_line(&err));
            ExitCode::FAILURE
        }
    }
}

/// The single line printed for a failed command. Device error bodies can span
/// several lines, so whitespace is collapsed.
fn failure_line(err: &OtaError) -> String {
    let text = err.to_string();
    format!("error: {}", text.split_whitespace().collect::<Vec<_>>().join(" "))
}

async fn run(cli: Cli) -> Result<()> {
    let storage = StorageManager::new();
    let mut config = storage.read_config().await?;
    let Some(command) = cli.command else {
        println!("No command given; try --help.");
        return Ok(());
    };

    if let Command::Config(action) = command {
        return run_config(&storage, config, action).await;
    }

    if let Some(device) = cli.device {
        config.set("device_url", &device)?;
    }
    if let Some(feed) = cli.feed {
        config.set("release_feed_url", &feed)?;
    }
    if let Some(relay) = cli.relay {
        config.set("asset_relay", &relay)?;
    }
    let device = DeviceClient::new(&config.device_url, config.request_timeout());
    info!("using device {}", device.base_url());

    match command {
        Command::Info => {
            let info = ui::with_spinner("Reading device", device.system_info()).await?;
            println!("{}", ui::format_system_info(&info));
        }
        Command::Check { open } => {
            let (latest, status) = check(&config, &device).await?;
            println!("{}", ui::format_release(&latest));
            println!("{}", ui::format_status(&status));
            let url = latest.html_url;
            if open && !url.is_empty() {
                if let Err(err) = open::that(&url) {
                    warn!("failed to open {url}: {err}");
                }
            }
        }
        Command::Update { force } => auto_update(&config, device, force).await?,
        Command::Flash(args) => {
            let (stage, path) = match (args.firmware, args.www) {
                (Some(path), _) => (Stage::Firmware, path),
                (None, Some(path)) => (Stage::WebAssets, path),
                (None, None) => {
                    return Err(OtaError::InvalidSetting(
                        "pass --firmware or --www".into(),
                    ));
                }
            };
            flash_local(&config, device, stage, &path).await?;
        }
        Command::Settings(SettingsCommand::Show) => {
            let info = ui::with_spinner("Reading device", device.system_info()).await?;
            let mut fields: Vec<_> = info.extra.iter().collect();
            fields.sort_by(|a, b| a.0.cmp(b.0));
            println!("{}", ui::format_system_info(&info));
            for (key, value) in fields {
                println!("{key}: {value}");
            }
        }
        Command::Settings(SettingsCommand::Set { values }) => {
            let pairs = settings::parse_assignments(&values)?;
            let payload = settings::system_settings_payload(&pairs)?;
            ui::with_spinner("Saving", device.update_system(&payload)).await?;
            println!("Saved.");
        }
        Command::Autotune(SettingsCommand::Show) => {
            let autotune = ui::with_spinner("Reading autotune", device.autotune()).await?;
            println!("{}", ui::format_autotune(&autotune));
        }
        Command::Autotune(SettingsCommand::Set { values }) => {
            let pairs = settings::parse_assignments(&values)?;
            settings::validate_autotune(&pairs)?;
            let mut autotune = ui::with_spinner("Reading autotune", device.autotune()).await?;
            for (key, value) in &pairs {
                autotune.apply(key, value)?;
            }
            ui::with_spinner("Saving", device.update_autotune(&autotune)).await?;
            println!("Autotune settings saved!");
        }
        Command::Restart => {
            ui::with_spinner("Restarting", device.restart()).await?;
            println!("Device restarted");
        }
        Command::Config(_) => {}
    }
    Ok(())
}

async fn run_config(
    storage: &StorageManager,
    mut config: ConsoleConfig,
    action: ConfigCommand,
) -> Result<()> {
    match action {
        ConfigCommand::Show => {
            let text = serde_json::to_string_pretty(&config)
                .map_err(|e| OtaError::Config(format!("unable to encode config: {e}")))?;
            println!("# {}", storage.config_path().display());
            println!("{text}");
        }
        ConfigCommand::Set { key, value } => {
            config.set(&key, &value)?;
            storage.write_config(&config).await?;
            println!("{key} saved");
        }
    }
    Ok(())
}

fn orchestrator(
    config: &ConsoleConfig,
    device: DeviceClient,
    updates: mpsc::UnboundedSender<engine::state::OtaEvent>,
) -> OtaOrchestrator<GithubReleaseFeed, HttpAssetFetcher, DeviceClient> {
    let feed = GithubReleaseFeed::new(&config.release_feed_url, config.request_timeout());
    let fetcher = HttpAssetFetcher::new(FetchStrategy::from_relay(config.asset_relay.as_deref()));
    OtaOrchestrator::new(feed, fetcher, device, updates)
}

async fn check(
    config: &ConsoleConfig,
    device: &DeviceClient,
) -> Result<(release::Release, updater::UpdateStatus)> {
    let info = ui::with_spinner("Reading device", device.system_info()).await?;
    let (tx, _rx) = mpsc::unbounded_channel();
    let mut ota = orchestrator(config, device.clone(), tx);
    ui::with_spinner("Checking releases", ota.check_for_update(&info.version)).await
}

async fn auto_update(config: &ConsoleConfig, device: DeviceClient, force: bool) -> Result<()> {
    let info = ui::with_spinner("Reading device", device.system_info()).await?;
    let (tx, rx) = mpsc::unbounded_channel();
    let view_device = device.clone();
    let mut ota = orchestrator(config, device, tx);

    let work = async move {
        let outcome = ota.auto_update(&info.version, force).await;
        (outcome, ota.state().clone(), transfer_summary(&ota))
    };
    let ((outcome, state, summary), ()) = tokio::join!(work, ui::render_events(rx, view_device));
    print_summary(&summary);
    if state.is_terminal() {
        info!("update finished in state {state:?}");
    } else {
        debug!("update stopped in state {state:?}");
    }
    outcome.map(|_| ())
}

async fn flash_local(config: &ConsoleConfig, device: DeviceClient, stage: Stage, path: &Path) -> Result<()> {
    let payload = tokio::fs::read(path).await.map_err(|e| {
        OtaError::InvalidSetting(format!("unable to read {}: {e}", path.display()))
    })?;
    let (tx, rx) = mpsc::unbounded_channel();
    let view_device = device.clone();
    let mut ota = orchestrator(config, device, tx);

    let work = async move {
        let outcome = ota.flash_local(stage, payload).await;
        (outcome, ota.state().clone(), transfer_summary(&ota))
    };
    let ((outcome, state, summary), ()) = tokio::join!(work, ui::render_events(rx, view_device));
    print_summary(&summary);
    if state != OtaState::done(stage) {
        warn!("{stage} flash ended in state {state:?}");
    }
    outcome
}

fn transfer_summary(ota: &OtaOrchestrator<GithubReleaseFeed, HttpAssetFetcher, DeviceClient>) -> Vec<String> {
    [Stage::Firmware, Stage::WebAssets]
        .into_iter()
        .filter_map(|stage| ui::format_transfer(stage, ota.transfer_state(stage), ota.progress(stage)))
        .collect()
}

fn print_summary(lines: &[String]) {
    for line in lines {
        println!("{line}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failures_print_as_one_line() {
        let err = OtaError::Device("device returned status: 500 (partition\n  too small)".into());
        assert_eq!(
            failure_line(&err),
            "error: device request failed: device returned status: 500 (partition too small)"
        );
        assert_eq!(
            failure_line(&OtaError::MissingAsset("www.bin".into())),
            "error: No www.bin file found"
        );
    }
}
