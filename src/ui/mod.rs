use std::collections::HashMap;
use std::fmt::Write;
use std::future::Future;
use std::time::Duration;

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use log::{debug, warn};
use tokio::sync::mpsc;

use crate::engine::state::{FailedStep, Notice, NoticeLevel, OtaEvent, OtaState, Stage};
use crate::networking::DeviceClient;
use crate::release::Release;
use crate::settings::{AUTOTUNE_RANGES, AutotuneSettings, SystemInfo};
use crate::transfer::TransferState;
use crate::updater::UpdateStatus;

const BAR_TEMPLATE: &str = "{prefix:>10} [{bar:40.cyan/blue}] {pos:>3}%";

/// Draws orchestrator events in the terminal. Never feeds anything back into
/// the orchestrator.
pub struct ConsoleView {
    multi: MultiProgress,
    bars: HashMap<Stage, ProgressBar>,
}

impl ConsoleView {
    pub fn new() -> Self {
        Self {
            multi: MultiProgress::new(),
            bars: HashMap::new(),
        }
    }

    fn println(&self, line: &str) {
        if self.multi.println(line).is_err() {
            println!("{line}");
        }
    }

    fn show_progress(&mut self, stage: Stage, percent: Option<u8>) {
        match percent {
            Some(percent) => {
                let bar = self.bars.entry(stage).or_insert_with(|| {
                    let bar = self.multi.add(ProgressBar::new(100));
                    bar.set_style(
                        ProgressStyle::with_template(BAR_TEMPLATE)
                            .unwrap_or_else(|_| ProgressStyle::default_bar())
                            .progress_chars("=> "),
                    );
                    bar.set_prefix(stage.label());
                    bar
                });
                bar.set_position(u64::from(percent));
            }
            None => {
                if let Some(bar) = self.bars.remove(&stage) {
                    bar.finish_and_clear();
                }
            }
        }
    }

    /// Handle one event. Returns `true` when the device should be re-read.
    pub fn apply(&mut self, event: &OtaEvent) -> bool {
        match event {
            OtaEvent::StateChanged(state) => {
                debug!("ui: state {state:?}");
                if let Some(line) = describe_state(state) {
                    self.println(&line);
                }
            }
            OtaEvent::Progress { stage, percent } => self.show_progress(*stage, *percent),
            OtaEvent::Notice(notice) => self.println(&format_notice(notice)),
            OtaEvent::ReloadScheduled { after } => {
                self.println(&format!("Reloading in {:.1}s...", after.as_secs_f32()));
            }
            OtaEvent::Reload => return true,
        }
        false
    }
}

/// Render events until every sender is gone. A `Reload` re-reads the device
/// so the user sees the version it now serves.
pub async fn render_events(mut events: mpsc::UnboundedReceiver<OtaEvent>, device: DeviceClient) {
    let mut view = ConsoleView::new();
    while let Some(event) = events.recv().await {
        if view.apply(&event) {
            match device.system_info().await {
                Ok(info) => view.println(&format!(
                    "Reloaded: {} now runs {}",
                    display_or_dash(&info.hostname),
                    display_or_dash(&info.version)
                )),
                Err(err) => {
                    warn!("ui: reload failed: {err}");
                    view.println(&format!("Reload failed: {err}"));
                }
            }
        }
    }
}

/// Show a spinner while `task` runs, in place of a blocking overlay.
pub async fn with_spinner<T>(message: &str, task: impl Future<Output = T>) -> T {
    let spinner = ProgressBar::new_spinner();
    spinner.set_message(message.to_owned());
    spinner.enable_steady_tick(Duration::from_millis(100));
    let result = task.await;
    spinner.finish_and_clear();
    result
}

pub fn format_notice(notice: &Notice) -> String {
    let marker = match notice.level {
        NoticeLevel::Info => "i",
        NoticeLevel::Success => "+",
        NoticeLevel::Warning => "!",
        NoticeLevel::Error => "x",
    };
    format!("[{marker}] {}: {}", notice.title, notice.message)
}

fn describe_state(state: &OtaState) -> Option<String> {
    match state {
        OtaState::ReleaseFetched { tag } => Some(format!("Latest release: {tag}")),
        OtaState::AssetsResolved { tag } => Some(format!("Assets for {tag} resolved")),
        OtaState::FirmwareTransferring => Some("Updating firmware...".into()),
        OtaState::WebAssetsTransferring => Some("Updating web assets...".into()),
        OtaState::Failed { step, .. } => Some(format!("Update stopped at {}", step_label(*step))),
        _ => None,
    }
}

fn step_label(step: FailedStep) -> String {
    match step {
        FailedStep::ReleaseFeed => "release feed".into(),
        FailedStep::VersionCheck => "version check".into(),
        FailedStep::AssetResolution => "asset resolution".into(),
        FailedStep::Transfer(stage) => format!("{stage} transfer"),
    }
}

pub fn format_status(status: &UpdateStatus) -> String {
    match status {
        UpdateStatus::UpToDate {
            device_version,
            latest_version,
        } => format!("Up to date: device runs {device_version}, latest release is {latest_version}"),
        UpdateStatus::UpdateAvailable {
            device_version,
            latest_version,
            url,
            published,
        } => {
            let mut out = format!("Update available: {device_version} -> {latest_version}");
            if let Some(published) = published {
                let _ = write!(out, " (published {})", published.format("%Y-%m-%d"));
            }
            if !url.is_empty() {
                let _ = write!(out, "\n  {url}");
            }
            out
        }
    }
}

pub fn format_release(release: &Release) -> String {
    let title = release
        .name
        .as_deref()
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .unwrap_or(&release.tag_name);
    let mut out = format!("Latest release: {title}");
    if title != release.tag_name {
        let _ = write!(out, " ({})", release.tag_name);
    }
    if release.prerelease {
        out.push_str(" [pre-release]");
    }
    out
}

/// One summary line per stage that was touched; `None` for an idle stage.
pub fn format_transfer(stage: Stage, state: &TransferState, progress: Option<u8>) -> Option<String> {
    let detail = match state {
        TransferState::Idle => return None,
        TransferState::InProgress { percent } => {
            format!("in progress ({}%)", progress.unwrap_or(*percent))
        }
        TransferState::Succeeded => "done".to_owned(),
        TransferState::Failed(reason) => format!("failed: {reason}"),
    };
    Some(format!("{:>10}: {detail}", stage.label()))
}

pub fn format_system_info(info: &SystemInfo) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Hostname:     {}", display_or_dash(&info.hostname));
    let _ = writeln!(out, "ASIC model:   {}", display_or_dash(&info.asic_model));
    let _ = writeln!(out, "Firmware:     {}", display_or_dash(&info.version));
    let _ = writeln!(out, "Frequency:    {}", number_with_unit(info.frequency, "MHz"));
    let _ = writeln!(out, "Core voltage: {}", number_with_unit(info.core_voltage, "mV"));
    let _ = write!(out, "Hash rate:    {}", number_with_unit(info.hash_rate, "GH/s"));
    out
}

pub fn format_autotune(settings: &AutotuneSettings) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{:<22} {}",
        "Auto tune",
        if settings.auto_tune { "on" } else { "off" }
    );
    for range in AUTOTUNE_RANGES {
        let value = settings.value(range.key).unwrap_or_default();
        let _ = writeln!(
            out,
            "{:<22} {} {} ({}..{}) [{}]",
            range.label, value, range.unit, range.min, range.max, range.key
        );
    }
    out.trim_end().to_owned()
}

fn display_or_dash(value: &str) -> &str {
    if value.trim().is_empty() { "-" } else { value }
}

fn number_with_unit(value: Option<f64>, unit: &str) -> String {
    match value {
        Some(value) => format!("{value} {unit}"),
        None => "-".into(),
    }
}
