use log::{debug, error, info};
use tokio::sync::mpsc;

use crate::engine::state::{FailedStep, Notice, OtaEvent, OtaState, Stage};
use crate::error::{OtaError, Result};
use crate::networking::{AssetFetcher, DeviceTransport};
use crate::release::{self, Asset, Release, ReleaseFeed};
use crate::transfer::{TransferState, TransferTracker};
use crate::updater::UpdateStatus;
use crate::util::format_size;

pub mod state;

/// Sequences release discovery, asset selection and the two uploads.
///
/// Owns one [`TransferTracker`] per stage; the rendering layer only ever sees
/// the [`OtaEvent`]s sent on `updates` and the read-only accessors below.
pub struct OtaOrchestrator<F, A, D> {
    state: OtaState,
    feed: F,
    fetcher: A,
    device: D,
    firmware: TransferTracker,
    web: TransferTracker,
    updates: mpsc::UnboundedSender<OtaEvent>,
}

impl<F, A, D> OtaOrchestrator<F, A, D>
where
    F: ReleaseFeed,
    A: AssetFetcher,
    D: DeviceTransport,
{
    pub fn new(feed: F, fetcher: A, device: D, updates: mpsc::UnboundedSender<OtaEvent>) -> Self {
        Self {
            state: OtaState::Idle,
            feed,
            fetcher,
            device,
            firmware: TransferTracker::new(Stage::Firmware, updates.clone()),
            web: TransferTracker::new(Stage::WebAssets, updates.clone()),
            updates,
        }
    }

    pub fn state(&self) -> &OtaState {
        &self.state
    }

    pub fn transfer_state(&self, stage: Stage) -> &TransferState {
        self.tracker(stage).state()
    }

    pub fn progress(&self, stage: Stage) -> Option<u8> {
        self.tracker(stage).progress()
    }

    /// Fetch the newest release and compare it with the device version.
    pub async fn check_for_update(&mut self, device_version: &str) -> Result<(Release, UpdateStatus)> {
        self.transition(OtaState::Idle);
        let release = self.fetch_latest().await?;
        let status = UpdateStatus::evaluate(&release, device_version)
            .map_err(|err| self.fail(FailedStep::VersionCheck, err, true))?;
        debug!("check_for_update: {status:?}");
        Ok((release, status))
    }

    /// Full automatic update. Stops after the version check unless the
    /// release is newer or `force` is set.
    pub async fn auto_update(&mut self, device_version: &str, force: bool) -> Result<UpdateStatus> {
        let (release, status) = self.check_for_update(device_version).await?;
        if !status.is_available() && !force {
            info!(
                "auto_update: device {} already runs {} or newer",
                device_version.trim(),
                release.tag_name
            );
            let _ = self.updates.send(OtaEvent::Notice(Notice::info(format!(
                "Device is up to date ({})",
                device_version.trim()
            ))));
            self.transition(OtaState::Idle);
            return Ok(status);
        }
        if !status.is_available() {
            let _ = self.updates.send(OtaEvent::Notice(Notice::warning(format!(
                "Forcing {} over device version {}",
                release.tag_name,
                device_version.trim()
            ))));
        }
        self.update_from_release(&release).await?;
        Ok(status)
    }

    /// Flash both binaries of an already fetched release, firmware first.
    pub async fn update_from_release(&mut self, target: &Release) -> Result<()> {
        let assets = release::resolve_update_assets(target)
            .map_err(|err| self.fail(FailedStep::AssetResolution, err, true))?;
        self.transition(OtaState::AssetsResolved {
            tag: target.tag_name.clone(),
        });

        self.run_release_stage(Stage::Firmware, &assets.firmware).await?;
        self.run_release_stage(Stage::WebAssets, &assets.web).await
    }

    /// Flash a binary supplied by the user, skipping the release feed.
    pub async fn flash_local(&mut self, stage: Stage, payload: Vec<u8>) -> Result<()> {
        info!(
            "flash_local: {} for {stage}",
            format_size(payload.len() as u64)
        );
        self.transition(OtaState::transferring(stage));
        self.upload(stage, payload).await
    }

    async fn fetch_latest(&mut self) -> Result<Release> {
        let fetched = release::latest_release(&self.feed).await;
        let release = fetched.map_err(|err| self.fail(FailedStep::ReleaseFeed, err, true))?;
        self.transition(OtaState::ReleaseFetched {
            tag: release.tag_name.clone(),
        });
        Ok(release)
    }

    async fn run_release_stage(&mut self, stage: Stage, asset: &Asset) -> Result<()> {
        self.transition(OtaState::transferring(stage));
        info!(
            "{stage}: downloading {} ({})",
            asset.download_url,
            format_size(asset.size)
        );
        let fetched = self.fetcher.fetch(&asset.download_url).await;
        let payload = match fetched {
            Ok(payload) => {
                debug!("{stage}: downloaded {}", format_size(payload.len() as u64));
                payload
            }
            Err(reason) => {
                let err = OtaError::AssetDownload {
                    asset: asset.name.clone(),
                    reason,
                };
                return Err(self.fail(FailedStep::Transfer(stage), err, true));
            }
        };
        release::verify_size(asset, &payload)
            .and_then(|()| release::verify_digest(asset, &payload))
            .map_err(|err| self.fail(FailedStep::Transfer(stage), err, true))?;
        self.upload(stage, payload).await
    }

    async fn upload(&mut self, stage: Stage, payload: Vec<u8>) -> Result<()> {
        if let Err(err) = self.tracker_mut(stage).begin() {
            return Err(self.fail(FailedStep::Transfer(stage), err, true));
        }
        let events = self.device.upload(stage, payload);
        let outcome = self.tracker_mut(stage).track(events).await;
        // The tracker has already told the user about a failed transfer.
        if let Err(err) = outcome {
            return Err(self.fail(FailedStep::Transfer(stage), err, false));
        }
        self.transition(OtaState::done(stage));
        Ok(())
    }

    fn tracker(&self, stage: Stage) -> &TransferTracker {
        match stage {
            Stage::Firmware => &self.firmware,
            Stage::WebAssets => &self.web,
        }
    }

    fn tracker_mut(&mut self, stage: Stage) -> &mut TransferTracker {
        match stage {
            Stage::Firmware => &mut self.firmware,
            Stage::WebAssets => &mut self.web,
        }
    }

    fn transition(&mut self, state: OtaState) {
        if self.state == state {
            return;
        }
        info!("ota: {:?} -> {:?}", self.state, state);
        self.state = state.clone();
        let _ = self.updates.send(OtaEvent::StateChanged(state));
    }

    fn fail(&mut self, step: FailedStep, err: OtaError, notify: bool) -> OtaError {
        let reason = err.to_string();
        error!("ota: failed at {step:?}: {reason}");
        if notify {
            let _ = self.updates.send(OtaEvent::Notice(Notice::error(reason.clone())));
        }
        self.transition(OtaState::Failed { step, reason });
        err
    }
}
