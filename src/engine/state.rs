use std::fmt;
use std::time::Duration;

/// One of the two sequential transfer phases.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Stage {
    Firmware,
    WebAssets,
}

impl Stage {
    pub fn label(self) -> &'static str {
        match self {
            Stage::Firmware => "firmware",
            Stage::WebAssets => "web assets",
        }
    }

    /// Device endpoint that accepts this stage's binary.
    pub fn endpoint(self) -> &'static str {
        match self {
            Stage::Firmware => "/api/system/OTA",
            Stage::WebAssets => "/api/system/OTAWWW",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Where an update attempt stopped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailedStep {
    ReleaseFeed,
    VersionCheck,
    AssetResolution,
    Transfer(Stage),
}

// The central source of truth for an update attempt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OtaState {
    Idle,
    ReleaseFetched { tag: String },
    AssetsResolved { tag: String },
    FirmwareTransferring,
    FirmwareDone,
    WebAssetsTransferring,
    WebAssetsDone,
    Failed { step: FailedStep, reason: String },
}

impl OtaState {
    pub fn transferring(stage: Stage) -> Self {
        match stage {
            Stage::Firmware => OtaState::FirmwareTransferring,
            Stage::WebAssets => OtaState::WebAssetsTransferring,
        }
    }

    pub fn done(stage: Stage) -> Self {
        match stage {
            Stage::Firmware => OtaState::FirmwareDone,
            Stage::WebAssets => OtaState::WebAssetsDone,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, OtaState::WebAssetsDone | OtaState::Failed { .. })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NoticeLevel {
    Info,
    Success,
    Warning,
    Error,
}

/// A toast-style message for the user.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Notice {
    pub level: NoticeLevel,
    pub title: String,
    pub message: String,
}

impl Notice {
    pub fn success(message: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            level: NoticeLevel::Success,
            title: title.into(),
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            level: NoticeLevel::Error,
            title: "Error".into(),
            message: message.into(),
        }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self {
            level: NoticeLevel::Warning,
            title: "Warning".into(),
            message: message.into(),
        }
    }

    pub fn info(message: impl Into<String>) -> Self {
        Self {
            level: NoticeLevel::Info,
            title: "Info".into(),
            message: message.into(),
        }
    }
}

// Everything the rendering layer gets to see, in order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OtaEvent {
    StateChanged(OtaState),
    Progress { stage: Stage, percent: Option<u8> },
    Notice(Notice),
    ReloadScheduled { after: Duration },
    Reload,
}
