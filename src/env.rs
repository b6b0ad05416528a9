use std::env;
use std::path::PathBuf;

/// Returns the root directory used by the console.
pub fn default_app_dir() -> PathBuf {
    let base = match env::consts::OS {
        "windows" => env::var_os("LOCALAPPDATA")
            .or_else(|| env::var_os("APPDATA"))
            .map(PathBuf::from),
        "macos" => env::var_os("HOME")
            .map(PathBuf::from)
            .map(|home| home.join("Library").join("Application Support")),
        _ => env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .or_else(|| {
                env::var_os("HOME")
                    .map(PathBuf::from)
                    .map(|home| home.join(".config"))
            }),
    }
    .unwrap_or_else(|| PathBuf::from("."));

    base.join("axe-console")
}

pub fn config_path() -> PathBuf {
    default_app_dir().join("config.json")
}
