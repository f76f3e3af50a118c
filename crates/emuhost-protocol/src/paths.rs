use std::path::PathBuf;

/// Returns the config/data directory path for emuhost.
pub fn dirs_path() -> PathBuf {
    if let Ok(config_dir) = std::env::var("XDG_CONFIG_HOME") {
        PathBuf::from(config_dir).join("emuhost")
    } else if let Ok(home) = std::env::var("HOME") {
        PathBuf::from(home).join(".config").join("emuhost")
    } else {
        PathBuf::from("/tmp/emuhost")
    }
}

/// Returns the default config file path for the local host runner.
pub fn config_path() -> PathBuf {
    dirs_path().join("config.toml")
}
