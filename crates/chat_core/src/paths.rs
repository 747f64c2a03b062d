use std::path::PathBuf;

/// Application directory (~/.ollama-chat)
pub fn app_dir() -> PathBuf {
    std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .map(PathBuf::from)
        .unwrap_or_else(|| std::env::temp_dir())
        .join(".ollama-chat")
}

/// Path of config.json
pub fn config_json_path() -> PathBuf {
    app_dir().join("config.json")
}

/// Default chat database location
///
/// Prefers the platform data directory and falls back to the app directory.
pub fn default_database_path() -> PathBuf {
    dirs::data_dir()
        .map(|dir| dir.join("ollama-chat"))
        .unwrap_or_else(app_dir)
        .join("chats.db")
}
