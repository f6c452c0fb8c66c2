use std::fs;
use std::path::Path;

use crate::error::{AppError, AppResult};
use crate::models::AppConfig;

const CONFIG_FILE: &str = "config.json";

pub fn load_app_config(data_dir: &Path) -> AppResult<AppConfig> {
    let config_path = data_dir.join(CONFIG_FILE);

    if !config_path.exists() {
        let config = AppConfig::new();
        let _ = save_app_config(data_dir, &config);
        return Ok(config);
    }

    let content = fs::read_to_string(&config_path)?;
    let config: AppConfig = serde_json::from_str(&content)
        .map_err(|e| AppError::Config(format!("failed_to_parse_config_file: {}", e)))?;
    Ok(config)
}

// Temp-file + rename so a crash mid-write never leaves a torn config behind.
pub fn save_app_config(data_dir: &Path, config: &AppConfig) -> AppResult<()> {
    fs::create_dir_all(data_dir)?;
    let config_path = data_dir.join(CONFIG_FILE);
    let tmp_path = data_dir.join(format!("{}.tmp", CONFIG_FILE));

    let content = serde_json::to_string_pretty(config)
        .map_err(|e| AppError::Config(format!("failed_to_serialize_config: {}", e)))?;

    fs::write(&tmp_path, content)?;
    fs::rename(&tmp_path, &config_path)?;
    Ok(())
}
