//! Command-line configuration management

use anyhow::{Context, Result, anyhow};
use printer::TransferConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CliConfig {
    /// Printer selection; empty means auto-discovery
    #[serde(default)]
    pub printer: PrinterSettings,
    #[serde(default)]
    pub transfer: TransferConfig,
    #[serde(default)]
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PrinterSettings {
    /// Vendor ID in hex (e.g. "0x04b8")
    #[serde(default)]
    pub vendor_id: Option<String>,
    /// Product ID in hex (e.g. "0x0e15")
    #[serde(default)]
    pub product_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    #[serde(default = "LoggingSettings::default_level")]
    pub level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: Self::default_level(),
        }
    }
}

impl LoggingSettings {
    fn default_level() -> String {
        "info".to_string()
    }
}

impl CliConfig {
    /// Load configuration from file
    ///
    /// Without an explicit path the standard locations are tried in order.
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            PathBuf::from(shellexpand::tilde(&p.to_string_lossy()).as_ref())
        } else {
            let candidates = vec![
                Self::default_path(),
                PathBuf::from("/etc/usb-printer/config.toml"),
            ];

            candidates
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found"))?
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: CliConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        config.validate()?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Load configuration or return defaults if not found
    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                tracing::debug!("Failed to load config: {}, using defaults", e);
                Self::default()
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::info!("Saved configuration to: {}", path.display());
        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("usb-printer").join("config.toml")
        } else {
            PathBuf::from(".config/usb-printer/config.toml")
        }
    }

    /// Configured vendor/product pair, if any
    pub fn printer_ids(&self) -> Result<Option<(u16, u16)>> {
        match (&self.printer.vendor_id, &self.printer.product_id) {
            (Some(vid), Some(pid)) => Ok(Some((
                parse_hex_id(vid, "vendor_id")?,
                parse_hex_id(pid, "product_id")?,
            ))),
            (None, None) => Ok(None),
            _ => Err(anyhow!(
                "vendor_id and product_id must be given together"
            )),
        }
    }

    fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.logging.level,
                valid_levels.join(", ")
            ));
        }

        self.printer_ids()?;
        Ok(())
    }
}

/// Parse a `0x`-prefixed 16-bit USB id
pub fn parse_hex_id(id: &str, name: &str) -> Result<u16> {
    let Some(hex_part) = id.strip_prefix("0x").or_else(|| id.strip_prefix("0X")) else {
        return Err(anyhow!(
            "Invalid {} '{}', must start with '0x' (e.g., '0x1234')",
            name,
            id
        ));
    };

    if hex_part.is_empty() || hex_part.len() > 4 {
        return Err(anyhow!(
            "Invalid {} '{}', hex part must be 1-4 digits",
            name,
            id
        ));
    }

    u16::from_str_radix(hex_part, 16)
        .map_err(|_| anyhow!("Invalid {} '{}', not a valid hex number", name, id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_config(dir: &TempDir, content: &str) -> PathBuf {
        let path = dir.path().join("config.toml");
        fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_default_config() {
        let config = CliConfig::default();
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.transfer.write_timeout_ms, 5000);
        assert!(config.printer_ids().unwrap().is_none());
    }

    #[test]
    fn test_parse_hex_id() {
        assert_eq!(parse_hex_id("0x04b8", "vendor_id").unwrap(), 0x04b8);
        assert_eq!(parse_hex_id("0XE15", "product_id").unwrap(), 0x0e15);
        assert!(parse_hex_id("04b8", "vendor_id").is_err());
        assert!(parse_hex_id("0x", "vendor_id").is_err());
        assert!(parse_hex_id("0x12345", "vendor_id").is_err());
        assert!(parse_hex_id("0xGHIJ", "vendor_id").is_err());
    }

    #[test]
    fn test_load_partial_file() {
        let dir = TempDir::new().unwrap();
        let path = write_config(
            &dir,
            r#"
[printer]
vendor_id = "0x04b8"
product_id = "0x0e15"

[transfer]
read_timeout_ms = 250
"#,
        );

        let config = CliConfig::load(Some(path)).unwrap();
        assert_eq!(config.printer_ids().unwrap(), Some((0x04b8, 0x0e15)));
        assert_eq!(config.transfer.read_timeout_ms, 250);
        assert_eq!(config.transfer.write_timeout_ms, 5000);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_load_rejects_lone_vendor_id() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, "[printer]\nvendor_id = \"0x04b8\"\n");
        assert!(CliConfig::load(Some(path)).is_err());
    }

    #[test]
    fn test_load_rejects_bad_log_level() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, "[logging]\nlevel = \"loud\"\n");
        assert!(CliConfig::load(Some(path)).is_err());
    }

    #[test]
    fn test_load_missing_file() {
        let dir = TempDir::new().unwrap();
        assert!(CliConfig::load(Some(dir.path().join("absent.toml"))).is_err());
    }

    #[test]
    fn test_save_then_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = CliConfig::default();
        config.printer.vendor_id = Some("0x04b8".to_string());
        config.printer.product_id = Some("0x0202".to_string());
        config.logging.level = "debug".to_string();
        config.save(&path).unwrap();

        let loaded = CliConfig::load(Some(path)).unwrap();
        assert_eq!(loaded.printer_ids().unwrap(), Some((0x04b8, 0x0202)));
        assert_eq!(loaded.logging.level, "debug");
    }
}
