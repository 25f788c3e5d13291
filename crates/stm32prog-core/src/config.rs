//! Session and simulated board configuration.

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::protocol::constants::*;

/// Configuration for a programming session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// RAM address the flash layout is loaded to (reported in phase `Layout`).
    pub load_address: u32,
    /// Size of the layout buffer.
    pub layout_max_size: usize,
    /// Product id returned by get-id.
    pub device_id: u16,
    /// Delay after a packet checksum error.
    pub checksum_guard_delay_ms: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            load_address: 0xC000_0000,
            layout_max_size: FLASHLAYOUT_MAX_SIZE,
            device_id: DEVICE_ID,
            checksum_guard_delay_ms: CHECKSUM_GUARD_DELAY_MS,
        }
    }
}

impl SessionConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: SessionConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<std::path::Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

/// One simulated MMC device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MmcConfig {
    pub dev_id: u8,
    #[serde(default = "default_block_size")]
    pub block_size: u64,
    pub blocks: u64,
    #[serde(default = "default_erase_group")]
    pub erase_group_blocks: u64,
    #[serde(default)]
    pub boot_size: u64,
}

fn default_block_size() -> u64 {
    512
}

fn default_erase_group() -> u64 {
    1024
}

/// Simulated board used by the CLI `serve` and `check` commands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BoardConfig {
    /// OTP image size; `None` when the board has no OTP service.
    pub otp_size: Option<usize>,
    pub pmic: bool,
    /// RAM window served by read-memory.
    pub ram_base: u32,
    pub ram_size: usize,
    pub session: SessionConfig,
    pub mmc: Vec<MmcConfig>,
}

impl Default for BoardConfig {
    /// STM32MP15 evaluation board: SD card on mmc0, 4 GiB eMMC on mmc1.
    fn default() -> Self {
        Self {
            otp_size: Some(OTP_SIZE_SMC),
            pmic: true,
            ram_base: 0xC000_0000,
            ram_size: 0x0010_0000,
            session: SessionConfig::default(),
            mmc: vec![
                MmcConfig {
                    dev_id: 0,
                    block_size: 512,
                    blocks: 0x0040_0000,
                    erase_group_blocks: 1,
                    boot_size: 0,
                },
                MmcConfig {
                    dev_id: 1,
                    block_size: 512,
                    blocks: 0x0074_0000,
                    erase_group_blocks: 1024,
                    boot_size: 0x0040_0000,
                },
            ],
        }
    }
}

impl BoardConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: BoardConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<std::path::Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.load_address, 0xC000_0000);
        assert_eq!(config.layout_max_size, 0x40000);
        assert_eq!(config.device_id, 0x0500);
        assert_eq!(config.checksum_guard_delay_ms, 30);
    }

    #[test]
    fn test_board_config_toml() {
        let text = r#"
            otp_size = 776
            pmic = false

            [session]
            load_address = 0xC2000000

            [[mmc]]
            dev_id = 2
            blocks = 65536
        "#;
        let config: BoardConfig = toml::from_str(text).unwrap();
        assert_eq!(config.otp_size, Some(OTP_SIZE_TA));
        assert!(!config.pmic);
        assert_eq!(config.session.load_address, 0xC200_0000);
        assert_eq!(config.session.device_id, DEVICE_ID);
        assert_eq!(config.mmc.len(), 1);
        assert_eq!(config.mmc[0].block_size, 512);
        assert_eq!(config.mmc[0].erase_group_blocks, 1024);
        assert_eq!(config.ram_base, 0xC000_0000);
    }

    #[test]
    fn test_board_config_file_roundtrip() {
        let path = std::env::temp_dir().join(format!("stm32prog-board-{}.toml", std::process::id()));
        let config = BoardConfig::default();
        config.save_to_file(&path).unwrap();
        let loaded = BoardConfig::load_from_file(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(loaded, config);
    }
}
