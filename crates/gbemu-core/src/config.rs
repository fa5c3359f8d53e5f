use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use log::warn;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum HardwareMode {
    /// Pick CGB when the header advertises CGB support.
    #[default]
    Auto,
    Dmg,
    Cgb,
}

impl HardwareMode {
    pub fn resolve(self, header_cgb: bool) -> bool {
        match self {
            Self::Auto => header_cgb,
            Self::Dmg => false,
            Self::Cgb => true,
        }
    }
}

/// Four-shade palette used when rendering DMG frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum DmgPalette {
    #[default]
    Grey,
    Green,
    /// 0xRRGGBB values from lightest to darkest.
    Custom([u32; 4]),
}

impl DmgPalette {
    pub fn shades(&self) -> [u32; 4] {
        match self {
            Self::Grey => [0xFFFFFF, 0xAAAAAA, 0x555555, 0x000000],
            Self::Green => [0x9BBC0F, 0x8BAC0F, 0x306230, 0x0F380F],
            Self::Custom(c) => *c,
        }
    }
}

/// Frontend key names mapped to joypad buttons.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyBindings {
    pub map: BTreeMap<String, String>,
}

impl Default for KeyBindings {
    fn default() -> Self {
        let map = [
            ("right", "Right"),
            ("left", "Left"),
            ("up", "Up"),
            ("down", "Down"),
            ("a", "X"),
            ("b", "Z"),
            ("select", "Backspace"),
            ("start", "Enter"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        Self { map }
    }
}

/// Settings built once at startup and handed to [`crate::gameboy::GameBoy::new`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmulatorConfig {
    pub mode: HardwareMode,
    pub skip_boot: bool,
    pub dmg_boot_rom: Option<PathBuf>,
    pub cgb_boot_rom: Option<PathBuf>,
    pub dmg_palette: DmgPalette,
    /// Block CPU VRAM access during pixel transfer.
    pub strict_vram_timing: bool,
    pub sample_rate: u32,
    /// Directory for battery saves; defaults to the ROM's directory.
    pub save_dir: Option<PathBuf>,
    pub keys: KeyBindings,
}

impl Default for EmulatorConfig {
    fn default() -> Self {
        Self {
            mode: HardwareMode::Auto,
            skip_boot: true,
            dmg_boot_rom: None,
            cgb_boot_rom: None,
            dmg_palette: DmgPalette::Grey,
            strict_vram_timing: false,
            sample_rate: 48_000,
            save_dir: None,
            keys: KeyBindings::default(),
        }
    }
}

pub fn default_config_path() -> PathBuf {
    if let Some(xdg) = std::env::var_os("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("gbemu").join("config.toml");
    }

    if let Some(home) = std::env::var_os("HOME") {
        return PathBuf::from(home)
            .join(".config")
            .join("gbemu")
            .join("config.toml");
    }

    PathBuf::from("gbemu.toml")
}

pub fn load_from_file(path: &Path) -> EmulatorConfig {
    let text = match std::fs::read_to_string(path) {
        Ok(s) => s,
        Err(_) => return EmulatorConfig::default(),
    };

    match toml::from_str::<EmulatorConfig>(&text) {
        Ok(cfg) => cfg,
        Err(e) => {
            warn!(
                "Failed to parse config {}: {e}; using defaults",
                path.display()
            );
            EmulatorConfig::default()
        }
    }
}

pub fn save_to_file(path: &Path, cfg: &EmulatorConfig) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let text = toml::to_string_pretty(cfg)?;
    std::fs::write(path, text)?;
    Ok(())
}
