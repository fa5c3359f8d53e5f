use std::path::PathBuf;

use thiserror::Error;

/// Failures while loading a cartridge or boot ROM.
#[derive(Error, Debug)]
pub enum LoadError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("unsupported cartridge type {0:#04X}")]
    UnsupportedCartridge(u8),

    #[error("ROM is truncated: expected at least {expected} bytes, got {actual}")]
    TruncatedRom { expected: usize, actual: usize },

    #[error("boot ROM has invalid size {actual} (expected {expected})")]
    BadBootRom { expected: usize, actual: usize },
}

/// Conditions that stop the CPU.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuError {
    #[error("illegal opcode {opcode:#04X} at {pc:#06X}; CPU locked up")]
    IllegalOpcode { opcode: u8, pc: u16 },

    #[error("CPU is locked up at {pc:#06X}")]
    Locked { pc: u16 },
}

/// Failures while writing or restoring a save state.
#[derive(Error, Debug)]
pub enum StateError {
    #[error("save state I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("save state is malformed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("save state version {found} is not supported (expected {expected})")]
    Version { found: u32, expected: u32 },

    #[error("save state belongs to a different ROM ({found:?})")]
    RomMismatch { found: String },

    #[error("no cartridge loaded")]
    NoCartridge,
}

/// Failures while persisting configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("config I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("config could not be serialized: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Umbrella error for the machine facade.
#[derive(Error, Debug)]
pub enum EmuError {
    #[error(transparent)]
    Load(#[from] LoadError),

    #[error(transparent)]
    Cpu(#[from] CpuError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error("no cartridge loaded")]
    NoCartridge,
}
