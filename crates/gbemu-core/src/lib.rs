//! Cycle-stepped Game Boy / Game Boy Color emulation core.
//!
//! This crate holds all of the emulator logic. Frontends drive it through the
//! [`gameboy::GameBoy`] facade, or through [`runner::Runner`] when emulation
//! should run on its own thread.

/// Sound channels, frame sequencer and mixer.
pub mod apu;

/// Memory map, I/O registers, DMA and joypad.
pub mod bus;

/// Cartridge header parsing, mappers (MBC) and battery RAM/RTC handling.
pub mod cartridge;

/// Settings loaded from TOML.
pub mod config;

/// SM83 CPU core.
pub mod cpu;

pub mod error;

/// High-level facade that wires every component into a single machine.
pub mod gameboy;

/// Decoded instruction tables.
pub mod opcodes;

/// Pixel Processing Unit (PPU) emulation.
pub mod ppu;

/// Threaded emulation loop.
pub mod runner;

/// Divider/timer unit.
pub mod timer;

pub use bus::Key;
pub use config::EmulatorConfig;
pub use error::{ConfigError, CpuError, EmuError, LoadError, StateError};
pub use gameboy::GameBoy;
pub use ppu::{SCREEN_HEIGHT, SCREEN_WIDTH};
pub use runner::{FrameBuffer, Runner};
