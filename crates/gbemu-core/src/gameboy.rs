use std::fs;
use std::path::{Path, PathBuf};

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::{
    apu::Apu,
    bus::{Bus, IoReg, Key},
    cartridge::Cartridge,
    config::EmulatorConfig,
    cpu::Cpu,
    error::{EmuError, LoadError, StateError},
    ppu::{FRAME_CYCLES, Ppu},
    timer::Timer,
};

/// Current save-state layout.
pub const STATE_VERSION: u32 = 1;

/// Identifies the cartridge a save state belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct RomId {
    title: String,
    header_checksum: u8,
}

impl RomId {
    fn of(cart: &Cartridge) -> Self {
        Self {
            title: cart.header.title.clone(),
            header_checksum: cart.header.header_checksum,
        }
    }
}

#[derive(Serialize)]
struct StateRef<'a> {
    version: u32,
    rom: RomId,
    cpu: &'a Cpu,
    bus: &'a Bus,
    timer: &'a Timer,
    ppu: &'a Ppu,
    apu: &'a Apu,
}

#[derive(Deserialize)]
struct StateVersion {
    version: u32,
}

#[derive(Deserialize)]
struct State {
    rom: RomId,
    cpu: Cpu,
    bus: Bus,
    timer: Timer,
    ppu: Ppu,
    apu: Apu,
}

/// The whole console: CPU, bus, timer, PPU and APU on one clock.
pub struct GameBoy {
    pub cpu: Cpu,
    pub bus: Bus,
    pub timer: Timer,
    pub ppu: Ppu,
    pub apu: Apu,
    config: EmulatorConfig,
    cgb: bool,
    rom_path: Option<PathBuf>,
}

impl GameBoy {
    /// Builds an empty console. Hardware mode is settled when a ROM is loaded.
    pub fn new(config: &EmulatorConfig) -> Self {
        let cgb = config.mode.resolve(false);
        Self {
            cpu: Cpu::new(),
            bus: Bus::new(cgb),
            timer: Timer::new(),
            ppu: Ppu::new(cgb, config.dmg_palette.shades()),
            apu: Apu::new(config.sample_rate),
            config: config.clone(),
            cgb,
            rom_path: None,
        }
    }

    pub fn config(&self) -> &EmulatorConfig {
        &self.config
    }

    pub fn is_cgb(&self) -> bool {
        self.cgb
    }

    pub fn rom_path(&self) -> Option<&Path> {
        self.rom_path.as_deref()
    }

    pub fn has_cartridge(&self) -> bool {
        self.bus.cart.is_some()
    }

    pub fn rom_title(&self) -> Option<&str> {
        self.bus.cart.as_ref().map(|c| c.header.title.as_str())
    }

    pub fn is_locked(&self) -> bool {
        self.cpu.locked
    }

    /// Loads a ROM (and its battery save) from disk and powers on.
    pub fn load_file(&mut self, path: &Path) -> Result<(), EmuError> {
        self.unload();
        let cart = Cartridge::from_file(path, self.config.save_dir.as_deref())?;
        self.rom_path = Some(path.to_path_buf());
        self.insert(cart)
    }

    /// Loads a ROM image held in memory. No battery save is attached.
    pub fn load_rom_bytes(&mut self, data: Vec<u8>) -> Result<(), EmuError> {
        self.unload();
        let cart = Cartridge::load(data)?;
        self.rom_path = None;
        self.insert(cart)
    }

    fn insert(&mut self, cart: Cartridge) -> Result<(), EmuError> {
        self.cgb = self.config.mode.resolve(cart.header.cgb_supported());
        self.rebuild();
        self.bus.install_cartridge(cart);
        self.boot()
    }

    /// Fresh components for the current hardware mode. Leaves the bus empty.
    fn rebuild(&mut self) {
        self.cpu = Cpu::new();
        self.bus = Bus::new(self.cgb);
        self.bus.set_strict_vram_timing(self.config.strict_vram_timing);
        self.timer = Timer::new();
        self.ppu = Ppu::new(self.cgb, self.config.dmg_palette.shades());
        self.apu = Apu::new(self.config.sample_rate);
    }

    fn boot_rom_path(&self) -> Option<&Path> {
        if self.cgb {
            self.config.cgb_boot_rom.as_deref()
        } else {
            self.config.dmg_boot_rom.as_deref()
        }
    }

    /// Maps the configured boot ROM, or applies the post-boot state when
    /// booting is skipped or no boot ROM is available.
    fn boot(&mut self) -> Result<(), EmuError> {
        if self.bus.boot_rom().is_none() && !self.config.skip_boot {
            match self.boot_rom_path().map(Path::to_path_buf) {
                Some(path) if path.exists() => {
                    let data = fs::read(&path).map_err(|source| LoadError::Io {
                        path: path.clone(),
                        source,
                    })?;
                    self.bus.load_boot_rom(data)?;
                }
                Some(path) => {
                    warn!(
                        "Boot ROM {} not found; skipping boot sequence",
                        path.display()
                    );
                }
                None => {}
            }
        }

        if self.bus.boot_mapped() {
            self.cpu.reset(false, self.cgb);
        } else {
            self.cpu.reset(true, self.cgb);
            self.bus.apply_post_boot_state();
        }
        Ok(())
    }

    /// Power cycle: RAM cleared, cartridge and boot ROM kept.
    pub fn reset(&mut self) -> Result<(), EmuError> {
        self.bus.reset();
        self.reset_components();
        self.boot()
    }

    /// Reset button: registers and mapper reset, RAM contents kept.
    pub fn soft_reset(&mut self) -> Result<(), EmuError> {
        self.bus.soft_reset();
        self.reset_components();
        self.boot()
    }

    fn reset_components(&mut self) {
        self.cpu = Cpu::new();
        self.timer = Timer::new();
        self.ppu = Ppu::new(self.cgb, self.config.dmg_palette.shades());
        self.apu = Apu::new(self.config.sample_rate);
    }

    /// Runs one CPU instruction and advances every other component by the
    /// cycles it took. Returns CPU cycles.
    pub fn step(&mut self) -> Result<u32, EmuError> {
        if self.bus.cart.is_none() {
            return Err(EmuError::NoCartridge);
        }

        let old_if = self.bus.reg(IoReg::If);
        let mut cycles = self.cpu.step(&mut self.bus)?;
        cycles += self.bus.take_stall_cycles();

        self.timer.update(cycles, old_if, &mut self.bus);

        let dots = if self.bus.double_speed() {
            cycles / 2
        } else {
            cycles
        };
        self.ppu.update(dots, &mut self.bus);
        self.apu.update(dots, &mut self.bus);
        self.bus.tick_dma(cycles);
        self.bus.tick_serial(cycles);
        if let Some(cart) = self.bus.cart.as_mut() {
            cart.step_rtc(dots);
        }
        Ok(cycles)
    }

    /// Runs until the PPU completes a frame, or a frame's worth of cycles
    /// passes with the LCD off. Returns the PPU cycles elapsed.
    pub fn run_frame(&mut self) -> Result<u32, EmuError> {
        let start = self.ppu.frames();
        let mut elapsed = 0u32;
        while self.ppu.frames() == start {
            let double = self.bus.double_speed();
            let cycles = self.step()?;
            elapsed += if double { cycles / 2 } else { cycles };
            let lcd_off = self.bus.reg(IoReg::Lcdc) & 0x80 == 0;
            if lcd_off && elapsed >= FRAME_CYCLES {
                break;
            }
        }
        Ok(elapsed)
    }

    pub fn key_down(&mut self, key: Key) {
        self.bus.press_key(key);
    }

    pub fn key_up(&mut self, key: Key) {
        self.bus.release_key(key);
    }

    /// RGBA8 pixels of the last completed frame.
    pub fn screen_data(&self) -> &[u8] {
        self.ppu.screen_data()
    }

    pub fn is_ready_to_draw(&self) -> bool {
        self.ppu.is_ready_to_draw()
    }

    pub fn clear_ready_to_draw(&mut self) {
        self.ppu.clear_ready_to_draw();
    }

    pub fn is_resized(&self) -> bool {
        self.ppu.is_resized()
    }

    pub fn clear_resized(&mut self) {
        self.ppu.clear_resized();
    }

    /// Interleaved stereo samples produced since the last call.
    pub fn take_audio_samples(&mut self) -> Vec<i16> {
        self.apu.take_samples()
    }

    /// Bytes shifted out of the serial port since the last call.
    pub fn take_serial_output(&mut self) -> Vec<u8> {
        self.bus.take_serial_output()
    }

    /// Writes battery-backed RAM to disk. A no-op without a battery cart.
    pub fn save_battery(&self) -> Result<(), StateError> {
        if let Some(cart) = self.bus.cart.as_ref() {
            cart.save_ram()?;
        }
        Ok(())
    }

    /// Saves the battery and ejects the cartridge.
    pub fn unload(&mut self) {
        if let Err(e) = self.save_battery() {
            warn!("Failed to write battery save: {e}");
        }
        if self.bus.take_cartridge().is_some() {
            info!("Cartridge unloaded");
        }
        self.rom_path = None;
    }

    /// Serializes the machine to JSON. ROM and boot ROM bytes are left out.
    pub fn snapshot(&self) -> Result<Vec<u8>, StateError> {
        let cart = self.bus.cart.as_ref().ok_or(StateError::NoCartridge)?;
        let state = StateRef {
            version: STATE_VERSION,
            rom: RomId::of(cart),
            cpu: &self.cpu,
            bus: &self.bus,
            timer: &self.timer,
            ppu: &self.ppu,
            apu: &self.apu,
        };
        Ok(serde_json::to_vec(&state)?)
    }

    /// Restores a snapshot taken from the same ROM.
    pub fn restore(&mut self, data: &[u8]) -> Result<(), StateError> {
        let cart = self.bus.cart.as_ref().ok_or(StateError::NoCartridge)?;
        let current = RomId::of(cart);

        let StateVersion { version } = serde_json::from_slice(data)?;
        if version != STATE_VERSION {
            return Err(StateError::Version {
                found: version,
                expected: STATE_VERSION,
            });
        }

        let state: State = serde_json::from_slice(data)?;
        if state.rom != current {
            return Err(StateError::RomMismatch {
                found: state.rom.title,
            });
        }

        let rom = cart.rom.clone();
        let save_path = cart.save_path().map(Path::to_path_buf);
        let boot_rom = self.bus.boot_rom().map(<[u8]>::to_vec);

        self.cpu = state.cpu;
        self.bus = state.bus;
        self.timer = state.timer;
        self.ppu = state.ppu;
        self.apu = state.apu;
        self.bus.restore_transient(rom, boot_rom);
        if let Some(cart) = self.bus.cart.as_mut() {
            cart.set_save_path(save_path);
        }
        self.cgb = self.bus.is_cgb();
        Ok(())
    }

    pub fn save_state(&self, path: &Path) -> Result<(), StateError> {
        let data = self.snapshot()?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, data)?;
        info!("Saved state to {}", path.display());
        Ok(())
    }

    pub fn load_state(&mut self, path: &Path) -> Result<(), StateError> {
        let data = fs::read(path)?;
        self.restore(&data)?;
        info!("Loaded state from {}", path.display());
        Ok(())
    }
}

impl Drop for GameBoy {
    fn drop(&mut self) {
        if let Err(e) = self.save_battery() {
            warn!("Failed to write battery save: {e}");
        }
    }
}
