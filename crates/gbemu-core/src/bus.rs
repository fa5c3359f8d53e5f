//! Memory map and hardware register plumbing.
//!
//! The bus owns every addressable byte: cartridge, VRAM, WRAM, OAM and the
//! I/O/HRAM page. Other components reach hardware registers through
//! [`IoReg`] handles instead of holding references into the arena.

use std::path::{Path, PathBuf};

use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::apu::Sound;
use crate::cartridge::Cartridge;
use crate::error::LoadError;

pub const VRAM_BANK_SIZE: usize = 0x2000;
pub const WRAM_BANK_SIZE: usize = 0x1000;
const OAM_SIZE: usize = 0xA0;
const PAL_RAM_SIZE: usize = 0x40;
const OAM_DMA_LEN: u16 = 0xA0;
const DMG_BOOT_ROM_SIZE: usize = 0x100;
const CGB_BOOT_ROM_SIZE: usize = 0x900;
// Eight bits at 8192 Hz.
const SERIAL_TRANSFER_CYCLES: u32 = 8 * 512;

pub const INT_VBLANK: u8 = 0x01;
pub const INT_STAT: u8 = 0x02;
pub const INT_TIMER: u8 = 0x04;
pub const INT_SERIAL: u8 = 0x08;
pub const INT_JOYPAD: u8 = 0x10;

/// Typed handle to a memory-mapped hardware register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum IoReg {
    P1 = 0xFF00,
    Sb = 0xFF01,
    Sc = 0xFF02,
    Div = 0xFF04,
    Tima = 0xFF05,
    Tma = 0xFF06,
    Tac = 0xFF07,
    If = 0xFF0F,
    Lcdc = 0xFF40,
    Stat = 0xFF41,
    Scy = 0xFF42,
    Scx = 0xFF43,
    Ly = 0xFF44,
    Lyc = 0xFF45,
    Dma = 0xFF46,
    Bgp = 0xFF47,
    Obp0 = 0xFF48,
    Obp1 = 0xFF49,
    Wy = 0xFF4A,
    Wx = 0xFF4B,
    Key1 = 0xFF4D,
    Vbk = 0xFF4F,
    Svbk = 0xFF70,
    Ie = 0xFFFF,
}

impl IoReg {
    #[inline]
    fn index(self) -> usize {
        (self as u16 & 0xFF) as usize
    }
}

/// Backing store a fast-map page resolves into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Area {
    Rom,
    Vram,
    Wram,
}

/// One 256-byte page of the fast map: `base` is the offset of the page's
/// first byte within `area`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FastEntry {
    pub area: Area,
    pub base: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Key {
    Right,
    Left,
    Up,
    Down,
    A,
    B,
    Select,
    Start,
}

impl Key {
    /// (is_action_key, bit)
    fn line(self) -> (bool, u8) {
        match self {
            Key::Right => (false, 0x01),
            Key::Left => (false, 0x02),
            Key::Up => (false, 0x04),
            Key::Down => (false, 0x08),
            Key::A => (true, 0x01),
            Key::B => (true, 0x02),
            Key::Select => (true, 0x04),
            Key::Start => (true, 0x08),
        }
    }
}

/// Registers whose mid-scanline writes the renderer replays per pixel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LatchedReg {
    Bgp,
    Obp0,
    Obp1,
    BgEnable,
}

/// A register write that happened while pixel `x` of the current line was
/// being drawn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanlineChange {
    pub x: u8,
    pub reg: LatchedReg,
    pub value: u8,
}

/// Writes the timer consumes at its next update.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimerWrites {
    pub div_reset: bool,
    pub tima: bool,
    pub tma: bool,
    pub tac: bool,
    pub if_reg: bool,
}

/// CGB palette index register (BCPS/OCPS).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaletteSpec(u8);

impl PaletteSpec {
    pub fn index(self) -> usize {
        (self.0 & 0x3F) as usize
    }

    pub fn auto_increment(self) -> bool {
        self.0 & 0x80 != 0
    }

    pub fn set(&mut self, val: u8) {
        self.0 = val & 0xBF;
    }

    pub fn read(self) -> u8 {
        self.0 | 0x40
    }

    fn advance(&mut self) {
        if self.auto_increment() {
            self.0 = 0x80 | ((self.0 + 1) & 0x3F);
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaletteRam {
    pub spec: PaletteSpec,
    pub data: Vec<u8>,
}

impl PaletteRam {
    fn new() -> Self {
        Self {
            spec: PaletteSpec::default(),
            data: vec![0xFF; PAL_RAM_SIZE],
        }
    }

    fn write_data(&mut self, val: u8) {
        self.data[self.spec.index()] = val;
        self.spec.advance();
    }

    fn read_data(&self) -> u8 {
        self.data[self.spec.index()]
    }

    /// Little-endian BGR555 colour.
    pub fn color(&self, palette: usize, color_id: usize) -> u16 {
        let off = (palette * 8 + color_id * 2) & 0x3F;
        u16::from_le_bytes([self.data[off], self.data[off + 1]])
    }

    fn load(&mut self, palette: usize, colors: [u16; 4]) {
        for (i, c) in colors.iter().enumerate() {
            let [lo, hi] = c.to_le_bytes();
            self.data[palette * 8 + i * 2] = lo;
            self.data[palette * 8 + i * 2 + 1] = hi;
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct OamDma {
    /// Source written to 0xFF46, picked up at the next tick.
    setup: Option<u16>,
    source: u16,
    index: u16,
    active: bool,
    /// First step of a transfer that did not interrupt another one.
    fresh: bool,
    /// A running transfer was cut off by a new 0xFF46 write.
    #[serde(default)]
    restarted: bool,
    remainder: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
enum HdmaMode {
    General,
    HBlank,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct HdmaState {
    src: u16,
    dst: u16,
    /// Remaining 0x10-byte blocks.
    blocks: u8,
    mode: HdmaMode,
    active: bool,
    cancelled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bus {
    pub cart: Option<Cartridge>,
    #[serde(skip)]
    boot_rom: Option<Vec<u8>>,
    boot_mapped: bool,
    cgb: bool,
    dmg_compat: bool,
    strict_vram: bool,
    vram: Vec<u8>,
    wram: Vec<u8>,
    oam: Vec<u8>,
    /// 0xFF00-0xFFFF: I/O registers, HRAM and IE.
    io: Vec<u8>,
    pub sound: Sound,
    vram_bank: usize,
    wram_bank: usize,
    #[serde(skip)]
    fast_map: Vec<Option<FastEntry>>,
    pub bg_palettes: PaletteRam,
    pub obj_palettes: PaletteRam,
    /// Cleared by the PPU during OAM scan and pixel transfer.
    pub oam_accessible: bool,
    pub vram_accessible: bool,
    /// Pixel the PPU is drawing; keys mid-scanline register writes.
    pub cur_scanline_x: u8,
    scanline_changes: Vec<ScanlineChange>,
    dma: OamDma,
    hdma: HdmaState,
    stall_cycles: u32,
    timer_writes: TimerWrites,
    direction_keys: u8,
    action_keys: u8,
    /// Set on any new key press; consumed by the CPU while stopped.
    key_pressed: bool,
    serial_countdown: u32,
    #[serde(skip)]
    serial_out: Vec<u8>,
}

impl Bus {
    pub fn new(cgb: bool) -> Self {
        let mut bus = Self {
            cart: None,
            boot_rom: None,
            boot_mapped: false,
            cgb,
            dmg_compat: false,
            strict_vram: false,
            vram: vec![0; VRAM_BANK_SIZE * 2],
            wram: vec![0; WRAM_BANK_SIZE * 8],
            oam: vec![0; OAM_SIZE],
            io: vec![0; 0x100],
            sound: Sound::new(cgb),
            vram_bank: 0,
            wram_bank: 1,
            fast_map: Vec::new(),
            bg_palettes: PaletteRam::new(),
            obj_palettes: PaletteRam::new(),
            oam_accessible: true,
            vram_accessible: true,
            cur_scanline_x: 0,
            scanline_changes: Vec::new(),
            dma: OamDma::default(),
            hdma: HdmaState {
                src: 0,
                dst: 0x8000,
                blocks: 0,
                mode: HdmaMode::General,
                active: false,
                cancelled: false,
            },
            stall_cycles: 0,
            timer_writes: TimerWrites::default(),
            direction_keys: 0,
            action_keys: 0,
            key_pressed: false,
            serial_countdown: 0,
            serial_out: Vec::new(),
        };
        bus.init_io();
        bus.refill_fast_map();
        bus
    }

    pub fn is_cgb(&self) -> bool {
        self.cgb
    }

    /// CGB hardware running a DMG-only cartridge.
    pub fn dmg_compat(&self) -> bool {
        self.dmg_compat
    }

    pub fn set_strict_vram_timing(&mut self, strict: bool) {
        self.strict_vram = strict;
    }

    pub fn strict_vram_timing(&self) -> bool {
        self.strict_vram
    }

    pub fn double_speed(&self) -> bool {
        self.io[IoReg::Key1.index()] & 0x80 != 0
    }

    pub fn speed_switch_armed(&self) -> bool {
        self.cgb && self.io[IoReg::Key1.index()] & 0x01 != 0
    }

    /// Performs the KEY1 speed switch requested by STOP.
    pub fn switch_speed(&mut self) {
        let key1 = &mut self.io[IoReg::Key1.index()];
        *key1 = (*key1 ^ 0x80) & 0xFE;
        debug!(
            "Speed switch: double speed {}",
            if self.double_speed() { "on" } else { "off" }
        );
    }

    fn init_io(&mut self) {
        self.io.fill(0);
        self.io[IoReg::P1.index()] = 0xCF;
        self.io[IoReg::Sc.index()] = 0x7E;
        self.io[IoReg::Tac.index()] = 0xF8;
        self.io[IoReg::If.index()] = 0xE0;
        self.io[IoReg::Stat.index()] = 0x80;
        self.io[IoReg::Key1.index()] = if self.cgb { 0x7E } else { 0xFF };
        self.io[IoReg::Vbk.index()] = if self.cgb { 0xFE } else { 0xFF };
        self.io[IoReg::Svbk.index()] = if self.cgb { 0xF9 } else { 0xFF };
    }

    /// Register values the boot ROM leaves behind.
    pub fn apply_post_boot_state(&mut self) {
        self.io[IoReg::Lcdc.index()] = 0x91;
        self.io[IoReg::Stat.index()] = 0x81;
        self.io[IoReg::Dma.index()] = 0xFF;
        self.io[IoReg::Bgp.index()] = 0xFC;
        self.io[IoReg::If.index()] = 0xE1;
        self.sound.apply_post_boot_state();
        self.boot_mapped = false;
        if self.dmg_compat {
            self.apply_dmg_compatibility_palettes();
        }
        self.refill_fast_map();
    }

    /// Palettes the CGB boot ROM installs for DMG-only cartridges.
    fn apply_dmg_compatibility_palettes(&mut self) {
        const OBJ_PAL: [u16; 4] = [0x7FFF, 0x421F, 0x1CF2, 0x0000];
        const BG_PAL: [u16; 4] = [0x7FFF, 0x1BEF, 0x6180, 0x0000];
        self.bg_palettes.load(0, BG_PAL);
        self.obj_palettes.load(0, OBJ_PAL);
        self.obj_palettes.load(1, OBJ_PAL);
        self.io[IoReg::Bgp.index()] = 0xE4;
        self.io[IoReg::Obp0.index()] = 0xD0;
        self.io[IoReg::Obp1.index()] = 0xE0;
    }

    pub fn load_cartridge(&mut self, path: &Path, save_dir: Option<&Path>) -> Result<(), LoadError> {
        let cart = Cartridge::from_file(path, save_dir)?;
        self.install_cartridge(cart);
        Ok(())
    }

    pub fn load_cartridge_bytes(
        &mut self,
        data: Vec<u8>,
        save_path: Option<PathBuf>,
    ) -> Result<(), LoadError> {
        let mut cart = Cartridge::load(data)?;
        if cart.kind.has_battery() {
            cart.set_save_path(save_path);
        }
        self.install_cartridge(cart);
        Ok(())
    }

    pub fn install_cartridge(&mut self, cart: Cartridge) {
        self.dmg_compat = self.cgb && !cart.header.cgb_supported();
        self.cart = Some(cart);
        if self.dmg_compat {
            self.apply_dmg_compatibility_palettes();
        }
        self.refill_fast_map();
    }

    pub fn take_cartridge(&mut self) -> Option<Cartridge> {
        let cart = self.cart.take();
        self.refill_fast_map();
        cart
    }

    pub fn load_boot_rom(&mut self, data: Vec<u8>) -> Result<(), LoadError> {
        let expected = if self.cgb {
            CGB_BOOT_ROM_SIZE
        } else {
            DMG_BOOT_ROM_SIZE
        };
        if data.len() != expected {
            return Err(LoadError::BadBootRom {
                expected,
                actual: data.len(),
            });
        }
        self.boot_rom = Some(data);
        self.boot_mapped = true;
        self.refill_fast_map();
        info!("Boot ROM mapped ({} bytes)", expected);
        Ok(())
    }

    pub fn boot_rom(&self) -> Option<&[u8]> {
        self.boot_rom.as_deref()
    }

    pub fn boot_mapped(&self) -> bool {
        self.boot_mapped
    }

    /// Power-on reset: clears all memory, keeps the cartridge ROM and boot ROM.
    pub fn reset(&mut self) {
        let cart = self.cart.take().map(|mut c| {
            c.ram.fill(0);
            c.reset_mapper();
            c
        });
        let boot_rom = self.boot_rom.take();
        let strict = self.strict_vram;
        *self = Self::new(self.cgb);
        self.strict_vram = strict;
        if let Some(cart) = cart {
            self.install_cartridge(cart);
        }
        if let Some(rom) = boot_rom {
            self.boot_rom = Some(rom);
            self.boot_mapped = true;
        }
        self.refill_fast_map();
    }

    /// Resets bank selections and registers but keeps RAM contents.
    pub fn soft_reset(&mut self) {
        if let Some(cart) = self.cart.as_mut() {
            cart.reset_mapper();
        }
        self.vram_bank = 0;
        self.wram_bank = 1;
        self.dma = OamDma::default();
        self.hdma.active = false;
        self.hdma.cancelled = false;
        self.stall_cycles = 0;
        self.timer_writes = TimerWrites::default();
        self.scanline_changes.clear();
        self.oam_accessible = true;
        self.vram_accessible = true;
        self.sound = Sound::new(self.cgb);
        let hram = self.io[0x80..].to_vec();
        self.init_io();
        self.io[0x80..].copy_from_slice(&hram);
        self.boot_mapped = self.boot_rom.is_some();
        self.refill_fast_map();
    }

    #[inline]
    pub fn reg(&self, reg: IoReg) -> u8 {
        self.io[reg.index()]
    }

    #[inline]
    pub fn set_reg(&mut self, reg: IoReg, val: u8) {
        self.io[reg.index()] = val;
    }

    #[inline]
    pub fn reg_mut(&mut self, reg: IoReg) -> &mut u8 {
        &mut self.io[reg.index()]
    }

    pub fn request_interrupt(&mut self, mask: u8) {
        self.io[IoReg::If.index()] |= mask;
    }

    pub fn take_timer_writes(&mut self) -> TimerWrites {
        std::mem::take(&mut self.timer_writes)
    }

    pub fn vram(&self) -> &[u8] {
        &self.vram
    }

    pub fn oam(&self) -> &[u8] {
        &self.oam
    }

    pub fn scanline_changes(&self) -> &[ScanlineChange] {
        &self.scanline_changes
    }

    pub fn clear_scanline_changes(&mut self) {
        self.scanline_changes.clear();
    }

    pub fn fast_map(&self) -> &[Option<FastEntry>] {
        &self.fast_map
    }

    pub fn take_serial_output(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.serial_out)
    }

    /// Cycles the CPU loses to general-purpose and HBlank VRAM DMA.
    pub fn take_stall_cycles(&mut self) -> u32 {
        std::mem::take(&mut self.stall_cycles)
    }

    pub fn oam_dma_active(&self) -> bool {
        self.dma.active
    }

    /// Rebuilds the whole fast map from the current banking state.
    pub fn refill_fast_map(&mut self) {
        self.fast_map.clear();
        self.fast_map.resize(0x100, None);
        self.refill_pages(0x00..=0xFF);
    }

    fn refill_pages(&mut self, pages: std::ops::RangeInclusive<usize>) {
        if self.fast_map.len() != 0x100 {
            self.fast_map.resize(0x100, None);
        }
        for page in pages {
            self.fast_map[page] = self.resolve_page(page);
        }
    }

    fn resolve_page(&self, page: usize) -> Option<FastEntry> {
        let boot_page = self.boot_mapped
            && (page == 0x00 || (self.cgb && (0x02..=0x08).contains(&page)));
        match page {
            _ if boot_page => None,
            0x00..=0x3F => self.cart.as_ref().map(|c| FastEntry {
                area: Area::Rom,
                base: c.low_bank_offset() + (page << 8),
            }),
            0x40..=0x7F => self.cart.as_ref().map(|c| FastEntry {
                area: Area::Rom,
                base: c.high_bank_offset() + ((page - 0x40) << 8),
            }),
            0x80..=0x9F => Some(FastEntry {
                area: Area::Vram,
                base: self.vram_bank * VRAM_BANK_SIZE + ((page - 0x80) << 8),
            }),
            0xC0..=0xCF => Some(FastEntry {
                area: Area::Wram,
                base: (page - 0xC0) << 8,
            }),
            0xD0..=0xDF => Some(FastEntry {
                area: Area::Wram,
                base: self.wram_bank * WRAM_BANK_SIZE + ((page - 0xD0) << 8),
            }),
            _ => None,
        }
    }

    pub fn read(&self, addr: u16) -> u8 {
        if let Some(Some(entry)) = self.fast_map.get((addr >> 8) as usize) {
            let off = entry.base + (addr & 0xFF) as usize;
            return match entry.area {
                Area::Rom => self
                    .cart
                    .as_ref()
                    .and_then(|c| c.rom.get(off).copied())
                    .unwrap_or(0xFF),
                Area::Vram if self.vram_accessible => self.vram[off],
                Area::Vram => 0xFF,
                Area::Wram => self.wram[off],
            };
        }
        self.read_slow(addr)
    }

    /// Resolves an address through the full redirect logic, ignoring the fast map.
    pub fn read_slow(&self, addr: u16) -> u8 {
        match addr {
            0x0000..=0x00FF if self.boot_mapped => self.boot_byte(addr),
            0x0200..=0x08FF if self.boot_mapped && self.cgb => self.boot_byte(addr),
            0x0000..=0x7FFF => self.cart.as_ref().map_or(0xFF, |c| c.read_rom(addr)),
            0x8000..=0x9FFF => {
                if self.vram_accessible {
                    self.vram[self.vram_bank * VRAM_BANK_SIZE + (addr as usize - 0x8000)]
                } else {
                    0xFF
                }
            }
            0xA000..=0xBFFF => self.cart.as_ref().map_or(0xFF, |c| c.read_ram(addr)),
            0xC000..=0xCFFF => self.wram[addr as usize - 0xC000],
            0xD000..=0xDFFF => self.wram[self.wram_bank * WRAM_BANK_SIZE + (addr as usize - 0xD000)],
            0xE000..=0xFDFF => self.read_slow(addr - 0x2000),
            0xFE00..=0xFE9F => {
                let idx = (addr - 0xFE00) as usize;
                if self.dma.active {
                    if self.dma.fresh && idx == 0 {
                        self.oam[0]
                    } else {
                        0xFF
                    }
                } else if self.oam_accessible {
                    self.oam[idx]
                } else {
                    0xFF
                }
            }
            0xFEA0..=0xFEFF => {
                if self.cgb {
                    0xFF
                } else {
                    0x00
                }
            }
            0xFF00..=0xFFFF => self.read_io(addr),
        }
    }

    fn boot_byte(&self, addr: u16) -> u8 {
        self.boot_rom
            .as_ref()
            .and_then(|b| b.get(addr as usize).copied())
            .unwrap_or(0xFF)
    }

    pub fn read16(&self, addr: u16) -> u16 {
        u16::from_le_bytes([self.read(addr), self.read(addr.wrapping_add(1))])
    }

    pub fn write16(&mut self, addr: u16, val: u16) {
        let [lo, hi] = val.to_le_bytes();
        self.write(addr, lo);
        self.write(addr.wrapping_add(1), hi);
    }

    fn read_io(&self, addr: u16) -> u8 {
        let idx = (addr & 0xFF) as usize;
        match addr {
            0xFF00 => {
                let select = self.io[idx];
                let mut low = 0x0F;
                if select & 0x10 == 0 {
                    low &= !self.direction_keys;
                }
                if select & 0x20 == 0 {
                    low &= !self.action_keys;
                }
                0xC0 | (select & 0x30) | (low & 0x0F)
            }
            0xFF01 | 0xFF02 | 0xFF04..=0xFF07 | 0xFF0F => self.io[idx],
            0xFF10..=0xFF3F => self.sound.read_reg(addr),
            0xFF40..=0xFF4B => self.io[idx],
            0xFF4D | 0xFF4F | 0xFF70 if self.cgb => self.io[idx],
            0xFF55 if self.cgb => {
                if self.hdma.active {
                    self.hdma.blocks.saturating_sub(1) & 0x7F
                } else if self.hdma.cancelled {
                    0x80
                } else {
                    0xFF
                }
            }
            0xFF68 if self.cgb => self.bg_palettes.spec.read(),
            0xFF69 if self.cgb => self.bg_palettes.read_data(),
            0xFF6A if self.cgb => self.obj_palettes.spec.read(),
            0xFF6B if self.cgb => self.obj_palettes.read_data(),
            0xFF80..=0xFFFF => self.io[idx],
            _ => 0xFF,
        }
    }

    pub fn write(&mut self, addr: u16, val: u8) {
        match addr {
            0x0000..=0x7FFF => {
                let changed = self
                    .cart
                    .as_mut()
                    .is_some_and(|c| c.write_control(addr, val));
                if changed {
                    self.refill_pages(0x00..=0x7F);
                }
            }
            0x8000..=0x9FFF => {
                if self.vram_accessible {
                    self.vram[self.vram_bank * VRAM_BANK_SIZE + (addr as usize - 0x8000)] = val;
                }
            }
            0xA000..=0xBFFF => {
                if let Some(cart) = self.cart.as_mut() {
                    cart.write_ram(addr, val);
                }
            }
            0xC000..=0xCFFF => self.wram[addr as usize - 0xC000] = val,
            0xD000..=0xDFFF => {
                self.wram[self.wram_bank * WRAM_BANK_SIZE + (addr as usize - 0xD000)] = val
            }
            0xE000..=0xFDFF => self.write(addr - 0x2000, val),
            0xFE00..=0xFE9F => {
                if self.oam_accessible && !self.dma.active {
                    self.oam[(addr - 0xFE00) as usize] = val;
                }
            }
            0xFEA0..=0xFEFF => {}
            0xFF00..=0xFFFF => self.write_io(addr, val),
        }
    }

    fn write_io(&mut self, addr: u16, val: u8) {
        let idx = (addr & 0xFF) as usize;
        match addr {
            0xFF00 => self.io[idx] = 0xC0 | (val & 0x30) | (self.io[idx] & 0x0F),
            0xFF01 => self.io[idx] = val,
            0xFF02 => {
                self.io[idx] = val | 0x7E;
                if val & 0x81 == 0x81 {
                    self.serial_out.push(self.io[IoReg::Sb.index()]);
                    self.serial_countdown = SERIAL_TRANSFER_CYCLES;
                }
            }
            0xFF04 => {
                self.io[idx] = 0;
                self.timer_writes.div_reset = true;
            }
            0xFF05 => {
                self.io[idx] = val;
                self.timer_writes.tima = true;
            }
            0xFF06 => {
                self.io[idx] = val;
                self.timer_writes.tma = true;
            }
            0xFF07 => {
                self.io[idx] = val | 0xF8;
                self.timer_writes.tac = true;
            }
            0xFF0F => {
                self.io[idx] = val | 0xE0;
                self.timer_writes.if_reg = true;
            }
            0xFF10..=0xFF3F => self.sound.write_reg(addr, val),
            0xFF40 => {
                let old = self.io[idx];
                self.io[idx] = val;
                if (old ^ val) & 0x01 != 0 {
                    self.latch_change(LatchedReg::BgEnable, val & 0x01);
                }
                if old & 0x80 != 0 && val & 0x80 == 0 {
                    self.oam_accessible = true;
                    self.vram_accessible = true;
                    self.io[IoReg::Stat.index()] &= !0x03;
                    self.io[IoReg::Ly.index()] = 0;
                    self.complete_active_hdma();
                }
            }
            0xFF41 => self.io[idx] = 0x80 | (val & 0x78) | (self.io[idx] & 0x07),
            0xFF44 => {}
            0xFF46 => {
                self.io[idx] = val;
                self.dma.setup = Some((val as u16) << 8);
                self.dma.restarted |= self.dma.active;
                self.dma.active = false;
            }
            0xFF47 => self.write_palette_reg(idx, LatchedReg::Bgp, val),
            0xFF48 => self.write_palette_reg(idx, LatchedReg::Obp0, val),
            0xFF49 => self.write_palette_reg(idx, LatchedReg::Obp1, val),
            0xFF42 | 0xFF43 | 0xFF45 | 0xFF4A | 0xFF4B => self.io[idx] = val,
            0xFF4D if self.cgb => self.io[idx] = (self.io[idx] & 0x80) | 0x7E | (val & 0x01),
            0xFF4F if self.cgb => {
                self.vram_bank = (val & 0x01) as usize;
                self.io[idx] = 0xFE | val & 0x01;
                self.refill_pages(0x80..=0x9F);
            }
            0xFF50 => {
                if val != 0 && self.boot_mapped {
                    self.boot_mapped = false;
                    self.refill_pages(0x00..=0x08);
                    info!("Boot ROM unmapped");
                }
            }
            0xFF51..=0xFF55 if self.cgb => self.write_hdma(addr, val),
            0xFF68 if self.cgb => self.bg_palettes.spec.set(val),
            0xFF69 if self.cgb => self.bg_palettes.write_data(val),
            0xFF6A if self.cgb => self.obj_palettes.spec.set(val),
            0xFF6B if self.cgb => self.obj_palettes.write_data(val),
            0xFF70 if self.cgb => {
                self.wram_bank = ((val & 0x07) as usize).max(1);
                self.io[idx] = 0xF8 | (val & 0x07);
                self.refill_pages(0xD0..=0xDF);
            }
            0xFF80..=0xFFFF => self.io[idx] = val,
            _ => {}
        }
    }

    fn write_palette_reg(&mut self, idx: usize, reg: LatchedReg, val: u8) {
        self.io[idx] = val;
        self.latch_change(reg, val);
    }

    /// Records a write that lands mid-line so the renderer can apply it from
    /// the current pixel onward.
    fn latch_change(&mut self, reg: LatchedReg, value: u8) {
        let lcd_on = self.io[IoReg::Lcdc.index()] & 0x80 != 0;
        if lcd_on && self.io[IoReg::Stat.index()] & 0x03 == 3 {
            self.scanline_changes.push(ScanlineChange {
                x: self.cur_scanline_x,
                reg,
                value,
            });
        }
    }

    pub fn press_key(&mut self, key: Key) {
        let (action, bit) = key.line();
        let keys = if action {
            &mut self.action_keys
        } else {
            &mut self.direction_keys
        };
        if *keys & bit == 0 {
            *keys |= bit;
            self.key_pressed = true;
            self.request_interrupt(INT_JOYPAD);
        }
    }

    /// Returns whether a key went down since the last call.
    pub fn take_key_press(&mut self) -> bool {
        std::mem::take(&mut self.key_pressed)
    }

    pub fn release_key(&mut self, key: Key) {
        let (action, bit) = key.line();
        if action {
            self.action_keys &= !bit;
        } else {
            self.direction_keys &= !bit;
        }
    }

    /// Advances the OAM DMA engine. A transfer requested through 0xFF46 is
    /// armed by the first call after the write and copies bytes from then on.
    pub fn tick_dma(&mut self, cycles: u32) {
        if let Some(src) = self.dma.setup.take() {
            self.dma.fresh = !std::mem::take(&mut self.dma.restarted);
            self.dma.active = true;
            self.dma.source = src;
            self.dma.index = 0;
            self.dma.remainder = 0;
            return;
        }
        if !self.dma.active {
            return;
        }
        self.dma.fresh = false;
        let per_byte = if self.double_speed() { 2 } else { 4 };
        let total = self.dma.remainder + cycles;
        self.dma.remainder = total % per_byte;
        for _ in 0..total / per_byte {
            if self.dma.index >= OAM_DMA_LEN {
                break;
            }
            let byte = self.dma_read(self.dma.source.wrapping_add(self.dma.index));
            self.oam[self.dma.index as usize] = byte;
            self.dma.index += 1;
        }
        if self.dma.index >= OAM_DMA_LEN {
            self.dma.active = false;
        }
    }

    /// DMA source reads bypass the CPU-side VRAM/OAM gates.
    fn dma_read(&self, addr: u16) -> u8 {
        match addr {
            0x8000..=0x9FFF => {
                self.vram[self.vram_bank * VRAM_BANK_SIZE + (addr as usize - 0x8000)]
            }
            0xE000..=0xFFFF => self.read_slow(addr.wrapping_sub(0x2000)),
            _ => self.read_slow(addr),
        }
    }

    pub fn tick_serial(&mut self, cycles: u32) {
        if self.serial_countdown == 0 {
            return;
        }
        self.serial_countdown = self.serial_countdown.saturating_sub(cycles);
        if self.serial_countdown == 0 {
            // No link partner: the line floats high.
            self.io[IoReg::Sb.index()] = 0xFF;
            self.io[IoReg::Sc.index()] &= 0x7F;
            self.request_interrupt(INT_SERIAL);
        }
    }

    fn write_hdma(&mut self, addr: u16, val: u8) {
        match addr {
            0xFF51 if !self.hdma.active => {
                self.hdma.src = ((val as u16) << 8) | (self.hdma.src & 0x00F0)
            }
            0xFF52 if !self.hdma.active => {
                self.hdma.src = (self.hdma.src & 0xFF00) | (val & 0xF0) as u16
            }
            0xFF53 if !self.hdma.active => {
                self.hdma.dst = 0x8000 | (((val & 0x1F) as u16) << 8) | (self.hdma.dst & 0x00F0)
            }
            0xFF54 if !self.hdma.active => {
                self.hdma.dst = (self.hdma.dst & 0xFF00) | (val & 0xF0) as u16
            }
            0xFF55 => {
                let blocks = (val & 0x7F) + 1;
                if self.hdma.active && val & 0x80 == 0 {
                    self.hdma.active = false;
                    self.hdma.blocks = 0;
                    self.hdma.cancelled = true;
                } else if val & 0x80 == 0 {
                    self.hdma.mode = HdmaMode::General;
                    self.hdma.blocks = blocks;
                    while self.hdma.blocks > 0 {
                        self.transfer_hdma_block();
                    }
                    self.hdma.cancelled = false;
                } else {
                    self.hdma.mode = HdmaMode::HBlank;
                    self.hdma.blocks = blocks;
                    self.hdma.active = true;
                    self.hdma.cancelled = false;
                    let lcd_off = self.io[IoReg::Lcdc.index()] & 0x80 == 0;
                    if lcd_off || self.io[IoReg::Stat.index()] & 0x03 == 0 {
                        self.hdma_hblank_transfer();
                    }
                }
            }
            _ => {}
        }
    }

    /// Copies one 16-byte HBlank DMA block. Called by the PPU on HBlank entry.
    pub fn hdma_hblank_transfer(&mut self) {
        if self.hdma.active && self.hdma.mode == HdmaMode::HBlank {
            self.transfer_hdma_block();
        }
    }

    fn transfer_hdma_block(&mut self) {
        for _ in 0..0x10 {
            let byte = self.dma_read(self.hdma.src);
            let dst = self.vram_bank * VRAM_BANK_SIZE + (self.hdma.dst as usize & 0x1FFF);
            self.vram[dst] = byte;
            self.hdma.src = self.hdma.src.wrapping_add(1);
            self.hdma.dst = 0x8000 | (self.hdma.dst.wrapping_add(1) & 0x1FFF);
        }
        self.hdma.blocks = self.hdma.blocks.saturating_sub(1);
        if self.hdma.blocks == 0 {
            self.hdma.active = false;
        }
        self.stall_cycles += if self.double_speed() { 16 } else { 8 } * 4;
    }

    fn complete_active_hdma(&mut self) {
        while self.hdma.active && self.hdma.mode == HdmaMode::HBlank {
            self.transfer_hdma_block();
        }
    }

    /// Rebuilds state skipped by serialization after a save state is restored.
    pub(crate) fn restore_transient(&mut self, rom: Vec<u8>, boot_rom: Option<Vec<u8>>) {
        if let Some(cart) = self.cart.as_mut() {
            cart.rom = rom;
        }
        self.boot_rom = boot_rom;
        self.refill_fast_map();
    }
}
