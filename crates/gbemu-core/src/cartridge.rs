use std::{
    fs,
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::error::LoadError;

pub const ROM_BANK_SIZE: usize = 0x4000;
pub const RAM_BANK_SIZE: usize = 0x2000;
const HEADER_END: usize = 0x150;
const MBC2_RAM_SIZE: usize = 0x200;

/// Cartridge type byte at 0x147. Anything not listed here fails to load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum CartridgeType {
    RomOnly = 0x00,
    Mbc1 = 0x01,
    Mbc1Ram = 0x02,
    Mbc1RamBattery = 0x03,
    Mbc2 = 0x05,
    Mbc2Battery = 0x06,
    RomRam = 0x08,
    RomRamBattery = 0x09,
    Mbc3TimerBattery = 0x0F,
    Mbc3TimerRamBattery = 0x10,
    Mbc3 = 0x11,
    Mbc3Ram = 0x12,
    Mbc3RamBattery = 0x13,
    Mbc5 = 0x19,
    Mbc5Ram = 0x1A,
    Mbc5RamBattery = 0x1B,
    Mbc5Rumble = 0x1C,
    Mbc5RumbleRam = 0x1D,
    Mbc5RumbleRamBattery = 0x1E,
}

impl TryFrom<u8> for CartridgeType {
    type Error = LoadError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        use CartridgeType::*;
        Ok(match value {
            0x00 => RomOnly,
            0x01 => Mbc1,
            0x02 => Mbc1Ram,
            0x03 => Mbc1RamBattery,
            0x05 => Mbc2,
            0x06 => Mbc2Battery,
            0x08 => RomRam,
            0x09 => RomRamBattery,
            0x0F => Mbc3TimerBattery,
            0x10 => Mbc3TimerRamBattery,
            0x11 => Mbc3,
            0x12 => Mbc3Ram,
            0x13 => Mbc3RamBattery,
            0x19 => Mbc5,
            0x1A => Mbc5Ram,
            0x1B => Mbc5RamBattery,
            0x1C => Mbc5Rumble,
            0x1D => Mbc5RumbleRam,
            0x1E => Mbc5RumbleRamBattery,
            other => return Err(LoadError::UnsupportedCartridge(other)),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MbcKind {
    None,
    Mbc1,
    Mbc2,
    Mbc3,
    Mbc5,
}

impl CartridgeType {
    pub fn mbc(self) -> MbcKind {
        use CartridgeType::*;
        match self {
            RomOnly | RomRam | RomRamBattery => MbcKind::None,
            Mbc1 | Mbc1Ram | Mbc1RamBattery => MbcKind::Mbc1,
            Mbc2 | Mbc2Battery => MbcKind::Mbc2,
            Mbc3TimerBattery | Mbc3TimerRamBattery | Mbc3 | Mbc3Ram | Mbc3RamBattery => {
                MbcKind::Mbc3
            }
            Mbc5 | Mbc5Ram | Mbc5RamBattery | Mbc5Rumble | Mbc5RumbleRam
            | Mbc5RumbleRamBattery => MbcKind::Mbc5,
        }
    }

    pub fn has_battery(self) -> bool {
        use CartridgeType::*;
        matches!(
            self,
            Mbc1RamBattery
                | Mbc2Battery
                | RomRamBattery
                | Mbc3TimerBattery
                | Mbc3TimerRamBattery
                | Mbc3RamBattery
                | Mbc5RamBattery
                | Mbc5RumbleRamBattery
        )
    }

    pub fn has_rtc(self) -> bool {
        matches!(
            self,
            CartridgeType::Mbc3TimerBattery | CartridgeType::Mbc3TimerRamBattery
        )
    }
}

/// Number of 16 KiB ROM banks for a header size code.
pub fn rom_bank_count(code: u8) -> Option<usize> {
    match code {
        0x00..=0x08 => Some(2usize << code),
        0x52 => Some(72),
        0x53 => Some(80),
        0x54 => Some(96),
        _ => None,
    }
}

/// Number of 8 KiB RAM banks for a header size code.
pub fn ram_bank_count(code: u8) -> usize {
    const RAM_BANKS: [usize; 6] = [0, 0, 1, 4, 16, 8];
    RAM_BANKS.get(code as usize).copied().unwrap_or(0)
}

/// Parsed cartridge header (0x100-0x14F).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub title: String,
    pub cgb_flag: u8,
    pub new_licensee: [u8; 2],
    pub cartridge_type: u8,
    pub rom_size_code: u8,
    pub ram_size_code: u8,
    pub old_licensee: u8,
    pub header_checksum: u8,
    pub computed_checksum: u8,
}

impl Header {
    pub fn parse(data: &[u8]) -> Result<Self, LoadError> {
        if data.len() < HEADER_END {
            return Err(LoadError::TruncatedRom {
                expected: HEADER_END,
                actual: data.len(),
            });
        }

        let mut title = &data[0x134..0x143];
        if let Some(pos) = title.iter().position(|&b| b == 0) {
            title = &title[..pos];
        }

        let computed_checksum = data[0x134..=0x14C]
            .iter()
            .fold(0u8, |acc, &b| acc.wrapping_sub(b).wrapping_sub(1));

        Ok(Self {
            title: String::from_utf8_lossy(title).trim().to_string(),
            cgb_flag: data[0x143],
            new_licensee: [data[0x144], data[0x145]],
            cartridge_type: data[0x147],
            rom_size_code: data[0x148],
            ram_size_code: data[0x149],
            old_licensee: data[0x14B],
            header_checksum: data[0x14D],
            computed_checksum,
        })
    }

    pub fn cgb_supported(&self) -> bool {
        self.cgb_flag & 0x80 != 0
    }

    pub fn checksum_valid(&self) -> bool {
        self.header_checksum == self.computed_checksum
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
struct RtcRegisters {
    seconds: u8,
    minutes: u8,
    hours: u8,
    days: u16,
    halt: bool,
    carry: bool,
}

impl RtcRegisters {
    fn control_byte(&self) -> u8 {
        let mut out = ((self.days >> 8) as u8) & 0x01;
        if self.halt {
            out |= 0x40;
        }
        if self.carry {
            out |= 0x80;
        }
        out
    }

    fn read(&self, reg: u8) -> u8 {
        match reg {
            0x08 => self.seconds & 0x3F,
            0x09 => self.minutes & 0x3F,
            0x0A => self.hours & 0x1F,
            0x0B => (self.days & 0x00FF) as u8,
            0x0C => self.control_byte(),
            _ => 0xFF,
        }
    }

    fn to_words(self) -> [u32; 5] {
        [
            self.seconds as u32,
            self.minutes as u32,
            self.hours as u32,
            (self.days & 0xFF) as u32,
            self.control_byte() as u32,
        ]
    }

    fn from_words(words: &[u32; 5]) -> Self {
        let control = words[4] as u8;
        Self {
            seconds: words[0] as u8 & 0x3F,
            minutes: words[1] as u8 & 0x3F,
            hours: words[2] as u8 & 0x1F,
            days: (words[3] as u16 & 0xFF) | (((control & 0x01) as u16) << 8),
            halt: control & 0x40 != 0,
            carry: control & 0x80 != 0,
        }
    }
}

const RTC_CYCLES_PER_SECOND: u32 = 4_194_304;
const RTC_TRAILER_LEN: usize = 48;

/// MBC3 real-time clock, driven by emulated cycles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Rtc {
    regs: RtcRegisters,
    latched: RtcRegisters,
    subsecond_cycles: u32,
}

impl Rtc {
    fn new() -> Self {
        Self {
            regs: RtcRegisters::default(),
            latched: RtcRegisters::default(),
            subsecond_cycles: 0,
        }
    }

    fn latch(&mut self) {
        self.latched = self.regs;
    }

    fn write_register(&mut self, reg: u8, value: u8) {
        match reg {
            0x08 => {
                self.regs.seconds = value & 0x3F;
                self.subsecond_cycles = 0;
            }
            0x09 => self.regs.minutes = value & 0x3F,
            0x0A => self.regs.hours = value & 0x1F,
            0x0B => self.regs.days = (self.regs.days & 0x0100) | value as u16,
            0x0C => {
                self.regs.days = (self.regs.days & 0x00FF) | (((value & 0x01) as u16) << 8);
                self.regs.halt = value & 0x40 != 0;
                self.regs.carry = value & 0x80 != 0;
            }
            _ => {}
        }
        self.latch();
    }

    fn step(&mut self, cycles: u64) {
        if self.regs.halt {
            return;
        }

        let mut seconds = cycles / RTC_CYCLES_PER_SECOND as u64;
        let mut sub = self.subsecond_cycles + (cycles % RTC_CYCLES_PER_SECOND as u64) as u32;
        if sub >= RTC_CYCLES_PER_SECOND {
            sub -= RTC_CYCLES_PER_SECOND;
            seconds += 1;
        }
        self.subsecond_cycles = sub;
        self.advance_seconds(seconds);
    }

    fn advance_seconds(&mut self, mut seconds: u64) {
        while seconds > 0 {
            // Out-of-range seconds (60-63) still count up to 63 before wrapping.
            let sec = self.regs.seconds as u64;
            let until_minute = if sec <= 59 { 60 - sec } else { 64 - sec + 60 };
            if seconds < until_minute {
                self.regs.seconds = ((sec + seconds) & 0x3F) as u8;
                return;
            }
            seconds -= until_minute;
            self.regs.seconds = 0;
            self.minute_tick();
        }
    }

    fn minute_tick(&mut self) {
        if self.regs.minutes == 59 {
            self.regs.minutes = 0;
            self.hour_tick();
        } else {
            self.regs.minutes = (self.regs.minutes + 1) & 0x3F;
        }
    }

    fn hour_tick(&mut self) {
        if self.regs.hours == 23 {
            self.regs.hours = 0;
            self.day_tick();
        } else {
            self.regs.hours = (self.regs.hours + 1) & 0x1F;
        }
    }

    fn day_tick(&mut self) {
        if self.regs.days >= 0x01FF {
            self.regs.days = 0;
            self.regs.carry = true;
        } else {
            self.regs.days += 1;
        }
    }

    fn trailer(&self, now: SystemTime) -> Vec<u8> {
        let mut data = Vec::with_capacity(RTC_TRAILER_LEN);
        for word in self.regs.to_words().into_iter().chain(self.latched.to_words()) {
            data.extend_from_slice(&word.to_le_bytes());
        }
        let stamp = now.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs();
        data.extend_from_slice(&stamp.to_le_bytes());
        data
    }

    fn restore_trailer(&mut self, data: &[u8], now: SystemTime) -> bool {
        if data.len() < RTC_TRAILER_LEN {
            return false;
        }
        let mut words = [0u32; 10];
        for (i, chunk) in data[..40].chunks_exact(4).enumerate() {
            words[i] = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
        let mut stamp = [0u8; 8];
        stamp.copy_from_slice(&data[40..48]);
        let saved = u64::from_le_bytes(stamp);

        let live: [u32; 5] = [words[0], words[1], words[2], words[3], words[4]];
        let latched: [u32; 5] = [words[5], words[6], words[7], words[8], words[9]];
        self.regs = RtcRegisters::from_words(&live);
        self.latched = RtcRegisters::from_words(&latched);
        self.subsecond_cycles = 0;

        let now_secs = now.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs();
        if !self.regs.halt {
            self.advance_seconds(now_secs.saturating_sub(saved));
        }
        true
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
enum MbcState {
    None,
    Mbc1 {
        rom_bank: u8,
        upper: u8,
        mode: u8,
        ram_enable: bool,
    },
    Mbc2 {
        rom_bank: u8,
        ram_enable: bool,
    },
    Mbc3 {
        rom_bank: u8,
        ram_bank: u8,
        ram_enable: bool,
        rtc: Option<Rtc>,
        latch_pending: bool,
    },
    Mbc5 {
        rom_bank: u16,
        ram_bank: u8,
        ram_enable: bool,
    },
}

impl MbcState {
    fn new(kind: CartridgeType) -> Self {
        match kind.mbc() {
            MbcKind::None => MbcState::None,
            MbcKind::Mbc1 => MbcState::Mbc1 {
                rom_bank: 1,
                upper: 0,
                mode: 0,
                ram_enable: false,
            },
            MbcKind::Mbc2 => MbcState::Mbc2 {
                rom_bank: 1,
                ram_enable: false,
            },
            MbcKind::Mbc3 => MbcState::Mbc3 {
                rom_bank: 1,
                ram_bank: 0,
                ram_enable: false,
                rtc: kind.has_rtc().then(Rtc::new),
                latch_pending: false,
            },
            MbcKind::Mbc5 => MbcState::Mbc5 {
                rom_bank: 1,
                ram_bank: 0,
                ram_enable: false,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cartridge {
    #[serde(skip)]
    pub rom: Vec<u8>,
    pub ram: Vec<u8>,
    pub header: Header,
    pub kind: CartridgeType,
    rom_banks: usize,
    ram_banks: usize,
    mbc: MbcState,
    #[serde(skip)]
    save_path: Option<PathBuf>,
}

impl Cartridge {
    /// Parses and classifies a ROM image.
    pub fn load(data: Vec<u8>) -> Result<Self, LoadError> {
        let header = Header::parse(&data)?;
        let kind = CartridgeType::try_from(header.cartridge_type)?;

        let rom_banks = match rom_bank_count(header.rom_size_code) {
            Some(banks) => banks,
            None => {
                warn!(
                    "Unknown ROM size code {:#04X}; sizing from file length",
                    header.rom_size_code
                );
                (data.len() / ROM_BANK_SIZE).max(2)
            }
        };
        let expected = rom_banks * ROM_BANK_SIZE;
        if data.len() < expected {
            return Err(LoadError::TruncatedRom {
                expected,
                actual: data.len(),
            });
        }

        if !header.checksum_valid() {
            warn!(
                "Header checksum mismatch: header {:#04X}, computed {:#04X}",
                header.header_checksum, header.computed_checksum
            );
        }

        let (ram_banks, ram_len) = if kind.mbc() == MbcKind::Mbc2 {
            (1, MBC2_RAM_SIZE)
        } else {
            let banks = ram_bank_count(header.ram_size_code);
            (banks, banks * RAM_BANK_SIZE)
        };

        Ok(Self {
            rom: data,
            ram: vec![0; ram_len],
            mbc: MbcState::new(kind),
            header,
            kind,
            rom_banks,
            ram_banks,
            save_path: None,
        })
    }

    /// Loads a ROM from disk along with any battery save next to it (or in `save_dir`).
    pub fn from_file(path: &Path, save_dir: Option<&Path>) -> Result<Self, LoadError> {
        let data = fs::read(path).map_err(|source| LoadError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut cart = Self::load(data)?;

        if cart.kind.has_battery() {
            let save = save_path_for(path, save_dir);
            if let Ok(bytes) = fs::read(&save) {
                cart.restore_save(&bytes);
                debug!("Restored battery save from {}", save.display());
            }
            cart.save_path = Some(save);
        }

        info!(
            "Loaded ROM: {} ({:?}, {} ROM banks, {} RAM banks, CGB: {})",
            cart.header.title,
            cart.kind,
            cart.rom_banks,
            cart.ram_banks,
            if cart.header.cgb_supported() { "yes" } else { "no" }
        );
        Ok(cart)
    }

    pub fn rom_banks(&self) -> usize {
        self.rom_banks
    }

    pub fn ram_banks(&self) -> usize {
        self.ram_banks
    }

    pub fn save_path(&self) -> Option<&Path> {
        self.save_path.as_deref()
    }

    pub fn set_save_path(&mut self, path: Option<PathBuf>) {
        self.save_path = path;
    }

    /// Byte offset of the bank mapped at 0x0000-0x3FFF.
    pub fn low_bank_offset(&self) -> usize {
        let bank = match &self.mbc {
            MbcState::Mbc1 { upper, mode: 1, .. } => ((*upper as usize) << 5) % self.rom_banks,
            _ => 0,
        };
        bank * ROM_BANK_SIZE
    }

    /// Byte offset of the bank mapped at 0x4000-0x7FFF.
    pub fn high_bank_offset(&self) -> usize {
        let bank = match &self.mbc {
            MbcState::None => 1,
            MbcState::Mbc1 {
                rom_bank, upper, ..
            } => {
                let mut bank = ((*upper as usize) << 5) | (*rom_bank as usize & 0x1F);
                if bank & 0x1F == 0 {
                    bank += 1;
                }
                bank
            }
            MbcState::Mbc2 { rom_bank, .. } => (*rom_bank as usize & 0x0F).max(1),
            MbcState::Mbc3 { rom_bank, .. } => (*rom_bank as usize & 0x7F).max(1),
            MbcState::Mbc5 { rom_bank, .. } => *rom_bank as usize,
        };
        (bank % self.rom_banks) * ROM_BANK_SIZE
    }

    pub fn read_rom(&self, addr: u16) -> u8 {
        let offset = match addr {
            0x0000..=0x3FFF => self.low_bank_offset() + addr as usize,
            _ => self.high_bank_offset() + (addr as usize & 0x3FFF),
        };
        self.rom.get(offset).copied().unwrap_or(0xFF)
    }

    /// Handles writes to the MBC control range. Returns true when the ROM mapping changed.
    pub fn write_control(&mut self, addr: u16, val: u8) -> bool {
        let before = (self.low_bank_offset(), self.high_bank_offset());
        match (&mut self.mbc, addr) {
            (MbcState::None, _) => {}
            (MbcState::Mbc1 { ram_enable, .. }, 0x0000..=0x1FFF)
            | (MbcState::Mbc3 { ram_enable, .. }, 0x0000..=0x1FFF)
            | (MbcState::Mbc5 { ram_enable, .. }, 0x0000..=0x1FFF) => {
                *ram_enable = val & 0x0F == 0x0A;
            }
            (MbcState::Mbc1 { rom_bank, .. }, 0x2000..=0x3FFF) => {
                *rom_bank = val & 0x1F;
                if *rom_bank == 0 {
                    *rom_bank = 1;
                }
            }
            (MbcState::Mbc1 { upper, .. }, 0x4000..=0x5FFF) => *upper = val & 0x03,
            (MbcState::Mbc1 { mode, .. }, 0x6000..=0x7FFF) => *mode = val & 0x01,
            (
                MbcState::Mbc2 {
                    rom_bank,
                    ram_enable,
                },
                0x0000..=0x3FFF,
            ) => {
                // Address bit 8 selects between RAM enable and ROM bank.
                if addr & 0x0100 == 0 {
                    *ram_enable = val & 0x0F == 0x0A;
                } else {
                    *rom_bank = (val & 0x0F).max(1);
                }
            }
            (MbcState::Mbc3 { rom_bank, .. }, 0x2000..=0x3FFF) => {
                *rom_bank = (val & 0x7F).max(1);
            }
            (MbcState::Mbc3 { ram_bank, .. }, 0x4000..=0x5FFF) => *ram_bank = val,
            (
                MbcState::Mbc3 {
                    latch_pending, rtc, ..
                },
                0x6000..=0x7FFF,
            ) => {
                if val == 1 && *latch_pending {
                    if let Some(rtc) = rtc {
                        rtc.latch();
                    }
                }
                *latch_pending = val == 0;
            }
            (MbcState::Mbc5 { rom_bank, .. }, 0x2000..=0x2FFF) => {
                *rom_bank = (*rom_bank & 0x100) | val as u16;
            }
            (MbcState::Mbc5 { rom_bank, .. }, 0x3000..=0x3FFF) => {
                *rom_bank = (*rom_bank & 0xFF) | (((val & 0x01) as u16) << 8);
            }
            (MbcState::Mbc5 { ram_bank, .. }, 0x4000..=0x5FFF) => *ram_bank = val & 0x0F,
            _ => {}
        }
        let changed = before != (self.low_bank_offset(), self.high_bank_offset());
        if changed {
            debug!(
                "ROM mapping now low={:#X} high={:#X}",
                self.low_bank_offset(),
                self.high_bank_offset()
            );
        }
        changed
    }

    fn ram_offset(&self, addr: u16) -> Option<usize> {
        let local = addr as usize - 0xA000;
        let bank = match &self.mbc {
            MbcState::None => 0,
            MbcState::Mbc1 {
                ram_enable: false, ..
            }
            | MbcState::Mbc3 {
                ram_enable: false, ..
            }
            | MbcState::Mbc5 {
                ram_enable: false, ..
            } => return None,
            MbcState::Mbc1 { upper, mode, .. } => {
                if *mode == 1 {
                    *upper as usize
                } else {
                    0
                }
            }
            MbcState::Mbc2 { .. } => return None,
            MbcState::Mbc3 { ram_bank, .. } => {
                if *ram_bank > 0x03 {
                    return None;
                }
                *ram_bank as usize
            }
            MbcState::Mbc5 { ram_bank, .. } => *ram_bank as usize,
        };
        if self.ram_banks == 0 {
            return None;
        }
        Some((bank % self.ram_banks) * RAM_BANK_SIZE + local)
    }

    pub fn read_ram(&self, addr: u16) -> u8 {
        match &self.mbc {
            MbcState::Mbc2 { ram_enable, .. } => {
                if !*ram_enable {
                    return 0xFF;
                }
                // 512 x 4-bit cells mirrored across the window.
                let idx = (addr as usize - 0xA000) & 0x01FF;
                0xF0 | (self.ram.get(idx).copied().unwrap_or(0x0F) & 0x0F)
            }
            MbcState::Mbc3 {
                ram_enable: true,
                ram_bank: reg @ 0x08..=0x0C,
                rtc: Some(rtc),
                ..
            } => rtc.latched.read(*reg),
            _ => self
                .ram_offset(addr)
                .and_then(|i| self.ram.get(i).copied())
                .unwrap_or(0xFF),
        }
    }

    pub fn write_ram(&mut self, addr: u16, val: u8) {
        match &mut self.mbc {
            MbcState::Mbc2 { ram_enable, .. } => {
                if *ram_enable {
                    let idx = (addr as usize - 0xA000) & 0x01FF;
                    if let Some(b) = self.ram.get_mut(idx) {
                        *b = val & 0x0F;
                    }
                }
                return;
            }
            MbcState::Mbc3 {
                ram_enable: true,
                ram_bank: reg @ 0x08..=0x0C,
                rtc: Some(rtc),
                ..
            } => {
                rtc.write_register(*reg, val);
                return;
            }
            _ => {}
        }
        if let Some(idx) = self.ram_offset(addr) {
            if let Some(b) = self.ram.get_mut(idx) {
                *b = val;
            }
        }
    }

    pub fn step_rtc(&mut self, cycles: u32) {
        if let MbcState::Mbc3 { rtc: Some(rtc), .. } = &mut self.mbc {
            rtc.step(cycles as u64);
        }
    }

    /// Restores MBC registers to their power-on values.
    pub fn reset_mapper(&mut self) {
        let rtc = match &self.mbc {
            MbcState::Mbc3 { rtc, .. } => rtc.clone(),
            _ => None,
        };
        self.mbc = MbcState::new(self.kind);
        if let MbcState::Mbc3 { rtc: slot, .. } = &mut self.mbc {
            if rtc.is_some() {
                *slot = rtc;
            }
        }
    }

    /// Raw battery save contents: RAM banks plus the RTC trailer when present.
    pub fn save_data(&self) -> Vec<u8> {
        let mut data = self.ram.clone();
        if let MbcState::Mbc3 { rtc: Some(rtc), .. } = &self.mbc {
            data.extend(rtc.trailer(SystemTime::now()));
        }
        data
    }

    fn restore_save(&mut self, bytes: &[u8]) {
        let n = self.ram.len().min(bytes.len());
        self.ram[..n].copy_from_slice(&bytes[..n]);
        let ram_len = self.ram.len();
        if let MbcState::Mbc3 { rtc: Some(rtc), .. } = &mut self.mbc {
            if bytes.len() > ram_len && !rtc.restore_trailer(&bytes[ram_len..], SystemTime::now())
            {
                warn!("Ignoring malformed RTC trailer in battery save");
            }
        }
    }

    /// Writes battery-backed RAM to the save path. A no-op for carts without a battery.
    pub fn save_ram(&self) -> std::io::Result<()> {
        if !self.kind.has_battery() {
            return Ok(());
        }
        let Some(path) = &self.save_path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, self.save_data())?;
        debug!("Wrote battery save to {}", path.display());
        Ok(())
    }
}

/// `<dir>/<stem>.sav`, where `dir` defaults to the ROM's own directory.
pub fn save_path_for(rom_path: &Path, save_dir: Option<&Path>) -> PathBuf {
    match save_dir {
        Some(dir) => {
            let stem = rom_path.file_stem().unwrap_or_default();
            dir.join(stem).with_extension("sav")
        }
        None => rom_path.with_extension("sav"),
    }
}
