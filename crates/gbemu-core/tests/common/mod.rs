#![allow(dead_code)]

use gbemu_core::{EmulatorConfig, GameBoy};

/// Offset inside every ROM bank that holds the bank's own number.
pub const BANK_MARKER: usize = 0x2000;

/// Builds a ROM image with a valid header, `program` at the entry point and
/// each bank tagged with its number at [`BANK_MARKER`].
pub fn build_rom(title: &str, kind: u8, rom_code: u8, ram_code: u8, program: &[u8]) -> Vec<u8> {
    let banks = 2usize << rom_code;
    let mut rom = vec![0u8; banks * 0x4000];
    for bank in 0..banks {
        rom[bank * 0x4000 + BANK_MARKER] = bank as u8;
    }
    rom[0x100..0x100 + program.len()].copy_from_slice(program);
    let title = title.as_bytes();
    rom[0x134..0x134 + title.len()].copy_from_slice(title);
    rom[0x147] = kind;
    rom[0x148] = rom_code;
    rom[0x149] = ram_code;
    fix_header_checksum(&mut rom);
    rom
}

pub fn fix_header_checksum(rom: &mut [u8]) {
    rom[0x14D] = rom[0x134..=0x14C]
        .iter()
        .fold(0u8, |acc, &b| acc.wrapping_sub(b).wrapping_sub(1));
}

/// Marks the header as CGB-capable.
pub fn cgb_rom(program: &[u8]) -> Vec<u8> {
    let mut rom = rom_only(program);
    rom[0x143] = 0x80;
    fix_header_checksum(&mut rom);
    rom
}

/// 32 KiB ROM-only image running `program`.
pub fn rom_only(program: &[u8]) -> Vec<u8> {
    build_rom("TESTROM", 0x00, 0x00, 0x00, program)
}

/// An endless `JR -2` loop at the entry point.
pub fn idle_rom() -> Vec<u8> {
    rom_only(&[0x18, 0xFE])
}

pub fn machine(rom: Vec<u8>) -> GameBoy {
    machine_with(&EmulatorConfig::default(), rom)
}

pub fn machine_with(config: &EmulatorConfig, rom: Vec<u8>) -> GameBoy {
    let mut gb = GameBoy::new(config);
    gb.load_rom_bytes(rom).unwrap();
    gb
}
