mod common;

use gbemu_core::bus::{Bus, INT_JOYPAD, IoReg, Key};
use gbemu_core::cartridge::Cartridge;

use common::{BANK_MARKER, build_rom};

fn bus_with(rom: Vec<u8>, cgb: bool) -> Bus {
    let mut bus = Bus::new(cgb);
    bus.install_cartridge(Cartridge::load(rom).unwrap());
    bus
}

fn assert_fast_matches_slow(bus: &Bus) {
    for addr in 0..=0xFFFFu16 {
        assert_eq!(
            bus.read(addr),
            bus.read_slow(addr),
            "fast and slow paths disagree at {addr:#06X}"
        );
    }
}

#[test]
fn bank_switch_is_idempotent() {
    let mut bus = bus_with(build_rom("BANKS", 0x01, 0x02, 0x00, &[]), false);

    bus.write(0x2000, 0x05);
    let once = bus.fast_map().to_vec();
    bus.write(0x2000, 0x05);
    assert_eq!(bus.fast_map(), once.as_slice());
    assert_eq!(bus.read(0x4000 + BANK_MARKER as u16), 5);
    assert_fast_matches_slow(&bus);
}

#[test]
fn mbc1_bank_zero_selects_bank_one() {
    let mut bus = bus_with(build_rom("BANKS", 0x01, 0x02, 0x00, &[]), false);
    bus.write(0x2000, 0x00);
    assert_eq!(bus.read(0x4000 + BANK_MARKER as u16), 1);
    bus.write(0x2000, 0x03);
    assert_eq!(bus.read(0x4000 + BANK_MARKER as u16), 3);
}

#[test]
fn mbc5_high_bank_bit() {
    // 512 banks need rom code 0x08.
    let mut bus = bus_with(build_rom("BIG", 0x19, 0x08, 0x00, &[]), false);
    bus.write(0x2000, 0x02);
    bus.write(0x3000, 0x01);
    // Markers hold the low byte of the bank number.
    assert_eq!(bus.read(0x4000 + BANK_MARKER as u16), 0x02);
    assert_eq!(bus.read_slow(0x4000 + BANK_MARKER as u16), 0x02);
    bus.write(0x3000, 0x00);
    bus.write(0x2000, 0x00);
    assert_eq!(bus.read(0x4000 + BANK_MARKER as u16), 0x00);
}

#[test]
fn fast_map_tracks_cgb_banks() {
    let mut bus = bus_with(build_rom("COLOR", 0x19, 0x01, 0x00, &[]), true);
    bus.write(0xFF70, 0x03);
    bus.write(0xD000, 0x33);
    bus.write(0xFF4F, 0x01);
    bus.write(0x8000, 0x44);
    assert_fast_matches_slow(&bus);

    bus.write(0xFF70, 0x00);
    assert_eq!(bus.read(0xD000), 0x00);
    bus.write(0xFF70, 0x03);
    assert_eq!(bus.read(0xD000), 0x33);
    bus.write(0xFF4F, 0x00);
    assert_eq!(bus.read(0x8000), 0x00);
    assert_fast_matches_slow(&bus);
}

#[test]
fn echo_ram_mirrors_work_ram() {
    let mut bus = Bus::new(false);
    bus.write(0xC123, 0x9C);
    assert_eq!(bus.read(0xE123), 0x9C);
    bus.write(0xFDFF, 0x42);
    assert_eq!(bus.read(0xDDFF), 0x42);
}

#[test]
fn boot_rom_overlay_and_unmap() {
    let mut bus = bus_with(build_rom("BOOT", 0x00, 0x00, 0x00, &[0xAA]), false);
    let mut boot = vec![0u8; 0x100];
    boot[0] = 0x31;
    bus.load_boot_rom(boot).unwrap();

    assert_eq!(bus.read(0x0000), 0x31);
    assert_eq!(bus.read(0x0100), 0xAA);
    assert_fast_matches_slow(&bus);

    bus.write(0xFF50, 0x01);
    assert!(!bus.boot_mapped());
    assert_eq!(bus.read(0x0000), 0x00);
    assert_fast_matches_slow(&bus);
}

#[test]
fn joypad_selection_and_interrupt() {
    let mut bus = Bus::new(false);
    bus.set_reg(IoReg::If, 0xE0);
    bus.write(0xFF00, 0x10);
    assert_eq!(bus.read(0xFF00) & 0x0F, 0x0F);

    bus.press_key(Key::Start);
    assert_eq!(bus.read(0xFF00) & 0x0F, 0x07);
    assert_ne!(bus.reg(IoReg::If) & INT_JOYPAD, 0);

    // Directions are not selected, so Right stays invisible.
    bus.press_key(Key::Right);
    assert_eq!(bus.read(0xFF00) & 0x0F, 0x07);
    bus.write(0xFF00, 0x20);
    assert_eq!(bus.read(0xFF00) & 0x0F, 0x0E);

    bus.release_key(Key::Right);
    assert_eq!(bus.read(0xFF00) & 0x0F, 0x0F);
}

#[test]
fn oam_dma_copies_after_start_delay() {
    let mut bus = Bus::new(false);
    for i in 0..0xA0u16 {
        bus.write(0xC000 + i, i as u8);
    }
    bus.write(0xFF46, 0xC0);
    assert!(!bus.oam_dma_active());
    // Arm the transfer and run it to completion.
    bus.tick_dma(4);
    bus.tick_dma(4 * 0xA0 + 8);
    assert!(!bus.oam_dma_active());
    assert_eq!(&bus.oam()[..4], &[0, 1, 2, 3]);
    assert_eq!(bus.oam()[0x9F], 0x9F);
}

#[test]
fn oam_dma_write_cuts_off_running_transfer() {
    let mut bus = Bus::new(false);
    for i in 0..0xA0u16 {
        bus.write(0xC000 + i, 0x11);
        bus.write(0xC100 + i, 0x22);
    }
    bus.write(0xFF46, 0xC0);
    bus.tick_dma(4);
    bus.tick_dma(4 * 0x10);
    assert!(bus.oam_dma_active());
    assert_eq!(bus.oam()[0x0F], 0x11);
    assert_eq!(bus.oam()[0x10], 0x00);

    bus.write(0xFF46, 0xC1);
    assert!(!bus.oam_dma_active());
    // The start delay of the new transfer copies nothing.
    bus.tick_dma(4);
    assert!(bus.oam_dma_active());
    assert_eq!(bus.oam()[0x10], 0x00);

    bus.tick_dma(4 * 0xA0);
    assert!(!bus.oam_dma_active());
    assert!(bus.oam().iter().all(|&b| b == 0x22));
}
