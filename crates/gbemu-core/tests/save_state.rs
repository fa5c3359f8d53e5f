mod common;

use common::{build_rom, idle_rom, machine, rom_only};
use gbemu_core::error::StateError;
use gbemu_core::{EmulatorConfig, GameBoy};

/// INC A; LD (C000),A; JR -6
fn counting_rom() -> Vec<u8> {
    rom_only(&[0x3C, 0xEA, 0x00, 0xC0, 0x18, 0xFA])
}

#[test]
fn restore_then_snapshot_is_byte_identical() {
    let mut gb = machine(counting_rom());
    gb.run_frame().unwrap();
    gb.step().unwrap();
    let first = gb.snapshot().unwrap();

    gb.run_frame().unwrap();
    gb.restore(&first).unwrap();
    assert_eq!(gb.snapshot().unwrap(), first);
}

#[test]
fn restored_machine_continues_identically() {
    let mut a = machine(counting_rom());
    a.run_frame().unwrap();
    a.run_frame().unwrap();
    let state = a.snapshot().unwrap();

    let mut b = machine(counting_rom());
    b.restore(&state).unwrap();
    for _ in 0..3 {
        a.run_frame().unwrap();
        b.run_frame().unwrap();
    }
    assert_eq!(a.cpu, b.cpu);
    assert_eq!(a.bus.read(0xC000), b.bus.read(0xC000));
    assert_eq!(a.screen_data(), b.screen_data());
    assert_eq!(a.snapshot().unwrap(), b.snapshot().unwrap());
}

#[test]
fn state_files_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("states").join("slot1.json");

    let mut a = machine(counting_rom());
    a.run_frame().unwrap();
    a.save_state(&path).unwrap();
    assert!(path.exists());

    let mut b = machine(counting_rom());
    b.load_state(&path).unwrap();
    assert_eq!(a.cpu, b.cpu);
    assert_eq!(a.ppu.frames(), b.ppu.frames());
}

#[test]
fn cartridge_ram_is_part_of_the_state() {
    let mut gb = machine(build_rom("RAMCART", 0x03, 0x00, 0x02, &[0x18, 0xFE]));
    gb.bus.write(0x0000, 0x0A);
    gb.bus.write(0xA000, 0x11);
    let state = gb.snapshot().unwrap();

    gb.bus.write(0xA000, 0x22);
    gb.restore(&state).unwrap();
    assert_eq!(gb.bus.read(0xA000), 0x11);
}

#[test]
fn state_from_another_rom_is_rejected() {
    let one = machine(build_rom("ONE", 0x00, 0x00, 0x00, &[0x18, 0xFE]));
    let state = one.snapshot().unwrap();

    let mut two = machine(build_rom("TWO", 0x00, 0x00, 0x00, &[0x18, 0xFE]));
    let before = two.snapshot().unwrap();
    match two.restore(&state) {
        Err(StateError::RomMismatch { found }) => assert_eq!(found, "ONE"),
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(two.snapshot().unwrap(), before);
}

#[test]
fn snapshot_needs_a_cartridge() {
    let mut gb = GameBoy::new(&EmulatorConfig::default());
    assert!(matches!(gb.snapshot(), Err(StateError::NoCartridge)));

    let state = machine(idle_rom()).snapshot().unwrap();
    assert!(matches!(gb.restore(&state), Err(StateError::NoCartridge)));
}

#[test]
fn malformed_state_is_rejected() {
    let mut gb = machine(idle_rom());
    assert!(matches!(gb.restore(b"not a state"), Err(StateError::Json(_))));
}
