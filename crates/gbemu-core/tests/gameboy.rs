mod common;

use std::fs;

use common::{build_rom, cgb_rom, idle_rom, machine, machine_with, rom_only};
use gbemu_core::bus::{INT_JOYPAD, INT_SERIAL, INT_TIMER, IoReg};
use gbemu_core::config::HardwareMode;
use gbemu_core::error::{CpuError, EmuError, LoadError};
use gbemu_core::{EmulatorConfig, GameBoy, Key};

#[test]
fn dmg_cartridge_boots_with_dmg_registers() {
    let gb = machine(idle_rom());
    assert!(!gb.is_cgb());
    assert_eq!(gb.rom_title(), Some("TESTROM"));
    assert_eq!((gb.cpu.a, gb.cpu.f), (0x01, 0xB0));
    assert_eq!((gb.cpu.sp, gb.cpu.pc), (0xFFFE, 0x0100));
    assert_eq!(gb.bus.read(0xFF40), 0x91);
    assert_eq!(gb.bus.read(0xFF47), 0xFC);
}

#[test]
fn cgb_cartridge_selects_cgb_in_auto_mode() {
    let gb = machine(cgb_rom(&[0x18, 0xFE]));
    assert!(gb.is_cgb());
    assert_eq!(gb.cpu.a, 0x11);
    assert!(!gb.bus.dmg_compat());
}

#[test]
fn forced_cgb_runs_dmg_cartridge_in_compat_mode() {
    let config = EmulatorConfig {
        mode: HardwareMode::Cgb,
        ..EmulatorConfig::default()
    };
    let gb = machine_with(&config, idle_rom());
    assert!(gb.is_cgb());
    assert!(gb.bus.dmg_compat());
    assert_eq!(gb.bus.read(0xFF47), 0xE4);
    assert_eq!(gb.bus.read(0xFF48), 0xD0);
}

#[test]
fn forced_dmg_ignores_cgb_header() {
    let config = EmulatorConfig {
        mode: HardwareMode::Dmg,
        ..EmulatorConfig::default()
    };
    let gb = machine_with(&config, cgb_rom(&[0x18, 0xFE]));
    assert!(!gb.is_cgb());
    assert_eq!(gb.cpu.a, 0x01);
}

#[test]
fn mbc1_program_switches_banks() {
    // LD A,0; LD (2000),A; LD A,(6000); LD B,A
    // LD A,5; LD (2000),A; LD A,(6000); JR -2
    let program = [
        0x3E, 0x00, 0xEA, 0x00, 0x20, 0xFA, 0x00, 0x60, 0x47, 0x3E, 0x05, 0xEA, 0x00, 0x20,
        0xFA, 0x00, 0x60, 0x18, 0xFE,
    ];
    let mut gb = machine(build_rom("MBC1", 0x01, 0x02, 0x00, &program));
    for _ in 0..7 {
        gb.step().unwrap();
    }
    assert_eq!(gb.cpu.b, 1, "bank 0 selects bank 1");
    assert_eq!(gb.cpu.a, 5);
}

#[test]
fn illegal_opcode_locks_the_machine() {
    let mut gb = machine(rom_only(&[0x00, 0xD3]));
    assert_eq!(gb.step().unwrap(), 4);
    match gb.step() {
        Err(EmuError::Cpu(CpuError::IllegalOpcode { opcode, pc })) => {
            assert_eq!((opcode, pc), (0xD3, 0x0101));
        }
        other => panic!("unexpected {other:?}"),
    }
    assert!(gb.is_locked());
    assert!(matches!(
        gb.step(),
        Err(EmuError::Cpu(CpuError::Locked { pc: 0x0101 }))
    ));
    assert!(gb.run_frame().is_err());
}

#[test]
fn vblank_handler_runs_once_per_frame() {
    let mut rom = rom_only(&[
        0x21, 0x80, 0xFF, // LD HL,FF80
        0xAF, // XOR A
        0xE0, 0x0F, // LDH (IF),A
        0x3E, 0x01, // LD A,1
        0xE0, 0xFF, // LDH (IE),A
        0xFB, // EI
        0x76, // HALT
        0x18, 0xFD, // JR -3
    ]);
    // INC (HL); RETI
    rom[0x40] = 0x34;
    rom[0x41] = 0xD9;
    let mut gb = machine(rom);

    for _ in 0..5 {
        gb.run_frame().unwrap();
    }
    for _ in 0..10 {
        gb.step().unwrap();
    }
    assert_eq!(gb.ppu.frames(), 5);
    assert_eq!(gb.bus.read(0xFF80), 5);
}

#[test]
fn ei_halt_with_pending_interrupt_runs_handler_once() {
    // EI; HALT; JR -2, with INC A; RETI at the timer vector
    let mut rom = rom_only(&[0xFB, 0x76, 0x18, 0xFE]);
    rom[0x50] = 0x3C;
    rom[0x51] = 0xD9;
    let mut gb = machine(rom);
    gb.bus.write(0xFFFF, INT_TIMER);
    gb.bus.write(0xFF0F, INT_TIMER);

    // EI, then HALT with the dispatch folded into the same step.
    gb.step().unwrap();
    gb.step().unwrap();
    assert_eq!(gb.cpu.pc, 0x0050);
    gb.step().unwrap();
    assert_eq!(gb.cpu.a, 0x02);
    assert_eq!(gb.cpu.pc, 0x0051);
    // RETI goes back to the HALT, which now sleeps.
    gb.step().unwrap();
    assert_eq!(gb.cpu.pc, 0x0101);
    gb.step().unwrap();
    assert!(gb.cpu.halted);
    assert_eq!(gb.cpu.a, 0x02);
}

#[test]
fn joypad_press_is_visible_and_interrupts() {
    let mut gb = machine(idle_rom());
    gb.bus.write(0xFF0F, 0x00);
    gb.bus.write(0xFF00, 0x10);
    assert_eq!(gb.bus.read(0xFF00), 0xDF);

    gb.key_down(Key::Start);
    assert_eq!(gb.bus.read(0xFF00), 0xD7);
    assert_ne!(gb.bus.reg(IoReg::If) & INT_JOYPAD, 0);

    gb.key_up(Key::Start);
    assert_eq!(gb.bus.read(0xFF00), 0xDF);
}

#[test]
fn soft_reset_keeps_ram_and_power_cycle_clears_it() {
    let mut gb = machine(idle_rom());
    gb.bus.write(0xC000, 0x5A);
    gb.run_frame().unwrap();

    gb.soft_reset().unwrap();
    assert_eq!(gb.cpu.pc, 0x0100);
    assert_eq!(gb.ppu.frames(), 0);
    assert_eq!(gb.bus.read(0xC000), 0x5A);

    gb.reset().unwrap();
    assert_eq!(gb.cpu.pc, 0x0100);
    assert_eq!(gb.bus.read(0xC000), 0x00);
    assert!(gb.has_cartridge());
}

#[test]
fn boot_rom_runs_until_it_unmaps_itself() {
    let dir = tempfile::tempdir().unwrap();
    let boot = dir.path().join("dmg_boot.bin");
    let mut image = vec![0u8; 0x100];
    // LD A,1; LDH (50),A
    image[..4].copy_from_slice(&[0x3E, 0x01, 0xE0, 0x50]);
    fs::write(&boot, image).unwrap();

    let config = EmulatorConfig {
        skip_boot: false,
        dmg_boot_rom: Some(boot),
        ..EmulatorConfig::default()
    };
    let mut gb = machine_with(&config, idle_rom());
    assert_eq!(gb.cpu.pc, 0x0000);
    assert!(gb.bus.boot_mapped());
    assert_eq!(gb.bus.read(0x0000), 0x3E);
    assert_eq!(gb.bus.read(0x0100), 0x18);

    gb.step().unwrap();
    gb.step().unwrap();
    assert!(!gb.bus.boot_mapped());
    assert_eq!(gb.bus.read(0x0000), 0x00);
    assert_eq!(gb.cpu.pc, 0x0004);
}

#[test]
fn wrong_size_boot_rom_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let boot = dir.path().join("dmg_boot.bin");
    fs::write(&boot, [0u8; 10]).unwrap();
    let config = EmulatorConfig {
        skip_boot: false,
        dmg_boot_rom: Some(boot),
        ..EmulatorConfig::default()
    };
    let mut gb = GameBoy::new(&config);
    assert!(matches!(
        gb.load_rom_bytes(idle_rom()),
        Err(EmuError::Load(LoadError::BadBootRom {
            expected: 0x100,
            actual: 10
        }))
    ));
}

#[test]
fn serial_transfer_is_captured() {
    // LD A,'A'; LDH (SB),A; LD A,81; LDH (SC),A; JR -2
    let mut gb = machine(rom_only(&[
        0x3E, 0x41, 0xE0, 0x01, 0x3E, 0x81, 0xE0, 0x02, 0x18, 0xFE,
    ]));
    gb.bus.write(0xFF0F, 0x00);
    for _ in 0..4 {
        gb.step().unwrap();
    }
    assert_eq!(gb.take_serial_output(), b"A");
    assert!(gb.take_serial_output().is_empty());

    gb.run_frame().unwrap();
    assert_eq!(gb.bus.read(0xFF01), 0xFF);
    assert_eq!(gb.bus.read(0xFF02) & 0x80, 0);
    assert_ne!(gb.bus.reg(IoReg::If) & INT_SERIAL, 0);
}

#[test]
fn frames_produce_audio_samples() {
    let mut gb = machine(idle_rom());
    gb.run_frame().unwrap();
    let samples = gb.take_audio_samples();
    // Stereo pairs at 48 kHz for roughly one 59.7 Hz frame.
    assert!(samples.len() % 2 == 0);
    assert!((1500..=1800).contains(&samples.len()), "{}", samples.len());
    assert!(gb.take_audio_samples().is_empty());
}
