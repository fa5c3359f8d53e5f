mod common;

use std::fs;
use std::thread;
use std::time::{Duration, Instant};

use common::{idle_rom, machine, rom_only};
use gbemu_core::error::{CpuError, EmuError};
use gbemu_core::ppu::FRAME_BYTES;
use gbemu_core::{EmulatorConfig, GameBoy, Runner};

const TIMEOUT: Duration = Duration::from_secs(10);

fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < TIMEOUT {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    false
}

fn frame_count(runner: &Runner) -> u64 {
    runner.frame_buffer().lock().unwrap().frame
}

fn fast_runner() -> Runner {
    let runner = Runner::new(machine(idle_rom()));
    runner.set_throttled(false);
    runner
}

#[test]
fn runs_frames_until_stopped() {
    let mut runner = fast_runner();
    runner.start();
    assert!(runner.is_running());
    assert!(wait_until(|| frame_count(&runner) >= 3));
    runner.stop();
    assert!(!runner.is_running());

    let frame = runner.take_frame().expect("a frame was published");
    assert_eq!(frame.len(), FRAME_BYTES);
    assert!(runner.take_frame().is_none());
    assert!(runner.take_error().is_none());
}

#[test]
fn pause_holds_and_step_advances_one_frame() {
    let mut runner = fast_runner();
    runner.start();
    assert!(wait_until(|| frame_count(&runner) >= 1));

    runner.pause();
    assert!(runner.is_paused());
    thread::sleep(Duration::from_millis(50));
    let held = frame_count(&runner);
    thread::sleep(Duration::from_millis(50));
    assert_eq!(frame_count(&runner), held);

    runner.step_frame();
    assert!(wait_until(|| frame_count(&runner) == held + 1));
    thread::sleep(Duration::from_millis(50));
    assert_eq!(frame_count(&runner), held + 1);

    runner.resume();
    assert!(wait_until(|| frame_count(&runner) > held + 2));
    runner.stop();
}

#[test]
fn lockup_stops_the_thread_with_an_error() {
    let mut runner = Runner::new(machine(rom_only(&[0xD3])));
    runner.set_throttled(false);
    runner.start();
    assert!(wait_until(|| !runner.is_running()));
    assert!(matches!(
        runner.take_error(),
        Some(EmuError::Cpu(CpuError::IllegalOpcode { opcode: 0xD3, .. }))
    ));
    runner.stop();
}

#[test]
fn load_rom_replaces_the_cartridge() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("idle.gb");
    fs::write(&path, idle_rom()).unwrap();

    let runner = Runner::new(GameBoy::new(&EmulatorConfig::default()));
    assert!(runner.load_rom(&path).unwrap());
    let gb = runner.gameboy();
    let gb = gb.lock().unwrap();
    assert_eq!(gb.rom_title(), Some("TESTROM"));
    assert_eq!(gb.rom_path(), Some(path.as_path()));
}

#[test]
fn keys_reach_the_machine() {
    let runner = fast_runner();
    runner.key_down(gbemu_core::Key::A);
    let gb = runner.gameboy();
    let mut gb = gb.lock().unwrap();
    gb.bus.write(0xFF00, 0x10);
    assert_eq!(gb.bus.read(0xFF00) & 0x01, 0);
}
