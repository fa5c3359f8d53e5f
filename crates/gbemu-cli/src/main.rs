use std::error::Error;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use clap::Parser;
use gbemu_core::config::{self, HardwareMode};
use gbemu_core::{EmulatorConfig, GameBoy, SCREEN_HEIGHT, SCREEN_WIDTH};
use log::{error, info};

#[derive(Parser, Debug)]
#[command(name = "gbemu", about = "Headless Game Boy / Game Boy Color emulator")]
struct Args {
    /// Path to ROM file
    rom: PathBuf,

    /// Config file (defaults to the per-user config path)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Force DMG mode
    #[arg(long, conflicts_with = "cgb")]
    dmg: bool,

    /// Force CGB mode
    #[arg(long, conflicts_with = "dmg")]
    cgb: bool,

    /// Path to boot ROM file
    #[arg(long)]
    boot_rom: Option<PathBuf>,

    /// Number of frames to run
    #[arg(long, default_value_t = 60)]
    frames: usize,

    /// Write the final frame as a binary PPM image
    #[arg(long)]
    screenshot: Option<PathBuf>,

    /// Write the produced audio as interleaved little-endian i16 stereo
    #[arg(long)]
    audio: Option<PathBuf>,

    /// Restore this save state before running
    #[arg(long)]
    load_state: Option<PathBuf>,

    /// Write a save state after running
    #[arg(long)]
    save_state: Option<PathBuf>,

    /// Print bytes sent over the serial port
    #[arg(long)]
    serial: bool,
}

fn build_config(args: &Args) -> EmulatorConfig {
    let path = args
        .config
        .clone()
        .unwrap_or_else(config::default_config_path);
    let mut cfg = config::load_from_file(&path);

    if args.dmg {
        cfg.mode = HardwareMode::Dmg;
    } else if args.cgb {
        cfg.mode = HardwareMode::Cgb;
    }

    if let Some(boot) = &args.boot_rom {
        cfg.skip_boot = false;
        cfg.dmg_boot_rom = Some(boot.clone());
        cfg.cgb_boot_rom = Some(boot.clone());
    }
    cfg
}

/// Binary PPM (P6) of an RGBA8 frame.
fn encode_ppm(rgba: &[u8], width: usize, height: usize) -> Vec<u8> {
    let mut out = format!("P6\n{width} {height}\n255\n").into_bytes();
    out.reserve(width * height * 3);
    for px in rgba.chunks_exact(4) {
        out.extend_from_slice(&px[..3]);
    }
    out
}

fn encode_pcm(samples: &[i16]) -> Vec<u8> {
    samples.iter().flat_map(|s| s.to_le_bytes()).collect()
}

fn print_serial(bytes: &[u8]) {
    if bytes.is_empty() {
        return;
    }
    let mut stdout = std::io::stdout().lock();
    let _ = stdout.write_all(bytes);
    let _ = stdout.flush();
}

fn write_file(path: &Path, data: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    fs::write(path, data)
}

fn run(args: &Args) -> Result<(), Box<dyn Error>> {
    let cfg = build_config(args);
    let mut gb = GameBoy::new(&cfg);
    gb.load_file(&args.rom)?;
    info!(
        "Emulator initialized in {} mode",
        if gb.is_cgb() { "CGB" } else { "DMG" }
    );

    if let Some(path) = &args.load_state {
        gb.load_state(path)?;
    }

    let mut audio = Vec::new();
    for _ in 0..args.frames {
        gb.run_frame()?;
        if args.audio.is_some() {
            audio.extend(gb.take_audio_samples());
        } else {
            gb.take_audio_samples();
        }
        if args.serial {
            print_serial(&gb.take_serial_output());
        }
    }
    info!("Ran {} frames", args.frames);

    if let Some(path) = &args.screenshot {
        write_file(
            path,
            &encode_ppm(gb.screen_data(), SCREEN_WIDTH, SCREEN_HEIGHT),
        )?;
        info!("Wrote screenshot to {}", path.display());
    }

    if let Some(path) = &args.audio {
        write_file(path, &encode_pcm(&audio))?;
        info!("Wrote {} audio samples to {}", audio.len(), path.display());
    }

    if let Some(path) = &args.save_state {
        gb.save_state(path)?;
    }

    gb.save_battery()?;
    Ok(())
}

fn main() {
    env_logger::init();
    let args = Args::parse();

    if let Err(e) = run(&args) {
        error!("{e}");
        eprintln!("gbemu: {e}");
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ppm_drops_alpha() {
        let rgba = [1, 2, 3, 255, 4, 5, 6, 255];
        let ppm = encode_ppm(&rgba, 2, 1);
        assert_eq!(ppm, b"P6\n2 1\n255\n\x01\x02\x03\x04\x05\x06");
    }

    #[test]
    fn pcm_is_little_endian() {
        assert_eq!(encode_pcm(&[0x0102, -1]), vec![0x02, 0x01, 0xFF, 0xFF]);
    }

    #[test]
    fn flags_override_config() {
        let dir = tempfile::tempdir().unwrap();
        let cfg_path = dir.path().join("config.toml");
        fs::write(&cfg_path, "mode = \"dmg\"\nskip_boot = true\n").unwrap();
        let args = Args::parse_from([
            "gbemu",
            "game.gb",
            "--config",
            cfg_path.to_str().unwrap(),
            "--cgb",
            "--boot-rom",
            "boot.bin",
        ]);
        let cfg = build_config(&args);
        assert_eq!(cfg.mode, HardwareMode::Cgb);
        assert!(!cfg.skip_boot);
        assert_eq!(cfg.cgb_boot_rom.as_deref(), Some(Path::new("boot.bin")));
    }

    #[test]
    fn dmg_and_cgb_conflict() {
        assert!(Args::try_parse_from(["gbemu", "game.gb", "--dmg", "--cgb"]).is_err());
    }
}
