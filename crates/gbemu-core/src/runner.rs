//! Background emulation thread for frontends.
//!
//! The runner owns a [`GameBoy`] behind `Arc<Mutex<_>>` and runs whole
//! frames on its own thread. Finished frames are copied into a shared
//! [`FrameBuffer`] that the render side polls. Stop, pause and single-step
//! requests are plain atomics; a paused thread parks on a condition variable
//! until it is stepped, resumed or stopped.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};

use crate::bus::Key;
use crate::error::EmuError;
use crate::gameboy::GameBoy;
use crate::ppu::FRAME_BYTES;

/// One DMG frame at 4194304 Hz / 70224 cycles.
const FRAME_DURATION: Duration = Duration::from_nanos(16_742_706);

/// Latest completed frame as seen by the render side.
#[derive(Debug, Clone)]
pub struct FrameBuffer {
    pub pixels: Vec<u8>,
    /// A new frame arrived since the consumer last cleared this.
    pub ready_to_draw: bool,
    /// Output dimensions changed; the consumer should rebuild its surface.
    pub resized: bool,
    /// Frames published since the runner was created.
    pub frame: u64,
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self {
            pixels: vec![0xFF; FRAME_BYTES],
            ready_to_draw: false,
            resized: true,
            frame: 0,
        }
    }
}

#[derive(Default)]
struct Control {
    stopped: AtomicBool,
    paused: AtomicBool,
    step: AtomicBool,
    loading: AtomicBool,
    throttled: AtomicBool,
    step_lock: Mutex<()>,
    step_cv: Condvar,
    error: Mutex<Option<EmuError>>,
}

impl Control {
    fn wake(&self) {
        let _guard = lock(&self.step_lock);
        self.step_cv.notify_all();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct Runner {
    gb: Arc<Mutex<GameBoy>>,
    frame: Arc<Mutex<FrameBuffer>>,
    control: Arc<Control>,
    handle: Option<JoinHandle<()>>,
}

impl Runner {
    pub fn new(gb: GameBoy) -> Self {
        let control = Control::default();
        control.throttled.store(true, Ordering::Relaxed);
        Self {
            gb: Arc::new(Mutex::new(gb)),
            frame: Arc::new(Mutex::new(FrameBuffer::default())),
            control: Arc::new(control),
            handle: None,
        }
    }

    pub fn gameboy(&self) -> Arc<Mutex<GameBoy>> {
        Arc::clone(&self.gb)
    }

    pub fn frame_buffer(&self) -> Arc<Mutex<FrameBuffer>> {
        Arc::clone(&self.frame)
    }

    /// Pace frames to real time. Unthrottled runners go as fast as possible.
    pub fn set_throttled(&self, throttled: bool) {
        self.control.throttled.store(throttled, Ordering::Relaxed);
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    pub fn is_paused(&self) -> bool {
        self.control.paused.load(Ordering::Acquire)
    }

    /// Spawns the emulation thread. Does nothing if one is already running.
    pub fn start(&mut self) {
        if self.is_running() {
            return;
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        self.control.stopped.store(false, Ordering::Release);
        self.control.step.store(false, Ordering::Release);

        let gb = Arc::clone(&self.gb);
        let frame = Arc::clone(&self.frame);
        let control = Arc::clone(&self.control);
        self.handle = Some(thread::spawn(move || emulation_loop(&gb, &frame, &control)));
        info!("Emulation thread started");
    }

    /// Stops the emulation thread and waits for it to exit.
    pub fn stop(&mut self) {
        self.control.stopped.store(true, Ordering::Release);
        self.control.wake();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("Emulation thread panicked");
            }
            info!("Emulation thread stopped");
        }
    }

    pub fn pause(&self) {
        self.control.paused.store(true, Ordering::Release);
    }

    pub fn resume(&self) {
        self.control.paused.store(false, Ordering::Release);
        self.control.wake();
    }

    /// Runs exactly one frame while paused.
    pub fn step_frame(&self) {
        self.control.step.store(true, Ordering::Release);
        self.control.wake();
    }

    pub fn key_down(&self, key: Key) {
        lock(&self.gb).key_down(key);
    }

    pub fn key_up(&self, key: Key) {
        lock(&self.gb).key_up(key);
    }

    /// Returns the newest frame if one arrived since the last call.
    pub fn take_frame(&self) -> Option<Vec<u8>> {
        let mut frame = lock(&self.frame);
        if !frame.ready_to_draw {
            return None;
        }
        frame.ready_to_draw = false;
        Some(frame.pixels.clone())
    }

    /// The error that stopped the emulation thread, if any.
    pub fn take_error(&self) -> Option<EmuError> {
        lock(&self.control.error).take()
    }

    /// Loads a ROM into the running machine. Returns `Ok(false)` when another
    /// load is still in flight and this one was dropped.
    pub fn load_rom(&self, path: &Path) -> Result<bool, EmuError> {
        if self.control.loading.swap(true, Ordering::AcqRel) {
            warn!(
                "Ignoring load of {} while another load is in progress",
                path.display()
            );
            return Ok(false);
        }
        let result = lock(&self.gb).load_file(path);
        self.control.loading.store(false, Ordering::Release);
        result?;
        lock(&self.control.error).take();
        Ok(true)
    }
}

impl Drop for Runner {
    fn drop(&mut self) {
        self.stop();
    }
}

fn emulation_loop(gb: &Mutex<GameBoy>, frame: &Mutex<FrameBuffer>, control: &Control) {
    let mut next_frame = Instant::now();
    loop {
        if control.stopped.load(Ordering::Acquire) {
            break;
        }

        if control.paused.load(Ordering::Acquire) {
            let guard = lock(&control.step_lock);
            let _guard = control
                .step_cv
                .wait_while(guard, |_| {
                    control.paused.load(Ordering::Acquire)
                        && !control.step.load(Ordering::Acquire)
                        && !control.stopped.load(Ordering::Acquire)
                })
                .unwrap_or_else(PoisonError::into_inner);
            if control.stopped.load(Ordering::Acquire) {
                break;
            }
            if control.step.swap(false, Ordering::AcqRel) {
                debug!("Single-stepping one frame");
            }
            next_frame = Instant::now();
        }

        let result = {
            let mut gb = lock(gb);
            let result = gb.run_frame();
            if gb.is_ready_to_draw() {
                let mut out = lock(frame);
                out.pixels.copy_from_slice(gb.screen_data());
                out.ready_to_draw = true;
                out.resized |= gb.is_resized();
                out.frame += 1;
                gb.clear_ready_to_draw();
                gb.clear_resized();
            }
            result
        };

        if let Err(e) = result {
            error!("Emulation stopped: {e}");
            *lock(&control.error) = Some(e);
            control.stopped.store(true, Ordering::Release);
            break;
        }

        if control.throttled.load(Ordering::Relaxed) {
            next_frame += FRAME_DURATION;
            let now = Instant::now();
            if next_frame > now {
                thread::sleep(next_frame - now);
            } else {
                next_frame = now;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EmulatorConfig;

    #[test]
    fn concurrent_load_is_dropped() {
        let runner = Runner::new(GameBoy::new(&EmulatorConfig::default()));
        runner.control.loading.store(true, Ordering::Release);
        let loaded = runner.load_rom(Path::new("/nonexistent.gb")).unwrap();
        assert!(!loaded);
    }

    #[test]
    fn failed_load_releases_the_slot() {
        let runner = Runner::new(GameBoy::new(&EmulatorConfig::default()));
        assert!(runner.load_rom(Path::new("/nonexistent.gb")).is_err());
        assert!(!runner.control.loading.load(Ordering::Acquire));
    }
}
