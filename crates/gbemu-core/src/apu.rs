//! Sound channels and the stereo mixer.
//!
//! [`Sound`] is the register side of the APU and lives inside the bus so
//! register writes land on channel state directly. The timer clocks its
//! frame sequencer. [`Apu`] advances the channel timers and turns the
//! digital channel outputs into filtered 16-bit stereo samples.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::bus::Bus;

#[cfg(feature = "apu-trace")]
macro_rules! apu_trace {
    ($($arg:tt)*) => {
        log::trace!($($arg)*);
    };
}
#[cfg(not(feature = "apu-trace"))]
macro_rules! apu_trace {
    ($($arg:tt)*) => {};
}

pub const CPU_CLOCK_HZ: u64 = 4_194_304;
const VOLUME_FACTOR: i16 = 64;

/// Register contents after the boot ROM. Unlisted NR registers read 0xFF.
const POST_BOOT_WRITES: [(u16, u8); 16] = [
    (0xFF10, 0x80),
    (0xFF11, 0xBF),
    (0xFF12, 0xF3),
    (0xFF14, 0xBF),
    (0xFF16, 0x3F),
    (0xFF17, 0x00),
    (0xFF19, 0xBF),
    (0xFF1A, 0x7F),
    (0xFF1C, 0x9F),
    (0xFF1E, 0xBF),
    (0xFF21, 0x00),
    (0xFF22, 0x00),
    (0xFF23, 0xBF),
    (0xFF24, 0x77),
    (0xFF25, 0xF3),
    (0xFF26, 0xF1),
];

/// Square waveforms, most significant bit first: 12.5%, 25%, 50%, 75%.
const DUTY_PATTERNS: [u8; 4] = [0b0000_0001, 0b1000_0001, 0b1000_0111, 0b0111_1110];

const NOISE_DIVISORS: [u32; 8] = [8, 16, 32, 48, 64, 80, 96, 112];

/// Volume envelope, configured by the raw NRx2 value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
struct Envelope {
    nrx2: u8,
    volume: u8,
    countdown: u8,
}

impl Envelope {
    fn pace(&self) -> u8 {
        self.nrx2 & 0x07
    }

    fn rising(&self) -> bool {
        self.nrx2 & 0x08 != 0
    }

    fn tick(&mut self) {
        let pace = self.pace();
        if pace == 0 {
            return;
        }
        self.countdown = self.countdown.saturating_sub(1);
        if self.countdown > 0 {
            return;
        }
        self.countdown = pace;
        self.volume = match (self.rising(), self.volume) {
            (true, v) if v < 15 => v + 1,
            (false, v) if v > 0 => v - 1,
            (_, v) => v,
        };
    }

    fn restart(&mut self) {
        self.volume = self.nrx2 >> 4;
        self.countdown = self.pace();
    }
}

/// Channel 1 frequency sweep, configured by the raw NR10 value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
struct Sweep {
    nr10: u8,
    countdown: u8,
    shadow: u16,
    active: bool,
    /// A subtraction has been calculated since the last trigger.
    negated: bool,
}

impl Sweep {
    fn pace(&self) -> u8 {
        (self.nr10 >> 4) & 0x07
    }

    fn shift(&self) -> u8 {
        self.nr10 & 0x07
    }

    fn decreasing(&self) -> bool {
        self.nr10 & 0x08 != 0
    }

    fn reload_countdown(&mut self) {
        self.countdown = match self.pace() {
            0 => 8,
            pace => pace,
        };
    }

    /// Next shadow frequency, or `None` when it would overflow 11 bits.
    fn next_frequency(&mut self) -> Option<u16> {
        let delta = self.shadow >> self.shift();
        let next = if self.decreasing() {
            self.negated = true;
            self.shadow - delta
        } else {
            self.shadow + delta
        };
        (next <= 0x7FF).then_some(next)
    }

    /// NR10 write. Leaving subtraction mode after a subtraction was
    /// calculated silences the channel; returns false in that case.
    fn write(&mut self, val: u8) -> bool {
        let was_decreasing = self.decreasing();
        self.nr10 = val;
        !(was_decreasing && !self.decreasing() && self.negated)
    }

    /// Trigger. Returns false when the immediate overflow check fails.
    fn restart(&mut self, freq: u16) -> bool {
        self.shadow = freq;
        self.reload_countdown();
        self.active = self.pace() != 0 || self.shift() != 0;
        self.negated = false;
        self.shift() == 0 || self.next_frequency().is_some()
    }

    /// Frame sequencer clock. Returns false when the channel overflowed.
    fn tick(&mut self, freq: &mut u16) -> bool {
        self.countdown = self.countdown.saturating_sub(1);
        if self.countdown > 0 {
            return true;
        }
        self.reload_countdown();
        if !self.active || self.pace() == 0 {
            return true;
        }
        let Some(next) = self.next_frequency() else {
            self.active = false;
            return false;
        };
        if self.shift() == 0 {
            return true;
        }
        self.shadow = next;
        *freq = next;
        self.active = self.next_frequency().is_some();
        self.active
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
struct LengthCounter {
    counter: u16,
    enabled: bool,
}

impl LengthCounter {
    /// Returns true when the counter just expired.
    fn clock(&mut self) -> bool {
        if self.enabled && self.counter > 0 {
            self.counter -= 1;
            return self.counter == 0;
        }
        false
    }

    /// NRx4 write. `extra_clock` is set when the next sequencer step does not
    /// clock length. Returns true when the extra clock expired the counter.
    fn write_enable(&mut self, enable: bool, extra_clock: bool) -> bool {
        let was_enabled = self.enabled;
        self.enabled = enable;
        !was_enabled && enable && extra_clock && self.clock()
    }

    fn trigger(&mut self, max: u16, extra_clock: bool) {
        if self.counter == 0 {
            self.counter = if self.enabled && extra_clock { max - 1 } else { max };
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
struct SquareChannel {
    enabled: bool,
    dac_enabled: bool,
    length: LengthCounter,
    duty: u8,
    duty_pos: u8,
    frequency: u16,
    timer: u32,
    envelope: Envelope,
    sweep: Option<Sweep>,
}

impl SquareChannel {
    fn new(with_sweep: bool) -> Self {
        Self {
            sweep: with_sweep.then(Sweep::default),
            ..Default::default()
        }
    }

    fn period(&self) -> u32 {
        (2048 - self.frequency as u32) * 4
    }

    fn step(&mut self, cycles: u32) {
        if !self.enabled {
            return;
        }
        let mut cycles = cycles;
        while cycles >= self.timer {
            cycles -= self.timer;
            self.timer = self.period();
            self.duty_pos = (self.duty_pos + 1) & 7;
        }
        self.timer -= cycles;
    }

    fn output(&self) -> u8 {
        if !self.enabled {
            return 0;
        }
        let high = (DUTY_PATTERNS[self.duty as usize] >> (7 - self.duty_pos)) & 1;
        high * self.envelope.volume
    }

    fn write_envelope(&mut self, val: u8) {
        self.envelope.nrx2 = val;
        self.dac_enabled = val & 0xF8 != 0;
        if !self.dac_enabled {
            self.enabled = false;
        }
    }

    fn trigger(&mut self, extra_clock: bool) {
        self.enabled = self.dac_enabled;
        self.length.trigger(64, extra_clock);
        self.timer = self.period();
        self.envelope.restart();
        if let Some(sweep) = self.sweep.as_mut()
            && !sweep.restart(self.frequency)
        {
            self.enabled = false;
        }
    }

    fn clock_length(&mut self) {
        if self.length.clock() {
            self.enabled = false;
        }
    }

    fn clock_sweep(&mut self) {
        if let Some(sweep) = self.sweep.as_mut()
            && !sweep.tick(&mut self.frequency)
        {
            self.enabled = false;
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
struct WaveChannel {
    enabled: bool,
    dac_enabled: bool,
    length: LengthCounter,
    /// NR32 output level selector.
    volume: u8,
    position: u8,
    sample_buffer: u8,
    frequency: u16,
    timer: u32,
}

impl WaveChannel {
    fn period(&self) -> u32 {
        (2048 - self.frequency as u32) * 2
    }

    fn step(&mut self, cycles: u32, wave_ram: &[u8; 0x10]) {
        if !self.enabled {
            return;
        }
        let mut cycles = cycles;
        while cycles >= self.timer {
            cycles -= self.timer;
            self.timer = self.period();
            self.position = (self.position + 1) & 0x1F;
            let byte = wave_ram[(self.position / 2) as usize];
            self.sample_buffer = if self.position & 1 == 0 {
                byte >> 4
            } else {
                byte & 0x0F
            };
        }
        self.timer -= cycles;
    }

    fn output(&self) -> u8 {
        if !self.enabled {
            return 0;
        }
        match self.volume {
            1 => self.sample_buffer,
            2 => self.sample_buffer >> 1,
            3 => self.sample_buffer >> 2,
            _ => 0,
        }
    }

    fn trigger(&mut self, extra_clock: bool) {
        self.enabled = self.dac_enabled;
        self.length.trigger(256, extra_clock);
        self.position = 0;
        // Wave playback starts after a short delay.
        self.timer = self.period() + 6;
    }

    fn clock_length(&mut self) {
        if self.length.clock() {
            self.enabled = false;
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
struct NoiseChannel {
    enabled: bool,
    dac_enabled: bool,
    length: LengthCounter,
    envelope: Envelope,
    clock_shift: u8,
    divisor: u8,
    width7: bool,
    lfsr: u16,
    timer: u32,
}

impl NoiseChannel {
    fn period(&self) -> u32 {
        NOISE_DIVISORS[self.divisor as usize] << self.clock_shift
    }

    fn step(&mut self, cycles: u32) {
        // Shifts 14 and 15 stop the LFSR.
        if !self.enabled || self.clock_shift >= 14 {
            return;
        }
        let mut cycles = cycles;
        while cycles >= self.timer {
            cycles -= self.timer;
            self.timer = self.period();
            let bit = (self.lfsr ^ (self.lfsr >> 1)) & 1;
            self.lfsr = (self.lfsr >> 1) | (bit << 14);
            if self.width7 {
                self.lfsr = (self.lfsr & !0x40) | (bit << 6);
            }
        }
        self.timer -= cycles;
    }

    fn output(&self) -> u8 {
        if !self.enabled || self.lfsr & 1 != 0 {
            return 0;
        }
        self.envelope.volume
    }

    fn write_envelope(&mut self, val: u8) {
        self.envelope.nrx2 = val;
        self.dac_enabled = val & 0xF8 != 0;
        if !self.dac_enabled {
            self.enabled = false;
        }
    }

    fn trigger(&mut self, extra_clock: bool) {
        self.enabled = self.dac_enabled;
        self.length.trigger(64, extra_clock);
        self.lfsr = 0x7FFF;
        self.timer = self.period();
        self.envelope.restart();
    }

    fn clock_length(&mut self) {
        if self.length.clock() {
            self.enabled = false;
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
struct FrameSequencer {
    /// Step executed by the next clock.
    step: u8,
}

impl FrameSequencer {
    fn advance(&mut self) -> u8 {
        let s = self.step;
        self.step = (self.step + 1) & 7;
        s
    }

    /// True when the next step leaves length alone, i.e. we are in the first
    /// half of a length period.
    fn next_skips_length(&self) -> bool {
        self.step & 1 == 1
    }
}

/// Register-side state of the four sound channels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sound {
    cgb: bool,
    power: bool,
    ch1: SquareChannel,
    ch2: SquareChannel,
    ch3: WaveChannel,
    ch4: NoiseChannel,
    wave_ram: [u8; 0x10],
    nr50: u8,
    nr51: u8,
    sequencer: FrameSequencer,
    /// Last values written to NR10-NR51, read back through masks.
    regs: Vec<u8>,
}

impl Sound {
    pub fn new(cgb: bool) -> Self {
        Self {
            cgb,
            power: false,
            ch1: SquareChannel::new(true),
            ch2: SquareChannel::new(false),
            ch3: WaveChannel::default(),
            ch4: NoiseChannel::default(),
            wave_ram: [0; 0x10],
            nr50: 0,
            nr51: 0,
            sequencer: FrameSequencer::default(),
            regs: vec![0; 0x30],
        }
    }

    /// State left behind by the boot ROM's start-up chime.
    pub fn apply_post_boot_state(&mut self) {
        self.power = true;
        self.regs.fill(0xFF);
        for (addr, val) in POST_BOOT_WRITES {
            self.regs[(addr - 0xFF10) as usize] = val;
        }
        self.regs[0x20..].fill(0);
        self.nr50 = 0x77;
        self.nr51 = 0xF3;
        self.ch1.duty = 2;
        self.ch1.envelope.nrx2 = 0xF3;
        self.ch1.dac_enabled = true;
        self.ch1.enabled = true;
        self.ch1.frequency = 0x07C1;
        self.ch1.timer = self.ch1.period();
        self.ch3.frequency = 0x03FF;
        self.ch3.timer = self.ch3.period();
        self.ch4.lfsr = 0x7FFF;
    }

    pub fn powered(&self) -> bool {
        self.power
    }

    pub fn sequencer_step(&self) -> u8 {
        self.sequencer.step
    }

    pub fn nr50(&self) -> u8 {
        self.nr50
    }

    pub fn nr51(&self) -> u8 {
        self.nr51
    }

    fn read_mask(addr: u16) -> u8 {
        match addr {
            0xFF10 => 0x80,
            0xFF11 | 0xFF16 => 0x3F,
            0xFF13 | 0xFF18 | 0xFF1B | 0xFF1D | 0xFF20 => 0xFF,
            0xFF14 | 0xFF19 | 0xFF1E | 0xFF23 => 0xBF,
            0xFF1A => 0x7F,
            0xFF1C => 0x9F,
            0xFF15 | 0xFF1F | 0xFF27..=0xFF2F => 0xFF,
            _ => 0x00,
        }
    }

    pub fn read_reg(&self, addr: u16) -> u8 {
        match addr {
            0xFF26 => {
                let mut val = 0x70;
                if self.power {
                    val |= 0x80;
                }
                for (bit, on) in self.channel_status().into_iter().enumerate() {
                    if on {
                        val |= 1 << bit;
                    }
                }
                val
            }
            0xFF30..=0xFF3F => {
                if self.ch3.enabled {
                    0xFF
                } else {
                    self.wave_ram[(addr - 0xFF30) as usize]
                }
            }
            0xFF10..=0xFF2F => self.regs[(addr - 0xFF10) as usize] | Self::read_mask(addr),
            _ => 0xFF,
        }
    }

    pub fn channel_status(&self) -> [bool; 4] {
        [
            self.ch1.enabled,
            self.ch2.enabled,
            self.ch3.enabled,
            self.ch4.enabled,
        ]
    }

    pub fn write_reg(&mut self, addr: u16, val: u8) {
        if let 0xFF30..=0xFF3F = addr {
            if !self.ch3.enabled {
                self.wave_ram[(addr - 0xFF30) as usize] = val;
            }
            return;
        }
        if addr == 0xFF26 {
            self.write_power(val & 0x80 != 0);
            return;
        }
        if !self.power {
            // DMG keeps length counters writable while powered off.
            if !self.cgb {
                match addr {
                    0xFF11 => self.ch1.length.counter = 64 - (val & 0x3F) as u16,
                    0xFF16 => self.ch2.length.counter = 64 - (val & 0x3F) as u16,
                    0xFF1B => self.ch3.length.counter = 256 - val as u16,
                    0xFF20 => self.ch4.length.counter = 64 - (val & 0x3F) as u16,
                    _ => {}
                }
            }
            return;
        }
        if !(0xFF10..=0xFF25).contains(&addr) {
            return;
        }
        self.regs[(addr - 0xFF10) as usize] = val;

        let extra_clock = self.sequencer.next_skips_length();
        match addr {
            0xFF10 => {
                if let Some(sweep) = self.ch1.sweep.as_mut()
                    && !sweep.write(val)
                {
                    self.ch1.enabled = false;
                }
            }
            0xFF11 => {
                self.ch1.duty = val >> 6;
                self.ch1.length.counter = 64 - (val & 0x3F) as u16;
            }
            0xFF12 => self.ch1.write_envelope(val),
            0xFF13 => self.ch1.frequency = (self.ch1.frequency & 0x700) | val as u16,
            0xFF14 => {
                self.ch1.frequency = (self.ch1.frequency & 0xFF) | (((val & 0x07) as u16) << 8);
                if self.ch1.length.write_enable(val & 0x40 != 0, extra_clock) && val & 0x80 == 0 {
                    self.ch1.enabled = false;
                }
                if val & 0x80 != 0 {
                    apu_trace!("ch1 trigger freq={:03X}", self.ch1.frequency);
                    self.ch1.trigger(extra_clock);
                }
            }
            0xFF16 => {
                self.ch2.duty = val >> 6;
                self.ch2.length.counter = 64 - (val & 0x3F) as u16;
            }
            0xFF17 => self.ch2.write_envelope(val),
            0xFF18 => self.ch2.frequency = (self.ch2.frequency & 0x700) | val as u16,
            0xFF19 => {
                self.ch2.frequency = (self.ch2.frequency & 0xFF) | (((val & 0x07) as u16) << 8);
                if self.ch2.length.write_enable(val & 0x40 != 0, extra_clock) && val & 0x80 == 0 {
                    self.ch2.enabled = false;
                }
                if val & 0x80 != 0 {
                    apu_trace!("ch2 trigger freq={:03X}", self.ch2.frequency);
                    self.ch2.trigger(extra_clock);
                }
            }
            0xFF1A => {
                self.ch3.dac_enabled = val & 0x80 != 0;
                if !self.ch3.dac_enabled {
                    self.ch3.enabled = false;
                }
            }
            0xFF1B => self.ch3.length.counter = 256 - val as u16,
            0xFF1C => self.ch3.volume = (val >> 5) & 0x03,
            0xFF1D => self.ch3.frequency = (self.ch3.frequency & 0x700) | val as u16,
            0xFF1E => {
                self.ch3.frequency = (self.ch3.frequency & 0xFF) | (((val & 0x07) as u16) << 8);
                if self.ch3.length.write_enable(val & 0x40 != 0, extra_clock) && val & 0x80 == 0 {
                    self.ch3.enabled = false;
                }
                if val & 0x80 != 0 {
                    apu_trace!("ch3 trigger freq={:03X}", self.ch3.frequency);
                    self.ch3.trigger(extra_clock);
                }
            }
            0xFF20 => self.ch4.length.counter = 64 - (val & 0x3F) as u16,
            0xFF21 => self.ch4.write_envelope(val),
            0xFF22 => {
                self.ch4.clock_shift = val >> 4;
                self.ch4.width7 = val & 0x08 != 0;
                self.ch4.divisor = val & 0x07;
            }
            0xFF23 => {
                if self.ch4.length.write_enable(val & 0x40 != 0, extra_clock) && val & 0x80 == 0 {
                    self.ch4.enabled = false;
                }
                if val & 0x80 != 0 {
                    apu_trace!("ch4 trigger nr43={:02X}", self.regs[0x12]);
                    self.ch4.trigger(extra_clock);
                }
            }
            0xFF24 => self.nr50 = val,
            0xFF25 => self.nr51 = val,
            _ => {}
        }
    }

    fn write_power(&mut self, on: bool) {
        if !on && self.power {
            let lengths = [
                self.ch1.length.counter,
                self.ch2.length.counter,
                self.ch3.length.counter,
                self.ch4.length.counter,
            ];
            self.ch1 = SquareChannel::new(true);
            self.ch2 = SquareChannel::new(false);
            self.ch3 = WaveChannel::default();
            self.ch4 = NoiseChannel::default();
            if !self.cgb {
                self.ch1.length.counter = lengths[0];
                self.ch2.length.counter = lengths[1];
                self.ch3.length.counter = lengths[2];
                self.ch4.length.counter = lengths[3];
            }
            self.regs.fill(0);
            self.nr50 = 0;
            self.nr51 = 0;
        } else if on && !self.power {
            self.sequencer.step = 0;
            self.ch1.duty_pos = 0;
            self.ch2.duty_pos = 0;
            self.ch3.sample_buffer = 0;
        }
        self.power = on;
    }

    /// One 512 Hz frame-sequencer tick, driven by the timer's DIV edge.
    pub fn clock_frame_sequencer(&mut self) {
        if !self.power {
            return;
        }
        let step = self.sequencer.advance();
        if step & 1 == 0 {
            self.ch1.clock_length();
            self.ch2.clock_length();
            self.ch3.clock_length();
            self.ch4.clock_length();
        }
        if step == 2 || step == 6 {
            self.ch1.clock_sweep();
        }
        if step == 7 {
            self.ch1.envelope.tick();
            self.ch2.envelope.tick();
            self.ch4.envelope.tick();
        }
    }

    /// Advances the channel frequency timers by `cycles` normal-speed cycles.
    pub fn step(&mut self, cycles: u32) {
        if !self.power {
            return;
        }
        self.ch1.step(cycles);
        self.ch2.step(cycles);
        self.ch3.step(cycles, &self.wave_ram);
        self.ch4.step(cycles);
    }

    /// Digital channel outputs, 0-15 each.
    pub fn outputs(&self) -> [u8; 4] {
        [
            self.ch1.output(),
            self.ch2.output(),
            self.ch3.output(),
            self.ch4.output(),
        ]
    }

    fn dacs(&self) -> [bool; 4] {
        [
            self.ch1.dac_enabled,
            self.ch2.dac_enabled,
            self.ch3.dac_enabled,
            self.ch4.dac_enabled,
        ]
    }
}

/// One-pole DC blocker for a single output terminal.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
struct HighPass {
    prev_in: f32,
    prev_out: f32,
}

impl HighPass {
    fn filter(&mut self, x: f32, r: f32) -> f32 {
        let y = x - self.prev_in + r * self.prev_out;
        self.prev_in = x;
        self.prev_out = y;
        y
    }

    fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Mixer and sample queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Apu {
    sample_rate: u32,
    /// Fixed-point phase: advances by `sample_rate` per cycle, one sample per
    /// `CPU_CLOCK_HZ`.
    phase: u64,
    hp_coef: f32,
    /// Left, right.
    high_pass: [HighPass; 2],
    #[serde(skip)]
    samples: VecDeque<i16>,
}

impl Apu {
    pub fn new(sample_rate: u32) -> Self {
        let sample_rate = sample_rate.max(1);
        Self {
            sample_rate,
            phase: 0,
            hp_coef: Self::calc_hp_coef(sample_rate),
            high_pass: [HighPass::default(); 2],
            samples: VecDeque::with_capacity(sample_rate as usize / 10),
        }
    }

    fn calc_hp_coef(rate: u32) -> f32 {
        0.999_958_f32.powf(CPU_CLOCK_HZ as f32 / rate as f32)
    }

    fn max_samples(&self) -> usize {
        // One second of stereo audio.
        self.sample_rate as usize * 2
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Steps the channels by `cycles` (normal-speed) and emits samples at the
    /// configured rate.
    pub fn update(&mut self, cycles: u32, bus: &mut Bus) {
        let rate = self.sample_rate as u64;
        let mut remaining = cycles;
        while remaining > 0 {
            let until_sample = (CPU_CLOCK_HZ - self.phase).div_ceil(rate).max(1) as u32;
            let chunk = remaining.min(until_sample);
            bus.sound.step(chunk);
            self.phase += chunk as u64 * rate;
            remaining -= chunk;
            if self.phase >= CPU_CLOCK_HZ {
                self.phase -= CPU_CLOCK_HZ;
                let (left, right) = self.mix_output(&bus.sound);
                self.push_sample(left);
                self.push_sample(right);
            }
        }
    }

    fn push_sample(&mut self, s: i16) {
        if self.samples.len() >= self.max_samples() {
            self.samples.pop_front();
        }
        self.samples.push_back(s);
    }

    fn mix_output(&mut self, sound: &Sound) -> (i16, i16) {
        let dacs = sound.dacs();
        if !sound.powered() || !dacs.iter().any(|&d| d) {
            self.high_pass.iter_mut().for_each(HighPass::reset);
            return (0, 0);
        }

        let outputs = sound.outputs();
        let nr51 = sound.nr51();
        let mut left = 0i16;
        let mut right = 0i16;
        for ch in 0..4 {
            if !dacs[ch] {
                continue;
            }
            // DAC maps 0..15 onto -15..15.
            let analog = outputs[ch] as i16 * 2 - 15;
            if nr51 & (0x10 << ch) != 0 {
                left += analog;
            }
            if nr51 & (0x01 << ch) != 0 {
                right += analog;
            }
        }

        let nr50 = sound.nr50();
        let left_vol = (((nr50 >> 4) & 0x07) + 1) as i16;
        let right_vol = ((nr50 & 0x07) + 1) as i16;
        let [hp_left, hp_right] = &mut self.high_pass;
        let left = hp_left.filter((left * left_vol * VOLUME_FACTOR) as f32, self.hp_coef);
        let right = hp_right.filter((right * right_vol * VOLUME_FACTOR) as f32, self.hp_coef);
        (left.round() as i16, right.round() as i16)
    }

    /// Drains queued interleaved stereo samples.
    pub fn take_samples(&mut self) -> Vec<i16> {
        self.samples.drain(..).collect()
    }

    pub fn queued_samples(&self) -> usize {
        self.samples.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn powered() -> Sound {
        let mut s = Sound::new(false);
        s.write_reg(0xFF26, 0x80);
        s
    }

    #[test]
    fn dac_off_disables_channel() {
        let mut s = powered();
        s.write_reg(0xFF12, 0xF0);
        s.write_reg(0xFF14, 0x80);
        assert!(s.channel_status()[0]);
        s.write_reg(0xFF12, 0x07);
        assert!(!s.channel_status()[0]);
        assert_eq!(s.read_reg(0xFF26) & 0x0F, 0);
    }

    #[test]
    fn trigger_without_dac_stays_off() {
        let mut s = powered();
        s.write_reg(0xFF17, 0x00);
        s.write_reg(0xFF19, 0x80);
        assert!(!s.channel_status()[1]);
    }

    #[test]
    fn length_expires_channel() {
        let mut s = powered();
        s.write_reg(0xFF21, 0xF0);
        s.write_reg(0xFF20, 0x3E);
        s.write_reg(0xFF23, 0xC0);
        assert!(s.channel_status()[3]);
        // Length 2: two length steps (0 and 2) expire it.
        for _ in 0..3 {
            s.clock_frame_sequencer();
        }
        assert!(!s.channel_status()[3]);
    }

    #[test]
    fn enabling_length_in_first_half_clocks_extra() {
        let mut s = powered();
        s.write_reg(0xFF12, 0xF0);
        s.clock_frame_sequencer();
        assert_eq!(s.sequencer_step(), 1);
        s.write_reg(0xFF11, 0x3F);
        s.write_reg(0xFF14, 0x40);
        assert_eq!(s.ch1.length.counter, 0);
        assert!(!s.channel_status()[0]);
    }

    #[test]
    fn sweep_overflow_disables_on_trigger() {
        let mut s = powered();
        s.write_reg(0xFF10, 0x11);
        s.write_reg(0xFF12, 0xF0);
        s.write_reg(0xFF13, 0xFF);
        s.write_reg(0xFF14, 0x87);
        assert!(!s.channel_status()[0]);
    }

    #[test]
    fn envelope_steps_toward_limit_at_its_pace() {
        let mut env = Envelope {
            nrx2: 0xD2,
            ..Envelope::default()
        };
        env.restart();
        assert_eq!(env.volume, 13);
        env.tick();
        assert_eq!(env.volume, 13);
        env.tick();
        assert_eq!(env.volume, 12);

        env.nrx2 = 0xE9;
        env.restart();
        for _ in 0..5 {
            env.tick();
        }
        assert_eq!(env.volume, 15);
    }

    #[test]
    fn sweep_leaving_subtraction_after_use_silences_channel() {
        let mut sweep = Sweep::default();
        assert!(sweep.write(0x19));
        assert!(sweep.restart(0x400));
        assert!(sweep.negated);
        assert!(!sweep.write(0x11));
    }

    #[test]
    fn sweep_tick_updates_frequency() {
        let mut sweep = Sweep::default();
        sweep.write(0x11);
        let mut freq = 0x100;
        assert!(sweep.restart(freq));
        assert!(sweep.tick(&mut freq));
        assert_eq!(freq, 0x180);
        assert_eq!(sweep.shadow, 0x180);
    }

    #[test]
    fn duty_patterns_match_high_fraction() {
        let counts: Vec<u32> = DUTY_PATTERNS.iter().map(|p| p.count_ones()).collect();
        assert_eq!(counts, [1, 2, 4, 6]);
    }

    #[test]
    fn noise_trigger_sets_lfsr() {
        let mut s = powered();
        s.write_reg(0xFF21, 0xF0);
        s.write_reg(0xFF23, 0x80);
        assert_eq!(s.ch4.lfsr, 0x7FFF);
        assert_eq!(s.outputs()[3], 0);
    }

    #[test]
    fn power_off_clears_registers_but_keeps_dmg_length() {
        let mut s = powered();
        s.write_reg(0xFF24, 0x77);
        s.write_reg(0xFF11, 0x3F);
        s.write_reg(0xFF26, 0x00);
        assert_eq!(s.read_reg(0xFF24), 0x00);
        assert_eq!(s.ch1.length.counter, 1);
        s.write_reg(0xFF24, 0x77);
        assert_eq!(s.read_reg(0xFF24), 0x00);
        s.write_reg(0xFF11, 0x20);
        assert_eq!(s.ch1.length.counter, 32);
        s.write_reg(0xFF30, 0xAB);
        assert_eq!(s.read_reg(0xFF30), 0xAB);
    }

    #[test]
    fn cgb_power_off_blocks_length_writes() {
        let mut s = Sound::new(true);
        s.write_reg(0xFF11, 0x20);
        assert_eq!(s.ch1.length.counter, 0);
    }

    #[test]
    fn mixer_emits_at_sample_rate() {
        let mut bus = Bus::new(false);
        bus.write(0xFF26, 0x80);
        let mut apu = Apu::new(48_000);
        apu.update(70224, &mut bus);
        let n = apu.take_samples().len();
        // 70224 cycles at 48 kHz is 803.6 frames, two channels each.
        assert!((1606..=1608).contains(&n), "{n}");
    }

    #[test]
    fn square_wave_reaches_mixer() {
        let mut bus = Bus::new(false);
        bus.write(0xFF26, 0x80);
        bus.write(0xFF24, 0x77);
        bus.write(0xFF25, 0x11);
        bus.write(0xFF12, 0xF0);
        bus.write(0xFF13, 0x00);
        bus.write(0xFF14, 0x87);
        let mut apu = Apu::new(48_000);
        apu.update(20_000, &mut bus);
        let samples = apu.take_samples();
        assert!(samples.iter().any(|&s| s != 0));
    }
}
