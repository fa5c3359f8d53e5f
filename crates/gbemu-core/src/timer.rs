use serde::{Deserialize, Serialize};

use crate::bus::{Bus, INT_TIMER, IoReg};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timer {
    /// 16-bit internal divider counter. DIV is the upper 8 bits.
    osc: u16,
    last_signal: bool,
    /// TIMA overflowed during the previous update; reload and IRQ are due.
    overflow_pending: bool,
    /// The previous update performed a delayed reload.
    just_reloaded: bool,
    /// Ticks that fell inside the overflow window. They land after the
    /// reload.
    #[serde(default)]
    deferred_ticks: u8,
}

impl Timer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn osc(&self) -> u16 {
        self.osc
    }

    pub fn set_osc(&mut self, osc: u16) {
        self.osc = osc;
    }

    fn timer_bit(tac: u8) -> u16 {
        match tac & 0x03 {
            0x00 => 9,
            0x01 => 3,
            0x02 => 5,
            _ => 7,
        }
    }

    fn signal_with(osc: u16, tac: u8) -> bool {
        tac & 0x04 != 0 && (osc >> Self::timer_bit(tac)) & 1 != 0
    }

    /// Advances the timer by `cycles` CPU cycles. `old_if` is IF as it was
    /// before the instruction that just ran. Returns true when TIMA
    /// overflowed during this update.
    pub fn update(&mut self, cycles: u32, old_if: u8, bus: &mut Bus) -> bool {
        let writes = bus.take_timer_writes();
        let tac = bus.reg(IoReg::Tac);
        let tma = bus.reg(IoReg::Tma);
        let mut tima = bus.reg(IoReg::Tima);
        let mut overflowed = false;

        if self.just_reloaded {
            self.just_reloaded = false;
            if writes.tima || writes.tma {
                tima = tma;
            }
        }

        if self.overflow_pending {
            self.overflow_pending = false;
            if !writes.tima {
                tima = tma;
                let cpu_wrote_if = writes.if_reg && bus.reg(IoReg::If) != old_if;
                if !cpu_wrote_if {
                    bus.request_interrupt(INT_TIMER);
                }
                self.just_reloaded = true;
            }
            for _ in 0..std::mem::take(&mut self.deferred_ticks) {
                overflowed |= self.tick(&mut tima);
            }
        }

        let fs_bit = if bus.double_speed() { 13 } else { 12 };

        if writes.div_reset {
            if Self::signal_with(self.osc, tac) {
                overflowed |= self.tick(&mut tima);
            }
            if (self.osc >> fs_bit) & 1 != 0 {
                bus.sound.clock_frame_sequencer();
            }
            self.osc = 0;
            self.last_signal = false;
        }

        if writes.tac {
            let signal = Self::signal_with(self.osc, tac);
            if self.last_signal && !signal {
                overflowed |= self.tick(&mut tima);
            }
            self.last_signal = signal;
        }

        for _ in 0..cycles {
            let prev = self.osc;
            self.osc = self.osc.wrapping_add(1);
            if (prev >> fs_bit) & 1 != 0 && (self.osc >> fs_bit) & 1 == 0 {
                bus.sound.clock_frame_sequencer();
            }
            let signal = Self::signal_with(self.osc, tac);
            if self.last_signal && !signal {
                overflowed |= self.tick(&mut tima);
            }
            self.last_signal = signal;
        }

        bus.set_reg(IoReg::Div, (self.osc >> 8) as u8);
        bus.set_reg(IoReg::Tima, tima);
        overflowed
    }

    /// One TIMA edge. While an overflow is waiting for its reload TIMA
    /// holds 0 and the edge is saved for afterwards.
    fn tick(&mut self, tima: &mut u8) -> bool {
        if self.overflow_pending {
            self.deferred_ticks = self.deferred_ticks.saturating_add(1);
            return false;
        }
        self.increment(tima)
    }

    fn increment(&mut self, tima: &mut u8) -> bool {
        if *tima == 0xFF {
            *tima = 0;
            self.overflow_pending = true;
            true
        } else {
            *tima += 1;
            false
        }
    }
}
