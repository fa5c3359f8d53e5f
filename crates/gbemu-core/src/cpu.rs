use serde::{Deserialize, Serialize};

use crate::bus::{Bus, IoReg};
use crate::error::CpuError;
use crate::opcodes::{AluOp, CB_OPCODES, CbOp, Cond, OPCODES, OpInfo, OpKind, Operand8, R16};

// CPU flag bits as documented in gbdev.io/pandocs/The_CPU_Flags.html
pub const FLAG_Z: u8 = 0x80; // Zero
pub const FLAG_N: u8 = 0x40; // Subtract
pub const FLAG_H: u8 = 0x20; // Half Carry
pub const FLAG_C: u8 = 0x10; // Carry

const INTERRUPT_BASE: u16 = 0x40;
const INTERRUPT_CYCLES: u32 = 20;

// Post-boot CPU state from gbdev.io/pandocs/Power_Up_State.html
const BOOT_PC: u16 = 0x0100;
const BOOT_SP: u16 = 0xFFFE;

const DMG_BOOT_REGS: [u8; 8] = [0x01, 0xB0, 0x00, 0x13, 0x00, 0xD8, 0x01, 0x4D];
const CGB_BOOT_REGS: [u8; 8] = [0x11, 0x80, 0x00, 0x00, 0xFF, 0x56, 0x00, 0x0D];

macro_rules! cpu_trace {
    ($($arg:tt)*) => {
        #[cfg(feature = "cpu-trace")]
        {
            log::trace!($($arg)*);
        }
    };
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cpu {
    pub a: u8,
    pub f: u8,
    pub b: u8,
    pub c: u8,
    pub d: u8,
    pub e: u8,
    pub h: u8,
    pub l: u8,
    pub pc: u16,
    pub sp: u16,
    pub cycles: u64,
    pub ime: bool,
    pub halted: bool,
    pub stopped: bool,
    /// Set by an illegal opcode; only a reset clears it.
    pub locked: bool,
    halt_bug: bool,
    ime_enable_delay: u8,
}

impl Cpu {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clears the register file. With `skip_boot` the registers take the
    /// values the boot ROM leaves behind for the selected hardware.
    pub fn reset(&mut self, skip_boot: bool, cgb: bool) {
        *self = Self::default();
        if skip_boot {
            let regs = if cgb { CGB_BOOT_REGS } else { DMG_BOOT_REGS };
            let [a, f, b, c, d, e, h, l] = regs;
            self.a = a;
            self.f = f;
            self.b = b;
            self.c = c;
            self.d = d;
            self.e = e;
            self.h = h;
            self.l = l;
            self.sp = BOOT_SP;
            self.pc = BOOT_PC;
        }
    }

    pub fn get_af(&self) -> u16 {
        ((self.a as u16) << 8) | self.f as u16
    }

    pub fn set_af(&mut self, val: u16) {
        self.a = (val >> 8) as u8;
        self.f = (val as u8) & 0xF0;
    }

    pub fn get_bc(&self) -> u16 {
        ((self.b as u16) << 8) | self.c as u16
    }

    pub fn set_bc(&mut self, val: u16) {
        self.b = (val >> 8) as u8;
        self.c = val as u8;
    }

    pub fn get_de(&self) -> u16 {
        ((self.d as u16) << 8) | self.e as u16
    }

    pub fn set_de(&mut self, val: u16) {
        self.d = (val >> 8) as u8;
        self.e = val as u8;
    }

    pub fn get_hl(&self) -> u16 {
        ((self.h as u16) << 8) | self.l as u16
    }

    pub fn set_hl(&mut self, val: u16) {
        self.h = (val >> 8) as u8;
        self.l = val as u8;
    }

    fn get_r16(&self, rr: R16) -> u16 {
        match rr {
            R16::BC => self.get_bc(),
            R16::DE => self.get_de(),
            R16::HL => self.get_hl(),
            R16::SP => self.sp,
            R16::AF => self.get_af(),
        }
    }

    fn set_r16(&mut self, rr: R16, val: u16) {
        match rr {
            R16::BC => self.set_bc(val),
            R16::DE => self.set_de(val),
            R16::HL => self.set_hl(val),
            R16::SP => self.sp = val,
            R16::AF => self.set_af(val),
        }
    }

    pub fn debug_state(&self) -> String {
        format!(
            "A:{:02X} F:{:02X} B:{:02X} C:{:02X} D:{:02X} E:{:02X} H:{:02X} L:{:02X} SP:{:04X} PC:{:04X}",
            self.a, self.f, self.b, self.c, self.d, self.e, self.h, self.l, self.sp, self.pc
        )
    }

    fn fetch8(&mut self, bus: &Bus) -> u8 {
        let val = bus.read(self.pc);
        self.pc = self.pc.wrapping_add(1);
        val
    }

    fn fetch16(&mut self, bus: &Bus) -> u16 {
        let lo = self.fetch8(bus) as u16;
        let hi = self.fetch8(bus) as u16;
        (hi << 8) | lo
    }

    fn fetch_opcode(&mut self, bus: &Bus) -> u8 {
        let opcode = bus.read(self.pc);
        if self.halt_bug {
            self.halt_bug = false;
        } else {
            self.pc = self.pc.wrapping_add(1);
        }
        opcode
    }

    fn push_stack(&mut self, bus: &mut Bus, val: u16) {
        self.sp = self.sp.wrapping_sub(1);
        bus.write(self.sp, (val >> 8) as u8);
        self.sp = self.sp.wrapping_sub(1);
        bus.write(self.sp, val as u8);
    }

    fn pop_stack(&mut self, bus: &Bus) -> u16 {
        let lo = bus.read(self.sp) as u16;
        self.sp = self.sp.wrapping_add(1);
        let hi = bus.read(self.sp) as u16;
        self.sp = self.sp.wrapping_add(1);
        (hi << 8) | lo
    }

    fn read_operand(&mut self, bus: &Bus, operand: Operand8) -> u8 {
        match operand {
            Operand8::A => self.a,
            Operand8::B => self.b,
            Operand8::C => self.c,
            Operand8::D => self.d,
            Operand8::E => self.e,
            Operand8::H => self.h,
            Operand8::L => self.l,
            Operand8::HlInd => bus.read(self.get_hl()),
            Operand8::HliInd => {
                let hl = self.get_hl();
                self.set_hl(hl.wrapping_add(1));
                bus.read(hl)
            }
            Operand8::HldInd => {
                let hl = self.get_hl();
                self.set_hl(hl.wrapping_sub(1));
                bus.read(hl)
            }
            Operand8::BcInd => bus.read(self.get_bc()),
            Operand8::DeInd => bus.read(self.get_de()),
            Operand8::Imm => self.fetch8(bus),
            Operand8::Abs16 => {
                let addr = self.fetch16(bus);
                bus.read(addr)
            }
            Operand8::HighImm => {
                let offset = self.fetch8(bus) as u16;
                bus.read(0xFF00 | offset)
            }
            Operand8::HighC => bus.read(0xFF00 | self.c as u16),
        }
    }

    fn write_operand(&mut self, bus: &mut Bus, operand: Operand8, val: u8) {
        match operand {
            Operand8::A => self.a = val,
            Operand8::B => self.b = val,
            Operand8::C => self.c = val,
            Operand8::D => self.d = val,
            Operand8::E => self.e = val,
            Operand8::H => self.h = val,
            Operand8::L => self.l = val,
            Operand8::HlInd => bus.write(self.get_hl(), val),
            Operand8::HliInd => {
                let hl = self.get_hl();
                self.set_hl(hl.wrapping_add(1));
                bus.write(hl, val);
            }
            Operand8::HldInd => {
                let hl = self.get_hl();
                self.set_hl(hl.wrapping_sub(1));
                bus.write(hl, val);
            }
            Operand8::BcInd => bus.write(self.get_bc(), val),
            Operand8::DeInd => bus.write(self.get_de(), val),
            // No opcode stores to an immediate.
            Operand8::Imm => {}
            Operand8::Abs16 => {
                let addr = self.fetch16(bus);
                bus.write(addr, val);
            }
            Operand8::HighImm => {
                let offset = self.fetch8(bus) as u16;
                bus.write(0xFF00 | offset, val);
            }
            Operand8::HighC => bus.write(0xFF00 | self.c as u16, val),
        }
    }

    fn condition(&self, cond: Cond) -> bool {
        match cond {
            Cond::Always => true,
            Cond::NZ => self.f & FLAG_Z == 0,
            Cond::Z => self.f & FLAG_Z != 0,
            Cond::NC => self.f & FLAG_C == 0,
            Cond::C => self.f & FLAG_C != 0,
        }
    }

    fn pending_interrupts(bus: &Bus) -> u8 {
        bus.reg(IoReg::Ie) & bus.reg(IoReg::If) & 0x1F
    }

    /// Services the lowest pending interrupt when IME is set. Returns the
    /// cycles spent dispatching.
    fn handle_interrupts(&mut self, bus: &mut Bus) -> u32 {
        if !self.ime {
            return 0;
        }
        let pending = Self::pending_interrupts(bus);
        if pending == 0 {
            return 0;
        }
        let bit = pending.trailing_zeros() as u16;
        self.ime = false;
        self.halted = false;
        *bus.reg_mut(IoReg::If) &= !(1u8 << bit);
        // EI; HALT with a pending interrupt returns to the HALT itself.
        let pc = if self.halt_bug {
            self.halt_bug = false;
            self.pc.wrapping_sub(1)
        } else {
            self.pc
        };
        self.push_stack(bus, pc);
        self.pc = INTERRUPT_BASE + bit * 8;
        INTERRUPT_CYCLES
    }

    /// Executes one instruction, or idles one M-cycle while halted or
    /// stopped, then services at most one interrupt. Returns T-cycles.
    pub fn step(&mut self, bus: &mut Bus) -> Result<u32, CpuError> {
        if self.locked {
            return Err(CpuError::Locked { pc: self.pc });
        }

        let mut cycles = if self.stopped {
            if bus.take_key_press() {
                self.stopped = false;
            }
            4
        } else if self.halted {
            if Self::pending_interrupts(bus) != 0 {
                self.halted = false;
            }
            4
        } else {
            let pc = self.pc;
            let opcode = self.fetch_opcode(bus);
            let info = OPCODES[opcode as usize];
            cpu_trace!("{:04X}: {} | {}", pc, info, self.debug_state());
            match self.execute(&info, bus) {
                Some(cycles) => cycles,
                None => {
                    self.locked = true;
                    self.pc = pc;
                    log::error!("illegal opcode {opcode:#04X} at {pc:#06X}");
                    return Err(CpuError::IllegalOpcode { opcode, pc });
                }
            }
        };

        if self.ime_enable_delay > 0 {
            self.ime_enable_delay -= 1;
            if self.ime_enable_delay == 0 {
                self.ime = true;
            }
        }

        if !self.stopped {
            cycles += self.handle_interrupts(bus);
        }
        self.cycles += cycles as u64;
        Ok(cycles)
    }

    /// Runs one decoded instruction. `None` means the opcode does not exist.
    fn execute(&mut self, info: &OpInfo, bus: &mut Bus) -> Option<u32> {
        let mut cycles = info.cycles as u32;
        let taken = info.branch_cycles as u32;

        match info.kind {
            OpKind::Nop => {}
            OpKind::Ld8(dst, src) => {
                let val = self.read_operand(bus, src);
                self.write_operand(bus, dst, val);
            }
            OpKind::Ld16Imm(rr) => {
                let val = self.fetch16(bus);
                self.set_r16(rr, val);
            }
            OpKind::LdA16Sp => {
                let addr = self.fetch16(bus);
                bus.write16(addr, self.sp);
            }
            OpKind::LdSpHl => self.sp = self.get_hl(),
            OpKind::LdHlSpE => {
                let e = self.fetch8(bus) as i8;
                let (val, flags) = add_sp_e(self.sp, e);
                self.set_hl(val);
                self.f = flags;
            }
            OpKind::Push(rr) => {
                let val = self.get_r16(rr);
                self.push_stack(bus, val);
            }
            OpKind::Pop(rr) => {
                let val = self.pop_stack(bus);
                self.set_r16(rr, val);
            }
            OpKind::Alu(op, src) => {
                let val = self.read_operand(bus, src);
                let (a, flags) = alu8(op, self.a, val, self.f);
                self.a = a;
                self.f = flags;
            }
            OpKind::Inc8(target) => {
                let val = self.read_operand(bus, target);
                let (res, flags) = inc8(val, self.f);
                self.write_operand(bus, target, res);
                self.f = flags;
            }
            OpKind::Dec8(target) => {
                let val = self.read_operand(bus, target);
                let (res, flags) = dec8(val, self.f);
                self.write_operand(bus, target, res);
                self.f = flags;
            }
            OpKind::Inc16(rr) => {
                let val = self.get_r16(rr).wrapping_add(1);
                self.set_r16(rr, val);
            }
            OpKind::Dec16(rr) => {
                let val = self.get_r16(rr).wrapping_sub(1);
                self.set_r16(rr, val);
            }
            OpKind::AddHl(rr) => {
                let (val, flags) = add_hl(self.get_hl(), self.get_r16(rr), self.f);
                self.set_hl(val);
                self.f = flags;
            }
            OpKind::AddSpE => {
                let e = self.fetch8(bus) as i8;
                let (val, flags) = add_sp_e(self.sp, e);
                self.sp = val;
                self.f = flags;
            }
            OpKind::Rlca => self.rotate_a(CbOp::Rlc),
            OpKind::Rrca => self.rotate_a(CbOp::Rrc),
            OpKind::Rla => self.rotate_a(CbOp::Rl),
            OpKind::Rra => self.rotate_a(CbOp::Rr),
            OpKind::Daa => {
                let (a, flags) = daa(self.a, self.f);
                self.a = a;
                self.f = flags;
            }
            OpKind::Cpl => {
                self.a = !self.a;
                self.f = (self.f & (FLAG_Z | FLAG_C)) | FLAG_N | FLAG_H;
            }
            OpKind::Scf => self.f = (self.f & FLAG_Z) | FLAG_C,
            OpKind::Ccf => self.f = (self.f & (FLAG_Z | FLAG_C)) ^ FLAG_C,
            OpKind::Jp(cond) => {
                let addr = self.fetch16(bus);
                if self.condition(cond) {
                    self.pc = addr;
                    cycles = taken;
                }
            }
            OpKind::JpHl => self.pc = self.get_hl(),
            OpKind::Jr(cond) => {
                let offset = self.fetch8(bus) as i8;
                if self.condition(cond) {
                    self.pc = self.pc.wrapping_add_signed(offset as i16);
                    cycles = taken;
                }
            }
            OpKind::Call(cond) => {
                let addr = self.fetch16(bus);
                if self.condition(cond) {
                    let ret = self.pc;
                    self.push_stack(bus, ret);
                    self.pc = addr;
                    cycles = taken;
                }
            }
            OpKind::Ret(cond) => {
                if self.condition(cond) {
                    self.pc = self.pop_stack(bus);
                    cycles = taken;
                }
            }
            OpKind::Reti => {
                self.pc = self.pop_stack(bus);
                self.ime = true;
            }
            OpKind::Rst(vector) => {
                let ret = self.pc;
                self.push_stack(bus, ret);
                self.pc = vector as u16;
            }
            OpKind::Halt => {
                if !self.ime && Self::pending_interrupts(bus) != 0 {
                    self.halt_bug = true;
                } else {
                    self.halted = true;
                }
            }
            OpKind::Stop => {
                // STOP is two bytes long; the second is ignored.
                self.fetch8(bus);
                bus.write(IoReg::Div as u16, 0);
                if bus.speed_switch_armed() {
                    bus.switch_speed();
                } else {
                    bus.take_key_press();
                    self.stopped = true;
                }
            }
            OpKind::Di => {
                self.ime = false;
                self.ime_enable_delay = 0;
            }
            OpKind::Ei => {
                if !self.ime && self.ime_enable_delay == 0 {
                    self.ime_enable_delay = 2;
                }
            }
            OpKind::Prefix => {
                let opcode = self.fetch8(bus);
                cycles = self.handle_cb(opcode, bus);
            }
            OpKind::Illegal => return None,
        }
        Some(cycles)
    }

    fn rotate_a(&mut self, op: CbOp) {
        let (a, flags) = rotate(op, self.a, self.f);
        self.a = a;
        // The accumulator rotates always clear Z.
        self.f = flags & !FLAG_Z;
    }

    fn handle_cb(&mut self, opcode: u8, bus: &mut Bus) -> u32 {
        let info = CB_OPCODES[opcode as usize];
        cpu_trace!("      CB {}", info);
        let val = self.read_operand(bus, info.target);
        match info.op {
            CbOp::Bit(bit) => {
                let mut flags = (self.f & FLAG_C) | FLAG_H;
                if val & (1 << bit) == 0 {
                    flags |= FLAG_Z;
                }
                self.f = flags;
            }
            CbOp::Res(bit) => self.write_operand(bus, info.target, val & !(1 << bit)),
            CbOp::Set(bit) => self.write_operand(bus, info.target, val | (1 << bit)),
            op => {
                let (res, flags) = rotate(op, val, self.f);
                self.write_operand(bus, info.target, res);
                self.f = flags;
            }
        }
        info.cycles as u32
    }
}

fn zero_flag(val: u8) -> u8 {
    if val == 0 { FLAG_Z } else { 0 }
}

/// ADD/ADC/SUB/SBC/AND/XOR/OR/CP on the accumulator. Returns the new
/// accumulator and flags; CP leaves `a` unchanged.
pub fn alu8(op: AluOp, a: u8, val: u8, f: u8) -> (u8, u8) {
    let carry_in = (f & FLAG_C != 0) as u8;
    match op {
        AluOp::Add => add8(a, val, 0),
        AluOp::Adc => add8(a, val, carry_in),
        AluOp::Sub => sub8(a, val, 0),
        AluOp::Sbc => sub8(a, val, carry_in),
        AluOp::And => {
            let res = a & val;
            (res, zero_flag(res) | FLAG_H)
        }
        AluOp::Xor => {
            let res = a ^ val;
            (res, zero_flag(res))
        }
        AluOp::Or => {
            let res = a | val;
            (res, zero_flag(res))
        }
        AluOp::Cp => {
            let (_, flags) = sub8(a, val, 0);
            (a, flags)
        }
    }
}

fn add8(a: u8, val: u8, carry: u8) -> (u8, u8) {
    let sum = a as u16 + val as u16 + carry as u16;
    let res = sum as u8;
    let mut flags = zero_flag(res);
    if (a & 0x0F) + (val & 0x0F) + carry > 0x0F {
        flags |= FLAG_H;
    }
    if sum > 0xFF {
        flags |= FLAG_C;
    }
    (res, flags)
}

fn sub8(a: u8, val: u8, carry: u8) -> (u8, u8) {
    let res = a.wrapping_sub(val).wrapping_sub(carry);
    let mut flags = zero_flag(res) | FLAG_N;
    if (a & 0x0F) < (val & 0x0F) + carry {
        flags |= FLAG_H;
    }
    if (a as u16) < val as u16 + carry as u16 {
        flags |= FLAG_C;
    }
    (res, flags)
}

/// INC r: Z, N and H from the result, C preserved.
pub fn inc8(val: u8, f: u8) -> (u8, u8) {
    let res = val.wrapping_add(1);
    let mut flags = (f & FLAG_C) | zero_flag(res);
    if val & 0x0F == 0x0F {
        flags |= FLAG_H;
    }
    (res, flags)
}

/// DEC r: Z, N and H from the result, C preserved.
pub fn dec8(val: u8, f: u8) -> (u8, u8) {
    let res = val.wrapping_sub(1);
    let mut flags = (f & FLAG_C) | zero_flag(res) | FLAG_N;
    if val & 0x0F == 0 {
        flags |= FLAG_H;
    }
    (res, flags)
}

/// ADD HL,rr: H out of bit 11, C out of bit 15, Z untouched.
pub fn add_hl(hl: u16, val: u16, f: u8) -> (u16, u8) {
    let res = hl.wrapping_add(val);
    let mut flags = f & FLAG_Z;
    if (hl & 0x0FFF) + (val & 0x0FFF) > 0x0FFF {
        flags |= FLAG_H;
    }
    if hl as u32 + val as u32 > 0xFFFF {
        flags |= FLAG_C;
    }
    (res, flags)
}

/// ADD SP,e and LD HL,SP+e. Flags come from the unsigned add of the low
/// byte; Z and N are cleared.
pub fn add_sp_e(sp: u16, e: i8) -> (u16, u8) {
    let val = e as i16 as u16;
    let res = sp.wrapping_add(val);
    let mut flags = 0;
    if (sp & 0x000F) + (val & 0x000F) > 0x000F {
        flags |= FLAG_H;
    }
    if (sp & 0x00FF) + (val & 0x00FF) > 0x00FF {
        flags |= FLAG_C;
    }
    (res, flags)
}

/// Decimal adjust after an addition or subtraction, driven by the previous
/// N, H and C flags.
pub fn daa(a: u8, f: u8) -> (u8, u8) {
    let subtract = f & FLAG_N != 0;
    let mut correction = 0u8;
    let mut carry = false;
    if f & FLAG_H != 0 || (!subtract && (a & 0x0F) > 0x09) {
        correction |= 0x06;
    }
    if f & FLAG_C != 0 || (!subtract && a > 0x99) {
        correction |= 0x60;
        carry = true;
    }
    let res = if subtract {
        a.wrapping_sub(correction)
    } else {
        a.wrapping_add(correction)
    };
    let mut flags = zero_flag(res) | (f & FLAG_N);
    if carry {
        flags |= FLAG_C;
    }
    (res, flags)
}

/// CB-prefixed rotates and shifts. Z is set from the result; the
/// accumulator forms clear it afterwards. BIT/RES/SET are not handled here.
pub fn rotate(op: CbOp, val: u8, f: u8) -> (u8, u8) {
    let carry_in = f & FLAG_C != 0;
    let (res, carry_out) = match op {
        CbOp::Rlc => (val.rotate_left(1), val & 0x80 != 0),
        CbOp::Rrc => (val.rotate_right(1), val & 0x01 != 0),
        CbOp::Rl => ((val << 1) | carry_in as u8, val & 0x80 != 0),
        CbOp::Rr => ((val >> 1) | ((carry_in as u8) << 7), val & 0x01 != 0),
        CbOp::Sla => (val << 1, val & 0x80 != 0),
        CbOp::Sra => ((val >> 1) | (val & 0x80), val & 0x01 != 0),
        CbOp::Swap => (val.rotate_left(4), false),
        CbOp::Srl => (val >> 1, val & 0x01 != 0),
        CbOp::Bit(_) | CbOp::Res(_) | CbOp::Set(_) => return (val, f),
    };
    let mut flags = zero_flag(res);
    if carry_out {
        flags |= FLAG_C;
    }
    (res, flags)
}
