//! Opcode tables for the SM83 core.
//!
//! Both tables are built at compile time from the usual x/y/z/p/q split of
//! the opcode byte (x = bits 7-6, y = bits 5-3, z = bits 2-0, p = y >> 1,
//! q = y & 1). Operands live inside [`OpKind`] so the CPU can run every
//! instruction through a handful of generic executors.

use std::fmt;

/// 8-bit operand addressing modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand8 {
    A,
    B,
    C,
    D,
    E,
    H,
    L,
    /// (HL)
    HlInd,
    /// (HL+)
    HliInd,
    /// (HL-)
    HldInd,
    /// (BC)
    BcInd,
    /// (DE)
    DeInd,
    /// d8
    Imm,
    /// (a16)
    Abs16,
    /// (FF00+a8)
    HighImm,
    /// (FF00+C)
    HighC,
}

impl Operand8 {
    /// True for operands that cost a memory access.
    pub const fn is_memory(self) -> bool {
        !matches!(
            self,
            Self::A | Self::B | Self::C | Self::D | Self::E | Self::H | Self::L
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum R16 {
    BC,
    DE,
    HL,
    SP,
    AF,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cond {
    Always,
    NZ,
    Z,
    NC,
    C,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AluOp {
    Add,
    Adc,
    Sub,
    Sbc,
    And,
    Xor,
    Or,
    Cp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Nop,
    Ld8(Operand8, Operand8),
    Ld16Imm(R16),
    LdA16Sp,
    LdSpHl,
    LdHlSpE,
    Push(R16),
    Pop(R16),
    Alu(AluOp, Operand8),
    Inc8(Operand8),
    Dec8(Operand8),
    Inc16(R16),
    Dec16(R16),
    AddHl(R16),
    AddSpE,
    Rlca,
    Rrca,
    Rla,
    Rra,
    Daa,
    Cpl,
    Scf,
    Ccf,
    Jp(Cond),
    JpHl,
    Jr(Cond),
    Call(Cond),
    Ret(Cond),
    Reti,
    Rst(u8),
    Halt,
    Stop,
    Di,
    Ei,
    Prefix,
    Illegal,
}

/// One base-table entry. `cycles` is the T-cycle cost when a conditional
/// branch is not taken; `branch_cycles` the cost when it is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpInfo {
    pub opcode: u8,
    pub kind: OpKind,
    pub cycles: u8,
    pub branch_cycles: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CbOp {
    Rlc,
    Rrc,
    Rl,
    Rr,
    Sla,
    Sra,
    Swap,
    Srl,
    Bit(u8),
    Res(u8),
    Set(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CbInfo {
    pub opcode: u8,
    pub op: CbOp,
    pub target: Operand8,
    /// Total cost including the 0xCB prefix fetch.
    pub cycles: u8,
}

const fn reg8(i: u8) -> Operand8 {
    match i {
        0 => Operand8::B,
        1 => Operand8::C,
        2 => Operand8::D,
        3 => Operand8::E,
        4 => Operand8::H,
        5 => Operand8::L,
        6 => Operand8::HlInd,
        _ => Operand8::A,
    }
}

const fn rp(p: u8) -> R16 {
    match p {
        0 => R16::BC,
        1 => R16::DE,
        2 => R16::HL,
        _ => R16::SP,
    }
}

const fn rp2(p: u8) -> R16 {
    match p {
        0 => R16::BC,
        1 => R16::DE,
        2 => R16::HL,
        _ => R16::AF,
    }
}

const fn cc(y: u8) -> Cond {
    match y & 3 {
        0 => Cond::NZ,
        1 => Cond::Z,
        2 => Cond::NC,
        _ => Cond::C,
    }
}

const fn alu(y: u8) -> AluOp {
    match y {
        0 => AluOp::Add,
        1 => AluOp::Adc,
        2 => AluOp::Sub,
        3 => AluOp::Sbc,
        4 => AluOp::And,
        5 => AluOp::Xor,
        6 => AluOp::Or,
        _ => AluOp::Cp,
    }
}

const fn indirect(p: u8) -> Operand8 {
    match p {
        0 => Operand8::BcInd,
        1 => Operand8::DeInd,
        2 => Operand8::HliInd,
        _ => Operand8::HldInd,
    }
}

const fn op(opcode: u8, kind: OpKind, cycles: u8) -> OpInfo {
    OpInfo {
        opcode,
        kind,
        cycles,
        branch_cycles: cycles,
    }
}

const fn branch(opcode: u8, kind: OpKind, cycles: u8, branch_cycles: u8) -> OpInfo {
    OpInfo {
        opcode,
        kind,
        cycles,
        branch_cycles,
    }
}

const fn decode(opcode: u8) -> OpInfo {
    let x = opcode >> 6;
    let y = (opcode >> 3) & 7;
    let z = opcode & 7;
    let p = y >> 1;
    let q = y & 1;

    match x {
        0 => match z {
            0 => match y {
                0 => op(opcode, OpKind::Nop, 4),
                1 => op(opcode, OpKind::LdA16Sp, 20),
                2 => op(opcode, OpKind::Stop, 4),
                3 => op(opcode, OpKind::Jr(Cond::Always), 12),
                _ => branch(opcode, OpKind::Jr(cc(y - 4)), 8, 12),
            },
            1 => {
                if q == 0 {
                    op(opcode, OpKind::Ld16Imm(rp(p)), 12)
                } else {
                    op(opcode, OpKind::AddHl(rp(p)), 8)
                }
            }
            2 => {
                if q == 0 {
                    op(opcode, OpKind::Ld8(indirect(p), Operand8::A), 8)
                } else {
                    op(opcode, OpKind::Ld8(Operand8::A, indirect(p)), 8)
                }
            }
            3 => {
                if q == 0 {
                    op(opcode, OpKind::Inc16(rp(p)), 8)
                } else {
                    op(opcode, OpKind::Dec16(rp(p)), 8)
                }
            }
            4 => {
                let r = reg8(y);
                op(opcode, OpKind::Inc8(r), if r.is_memory() { 12 } else { 4 })
            }
            5 => {
                let r = reg8(y);
                op(opcode, OpKind::Dec8(r), if r.is_memory() { 12 } else { 4 })
            }
            6 => {
                let r = reg8(y);
                op(
                    opcode,
                    OpKind::Ld8(r, Operand8::Imm),
                    if r.is_memory() { 12 } else { 8 },
                )
            }
            _ => {
                let kind = match y {
                    0 => OpKind::Rlca,
                    1 => OpKind::Rrca,
                    2 => OpKind::Rla,
                    3 => OpKind::Rra,
                    4 => OpKind::Daa,
                    5 => OpKind::Cpl,
                    6 => OpKind::Scf,
                    _ => OpKind::Ccf,
                };
                op(opcode, kind, 4)
            }
        },
        1 => {
            if opcode == 0x76 {
                op(opcode, OpKind::Halt, 4)
            } else {
                let dst = reg8(y);
                let src = reg8(z);
                let cycles = if dst.is_memory() || src.is_memory() {
                    8
                } else {
                    4
                };
                op(opcode, OpKind::Ld8(dst, src), cycles)
            }
        }
        2 => {
            let src = reg8(z);
            op(
                opcode,
                OpKind::Alu(alu(y), src),
                if src.is_memory() { 8 } else { 4 },
            )
        }
        _ => match z {
            0 => match y {
                0..=3 => branch(opcode, OpKind::Ret(cc(y)), 8, 20),
                4 => op(opcode, OpKind::Ld8(Operand8::HighImm, Operand8::A), 12),
                5 => op(opcode, OpKind::AddSpE, 16),
                6 => op(opcode, OpKind::Ld8(Operand8::A, Operand8::HighImm), 12),
                _ => op(opcode, OpKind::LdHlSpE, 12),
            },
            1 => {
                if q == 0 {
                    op(opcode, OpKind::Pop(rp2(p)), 12)
                } else {
                    match p {
                        0 => op(opcode, OpKind::Ret(Cond::Always), 16),
                        1 => op(opcode, OpKind::Reti, 16),
                        2 => op(opcode, OpKind::JpHl, 4),
                        _ => op(opcode, OpKind::LdSpHl, 8),
                    }
                }
            }
            2 => match y {
                0..=3 => branch(opcode, OpKind::Jp(cc(y)), 12, 16),
                4 => op(opcode, OpKind::Ld8(Operand8::HighC, Operand8::A), 8),
                5 => op(opcode, OpKind::Ld8(Operand8::Abs16, Operand8::A), 16),
                6 => op(opcode, OpKind::Ld8(Operand8::A, Operand8::HighC), 8),
                _ => op(opcode, OpKind::Ld8(Operand8::A, Operand8::Abs16), 16),
            },
            3 => match y {
                0 => op(opcode, OpKind::Jp(Cond::Always), 16),
                1 => op(opcode, OpKind::Prefix, 4),
                6 => op(opcode, OpKind::Di, 4),
                7 => op(opcode, OpKind::Ei, 4),
                _ => op(opcode, OpKind::Illegal, 4),
            },
            4 => {
                if y < 4 {
                    branch(opcode, OpKind::Call(cc(y)), 12, 24)
                } else {
                    op(opcode, OpKind::Illegal, 4)
                }
            }
            5 => {
                if q == 0 {
                    op(opcode, OpKind::Push(rp2(p)), 16)
                } else if p == 0 {
                    op(opcode, OpKind::Call(Cond::Always), 24)
                } else {
                    op(opcode, OpKind::Illegal, 4)
                }
            }
            6 => op(opcode, OpKind::Alu(alu(y), Operand8::Imm), 8),
            _ => op(opcode, OpKind::Rst(y * 8), 16),
        },
    }
}

const fn decode_cb(opcode: u8) -> CbInfo {
    let x = opcode >> 6;
    let y = (opcode >> 3) & 7;
    let target = reg8(opcode & 7);
    let op = match x {
        0 => match y {
            0 => CbOp::Rlc,
            1 => CbOp::Rrc,
            2 => CbOp::Rl,
            3 => CbOp::Rr,
            4 => CbOp::Sla,
            5 => CbOp::Sra,
            6 => CbOp::Swap,
            _ => CbOp::Srl,
        },
        1 => CbOp::Bit(y),
        2 => CbOp::Res(y),
        _ => CbOp::Set(y),
    };
    let cycles = if !target.is_memory() {
        8
    } else if x == 1 {
        12
    } else {
        16
    };
    CbInfo {
        opcode,
        op,
        target,
        cycles,
    }
}

const fn build_table() -> [OpInfo; 256] {
    let mut table = [op(0, OpKind::Nop, 4); 256];
    let mut i = 0;
    while i < 256 {
        table[i] = decode(i as u8);
        i += 1;
    }
    table
}

const fn build_cb_table() -> [CbInfo; 256] {
    let mut table = [decode_cb(0); 256];
    let mut i = 0;
    while i < 256 {
        table[i] = decode_cb(i as u8);
        i += 1;
    }
    table
}

pub static OPCODES: [OpInfo; 256] = build_table();
pub static CB_OPCODES: [CbInfo; 256] = build_cb_table();

impl fmt::Display for Operand8 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::A => "A",
            Self::B => "B",
            Self::C => "C",
            Self::D => "D",
            Self::E => "E",
            Self::H => "H",
            Self::L => "L",
            Self::HlInd => "(HL)",
            Self::HliInd => "(HL+)",
            Self::HldInd => "(HL-)",
            Self::BcInd => "(BC)",
            Self::DeInd => "(DE)",
            Self::Imm => "d8",
            Self::Abs16 => "(a16)",
            Self::HighImm => "(FF00+a8)",
            Self::HighC => "(FF00+C)",
        };
        f.write_str(s)
    }
}

impl fmt::Display for R16 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::BC => "BC",
            Self::DE => "DE",
            Self::HL => "HL",
            Self::SP => "SP",
            Self::AF => "AF",
        };
        f.write_str(s)
    }
}

impl fmt::Display for Cond {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Always => "",
            Self::NZ => "NZ,",
            Self::Z => "Z,",
            Self::NC => "NC,",
            Self::C => "C,",
        };
        f.write_str(s)
    }
}

impl fmt::Display for AluOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Add => "ADD A,",
            Self::Adc => "ADC A,",
            Self::Sub => "SUB ",
            Self::Sbc => "SBC A,",
            Self::And => "AND ",
            Self::Xor => "XOR ",
            Self::Or => "OR ",
            Self::Cp => "CP ",
        };
        f.write_str(s)
    }
}

impl fmt::Display for OpInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            OpKind::Nop => write!(f, "NOP"),
            OpKind::Ld8(dst, src) => write!(f, "LD {dst},{src}"),
            OpKind::Ld16Imm(rr) => write!(f, "LD {rr},d16"),
            OpKind::LdA16Sp => write!(f, "LD (a16),SP"),
            OpKind::LdSpHl => write!(f, "LD SP,HL"),
            OpKind::LdHlSpE => write!(f, "LD HL,SP+e8"),
            OpKind::Push(rr) => write!(f, "PUSH {rr}"),
            OpKind::Pop(rr) => write!(f, "POP {rr}"),
            OpKind::Alu(op, src) => write!(f, "{op}{src}"),
            OpKind::Inc8(r) => write!(f, "INC {r}"),
            OpKind::Dec8(r) => write!(f, "DEC {r}"),
            OpKind::Inc16(rr) => write!(f, "INC {rr}"),
            OpKind::Dec16(rr) => write!(f, "DEC {rr}"),
            OpKind::AddHl(rr) => write!(f, "ADD HL,{rr}"),
            OpKind::AddSpE => write!(f, "ADD SP,e8"),
            OpKind::Rlca => write!(f, "RLCA"),
            OpKind::Rrca => write!(f, "RRCA"),
            OpKind::Rla => write!(f, "RLA"),
            OpKind::Rra => write!(f, "RRA"),
            OpKind::Daa => write!(f, "DAA"),
            OpKind::Cpl => write!(f, "CPL"),
            OpKind::Scf => write!(f, "SCF"),
            OpKind::Ccf => write!(f, "CCF"),
            OpKind::Jp(cond) => write!(f, "JP {cond}a16"),
            OpKind::JpHl => write!(f, "JP HL"),
            OpKind::Jr(cond) => write!(f, "JR {cond}e8"),
            OpKind::Call(cond) => write!(f, "CALL {cond}a16"),
            OpKind::Ret(Cond::Always) => write!(f, "RET"),
            OpKind::Ret(cond) => {
                let name = cond.to_string();
                write!(f, "RET {}", name.trim_end_matches(','))
            }
            OpKind::Reti => write!(f, "RETI"),
            OpKind::Rst(vec) => write!(f, "RST {vec:02X}h"),
            OpKind::Halt => write!(f, "HALT"),
            OpKind::Stop => write!(f, "STOP"),
            OpKind::Di => write!(f, "DI"),
            OpKind::Ei => write!(f, "EI"),
            OpKind::Prefix => write!(f, "PREFIX CB"),
            OpKind::Illegal => write!(f, "ILLEGAL_{:02X}", self.opcode),
        }
    }
}

impl fmt::Display for CbInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let t = self.target;
        match self.op {
            CbOp::Rlc => write!(f, "RLC {t}"),
            CbOp::Rrc => write!(f, "RRC {t}"),
            CbOp::Rl => write!(f, "RL {t}"),
            CbOp::Rr => write!(f, "RR {t}"),
            CbOp::Sla => write!(f, "SLA {t}"),
            CbOp::Sra => write!(f, "SRA {t}"),
            CbOp::Swap => write!(f, "SWAP {t}"),
            CbOp::Srl => write!(f, "SRL {t}"),
            CbOp::Bit(b) => write!(f, "BIT {b},{t}"),
            CbOp::Res(b) => write!(f, "RES {b},{t}"),
            CbOp::Set(b) => write!(f, "SET {b},{t}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_indices_match_opcodes() {
        for (i, info) in OPCODES.iter().enumerate() {
            assert_eq!(info.opcode as usize, i);
        }
        for (i, info) in CB_OPCODES.iter().enumerate() {
            assert_eq!(info.opcode as usize, i);
        }
    }

    #[test]
    fn illegal_opcodes() {
        let illegal: Vec<u8> = OPCODES
            .iter()
            .filter(|i| i.kind == OpKind::Illegal)
            .map(|i| i.opcode)
            .collect();
        assert_eq!(
            illegal,
            vec![0xD3, 0xDB, 0xDD, 0xE3, 0xE4, 0xEB, 0xEC, 0xED, 0xF4, 0xFC, 0xFD]
        );
    }

    #[test]
    fn spot_check_decoding() {
        assert_eq!(OPCODES[0x22].kind, OpKind::Ld8(Operand8::HliInd, Operand8::A));
        assert_eq!(OPCODES[0x3A].kind, OpKind::Ld8(Operand8::A, Operand8::HldInd));
        assert_eq!(OPCODES[0x36].cycles, 12);
        assert_eq!(OPCODES[0x46].cycles, 8);
        assert_eq!(OPCODES[0xF1].kind, OpKind::Pop(R16::AF));
        assert_eq!(OPCODES[0xE0].kind, OpKind::Ld8(Operand8::HighImm, Operand8::A));
        assert_eq!(OPCODES[0xEA].kind, OpKind::Ld8(Operand8::Abs16, Operand8::A));
        assert_eq!(OPCODES[0xFE].kind, OpKind::Alu(AluOp::Cp, Operand8::Imm));
        assert_eq!(OPCODES[0xFF].kind, OpKind::Rst(0x38));
    }

    #[test]
    fn branch_costs() {
        let jr_nz = OPCODES[0x20];
        assert_eq!((jr_nz.cycles, jr_nz.branch_cycles), (8, 12));
        let ret_c = OPCODES[0xD8];
        assert_eq!((ret_c.cycles, ret_c.branch_cycles), (8, 20));
        let call_z = OPCODES[0xCC];
        assert_eq!((call_z.cycles, call_z.branch_cycles), (12, 24));
        let jp = OPCODES[0xC3];
        assert_eq!((jp.cycles, jp.branch_cycles), (16, 16));
    }

    #[test]
    fn cb_costs() {
        assert_eq!(CB_OPCODES[0x00].cycles, 8);
        assert_eq!(CB_OPCODES[0x06].cycles, 16);
        assert_eq!(CB_OPCODES[0x46].cycles, 12);
        assert_eq!(CB_OPCODES[0xC6].cycles, 16);
        assert_eq!(CB_OPCODES[0x7F].op, CbOp::Bit(7));
    }

    #[test]
    fn disassembly() {
        assert_eq!(OPCODES[0x20].to_string(), "JR NZ,e8");
        assert_eq!(OPCODES[0xC8].to_string(), "RET Z");
        assert_eq!(OPCODES[0x2A].to_string(), "LD A,(HL+)");
        assert_eq!(OPCODES[0x90].to_string(), "SUB B");
        assert_eq!(CB_OPCODES[0x7E].to_string(), "BIT 7,(HL)");
    }
}
