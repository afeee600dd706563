//! Instruction word decoding.
//!
//! Every 16-bit word decodes to exactly one [`Instruction`]; there is no failure
//! mode here. Words whose opcode is the reserved value come back as
//! [`Instruction::Reserved`] and are rejected by the execution engine.

use core::fmt;

use crate::trap::TrapVector;

/// Widen the low `bits` of `value` to 16 bits, preserving the two's-complement sign.
///
/// Bits above the field are ignored, so callers may pass the raw instruction word.
/// `bits` must be in `1..16`.
pub const fn sign_extend(value: u16, bits: u32) -> u16 {
    debug_assert!(bits >= 1 && bits < u16::BITS, "field width out of range");
    let field = value & field_mask(bits);
    if (field >> (bits - 1)) & 1 == 1 {
        field | (u16::MAX << bits)
    } else {
        field
    }
}

const fn field_mask(bits: u32) -> u16 {
    (1u16 << bits) - 1
}

/// Extract the opcode field (bits 15..12).
pub const fn opcode_bits(word: u16) -> u16 {
    word >> 12
}

/// General purpose register selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Reg {
    R0,
    R1,
    R2,
    R3,
    R4,
    R5,
    R6,
    R7,
}

impl Reg {
    pub const ALL: [Self; 8] = [
        Self::R0,
        Self::R1,
        Self::R2,
        Self::R3,
        Self::R4,
        Self::R5,
        Self::R6,
        Self::R7,
    ];

    /// Decode a three-bit selector; only the low three bits are inspected.
    pub const fn from_bits(bits: u16) -> Self {
        Self::ALL[(bits & 0x7) as usize]
    }

    /// Decode the three-bit selector stored at `shift` within `word`.
    pub const fn at(word: u16, shift: u32) -> Self {
        Self::from_bits(word >> shift)
    }

    pub const fn index(self) -> usize {
        self as usize
    }

    pub fn parse(name: &str) -> Option<Self> {
        let name = name.trim();
        let digits = name.strip_prefix('R').or_else(|| name.strip_prefix('r'))?;
        match digits.parse::<u16>() {
            Ok(n) if n < 8 => Some(Self::from_bits(n)),
            _ => None,
        }
    }
}

impl fmt::Display for Reg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "R{}", self.index())
    }
}

/// The sixteen opcode values of the 4-bit opcode field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    Br = 0,
    Add,
    Ld,
    St,
    Jsr,
    And,
    Ldr,
    Str,
    Rti,
    Not,
    Ldi,
    Sti,
    Jmp,
    Res,
    Lea,
    Trap,
}

impl Opcode {
    pub const fn from_word(word: u16) -> Self {
        match opcode_bits(word) {
            0 => Self::Br,
            1 => Self::Add,
            2 => Self::Ld,
            3 => Self::St,
            4 => Self::Jsr,
            5 => Self::And,
            6 => Self::Ldr,
            7 => Self::Str,
            8 => Self::Rti,
            9 => Self::Not,
            10 => Self::Ldi,
            11 => Self::Sti,
            12 => Self::Jmp,
            13 => Self::Res,
            14 => Self::Lea,
            _ => Self::Trap,
        }
    }

    /// Opcode positioned in bits 15..12, ready to be OR-ed with operand fields.
    pub const fn base(self) -> u16 {
        (self as u16) << 12
    }
}

/// Second source operand of ADD/AND.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    Register(Reg),
    /// Already sign-extended from the 5-bit field.
    Immediate(u16),
}

/// Branch condition mask as encoded in bits 11..9 (n, z, p).
pub const BR_N: u16 = 0b100;
pub const BR_Z: u16 = 0b010;
pub const BR_P: u16 = 0b001;

/// A decoded instruction. Offsets and immediates are stored sign-extended to 16 bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instruction {
    Br { mask: u16, offset: u16 },
    Add { dr: Reg, sr1: Reg, operand: Operand },
    Ld { dr: Reg, offset: u16 },
    St { sr: Reg, offset: u16 },
    Jsr { offset: u16 },
    Jsrr { base: Reg },
    And { dr: Reg, sr1: Reg, operand: Operand },
    Ldr { dr: Reg, base: Reg, offset: u16 },
    Str { sr: Reg, base: Reg, offset: u16 },
    Rti,
    Not { dr: Reg, sr: Reg },
    Ldi { dr: Reg, offset: u16 },
    Sti { sr: Reg, offset: u16 },
    Jmp { base: Reg },
    Reserved { word: u16 },
    Lea { dr: Reg, offset: u16 },
    Trap { vector: u8 },
}

fn alu_operand(word: u16) -> Operand {
    if (word >> 5) & 1 == 1 {
        Operand::Immediate(sign_extend(word, 5))
    } else {
        Operand::Register(Reg::at(word, 0))
    }
}

impl Instruction {
    pub fn decode(word: u16) -> Self {
        let r9 = Reg::at(word, 9);
        let r6 = Reg::at(word, 6);
        let pc9 = sign_extend(word, 9);
        match Opcode::from_word(word) {
            Opcode::Br => Self::Br {
                mask: (word >> 9) & 0x7,
                offset: pc9,
            },
            Opcode::Add => Self::Add {
                dr: r9,
                sr1: r6,
                operand: alu_operand(word),
            },
            Opcode::Ld => Self::Ld { dr: r9, offset: pc9 },
            Opcode::St => Self::St { sr: r9, offset: pc9 },
            Opcode::Jsr => {
                if (word >> 11) & 1 == 1 {
                    Self::Jsr {
                        offset: sign_extend(word, 11),
                    }
                } else {
                    Self::Jsrr { base: r6 }
                }
            }
            Opcode::And => Self::And {
                dr: r9,
                sr1: r6,
                operand: alu_operand(word),
            },
            Opcode::Ldr => Self::Ldr {
                dr: r9,
                base: r6,
                offset: sign_extend(word, 6),
            },
            Opcode::Str => Self::Str {
                sr: r9,
                base: r6,
                offset: sign_extend(word, 6),
            },
            Opcode::Rti => Self::Rti,
            Opcode::Not => Self::Not { dr: r9, sr: r6 },
            Opcode::Ldi => Self::Ldi { dr: r9, offset: pc9 },
            Opcode::Sti => Self::Sti { sr: r9, offset: pc9 },
            Opcode::Jmp => Self::Jmp { base: r6 },
            Opcode::Res => Self::Reserved { word },
            Opcode::Lea => Self::Lea { dr: r9, offset: pc9 },
            Opcode::Trap => Self::Trap {
                vector: (word & 0xFF) as u8,
            },
        }
    }

    pub fn opcode(&self) -> Opcode {
        match self {
            Self::Br { .. } => Opcode::Br,
            Self::Add { .. } => Opcode::Add,
            Self::Ld { .. } => Opcode::Ld,
            Self::St { .. } => Opcode::St,
            Self::Jsr { .. } | Self::Jsrr { .. } => Opcode::Jsr,
            Self::And { .. } => Opcode::And,
            Self::Ldr { .. } => Opcode::Ldr,
            Self::Str { .. } => Opcode::Str,
            Self::Rti => Opcode::Rti,
            Self::Not { .. } => Opcode::Not,
            Self::Ldi { .. } => Opcode::Ldi,
            Self::Sti { .. } => Opcode::Sti,
            Self::Jmp { .. } => Opcode::Jmp,
            Self::Reserved { .. } => Opcode::Res,
            Self::Lea { .. } => Opcode::Lea,
            Self::Trap { .. } => Opcode::Trap,
        }
    }

    /// Encode back into a machine word. Offsets are truncated to their field width.
    pub fn encode(&self) -> u16 {
        let base = self.opcode().base();
        let reg = |r: Reg, shift: u32| (r.index() as u16) << shift;
        let alu = |dr: Reg, sr1: Reg, operand: &Operand| {
            let tail = match operand {
                Operand::Register(sr2) => reg(*sr2, 0),
                Operand::Immediate(imm) => (1 << 5) | (imm & field_mask(5)),
            };
            base | reg(dr, 9) | reg(sr1, 6) | tail
        };
        match self {
            Self::Br { mask, offset } => base | ((mask & 0x7) << 9) | (offset & field_mask(9)),
            Self::Add { dr, sr1, operand } | Self::And { dr, sr1, operand } => {
                alu(*dr, *sr1, operand)
            }
            Self::Ld { dr: r, offset }
            | Self::St { sr: r, offset }
            | Self::Ldi { dr: r, offset }
            | Self::Sti { sr: r, offset }
            | Self::Lea { dr: r, offset } => base | reg(*r, 9) | (offset & field_mask(9)),
            Self::Jsr { offset } => base | (1 << 11) | (offset & field_mask(11)),
            Self::Jsrr { base: b } => base | reg(*b, 6),
            Self::Ldr { dr: r, base: b, offset } | Self::Str { sr: r, base: b, offset } => {
                base | reg(*r, 9) | reg(*b, 6) | (offset & field_mask(6))
            }
            Self::Rti => base,
            Self::Not { dr, sr } => base | reg(*dr, 9) | reg(*sr, 6) | 0x3F,
            Self::Jmp { base: b } => base | reg(*b, 6),
            Self::Reserved { word } => *word,
            Self::Trap { vector } => base | u16::from(*vector),
        }
    }
}

struct Signed(u16);

impl fmt::Display for Signed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0 as i16)
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Register(r) => write!(f, "{r}"),
            Self::Immediate(imm) => write!(f, "{}", Signed(*imm)),
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Br { mask: 0, .. } => write!(f, "NOP"),
            Self::Br { mask, offset } => {
                write!(f, "BR")?;
                for (bit, flag) in [(BR_N, 'n'), (BR_Z, 'z'), (BR_P, 'p')] {
                    if mask & bit != 0 {
                        write!(f, "{flag}")?;
                    }
                }
                write!(f, " {}", Signed(*offset))
            }
            Self::Add { dr, sr1, operand } => write!(f, "ADD {dr}, {sr1}, {operand}"),
            Self::And { dr, sr1, operand } => write!(f, "AND {dr}, {sr1}, {operand}"),
            Self::Ld { dr, offset } => write!(f, "LD {dr}, {}", Signed(*offset)),
            Self::St { sr, offset } => write!(f, "ST {sr}, {}", Signed(*offset)),
            Self::Jsr { offset } => write!(f, "JSR {}", Signed(*offset)),
            Self::Jsrr { base } => write!(f, "JSRR {base}"),
            Self::Ldr { dr, base, offset } => write!(f, "LDR {dr}, {base}, {}", Signed(*offset)),
            Self::Str { sr, base, offset } => write!(f, "STR {sr}, {base}, {}", Signed(*offset)),
            Self::Rti => write!(f, "RTI"),
            Self::Not { dr, sr } => write!(f, "NOT {dr}, {sr}"),
            Self::Ldi { dr, offset } => write!(f, "LDI {dr}, {}", Signed(*offset)),
            Self::Sti { sr, offset } => write!(f, "STI {sr}, {}", Signed(*offset)),
            Self::Jmp { base: Reg::R7 } => write!(f, "RET"),
            Self::Jmp { base } => write!(f, "JMP {base}"),
            Self::Reserved { word } => write!(f, ".FILL x{word:04X}"),
            Self::Lea { dr, offset } => write!(f, "LEA {dr}, {}", Signed(*offset)),
            Self::Trap { vector } => match TrapVector::try_from(*vector) {
                Ok(known) => write!(f, "{}", known.name()),
                Err(_) => write!(f, "TRAP x{vector:02X}"),
            },
        }
    }
}
