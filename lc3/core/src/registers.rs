use core::fmt;

use serde::{Deserialize, Serialize};

use crate::decode::Reg;

/// Condition register value. Exactly one flag is active at any time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Condition {
    Pos = 1,
    Zero = 2,
    Neg = 4,
}

impl Condition {
    /// Classify a register value by sign.
    pub const fn of(value: u16) -> Self {
        if value == 0 {
            Self::Zero
        } else if value >> 15 == 1 {
            Self::Neg
        } else {
            Self::Pos
        }
    }

    /// Bit pattern matching the n/z/p layout of a branch mask.
    pub const fn bits(self) -> u16 {
        self as u16
    }

    pub const fn matches(self, mask: u16) -> bool {
        self.bits() & mask != 0
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pos => "P",
            Self::Zero => "Z",
            Self::Neg => "N",
        };
        write!(f, "{s}")
    }
}

/// R0..R7, PC and COND.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registers {
    #[serde(rename = "r")]
    gp: [u16; Self::GP_COUNT],
    pub pc: u16,
    cond: Condition,
}

impl Registers {
    pub const GP_COUNT: usize = 8;

    pub fn new(pc: u16) -> Self {
        Self {
            gp: [0; Self::GP_COUNT],
            pc,
            cond: Condition::Zero,
        }
    }

    pub fn get(&self, reg: Reg) -> u16 {
        self.gp[reg.index()]
    }

    /// Plain register write. Flags are left alone; see [`Registers::update_flags`].
    pub fn set(&mut self, reg: Reg, value: u16) {
        self.gp[reg.index()] = value;
    }

    pub fn cond(&self) -> Condition {
        self.cond
    }

    /// Recompute COND from the value currently held in `reg`.
    pub fn update_flags(&mut self, reg: Reg) {
        self.cond = Condition::of(self.get(reg));
    }

    pub fn general_purpose(&self) -> [u16; Self::GP_COUNT] {
        self.gp
    }
}

impl fmt::Display for Registers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (idx, value) in self.gp.iter().enumerate() {
            write!(f, "R{idx}=x{value:04X} ")?;
        }
        write!(f, "PC=x{:04X} COND={}", self.pc, self.cond)
    }
}
