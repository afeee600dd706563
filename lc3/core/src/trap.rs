//! Built-in console service routines reached through the TRAP instruction.

use core::fmt;

use tracing::info;

use crate::console::Console;
use crate::decode::Reg;
use crate::machine::{Machine, RunState};
use crate::memory::MEMORY_SIZE;
use crate::Result;

pub const IN_PROMPT: &str = "Enter a character: ";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TrapVector {
    Getc = 0x20,
    Out = 0x21,
    Puts = 0x22,
    In = 0x23,
    Putsp = 0x24,
    Halt = 0x25,
}

impl TrapVector {
    pub const ALL: [Self; 6] = [
        Self::Getc,
        Self::Out,
        Self::Puts,
        Self::In,
        Self::Putsp,
        Self::Halt,
    ];

    pub const fn vector(self) -> u8 {
        self as u8
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::Getc => "GETC",
            Self::Out => "OUT",
            Self::Puts => "PUTS",
            Self::In => "IN",
            Self::Putsp => "PUTSP",
            Self::Halt => "HALT",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|trap| trap.name().eq_ignore_ascii_case(name))
    }
}

impl TryFrom<u8> for TrapVector {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        Self::ALL
            .into_iter()
            .find(|trap| trap.vector() == value)
            .ok_or(value)
    }
}

impl fmt::Display for TrapVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl<C: Console> Machine<C> {
    /// Run the service routine for `vector`. R7 has already been set by the caller.
    pub(crate) fn dispatch_trap(&mut self, vector: TrapVector) -> Result<()> {
        match vector {
            TrapVector::Getc => {
                let key = self.console.read_key()?;
                self.write_result(Reg::R0, u16::from(key));
            }
            TrapVector::Out => {
                let byte = (self.registers.get(Reg::R0) & 0xFF) as u8;
                self.console.write_byte(byte)?;
                self.console.flush()?;
            }
            TrapVector::Puts => {
                self.write_string(|word, out| out.push(word as u8))?;
            }
            TrapVector::In => {
                self.console.write_str(IN_PROMPT)?;
                self.console.flush()?;
                let key = self.console.read_key()?;
                self.console.write_byte(key)?;
                self.console.flush()?;
                self.write_result(Reg::R0, u16::from(key));
            }
            TrapVector::Putsp => {
                self.write_string(|word, out| {
                    out.push(word as u8);
                    let high = (word >> 8) as u8;
                    if high != 0 {
                        out.push(high);
                    }
                })?;
            }
            TrapVector::Halt => {
                let message = self.config.halt_message.clone();
                self.console.write_str(&message)?;
                self.console.write_byte(b'\n')?;
                self.console.flush()?;
                self.state = RunState::Halted;
                info!(instructions = self.instructions, "machine halted");
            }
        }
        Ok(())
    }

    /// Emit the zero-terminated word string starting at R0. Each non-zero word is
    /// expanded into bytes by `unpack`.
    fn write_string(&mut self, unpack: impl Fn(u16, &mut Vec<u8>)) -> Result<()> {
        let mut address = self.registers.get(Reg::R0);
        let mut bytes = Vec::new();
        for _ in 0..MEMORY_SIZE {
            let word = self.memory.peek(address);
            if word == 0 {
                break;
            }
            unpack(word, &mut bytes);
            address = address.wrapping_add(1);
        }
        bytes
            .into_iter()
            .try_for_each(|b| self.console.write_byte(b))?;
        self.console.flush()?;
        Ok(())
    }
}
