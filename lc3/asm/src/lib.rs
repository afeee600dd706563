//! Two-pass assembler producing LC-3 object images.
//!
//! ```
//! let assembly = lc3_asm::assemble(".ORIG x3000\nHALT\n.END").unwrap();
//! assert_eq!(assembly.image.words, vec![0xF025]);
//! ```

use std::collections::BTreeMap;

use lc3_core::{Image, Instruction};
use thiserror::Error;

mod assembler;
pub mod lexer;

pub use assembler::assemble;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("line {line}: {kind}")]
pub struct AsmError {
    /// 1-based source line.
    pub line: usize,
    pub kind: AsmErrorKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AsmErrorKind {
    #[error("unknown instruction or directive `{0}`")]
    UnknownMnemonic(String),
    #[error("bad register `{0}`")]
    BadRegister(String),
    #[error("bad number `{0}`")]
    BadNumber(String),
    #[error("{mnemonic} expects {expected} operand(s), found {found}")]
    OperandCount {
        mnemonic: String,
        expected: usize,
        found: usize,
    },
    #[error("{value} does not fit in {field}")]
    OutOfRange { value: i32, field: &'static str },
    #[error("undefined label `{0}`")]
    UndefinedLabel(String),
    #[error("invalid label `{0}`")]
    BadLabel(String),
    #[error("duplicate label `{0}`")]
    DuplicateLabel(String),
    #[error("malformed string literal")]
    BadString,
    #[error("string literal not allowed here")]
    UnexpectedString,
    #[error(".ORIG requires an address")]
    MissingOrigin,
    #[error("statement before .ORIG")]
    NoOrigin,
    #[error("only one .ORIG block is supported")]
    DuplicateOrigin,
    #[error("program runs past the top of memory")]
    Overflow,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assembly {
    pub image: Image,
    pub symbols: BTreeMap<String, u16>,
}

impl Assembly {
    /// `x3000  xE002  START  LEA R0, #2` per assembled word.
    pub fn listing(&self) -> String {
        let mut labels: BTreeMap<u16, &str> = BTreeMap::new();
        for (name, address) in &self.symbols {
            labels.entry(*address).or_insert(name);
        }
        self.image
            .words
            .iter()
            .enumerate()
            .map(|(i, word)| {
                let address = self.image.origin.wrapping_add(i as u16);
                let label = labels.get(&address).copied().unwrap_or("");
                let line = format!(
                    "x{address:04X}  x{word:04X}  {label:<12} {}",
                    Instruction::decode(*word)
                );
                format!("{}\n", line.trim_end())
            })
            .collect()
    }

    pub fn symbol_table(&self) -> String {
        self.symbols
            .iter()
            .map(|(name, address)| format!("{name:<16} x{address:04X}\n"))
            .collect()
    }
}
