use std::collections::BTreeMap;

use lc3_core::decode::{BR_N, BR_P, BR_Z};
use lc3_core::{Image, Instruction, Operand, Reg, TrapVector, MEMORY_SIZE};
use tracing::debug;

use crate::lexer::{is_identifier, parse_number, tokenize, Token};
use crate::{AsmError, AsmErrorKind, Assembly};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Directive {
    Orig,
    Fill,
    Blkw,
    Stringz,
    End,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mnemonic {
    Add,
    And,
    Not,
    Ld,
    Ldi,
    Ldr,
    Lea,
    St,
    Sti,
    Str,
    Br(u16),
    Jmp,
    Ret,
    Jsr,
    Jsrr,
    Trap,
    Rti,
    Alias(TrapVector),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Directive(Directive),
    Instr(Mnemonic),
}

impl Op {
    fn parse(word: &str) -> Option<Self> {
        let upper = word.to_ascii_uppercase();
        let directive = match upper.as_str() {
            ".ORIG" => Some(Directive::Orig),
            ".FILL" => Some(Directive::Fill),
            ".BLKW" => Some(Directive::Blkw),
            ".STRINGZ" => Some(Directive::Stringz),
            ".END" => Some(Directive::End),
            _ => None,
        };
        if let Some(directive) = directive {
            return Some(Self::Directive(directive));
        }
        let mnemonic = match upper.as_str() {
            "ADD" => Mnemonic::Add,
            "AND" => Mnemonic::And,
            "NOT" => Mnemonic::Not,
            "LD" => Mnemonic::Ld,
            "LDI" => Mnemonic::Ldi,
            "LDR" => Mnemonic::Ldr,
            "LEA" => Mnemonic::Lea,
            "ST" => Mnemonic::St,
            "STI" => Mnemonic::Sti,
            "STR" => Mnemonic::Str,
            "JMP" => Mnemonic::Jmp,
            "RET" => Mnemonic::Ret,
            "JSR" => Mnemonic::Jsr,
            "JSRR" => Mnemonic::Jsrr,
            "TRAP" => Mnemonic::Trap,
            "RTI" => Mnemonic::Rti,
            other => match other.strip_prefix("BR") {
                Some(flags) => Mnemonic::Br(branch_mask(flags)?),
                None => Mnemonic::Alias(TrapVector::from_name(other)?),
            },
        };
        Some(Self::Instr(mnemonic))
    }

    fn operand_count(self) -> usize {
        match self {
            Self::Directive(Directive::End) => 0,
            Self::Directive(_) => 1,
            Self::Instr(m) => match m {
                Mnemonic::Add | Mnemonic::And | Mnemonic::Ldr | Mnemonic::Str => 3,
                Mnemonic::Not
                | Mnemonic::Ld
                | Mnemonic::Ldi
                | Mnemonic::Lea
                | Mnemonic::St
                | Mnemonic::Sti => 2,
                Mnemonic::Br(_) | Mnemonic::Jmp | Mnemonic::Jsr | Mnemonic::Jsrr | Mnemonic::Trap => {
                    1
                }
                Mnemonic::Ret | Mnemonic::Rti | Mnemonic::Alias(_) => 0,
            },
        }
    }
}

/// `""` means unconditional; otherwise some of `N`, `Z`, `P` in that order.
fn branch_mask(flags: &str) -> Option<u16> {
    if flags.is_empty() {
        return Some(BR_N | BR_Z | BR_P);
    }
    let mut mask = 0;
    let mut rest = flags;
    for (letter, bit) in [('N', BR_N), ('Z', BR_Z), ('P', BR_P)] {
        if let Some(tail) = rest.strip_prefix(letter) {
            mask |= bit;
            rest = tail;
        }
    }
    rest.is_empty().then_some(mask)
}

#[derive(Debug)]
struct Statement {
    line: usize,
    address: u16,
    mnemonic: String,
    op: Op,
    operands: Vec<Token>,
}

/// Assemble one `.ORIG` block. Lines after `.END` are ignored.
pub fn assemble(source: &str) -> Result<Assembly, AsmError> {
    let (origin, statements, symbols) = first_pass(source)?;
    let origin = origin.ok_or(AsmError {
        line: source.lines().count().max(1),
        kind: AsmErrorKind::NoOrigin,
    })?;

    let mut words = Vec::new();
    for stmt in &statements {
        emit(stmt, &symbols, &mut words).map_err(|kind| AsmError {
            line: stmt.line,
            kind,
        })?;
    }
    debug!(
        origin,
        words = words.len(),
        symbols = symbols.len(),
        "assembled"
    );
    Ok(Assembly {
        image: Image::new(origin, words),
        symbols,
    })
}

type FirstPass = (Option<u16>, Vec<Statement>, BTreeMap<String, u16>);

fn first_pass(source: &str) -> Result<FirstPass, AsmError> {
    let mut origin = None;
    let mut location = 0usize;
    let mut statements = Vec::new();
    let mut symbols = BTreeMap::new();

    for (index, text) in source.lines().enumerate() {
        let line = index + 1;
        let err = |kind| AsmError { line, kind };

        let mut tokens = tokenize(text).map_err(err)?;
        if tokens.is_empty() {
            continue;
        }
        let label = take_label(&mut tokens).map_err(err)?;
        if let Some(Label { name, .. }) = &label {
            if origin.is_none() {
                return Err(err(AsmErrorKind::NoOrigin));
            }
            if location >= MEMORY_SIZE {
                return Err(err(AsmErrorKind::Overflow));
            }
            if symbols.insert(name.clone(), location as u16).is_some() {
                return Err(err(AsmErrorKind::DuplicateLabel(name.clone())));
            }
        }
        if tokens.is_empty() {
            continue;
        }

        let mnemonic = tokens.remove(0).word().map_err(err)?.to_string();
        let Some(op) = Op::parse(&mnemonic) else {
            // `FROB R0` reads as label `FROB` then mnemonic `R0`; blame the first word.
            let unknown = match label {
                Some(Label {
                    name,
                    explicit: false,
                }) => name,
                _ => mnemonic,
            };
            return Err(err(AsmErrorKind::UnknownMnemonic(unknown)));
        };
        let operands = tokens;

        if op == Op::Directive(Directive::Orig) {
            if origin.is_some() {
                return Err(err(AsmErrorKind::DuplicateOrigin));
            }
            let Some(first) = operands.first() else {
                return Err(err(AsmErrorKind::MissingOrigin));
            };
            check_operand_count(&mnemonic, op, &operands).map_err(err)?;
            let address = unsigned(first, u16::MAX.into(), ".ORIG").map_err(err)?;
            origin = Some(address as u16);
            location = address as usize;
            continue;
        }
        if op == Op::Directive(Directive::End) {
            check_operand_count(&mnemonic, op, &operands).map_err(err)?;
            break;
        }
        if origin.is_none() {
            return Err(err(AsmErrorKind::NoOrigin));
        }
        check_operand_count(&mnemonic, op, &operands).map_err(err)?;

        let size = match op {
            Op::Directive(Directive::Blkw) => {
                unsigned(&operands[0], u16::MAX.into(), ".BLKW").map_err(err)? as usize
            }
            Op::Directive(Directive::Stringz) => match &operands[0] {
                Token::Str(text) => text.len() + 1,
                Token::Word(_) => return Err(err(AsmErrorKind::BadString)),
            },
            _ => 1,
        };
        if location + size > MEMORY_SIZE {
            return Err(err(AsmErrorKind::Overflow));
        }
        statements.push(Statement {
            line,
            address: location as u16,
            mnemonic,
            op,
            operands,
        });
        location += size;
    }
    Ok((origin, statements, symbols))
}

struct Label {
    name: String,
    /// Written with a trailing `:`.
    explicit: bool,
}

/// Strip a leading label. A word is a label when it ends in `:` or is not a
/// known instruction or directive.
fn take_label(tokens: &mut Vec<Token>) -> Result<Option<Label>, AsmErrorKind> {
    let Token::Word(first) = &tokens[0] else {
        return Ok(None);
    };
    let (name, explicit) = match first.strip_suffix(':') {
        Some(name) => (name.to_string(), true),
        None => (first.clone(), false),
    };
    if !explicit && (Op::parse(&name).is_some() || name.starts_with('.')) {
        return Ok(None);
    }
    if !is_identifier(&name) {
        return Err(if explicit {
            AsmErrorKind::BadLabel(name)
        } else {
            AsmErrorKind::UnknownMnemonic(name)
        });
    }
    tokens.remove(0);
    Ok(Some(Label { name, explicit }))
}

fn check_operand_count(mnemonic: &str, op: Op, operands: &[Token]) -> Result<(), AsmErrorKind> {
    let expected = op.operand_count();
    if operands.len() == expected {
        Ok(())
    } else {
        Err(AsmErrorKind::OperandCount {
            mnemonic: mnemonic.to_ascii_uppercase(),
            expected,
            found: operands.len(),
        })
    }
}

fn number(token: &Token) -> Result<i32, AsmErrorKind> {
    let word = token.word()?;
    parse_number(word).ok_or_else(|| AsmErrorKind::BadNumber(word.to_string()))
}

fn unsigned(token: &Token, max: i32, field: &'static str) -> Result<i32, AsmErrorKind> {
    let value = number(token)?;
    if (0..=max).contains(&value) {
        Ok(value)
    } else {
        Err(AsmErrorKind::OutOfRange { value, field })
    }
}

/// Range-check a two's-complement field of `bits` width and widen it to 16 bits.
fn signed(value: i32, bits: u32, field: &'static str) -> Result<u16, AsmErrorKind> {
    let half = 1i32 << (bits - 1);
    if (-half..half).contains(&value) {
        Ok(value as i16 as u16)
    } else {
        Err(AsmErrorKind::OutOfRange { value, field })
    }
}

fn register(token: &Token) -> Result<Reg, AsmErrorKind> {
    let word = token.word()?;
    Reg::parse(word).ok_or_else(|| AsmErrorKind::BadRegister(word.to_string()))
}

fn label(word: &str, symbols: &BTreeMap<String, u16>) -> Result<u16, AsmErrorKind> {
    if !is_identifier(word) {
        return Err(AsmErrorKind::BadNumber(word.to_string()));
    }
    symbols
        .get(word)
        .copied()
        .ok_or_else(|| AsmErrorKind::UndefinedLabel(word.to_string()))
}

struct Encoder<'a> {
    symbols: &'a BTreeMap<String, u16>,
    /// Address of the instruction after the one being encoded.
    next: i32,
}

impl Encoder<'_> {
    fn pc_offset(&self, token: &Token, bits: u32, field: &'static str) -> Result<u16, AsmErrorKind> {
        let word = token.word()?;
        let offset = match parse_number(word) {
            Some(literal) => literal,
            None => i32::from(label(word, self.symbols)?) - self.next,
        };
        signed(offset, bits, field)
    }

    fn alu_operand(&self, token: &Token) -> Result<Operand, AsmErrorKind> {
        let word = token.word()?;
        if let Some(reg) = Reg::parse(word) {
            return Ok(Operand::Register(reg));
        }
        Ok(Operand::Immediate(signed(number(token)?, 5, "imm5")?))
    }

    fn instruction(&self, mnemonic: Mnemonic, ops: &[Token]) -> Result<Instruction, AsmErrorKind> {
        Ok(match mnemonic {
            Mnemonic::Add => Instruction::Add {
                dr: register(&ops[0])?,
                sr1: register(&ops[1])?,
                operand: self.alu_operand(&ops[2])?,
            },
            Mnemonic::And => Instruction::And {
                dr: register(&ops[0])?,
                sr1: register(&ops[1])?,
                operand: self.alu_operand(&ops[2])?,
            },
            Mnemonic::Not => Instruction::Not {
                dr: register(&ops[0])?,
                sr: register(&ops[1])?,
            },
            Mnemonic::Ld => Instruction::Ld {
                dr: register(&ops[0])?,
                offset: self.pc_offset(&ops[1], 9, "PCoffset9")?,
            },
            Mnemonic::Ldi => Instruction::Ldi {
                dr: register(&ops[0])?,
                offset: self.pc_offset(&ops[1], 9, "PCoffset9")?,
            },
            Mnemonic::Lea => Instruction::Lea {
                dr: register(&ops[0])?,
                offset: self.pc_offset(&ops[1], 9, "PCoffset9")?,
            },
            Mnemonic::St => Instruction::St {
                sr: register(&ops[0])?,
                offset: self.pc_offset(&ops[1], 9, "PCoffset9")?,
            },
            Mnemonic::Sti => Instruction::Sti {
                sr: register(&ops[0])?,
                offset: self.pc_offset(&ops[1], 9, "PCoffset9")?,
            },
            Mnemonic::Ldr => Instruction::Ldr {
                dr: register(&ops[0])?,
                base: register(&ops[1])?,
                offset: signed(number(&ops[2])?, 6, "offset6")?,
            },
            Mnemonic::Str => Instruction::Str {
                sr: register(&ops[0])?,
                base: register(&ops[1])?,
                offset: signed(number(&ops[2])?, 6, "offset6")?,
            },
            Mnemonic::Br(mask) => Instruction::Br {
                mask,
                offset: self.pc_offset(&ops[0], 9, "PCoffset9")?,
            },
            Mnemonic::Jmp => Instruction::Jmp {
                base: register(&ops[0])?,
            },
            Mnemonic::Ret => Instruction::Jmp { base: Reg::R7 },
            Mnemonic::Jsr => Instruction::Jsr {
                offset: self.pc_offset(&ops[0], 11, "PCoffset11")?,
            },
            Mnemonic::Jsrr => Instruction::Jsrr {
                base: register(&ops[0])?,
            },
            Mnemonic::Trap => Instruction::Trap {
                vector: unsigned(&ops[0], 0xFF, "trapvect8")? as u8,
            },
            Mnemonic::Rti => Instruction::Rti,
            Mnemonic::Alias(trap) => Instruction::Trap {
                vector: trap.vector(),
            },
        })
    }
}

fn emit(
    stmt: &Statement,
    symbols: &BTreeMap<String, u16>,
    words: &mut Vec<u16>,
) -> Result<(), AsmErrorKind> {
    let ops = &stmt.operands;
    match stmt.op {
        Op::Directive(Directive::Fill) => {
            let word = ops[0].word()?;
            let value = match parse_number(word) {
                Some(value) if (-0x8000..=0xFFFF).contains(&value) => value as u16,
                Some(value) => {
                    return Err(AsmErrorKind::OutOfRange {
                        value,
                        field: ".FILL",
                    })
                }
                None => label(word, symbols)?,
            };
            words.push(value);
        }
        Op::Directive(Directive::Blkw) => {
            let count = unsigned(&ops[0], u16::MAX.into(), ".BLKW")? as usize;
            words.resize(words.len() + count, 0);
        }
        Op::Directive(Directive::Stringz) => {
            if let Token::Str(text) = &ops[0] {
                words.extend(text.bytes().map(u16::from));
                words.push(0);
            }
        }
        Op::Directive(Directive::Orig | Directive::End) => {}
        Op::Instr(mnemonic) => {
            let encoder = Encoder {
                symbols,
                next: i32::from(stmt.address) + 1,
            };
            let instr = encoder.instruction(mnemonic, ops)?;
            debug!(address = stmt.address, mnemonic = %stmt.mnemonic, %instr, "encoded");
            words.push(instr.encode());
        }
    }
    Ok(())
}
