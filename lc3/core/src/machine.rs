//! Fetch-decode-execute engine.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, trace};

use crate::console::Console;
use crate::decode::{Instruction, Operand, Reg};
use crate::image::Image;
use crate::memory::Memory;
use crate::registers::Registers;
use crate::trap::TrapVector;
use crate::{CoreError, Result};

pub const PC_START: u16 = 0x3000;
pub const DEFAULT_HALT_MESSAGE: &str = "HALT";
pub const DEFAULT_INTERRUPT_POLL_STEPS: u64 = 4096;

#[derive(Debug, Clone)]
pub struct MachineConfig {
    pub start_pc: u16,
    /// Stop `run` after this many instructions (counted from power-on).
    pub max_steps: Option<u64>,
    /// Upper bound on how long a keyboard-status read waits for input.
    pub poll_timeout: Duration,
    pub halt_message: String,
    /// Check the console for an interrupt request every this many instructions
    /// (0 disables the check).
    pub interrupt_poll_steps: u64,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            start_pc: PC_START,
            max_steps: None,
            poll_timeout: Duration::ZERO,
            halt_message: DEFAULT_HALT_MESSAGE.to_string(),
            interrupt_poll_steps: DEFAULT_INTERRUPT_POLL_STEPS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Running,
    Halted,
}

/// Cooperative cancellation flag shared between the console and the engine.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub state: RunState,
    pub instructions: u64,
    pub registers: Registers,
}

impl RunSummary {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn write_json(&self, path: &Path) -> Result<()> {
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }
}

pub struct Machine<C: Console> {
    pub(crate) registers: Registers,
    pub(crate) memory: Memory,
    pub(crate) console: C,
    pub(crate) config: MachineConfig,
    pub(crate) state: RunState,
    pub(crate) instructions: u64,
    cancel: CancelToken,
}

impl<C: Console> Machine<C> {
    pub fn new(console: C) -> Self {
        Self::with_config(console, MachineConfig::default())
    }

    pub fn with_config(console: C, config: MachineConfig) -> Self {
        let mut memory = Memory::new();
        memory.set_poll_timeout(config.poll_timeout);
        Self {
            registers: Registers::new(config.start_pc),
            memory,
            console,
            config,
            state: RunState::Running,
            instructions: 0,
            cancel: CancelToken::new(),
        }
    }

    /// Share `token` with whatever may request an interrupt (usually the console).
    pub fn with_cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn registers(&self) -> &Registers {
        &self.registers
    }

    pub fn registers_mut(&mut self) -> &mut Registers {
        &mut self.registers
    }

    pub fn memory(&self) -> &Memory {
        &self.memory
    }

    pub fn memory_mut(&mut self) -> &mut Memory {
        &mut self.memory
    }

    pub fn console(&self) -> &C {
        &self.console
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn is_halted(&self) -> bool {
        self.state == RunState::Halted
    }

    pub fn instruction_count(&self) -> u64 {
        self.instructions
    }

    pub fn load_image(&mut self, image: &Image) -> usize {
        self.memory.load_image(image)
    }

    pub fn summary(&self) -> RunSummary {
        RunSummary {
            state: self.state,
            instructions: self.instructions,
            registers: self.registers.clone(),
        }
    }

    /// Run until HALT, a fatal error, an interrupt, or the configured step limit.
    pub fn run(&mut self) -> Result<RunSummary> {
        while self.state == RunState::Running {
            if self
                .config
                .max_steps
                .is_some_and(|limit| self.instructions >= limit)
            {
                debug!(instructions = self.instructions, "step limit reached");
                break;
            }
            let interval = self.config.interrupt_poll_steps;
            if interval > 0 && self.instructions % interval == 0 {
                self.console.poll_interrupt()?;
            }
            self.step()?;
        }
        Ok(self.summary())
    }

    /// Execute exactly one instruction.
    pub fn step(&mut self) -> Result<RunState> {
        if self.state == RunState::Halted {
            return Ok(RunState::Halted);
        }
        if self.cancel.is_cancelled() {
            return Err(CoreError::Interrupted);
        }

        let pc = self.registers.pc;
        if let Err(err) = self.cycle(pc) {
            if !matches!(err, CoreError::Interrupted) {
                error!(pc, %err, "machine fault");
                self.state = RunState::Halted;
            }
            return Err(err);
        }
        Ok(self.state)
    }

    fn cycle(&mut self, pc: u16) -> Result<()> {
        let word = self.read(pc)?;
        self.registers.pc = pc.wrapping_add(1);
        let instr = Instruction::decode(word);
        trace!(pc, word, %instr, "execute");

        self.instructions += 1;
        self.execute(instr, pc)
    }

    pub(crate) fn write_result(&mut self, dr: Reg, value: u16) {
        self.registers.set(dr, value);
        self.registers.update_flags(dr);
    }

    fn operand_value(&self, operand: Operand) -> u16 {
        match operand {
            Operand::Register(r) => self.registers.get(r),
            Operand::Immediate(imm) => imm,
        }
    }

    fn read(&mut self, address: u16) -> Result<u16> {
        Ok(self.memory.read(address, &mut self.console)?)
    }

    /// `pc` is the address the instruction was fetched from; `self.registers.pc`
    /// already points past it.
    fn execute(&mut self, instr: Instruction, pc: u16) -> Result<()> {
        let next = self.registers.pc;
        match instr {
            Instruction::Br { mask, offset } => {
                if self.registers.cond().matches(mask) {
                    self.registers.pc = next.wrapping_add(offset);
                }
            }
            Instruction::Add { dr, sr1, operand } => {
                let value = self
                    .registers
                    .get(sr1)
                    .wrapping_add(self.operand_value(operand));
                self.write_result(dr, value);
            }
            Instruction::And { dr, sr1, operand } => {
                let value = self.registers.get(sr1) & self.operand_value(operand);
                self.write_result(dr, value);
            }
            Instruction::Not { dr, sr } => {
                let value = !self.registers.get(sr);
                self.write_result(dr, value);
            }
            Instruction::Ld { dr, offset } => {
                let value = self.read(next.wrapping_add(offset))?;
                self.write_result(dr, value);
            }
            Instruction::Ldi { dr, offset } => {
                let pointer = self.read(next.wrapping_add(offset))?;
                let value = self.read(pointer)?;
                self.write_result(dr, value);
            }
            Instruction::Ldr { dr, base, offset } => {
                let address = self.registers.get(base).wrapping_add(offset);
                let value = self.read(address)?;
                self.write_result(dr, value);
            }
            Instruction::Lea { dr, offset } => {
                self.write_result(dr, next.wrapping_add(offset));
            }
            Instruction::St { sr, offset } => {
                self.memory
                    .write(next.wrapping_add(offset), self.registers.get(sr));
            }
            Instruction::Sti { sr, offset } => {
                let pointer = self.read(next.wrapping_add(offset))?;
                self.memory.write(pointer, self.registers.get(sr));
            }
            Instruction::Str { sr, base, offset } => {
                let address = self.registers.get(base).wrapping_add(offset);
                self.memory.write(address, self.registers.get(sr));
            }
            Instruction::Jsr { offset } => {
                self.registers.set(Reg::R7, next);
                self.registers.pc = next.wrapping_add(offset);
            }
            Instruction::Jsrr { base } => {
                // Read the target first so JSRR R7 jumps to the old R7.
                let target = self.registers.get(base);
                self.registers.set(Reg::R7, next);
                self.registers.pc = target;
            }
            Instruction::Jmp { base } => {
                self.registers.pc = self.registers.get(base);
            }
            Instruction::Rti => {
                debug!(pc, "RTI ignored in user mode");
            }
            Instruction::Reserved { word } => {
                return Err(CoreError::IllegalOpcode { word, pc });
            }
            Instruction::Trap { vector } => {
                self.registers.set(Reg::R7, next);
                let trap = TrapVector::try_from(vector)
                    .map_err(|vector| CoreError::IllegalTrapVector { vector, pc })?;
                self.dispatch_trap(trap)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::console::BufferedConsole;
    use crate::registers::Condition;

    fn machine(program: &[u16]) -> Machine<BufferedConsole> {
        let mut vm = Machine::new(BufferedConsole::new());
        vm.load_image(&Image::new(PC_START, program.to_vec()));
        vm
    }

    #[test]
    fn powers_on_at_x3000_with_zero_flag() {
        let vm = machine(&[]);
        assert_eq!(vm.registers().pc, 0x3000);
        assert_eq!(vm.registers().cond(), Condition::Zero);
        assert_eq!(vm.state(), RunState::Running);
    }

    #[test]
    fn add_immediate_sets_positive_flag() {
        // ADD R1, R0, #5
        let mut vm = machine(&[0b0001_001_000_1_00101]);
        vm.step().unwrap();
        assert_eq!(vm.registers().get(Reg::R1), 5);
        assert_eq!(vm.registers().cond(), Condition::Pos);
        assert_eq!(vm.registers().pc, 0x3001);
    }

    #[test]
    fn add_wraps_and_sets_negative_or_zero() {
        // ADD R2, R0, R1 ; ADD R3, R2, #1
        let mut vm = machine(&[0x1401, 0x16A1]);
        vm.registers_mut().set(Reg::R0, 0x7FFF);
        vm.registers_mut().set(Reg::R1, 0x8000);
        vm.step().unwrap();
        assert_eq!(vm.registers().get(Reg::R2), 0xFFFF);
        assert_eq!(vm.registers().cond(), Condition::Neg);
        vm.step().unwrap();
        assert_eq!(vm.registers().get(Reg::R3), 0);
        assert_eq!(vm.registers().cond(), Condition::Zero);
    }

    #[test]
    fn lea_uses_incremented_pc() {
        // LEA R0, #16 fetched from x3000, so PC is x3001 when it executes
        let mut vm = machine(&[0xE010]);
        vm.step().unwrap();
        assert_eq!(vm.registers().get(Reg::R0), 0x3011);
        assert_eq!(vm.registers().cond(), Condition::Pos);
    }

    #[test]
    fn branch_not_taken_when_condition_differs() {
        // ADD R0, R0, #1 (COND=P) ; BRz #5
        let mut vm = machine(&[0x1021, 0x0405]);
        vm.step().unwrap();
        assert_eq!(vm.registers().cond(), Condition::Pos);
        vm.step().unwrap();
        assert_eq!(vm.registers().pc, 0x3002);
    }

    #[test]
    fn branch_taken_backwards() {
        // BRz #-1 at x3000 with COND=Z loops onto itself
        let mut vm = machine(&[0x05FF]);
        vm.step().unwrap();
        assert_eq!(vm.registers().pc, 0x3000);
    }

    #[test]
    fn ld_and_ldi_differ_by_one_indirection() {
        // LD R1, #1 ; LDI R2, #0 ; .FILL x4000
        let mut vm = machine(&[0x2201, 0xA400, 0x4000]);
        vm.memory_mut().write(0x4000, 0xBEEF);
        vm.step().unwrap();
        assert_eq!(vm.registers().get(Reg::R1), 0x4000);
        vm.step().unwrap();
        assert_eq!(vm.registers().get(Reg::R2), 0xBEEF);
        assert_eq!(vm.registers().cond(), Condition::Neg);
    }

    #[test]
    fn st_sti_and_str_store_source_register() {
        // ST R1, #2 ; STI R1, #2 ; STR R1, R2, #-1 ; (x3003) ; .FILL x5000
        let mut vm = machine(&[0x3202, 0xB202, 0x72BF, 0x0000, 0x5000]);
        vm.registers_mut().set(Reg::R1, 0x00AB);
        vm.registers_mut().set(Reg::R2, 0x6001);
        for _ in 0..3 {
            vm.step().unwrap();
        }
        assert_eq!(vm.memory().peek(0x3003), 0x00AB);
        assert_eq!(vm.memory().peek(0x5000), 0x00AB);
        assert_eq!(vm.memory().peek(0x6000), 0x00AB);
        assert_eq!(vm.registers().cond(), Condition::Zero, "stores leave flags alone");
    }

    #[test]
    fn ldr_reads_base_plus_offset() {
        // LDR R3, R4, #-2
        let mut vm = machine(&[0x673E]);
        vm.registers_mut().set(Reg::R4, 0x4002);
        vm.memory_mut().write(0x4000, 0x0042);
        vm.step().unwrap();
        assert_eq!(vm.registers().get(Reg::R3), 0x0042);
    }

    #[test]
    fn and_not_update_flags() {
        // AND R0, R0, #0 ; NOT R1, R0
        let mut vm = machine(&[0x5020, 0x923F]);
        vm.registers_mut().set(Reg::R0, 0x1234);
        vm.step().unwrap();
        assert_eq!(vm.registers().get(Reg::R0), 0);
        assert_eq!(vm.registers().cond(), Condition::Zero);
        vm.step().unwrap();
        assert_eq!(vm.registers().get(Reg::R1), 0xFFFF);
        assert_eq!(vm.registers().cond(), Condition::Neg);
    }

    #[test]
    fn jsr_saves_return_address_and_ret_comes_back() {
        // JSR #1 ; HALT ; RET
        let mut vm = machine(&[0x4801, 0xF025, 0xC1C0]);
        vm.step().unwrap();
        assert_eq!(vm.registers().get(Reg::R7), 0x3001);
        assert_eq!(vm.registers().pc, 0x3002);
        vm.step().unwrap();
        assert_eq!(vm.registers().pc, 0x3001);
    }

    #[test]
    fn jsrr_through_r7_uses_previous_value() {
        // JSRR R7
        let mut vm = machine(&[0x41C0]);
        vm.registers_mut().set(Reg::R7, 0x4000);
        vm.step().unwrap();
        assert_eq!(vm.registers().pc, 0x4000);
        assert_eq!(vm.registers().get(Reg::R7), 0x3001);
    }

    #[test]
    fn jmp_loads_pc_from_base() {
        let mut vm = machine(&[0xC080]);
        vm.registers_mut().set(Reg::R2, 0x1234);
        vm.step().unwrap();
        assert_eq!(vm.registers().pc, 0x1234);
    }

    #[test]
    fn rti_is_a_no_op() {
        let mut vm = machine(&[0x8000]);
        let before = vm.registers().clone();
        vm.step().unwrap();
        assert_eq!(vm.registers().pc, 0x3001);
        assert_eq!(vm.registers().general_purpose(), before.general_purpose());
        assert_eq!(vm.registers().cond(), before.cond());
    }

    #[test]
    fn reserved_opcode_halts_with_error() {
        let mut vm = machine(&[0xD000, 0x1021]);
        let err = vm.step().unwrap_err();
        assert!(matches!(
            err,
            CoreError::IllegalOpcode {
                word: 0xD000,
                pc: 0x3000
            }
        ));
        assert!(vm.is_halted());
        assert_eq!(vm.step().unwrap(), RunState::Halted);
        assert_eq!(vm.registers().get(Reg::R0), 0, "nothing runs after the fault");
    }

    #[test]
    fn unknown_trap_vector_halts_with_error() {
        let mut vm = machine(&[0xF0FF]);
        let err = vm.run().unwrap_err();
        assert!(matches!(
            err,
            CoreError::IllegalTrapVector {
                vector: 0xFF,
                pc: 0x3000
            }
        ));
        assert!(vm.is_halted());
    }

    #[test]
    fn halt_trap_stops_the_run() {
        // HALT ; ADD R0, R0, #1
        let mut vm = machine(&[0xF025, 0x1021]);
        let summary = vm.run().unwrap();
        assert_eq!(summary.state, RunState::Halted);
        assert_eq!(summary.instructions, 1);
        assert_eq!(vm.registers().get(Reg::R0), 0);
        assert_eq!(vm.registers().get(Reg::R7), 0x3001);
        assert_eq!(vm.console().output_string(), "HALT\n");
    }

    #[test]
    fn step_limit_stops_a_running_machine() {
        // BRnzp #-1 spins forever
        let mut vm = Machine::with_config(
            BufferedConsole::new(),
            MachineConfig {
                max_steps: Some(10),
                ..MachineConfig::default()
            },
        );
        vm.load_image(&Image::new(PC_START, vec![0x0FFF]));
        let summary = vm.run().unwrap();
        assert_eq!(summary.state, RunState::Running);
        assert_eq!(summary.instructions, 10);
    }

    #[test]
    fn cancellation_stops_before_next_fetch() {
        let mut vm = machine(&[0x1021, 0x1021]);
        vm.step().unwrap();
        vm.cancel_token().cancel();
        assert!(matches!(vm.step(), Err(CoreError::Interrupted)));
        assert_eq!(vm.registers().get(Reg::R0), 1);
        assert!(matches!(vm.run(), Err(CoreError::Interrupted)));
    }

    /// Keyboard polls fail; everything else is inert.
    struct BrokenKeyboard;

    impl Console for BrokenKeyboard {
        fn poll_key(&mut self, _timeout: Duration) -> std::io::Result<Option<u8>> {
            Err(std::io::Error::other("keyboard unplugged"))
        }

        fn read_key(&mut self) -> std::io::Result<u8> {
            Ok(0)
        }

        fn write_byte(&mut self, _byte: u8) -> std::io::Result<()> {
            Ok(())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn console_error_during_fetch_halts_like_any_fault() {
        let mut vm = Machine::new(BrokenKeyboard);
        vm.registers_mut().pc = crate::memory::KBSR;
        let err = vm.step().unwrap_err();
        assert!(matches!(err, CoreError::Io(_)), "{err:?}");
        assert!(vm.is_halted(), "fetch failures must halt the machine");
        assert_eq!(vm.instruction_count(), 0);
        assert_eq!(vm.registers().pc, crate::memory::KBSR, "PC not advanced");
    }

    /// Requests an interrupt the first time the engine checks for one.
    struct InterruptingConsole {
        polls: usize,
    }

    impl Console for InterruptingConsole {
        fn poll_key(&mut self, _timeout: Duration) -> std::io::Result<Option<u8>> {
            Ok(None)
        }

        fn read_key(&mut self) -> std::io::Result<u8> {
            Ok(0)
        }

        fn write_byte(&mut self, _byte: u8) -> std::io::Result<()> {
            Ok(())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }

        fn poll_interrupt(&mut self) -> std::io::Result<()> {
            self.polls += 1;
            Err(std::io::Error::new(
                std::io::ErrorKind::Interrupted,
                "ctrl-c",
            ))
        }
    }

    #[test]
    fn console_interrupt_stops_a_spinning_program() {
        let config = MachineConfig {
            interrupt_poll_steps: 16,
            ..MachineConfig::default()
        };
        let mut vm = Machine::with_config(InterruptingConsole { polls: 0 }, config);
        // BRnzp #-1
        vm.load_image(&Image::new(PC_START, vec![0x0FFF]));
        assert!(matches!(vm.run(), Err(CoreError::Interrupted)));
        assert_eq!(vm.instruction_count(), 0);
        assert_eq!(vm.state(), RunState::Running, "interrupt is not a fault");
        assert_eq!(vm.console().polls, 1);
    }

    #[test]
    fn fetch_from_keyboard_status_polls_console() {
        // LDI R0, #1 ; HALT ; .FILL xFE00
        let mut vm = Machine::new(BufferedConsole::with_input("x"));
        vm.load_image(&Image::new(PC_START, vec![0xA001, 0xF025, 0xFE00]));
        vm.run().unwrap();
        assert_eq!(vm.registers().get(Reg::R0), 0x8000);
        assert_eq!(vm.memory().peek(crate::memory::KBDR), u16::from(b'x'));
    }

    #[test]
    fn summary_serializes_to_json() {
        let mut vm = machine(&[0xF025]);
        let summary = vm.run().unwrap();
        let json = summary.to_json().unwrap();
        assert!(json.contains("\"state\": \"halted\""), "{json}");
        assert!(json.contains("\"instructions\": 1"), "{json}");
    }
}
