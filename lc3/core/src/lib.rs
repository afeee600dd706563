//! LC-3 virtual machine core.
//!
//! Loads object images into a 64K-word memory and runs them through a
//! fetch-decode-execute loop. Console I/O goes through the [`Console`] trait so
//! the same engine drives a real terminal or an in-memory test double.

use std::path::PathBuf;

use thiserror::Error;

pub mod console;
pub mod decode;
pub mod image;
pub mod machine;
pub mod memory;
pub mod registers;
pub mod trap;

pub use console::{BufferedConsole, Console, TerminalConsole};
pub use decode::{sign_extend, Instruction, Opcode, Operand, Reg};
pub use image::Image;
pub use machine::{CancelToken, Machine, MachineConfig, RunState, RunSummary, PC_START};
pub use memory::{Memory, KBDR, KBSR, MEMORY_SIZE};
pub use registers::{Condition, Registers};
pub use trap::TrapVector;

/// Environment variable holding the tracing filter directive.
pub const LOG_ENV: &str = "LC3_LOG";

pub type Result<T> = std::result::Result<T, CoreError>;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("io error: {0}")]
    Io(std::io::Error),
    #[error("failed to load image {}: {source}", path.display())]
    ImageLoad {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("image too short: {len} bytes, need at least an origin word")]
    ImageTooShort { len: usize },
    #[error("illegal opcode in {word:#06x} at {pc:#06x}")]
    IllegalOpcode { word: u16, pc: u16 },
    #[error("illegal trap vector {vector:#04x} at {pc:#06x}")]
    IllegalTrapVector { vector: u8, pc: u16 },
    #[error("interrupted")]
    Interrupted,
    #[error("serialize error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl From<std::io::Error> for CoreError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::Interrupted => Self::Interrupted,
            _ => Self::Io(err),
        }
    }
}

/// Install a stderr subscriber filtered by `LC3_LOG` (default `warn`).
/// Safe to call more than once.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_env(LOG_ENV)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}
