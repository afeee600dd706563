use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use lc3_core::machine::DEFAULT_INTERRUPT_POLL_STEPS;
use lc3_core::{
    init_tracing, CancelToken, Console, CoreError, Image, Machine, MachineConfig, RunState,
    TerminalConsole,
};
use tracing::info;

const EXIT_INTERRUPTED: i32 = 130;

#[derive(Parser, Debug)]
#[command(name = "lc3", about = "Run LC-3 object images in the terminal.")]
struct Args {
    /// Object images to load, in order. Later images overwrite earlier ones.
    #[arg(value_name = "IMAGE", required = true)]
    images: Vec<PathBuf>,

    /// Number of instructions to execute before exiting (0 = run until HALT).
    #[arg(long, default_value_t = 0)]
    steps: u64,

    /// How long a keyboard status read waits for a key, in milliseconds.
    #[arg(long, default_value_t = 0)]
    poll_timeout_ms: u64,

    /// Number of instructions between Ctrl+C checks while no key is being read (0 = never).
    #[arg(long, default_value_t = DEFAULT_INTERRUPT_POLL_STEPS)]
    interrupt_poll_steps: u64,

    /// Write the final machine state as JSON to this path.
    #[arg(long, value_name = "PATH")]
    dump_state: Option<PathBuf>,

    /// Leave the terminal in cooked mode.
    #[arg(long, default_value_t = false)]
    no_raw: bool,
}

impl Args {
    fn machine_config(&self) -> MachineConfig {
        MachineConfig {
            max_steps: (self.steps > 0).then_some(self.steps),
            poll_timeout: Duration::from_millis(self.poll_timeout_ms),
            interrupt_poll_steps: self.interrupt_poll_steps,
            ..MachineConfig::default()
        }
    }
}

fn run(args: Args) -> anyhow::Result<()> {
    let cancel = CancelToken::new();
    let mut console = TerminalConsole::new(cancel.clone());
    if !args.no_raw {
        console.enable_raw_mode().context("enable raw mode")?;
    }

    let mut machine =
        Machine::with_config(console, args.machine_config()).with_cancel_token(cancel);
    for path in &args.images {
        let image = Image::read(path)?;
        machine.load_image(&image);
    }

    let summary = machine.run()?;
    if summary.state == RunState::Running {
        info!(instructions = summary.instructions, "step limit reached");
    }
    if let Some(path) = &args.dump_state {
        summary
            .write_json(path)
            .with_context(|| format!("write state to {}", path.display()))?;
    }
    Ok(())
}

fn main() {
    init_tracing();
    let args = Args::parse();
    // `run` owns the console, so the terminal is restored before we exit.
    if let Err(err) = run(args) {
        if matches!(err.downcast_ref::<CoreError>(), Some(CoreError::Interrupted)) {
            std::process::exit(EXIT_INTERRUPTED);
        }
        eprintln!("fatal: {err:#}");
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_steps_means_unlimited() {
        let args = Args::parse_from(["lc3", "prog.obj"]);
        assert_eq!(args.machine_config().max_steps, None);
        assert_eq!(args.machine_config().poll_timeout, Duration::ZERO);
        assert_eq!(
            args.machine_config().interrupt_poll_steps,
            DEFAULT_INTERRUPT_POLL_STEPS
        );
    }

    #[test]
    fn flags_flow_into_machine_config() {
        let args = Args::parse_from([
            "lc3",
            "--steps",
            "500",
            "--poll-timeout-ms",
            "15",
            "os.obj",
            "prog.obj",
        ]);
        assert_eq!(args.images.len(), 2);
        let config = args.machine_config();
        assert_eq!(config.max_steps, Some(500));
        assert_eq!(config.poll_timeout, Duration::from_millis(15));
    }

    #[test]
    fn at_least_one_image_is_required() {
        assert!(Args::try_parse_from(["lc3"]).is_err());
    }
}
