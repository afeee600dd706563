use std::fs;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use lc3_core::init_tracing;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "lc3-asm", about = "Assemble LC-3 source into an object image.")]
struct Args {
    /// Assembly source file.
    #[arg(value_name = "INPUT")]
    input: PathBuf,

    /// Output image path (defaults to INPUT with an .obj extension).
    #[arg(short, long, value_name = "PATH")]
    output: Option<PathBuf>,

    /// Print the symbol table.
    #[arg(long, default_value_t = false)]
    symbols: bool,

    /// Print an address/word/disassembly listing instead of writing the image.
    #[arg(long, default_value_t = false)]
    disassemble: bool,
}

impl Args {
    fn output_path(&self) -> PathBuf {
        self.output
            .clone()
            .unwrap_or_else(|| self.input.with_extension("obj"))
    }
}

fn run(args: Args) -> anyhow::Result<()> {
    let source = fs::read_to_string(&args.input)
        .with_context(|| format!("read {}", args.input.display()))?;
    let assembly = lc3_asm::assemble(&source)
        .with_context(|| format!("assemble {}", args.input.display()))?;

    if args.symbols {
        print!("{}", assembly.symbol_table());
    }
    if args.disassemble {
        print!("{}", assembly.listing());
        return Ok(());
    }

    let output = args.output_path();
    assembly.image.write(&output)?;
    info!(
        path = %output.display(),
        origin = assembly.image.origin,
        words = assembly.image.words.len(),
        "wrote image"
    );
    Ok(())
}

fn main() {
    init_tracing();
    let args = Args::parse();
    if let Err(err) = run(args) {
        eprintln!("fatal: {err:#}");
        std::process::exit(1);
    }
}
