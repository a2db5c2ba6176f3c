//! Demo entrypoint for the Vein VM.
//!
//! There is no compiler wired in here (see `vein_runtime::compiler`), so
//! this hand-assembles a small program with `CodeObjectBuilder` — summing
//! the integers from 1 to `--n` — and runs it through a `Vm`, mirroring
//! `initVM`/`runfile`/`dumpTraceback` without needing a front end.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use vein_core::{Opcode, Value};
use vein_runtime::code_builder::CodeObjectBuilder;
use vein_runtime::{VmConfig, VmError};

#[derive(Parser, Debug)]
#[command(name = "vein")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Run a small hand-assembled Vein bytecode program", long_about = None)]
struct Cli {
    /// Sum the integers from 1 to N (demo program).
    #[arg(short = 'n', long, default_value_t = 10)]
    n: i64,

    /// Module search path, repeatable; passed through to the import
    /// machinery even though this demo never imports anything.
    #[arg(long = "module-path", value_name = "DIR")]
    module_paths: Vec<PathBuf>,

    /// Force a full GC cycle before every allocation (stress-tests the
    /// mark/sweep path instead of waiting for the threshold to trip).
    #[arg(long)]
    stress_gc: bool,

    /// Initial byte threshold before the first automatic collection.
    #[arg(long, value_name = "BYTES")]
    gc_threshold: Option<usize>,

    /// Maximum call-stack depth before raising a stack overflow.
    #[arg(long, default_value_t = 512)]
    max_depth: usize,
}

/// Builds the demo program: a loop summing `1..=n` into a local and
/// returning it.
fn build_sum_program(n: i64) -> vein_runtime::compiler::CompiledUnit {
    const I: u8 = 0; // loop counter
    const ACC: u8 = 1; // running total

    let mut b = CodeObjectBuilder::new("<sum>", "<demo>").total_locals(2);

    b.emit_constant(Value::Int(1), 1);
    b.emit_u8(Opcode::SetLocalPop, I, 1);
    b.emit_constant(Value::Int(0), 1);
    b.emit_u8(Opcode::SetLocalPop, ACC, 1);

    let loop_start = b.current_offset();
    b.emit_u8(Opcode::GetLocal, I, 2);
    b.emit_constant(Value::Int(n), 2);
    b.emit(Opcode::LessEqual, 2);
    let exit_jump = b.emit_jump(Opcode::PopJumpIfFalse, 2);

    b.emit_u8(Opcode::GetLocal, ACC, 3);
    b.emit_u8(Opcode::GetLocal, I, 3);
    b.emit(Opcode::Add, 3);
    b.emit_u8(Opcode::SetLocalPop, ACC, 3);

    b.emit_u8(Opcode::GetLocal, I, 3);
    b.emit_constant(Value::Int(1), 3);
    b.emit(Opcode::Add, 3);
    b.emit_u8(Opcode::SetLocalPop, I, 3);

    b.emit_loop(loop_start, 3);
    b.patch_jump(exit_jump);

    b.emit_u8(Opcode::GetLocal, ACC, 4);
    b.emit(Opcode::Return, 4);

    b.build()
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(
                "vein_runtime=debug"
                    .parse()
                    .expect("static directive always parses"),
            ),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = VmConfig {
        search_paths: if cli.module_paths.is_empty() {
            VmConfig::default().search_paths
        } else {
            cli.module_paths
        },
        gc_second_chance: !cli.stress_gc,
        initial_gc_threshold: cli.gc_threshold,
        max_call_depth: cli.max_depth,
    };
    let mut vm = vein_runtime::Vm::new(config);

    let unit = build_sum_program(cli.n);
    match vm.run_unit(unit, "__main__") {
        Ok(value) => {
            println!("{value}");
            ExitCode::SUCCESS
        }
        Err(VmError::Unhandled { traceback, .. }) => {
            eprint!("{traceback}");
            ExitCode::FAILURE
        }
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}
