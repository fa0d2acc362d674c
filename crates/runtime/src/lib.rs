//! Orus virtual machine.
//!
//! Executes the bytecode chunks produced by `orus-compiler` against a
//! shared `orus_core::Context`: a fetch-decode-dispatch loop with an
//! operand stack, fixed-depth call and exception frames, native builtin
//! dispatch, and opportunistic mark-and-sweep collection between
//! instructions.

pub mod disasm;
pub mod error;
pub mod natives;
pub mod vm;

pub use disasm::disassemble;
pub use error::RuntimeError;
pub use vm::{Vm, VmOptions};

use orus_core::{Chunk, Context};
use std::io::Write;

/// Run a compiled chunk from `start` against `ctx`, writing program output
/// to `out`.
pub fn run_chunk<W: Write>(
    ctx: &mut Context,
    chunk: &Chunk,
    start: usize,
    out: &mut W,
    options: VmOptions,
) -> Result<(), RuntimeError> {
    let mut vm = Vm::new(ctx, chunk, out, options);
    vm.run(start)
}
