//! Pipeline glue for the `orus` binary.
//!
//! Drives compile-then-run for a source file, renders diagnostics to
//! stderr, and maps outcomes to the conventional exit codes: 0 on success,
//! 65 on compile errors, 70 on runtime errors.

pub mod repl;

use orus_compiler::{CompileSession, OrusConfig};
use orus_core::{Chunk, Context};
use orus_runtime::{disassemble, run_chunk, VmOptions};
use std::io::Write;
use std::path::Path;
use tracing::debug;

pub const EXIT_OK: i32 = 0;
/// Compile-time failure (EX_DATAERR).
pub const EXIT_COMPILE_ERROR: i32 = 65;
/// Runtime failure (EX_SOFTWARE).
pub const EXIT_RUNTIME_ERROR: i32 = 70;

/// What to do after compiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Run,
    /// Stop after type checking and emission.
    Check,
    /// Print the disassembly listing instead of executing.
    Disasm,
}

/// Compile (and per `mode`, execute) the program at `path`, writing program
/// output to `out`. Diagnostics and runtime errors go to stderr.
pub fn execute<W: Write>(path: &Path, out: &mut W, mode: Mode, trace: bool) -> i32 {
    let source = match std::fs::read_to_string(path) {
        Ok(source) => source,
        Err(error) => {
            eprintln!("error: cannot read {}: {}", path.display(), error);
            return EXIT_COMPILE_ERROR;
        }
    };
    let dir = path.parent().unwrap_or(Path::new("."));
    let config = match OrusConfig::load_from_dir(dir) {
        Ok(config) => config,
        Err(message) => {
            eprintln!("error: {}", message);
            return EXIT_COMPILE_ERROR;
        }
    };
    let module_paths = config.module_search_paths(dir);

    let mut ctx = Context::new();
    let mut chunk = Chunk::new();
    let mut session = CompileSession::new(module_paths);
    let file_label = path.display().to_string();
    let start = match session.compile_into(&mut ctx, &mut chunk, &source, &file_label, true) {
        Ok(start) => start,
        Err(diagnostics) => {
            for diagnostic in &diagnostics {
                eprint!("{}", session.render(diagnostic));
            }
            eprintln!(
                "error: could not compile {} ({} error(s))",
                path.display(),
                diagnostics.len()
            );
            return EXIT_COMPILE_ERROR;
        }
    };
    debug!(file = %file_label, bytes = chunk.len(), "compilation finished");

    match mode {
        Mode::Check => EXIT_OK,
        Mode::Disasm => {
            let name = program_name(path);
            let listing = disassemble(&chunk, &ctx, &name);
            if write!(out, "{}", listing).is_err() {
                return EXIT_RUNTIME_ERROR;
            }
            EXIT_OK
        }
        Mode::Run => {
            if trace {
                let name = program_name(path);
                eprint!("{}", disassemble(&chunk, &ctx, &name));
            }
            let trace_flag = trace || config.vm.trace;
            let mut options = VmOptions {
                trace: trace_flag,
                program_name: program_name(path),
                program_path: file_label,
                ..VmOptions::default()
            };
            if let Some(stack_size) = config.vm.stack_size {
                options.stack_size = stack_size;
            }
            if let Some(frame_depth) = config.vm.frame_depth {
                options.frame_depth = frame_depth;
            }
            match run_chunk(&mut ctx, &chunk, start, out, options) {
                Ok(()) => EXIT_OK,
                Err(error) => {
                    eprintln!("{}", error);
                    EXIT_RUNTIME_ERROR
                }
            }
        }
    }
}

fn program_name(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "main".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    fn write_program(dir: &Path, name: &str, source: &str) -> std::path::PathBuf {
        let path = dir.join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(source.as_bytes()).unwrap();
        path
    }

    #[test]
    fn test_execute_runs_and_captures_output() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_program(dir.path(), "hello.orus", "fn main() { print(\"hello\") }\n");
        let mut out = Vec::new();
        let code = execute(&path, &mut out, Mode::Run, false);
        assert_eq!(code, EXIT_OK);
        assert_eq!(String::from_utf8(out).unwrap(), "hello\n");
    }

    #[test]
    fn test_compile_error_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_program(dir.path(), "bad.orus", "fn main() { let x: i32 = \"s\" }\n");
        let mut out = Vec::new();
        assert_eq!(
            execute(&path, &mut out, Mode::Run, false),
            EXIT_COMPILE_ERROR
        );
        assert!(out.is_empty());
    }

    #[test]
    fn test_runtime_error_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_program(
            dir.path(),
            "boom.orus",
            "fn main() { let z = 0\nprint(\"{}\", 1 / z) }\n",
        );
        let mut out = Vec::new();
        assert_eq!(
            execute(&path, &mut out, Mode::Run, false),
            EXIT_RUNTIME_ERROR
        );
    }

    #[test]
    fn test_check_mode_does_not_run() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_program(dir.path(), "ok.orus", "fn main() { print(\"x\") }\n");
        let mut out = Vec::new();
        assert_eq!(execute(&path, &mut out, Mode::Check, false), EXIT_OK);
        assert!(out.is_empty());
    }

    #[test]
    fn test_disasm_mode_lists_instructions() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_program(dir.path(), "list.orus", "fn main() { print(\"x\") }\n");
        let mut out = Vec::new();
        assert_eq!(execute(&path, &mut out, Mode::Disasm, false), EXIT_OK);
        let listing = String::from_utf8(out).unwrap();
        assert!(listing.contains("== list =="));
        assert!(listing.contains("Call"));
    }

    #[test]
    fn test_missing_file_is_compile_error() {
        let mut out = Vec::new();
        assert_eq!(
            execute(Path::new("/no/such/file.orus"), &mut out, Mode::Run, false),
            EXIT_COMPILE_ERROR
        );
    }
}
