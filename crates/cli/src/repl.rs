//! Interactive session.
//!
//! Each submitted line compiles as top-level statements into one growing
//! chunk against one persistent context, then runs from the line's start
//! offset. Bindings, functions, structs and imports accumulate across
//! lines; `main` is not required.

use orus_compiler::CompileSession;
use orus_core::{Chunk, Context};
use orus_runtime::{run_chunk, VmOptions};
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;

const PROMPT: &str = "orus> ";

pub fn run_repl() -> i32 {
    let mut editor = match DefaultEditor::new() {
        Ok(editor) => editor,
        Err(error) => {
            eprintln!("error: cannot start line editor: {}", error);
            return 1;
        }
    };
    println!(
        "Orus {} (type statements, Ctrl-D to exit)",
        env!("CARGO_PKG_VERSION")
    );

    let mut ctx = Context::new();
    let mut chunk = Chunk::new();
    let mut session = CompileSession::new(Vec::new());
    let mut line_number = 0usize;

    loop {
        match editor.readline(PROMPT) {
            Ok(line) => {
                if line.trim().is_empty() {
                    continue;
                }
                let _ = editor.add_history_entry(line.as_str());
                line_number += 1;
                let label = format!("repl:{}", line_number);
                let source = format!("{}\n", line);
                let start =
                    match session.compile_into(&mut ctx, &mut chunk, &source, &label, false) {
                        Ok(start) => start,
                        Err(diagnostics) => {
                            for diagnostic in &diagnostics {
                                eprint!("{}", session.render(diagnostic));
                            }
                            continue;
                        }
                    };
                let options = VmOptions {
                    program_name: "repl".to_string(),
                    program_path: label,
                    ..VmOptions::default()
                };
                let mut stdout = std::io::stdout();
                if let Err(error) = run_chunk(&mut ctx, &chunk, start, &mut stdout, options) {
                    eprintln!("{}", error);
                }
            }
            Err(ReadlineError::Interrupted) => continue,
            Err(ReadlineError::Eof) => break,
            Err(error) => {
                eprintln!("error: {}", error);
                return 1;
            }
        }
    }
    0
}
