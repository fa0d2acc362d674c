//! Orus compiler library.
//!
//! The front half of the pipeline: source text -> tokens -> syntax tree ->
//! typed syntax tree -> bytecode chunk. The VM lives in `orus-runtime`;
//! everything the two halves share (values, chunks, the interpreter
//! context) lives in `orus-core`.
//!
//! The main entry points are [`compile`] for one-shot compilation and
//! [`CompileSession`] for incremental use (the REPL compiles each line into
//! the same growing chunk and context).

pub mod ast;
pub mod builtins;
pub mod config;
pub mod diagnostics;
pub mod emitter;
pub mod lexer;
pub mod modules;
pub mod parser;
pub mod symbols;
pub mod typechecker;

pub use config::OrusConfig;
pub use diagnostics::{Diagnostic, FileSpan, Renderer};
pub use emitter::{EmitError, Emitter};
pub use modules::ModuleLoader;
pub use parser::parse;
pub use symbols::SymbolTable;
pub use typechecker::TypeChecker;

use ast::FunctionDecl;
use orus_core::types::Type;
use orus_core::{Chunk, Context};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Incremental compilation state that survives across units.
///
/// The symbol table, module cache, recorded function declarations and
/// generic specializations persist, so a REPL session can keep defining and
/// using names line after line while sharing one [`Context`] and one
/// growing [`Chunk`].
#[derive(Debug)]
pub struct CompileSession {
    symbols: SymbolTable,
    loader: ModuleLoader,
    function_decls: HashMap<u8, FunctionDecl>,
    spec_slots: HashMap<String, u8>,
    renderer: Renderer,
}

impl CompileSession {
    pub fn new(module_paths: Vec<PathBuf>) -> Self {
        CompileSession {
            symbols: SymbolTable::new(),
            loader: ModuleLoader::new(module_paths),
            function_decls: HashMap::new(),
            spec_slots: HashMap::new(),
            renderer: Renderer::new(),
        }
    }

    /// Render a diagnostic against the sources this session has seen.
    pub fn render(&self, diagnostic: &Diagnostic) -> String {
        self.renderer.render(diagnostic)
    }

    /// Compile one unit into `chunk`, returning the offset execution should
    /// start from. With `call_main` set, the emitted code ends by calling
    /// `main` (missing `main` is then a diagnostic).
    pub fn compile_into(
        &mut self,
        ctx: &mut Context,
        chunk: &mut Chunk,
        source: &str,
        file: &str,
        call_main: bool,
    ) -> Result<usize, Vec<Diagnostic>> {
        self.renderer.add_source(file, source);
        let start = chunk.len();
        let (mut stmts, parse_diagnostics) = parser::parse(source, file);
        if !parse_diagnostics.is_empty() {
            return Err(parse_diagnostics);
        }
        let dir = Path::new(file)
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        let mut checker = TypeChecker::new(
            ctx,
            &mut self.loader,
            &mut self.symbols,
            &mut self.function_decls,
            &mut self.spec_slots,
            file,
            dir,
        );
        checker.check_program(&mut stmts);
        let (specializations, mut diagnostics) = checker.finish();

        let main_slot = self
            .symbols
            .find("main")
            .filter(|s| matches!(s.ty, Type::Function(_)))
            .map(|s| s.slot);
        if call_main && main_slot.is_none() && diagnostics.is_empty() {
            diagnostics.push(
                Diagnostic::new(
                    "E1028",
                    "no 'main' function defined",
                    FileSpan {
                        file: file.to_string(),
                        span: ast::Span::new(1, 1, 1),
                    },
                )
                .with_help("define 'fn main() { ... }' as the program entry point"),
            );
        }
        self.sync_module_sources();
        if !diagnostics.is_empty() {
            return Err(diagnostics);
        }

        let mut emitter = Emitter::new(ctx, chunk, &mut self.loader);
        emitter
            .emit_program(
                &stmts,
                &specializations,
                if call_main { main_slot } else { None },
            )
            .map_err(|error| {
                vec![Diagnostic::new(
                    "E2001",
                    error.to_string(),
                    FileSpan {
                        file: file.to_string(),
                        span: ast::Span::new(1, 1, 1),
                    },
                )]
            })?;
        debug!(file, start, bytes = chunk.len() - start, "compiled unit");
        Ok(start)
    }

    /// Make imported modules' sources available to the renderer.
    fn sync_module_sources(&mut self) {
        let mut index = 0;
        while let Some(unit) = self.loader.unit(index) {
            self.renderer
                .add_source(unit.file_label.clone(), unit.source.clone());
            index += 1;
        }
    }
}

impl Default for CompileSession {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

/// One-shot compilation of a program (ends with the `main` call).
pub fn compile(
    source: &str,
    file: &str,
    ctx: &mut Context,
    module_paths: Vec<PathBuf>,
) -> Result<(Chunk, CompileSession), Vec<Diagnostic>> {
    let mut session = CompileSession::new(module_paths);
    let mut chunk = Chunk::new();
    session.compile_into(ctx, &mut chunk, source, file, true)?;
    Ok((chunk, session))
}

#[cfg(test)]
mod tests {
    use super::*;
    use orus_core::OpCode;

    #[test]
    fn test_compile_hello() {
        let mut ctx = Context::new();
        let (chunk, _) = compile(
            "fn main() { print(\"hello\") }\n",
            "hello.orus",
            &mut ctx,
            Vec::new(),
        )
        .expect("compiles");
        assert!(!chunk.is_empty());
        // Line-info runs cover the whole code stream.
        assert_eq!(chunk.line_run_total(), chunk.len());
        // The unit ends with a return.
        assert_eq!(
            chunk.read_byte(chunk.len() - 1),
            Some(u8::from(OpCode::Return))
        );
    }

    #[test]
    fn test_missing_main_is_diagnosed() {
        let mut ctx = Context::new();
        let err = compile("let x = 1\n", "x.orus", &mut ctx, Vec::new()).unwrap_err();
        assert!(err.iter().any(|d| d.code == "E1028"));
    }

    #[test]
    fn test_compile_error_reports_diagnostics() {
        let mut ctx = Context::new();
        let err = compile(
            "fn main() { let x: i32 = \"s\" }\n",
            "bad.orus",
            &mut ctx,
            Vec::new(),
        )
        .unwrap_err();
        assert!(err.iter().any(|d| d.code == "E1002"));
    }

    #[test]
    fn test_session_compiles_incrementally() {
        let mut ctx = Context::new();
        let mut chunk = Chunk::new();
        let mut session = CompileSession::new(Vec::new());
        let first = session
            .compile_into(&mut ctx, &mut chunk, "let a = 2\n", "repl", false)
            .expect("first line compiles");
        assert_eq!(first, 0);
        let second = session
            .compile_into(&mut ctx, &mut chunk, "let b = a + 1\n", "repl", false)
            .expect("second line sees earlier bindings");
        assert!(second > 0);
    }

    #[test]
    fn test_every_jump_is_patched() {
        let mut ctx = Context::new();
        let (chunk, _) = compile(
            "fn main() { let mut i = 0\nwhile i < 3 { if i == 1 { print(\"one\") } i = i + 1 } }\n",
            "jumps.orus",
            &mut ctx,
            Vec::new(),
        )
        .expect("compiles");
        // Walk the instruction stream: no jump operand may still hold the
        // 0xFFFF placeholder, and every target must be in bounds.
        let code = chunk.code();
        let mut offset = 0;
        while offset < code.len() {
            let op = OpCode::try_from(code[offset]).expect("valid opcode");
            let operands = operand_width(op, code, offset);
            match op {
                OpCode::Jump | OpCode::JumpIfFalse | OpCode::SetupExcept => {
                    let target = chunk.read_u16(offset + 1).unwrap() as usize;
                    assert_ne!(target, 0xFFFF, "unpatched jump at {}", offset);
                    assert!(offset + 3 + target <= code.len());
                }
                OpCode::Loop => {
                    let back = chunk.read_u16(offset + 1).unwrap() as usize;
                    assert!(back <= offset + 3, "loop target before chunk start");
                }
                _ => {}
            }
            offset += 1 + operands;
        }
    }

    fn operand_width(op: OpCode, code: &[u8], offset: usize) -> usize {
        use OpCode::*;
        match op {
            Constant | GetGlobal | SetGlobal | Convert | MakeArray | Slice | GetField
            | SetField | Import => 1,
            ConstantLong | MakeEnum => 3,
            Jump | JumpIfFalse | Loop | Call | CallNative | MakeStruct => 2,
            SetupExcept => 3,
            _ => {
                let _ = (code, offset);
                0
            }
        }
    }
}
