//! Bytecode emitter.
//!
//! Single pass over the annotated tree. Expressions leave their value on
//! the operand stack; statement-level expressions (assignments included)
//! pop it, so the stack is balanced at every statement boundary. Forward
//! jumps are emitted with a placeholder offset and patched once the target
//! is known; every function body is wrapped in a jump so top-level
//! execution falls past it.

use crate::ast::{
    AssignTarget, BinaryOp, Block, CallTarget, DeclKind, Expr, ExprKind, FunctionDecl,
    LiteralValue, LogicalOp, Span, Stmt, StmtKind, UnaryOp,
};
use crate::modules::ModuleLoader;
use orus_core::chunk::{Conversion, SLICE_HAS_END, SLICE_HAS_START};
use orus_core::types::Type;
use orus_core::{Chunk, Context, FunctionEntry, OpCode, Value};
use tracing::debug;

/// Error type for bytecode emission.
///
/// These are structural limits of the format (16-bit jumps, 24-bit constant
/// indices, byte operands), not user type errors; the checker has already
/// run by the time they can occur.
#[derive(Debug)]
pub enum EmitError {
    JumpTooLarge,
    TooManyConstants,
    Internal(String),
}

impl std::fmt::Display for EmitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EmitError::JumpTooLarge => write!(f, "jump distance exceeds 16 bits"),
            EmitError::TooManyConstants => {
                write!(f, "constant pool exceeds the 24-bit index range")
            }
            EmitError::Internal(message) => write!(f, "internal emitter error: {}", message),
        }
    }
}

impl std::error::Error for EmitError {}

enum LoopKind {
    While,
    /// Continue jumps forward to the increment tail.
    For,
}

struct LoopContext {
    kind: LoopKind,
    start: usize,
    break_jumps: Vec<usize>,
    continue_jumps: Vec<usize>,
}

pub struct Emitter<'a> {
    ctx: &'a mut Context,
    chunk: &'a mut Chunk,
    loader: &'a mut ModuleLoader,
    loops: Vec<LoopContext>,
}

impl<'a> Emitter<'a> {
    pub fn new(ctx: &'a mut Context, chunk: &'a mut Chunk, loader: &'a mut ModuleLoader) -> Self {
        Emitter {
            ctx,
            chunk,
            loader,
            loops: Vec::new(),
        }
    }

    /// Emit a checked program: top-level statements, queued generic
    /// specializations, then (when requested) the `main` call and the final
    /// return.
    pub fn emit_program(
        &mut self,
        stmts: &[Stmt],
        specializations: &[(u8, FunctionDecl)],
        main_slot: Option<u8>,
    ) -> Result<(), EmitError> {
        for stmt in stmts {
            self.emit_stmt(stmt)?;
        }
        for (_, decl) in specializations {
            self.emit_function(decl)?;
        }
        // The final return pops the halt value: either main's nil result or
        // an explicit nil.
        let end = Span::default();
        if let Some(slot) = main_slot {
            self.emit_op(OpCode::Call, end);
            self.emit_byte(slot, end);
            self.emit_byte(0, end);
            let returns_value = match self.ctx.global_type(slot) {
                Some(Type::Function(f)) => f.ret != Type::Void && f.ret != Type::Nil,
                _ => false,
            };
            if returns_value {
                self.emit_op(OpCode::Pop, end);
                self.emit_op(OpCode::Nil, end);
            }
        } else {
            self.emit_op(OpCode::Nil, end);
        }
        self.emit_op(OpCode::Return, end);
        debug!(bytes = self.chunk.len(), "emitted program");
        Ok(())
    }

    // ---- low-level helpers ----

    fn emit_op(&mut self, op: OpCode, span: Span) {
        self.chunk.write_op(op, span.line, span.column);
    }

    fn emit_byte(&mut self, byte: u8, span: Span) {
        self.chunk.write_byte(byte, span.line, span.column);
    }

    fn emit_constant(&mut self, value: Value, span: Span) -> Result<(), EmitError> {
        let index = self.chunk.add_constant(value);
        if index <= u8::MAX as usize {
            self.emit_op(OpCode::Constant, span);
            self.emit_byte(index as u8, span);
        } else if index < (1 << 24) {
            self.emit_op(OpCode::ConstantLong, span);
            self.emit_byte((index >> 16) as u8, span);
            self.emit_byte((index >> 8) as u8, span);
            self.emit_byte(index as u8, span);
        } else {
            return Err(EmitError::TooManyConstants);
        }
        Ok(())
    }

    fn emit_string_constant(&mut self, text: &str, span: Span) -> Result<(), EmitError> {
        let id = self.ctx.heap.alloc_str(text);
        self.emit_constant(Value::Obj(id), span)
    }

    /// Emit a jump with a placeholder offset; returns the operand position
    /// for patching.
    fn emit_jump(&mut self, op: OpCode, span: Span) -> usize {
        self.emit_op(op, span);
        let at = self.chunk.len();
        self.emit_byte(0xFF, span);
        self.emit_byte(0xFF, span);
        at
    }

    /// Patch a forward jump to land on the current position. Offsets are
    /// relative to the instruction after the operand.
    fn patch_jump(&mut self, operand_at: usize) -> Result<(), EmitError> {
        let distance = self.chunk.len() - (operand_at + 2);
        let offset = u16::try_from(distance).map_err(|_| EmitError::JumpTooLarge)?;
        self.chunk.patch_u16(operand_at, offset);
        Ok(())
    }

    /// Emit a backward branch to `start`.
    fn emit_loop(&mut self, start: usize, span: Span) -> Result<(), EmitError> {
        let distance = self.chunk.len() + 3 - start;
        let offset = u16::try_from(distance).map_err(|_| EmitError::JumpTooLarge)?;
        self.emit_op(OpCode::Loop, span);
        self.emit_byte((offset >> 8) as u8, span);
        self.emit_byte(offset as u8, span);
        Ok(())
    }

    fn slot_of(&self, slot: Option<u8>, what: &str) -> Result<u8, EmitError> {
        slot.ok_or_else(|| EmitError::Internal(format!("{} has no slot binding", what)))
    }

    fn type_of(&self, expr: &Expr) -> Result<Type, EmitError> {
        expr.ty
            .clone()
            .ok_or_else(|| EmitError::Internal("expression has no resolved type".to_string()))
    }

    // ---- statements ----

    fn emit_stmt(&mut self, stmt: &Stmt) -> Result<(), EmitError> {
        let span = stmt.span;
        match &stmt.kind {
            StmtKind::Expression(expr) => {
                self.emit_expr(expr)?;
                self.emit_op(OpCode::Pop, span);
            }
            StmtKind::Print { args, newline } => self.emit_print(args, *newline, span)?,
            StmtKind::Declaration {
                kind, init, slot, ..
            } => {
                // Const values were stored into their slot at check time.
                if *kind != DeclKind::Const {
                    let slot = self.slot_of(*slot, "declaration")?;
                    self.emit_expr(init)?;
                    self.emit_op(OpCode::SetGlobal, span);
                    self.emit_byte(slot, span);
                    self.emit_op(OpCode::Pop, span);
                }
            }
            StmtKind::Assign { target, value } => self.emit_assign(target, value, span)?,
            StmtKind::If {
                cond,
                then_block,
                elifs,
                else_block,
            } => self.emit_if(cond, then_block, elifs, else_block.as_ref(), span)?,
            StmtKind::While { cond, body } => self.emit_while(cond, body, span)?,
            StmtKind::For {
                start,
                end,
                step,
                body,
                slot,
                ..
            } => self.emit_for(start, end, step.as_ref(), body, *slot, span)?,
            StmtKind::Block(block) => self.emit_block(block)?,
            StmtKind::Function(decl) => {
                // Generic templates are never emitted; their checked
                // specializations are.
                if decl.generics.is_empty() {
                    self.emit_function(decl)?;
                }
            }
            StmtKind::StructDecl { .. } | StmtKind::EnumDecl { .. } => {}
            StmtKind::Return { value } => {
                match value {
                    Some(expr) => self.emit_expr(expr)?,
                    None => self.emit_op(OpCode::Nil, span),
                }
                self.emit_op(OpCode::Return, span);
            }
            StmtKind::Break => {
                let jump = self.emit_jump(OpCode::Jump, span);
                match self.loops.last_mut() {
                    Some(ctx) => ctx.break_jumps.push(jump),
                    None => {
                        return Err(EmitError::Internal(
                            "break outside of a loop".to_string(),
                        ))
                    }
                }
            }
            StmtKind::Continue => {
                let Some(ctx) = self.loops.last() else {
                    return Err(EmitError::Internal(
                        "continue outside of a loop".to_string(),
                    ));
                };
                match ctx.kind {
                    LoopKind::While => {
                        let start = ctx.start;
                        self.emit_loop(start, span)?;
                    }
                    LoopKind::For => {
                        let jump = self.emit_jump(OpCode::Jump, span);
                        if let Some(ctx) = self.loops.last_mut() {
                            ctx.continue_jumps.push(jump);
                        }
                    }
                }
            }
            StmtKind::TryCatch {
                try_block,
                err_slot,
                catch_block,
                ..
            } => {
                let err_slot = self.slot_of(*err_slot, "catch binding")?;
                self.emit_op(OpCode::SetupExcept, span);
                let operand_at = self.chunk.len();
                self.emit_byte(0xFF, span);
                self.emit_byte(0xFF, span);
                self.emit_byte(err_slot, span);
                self.emit_block(try_block)?;
                self.emit_op(OpCode::PopExcept, span);
                let over_catch = self.emit_jump(OpCode::Jump, span);
                // Handler target: the VM jumps here after truncating the
                // stack and storing the error message.
                let distance = self.chunk.len() - (operand_at + 2);
                let offset = u16::try_from(distance).map_err(|_| EmitError::JumpTooLarge)?;
                self.chunk.patch_u16(operand_at, offset);
                self.emit_block(catch_block)?;
                self.patch_jump(over_catch)?;
            }
            StmtKind::Use { module_index, .. } => {
                let index = module_index
                    .ok_or_else(|| EmitError::Internal("unresolved import".to_string()))?;
                self.emit_module_unit(index)?;
                self.emit_op(OpCode::Import, span);
                self.emit_byte(index, span);
            }
        }
        Ok(())
    }

    fn emit_block(&mut self, block: &Block) -> Result<(), EmitError> {
        for stmt in &block.stmts {
            self.emit_stmt(stmt)?;
        }
        Ok(())
    }

    fn emit_if(
        &mut self,
        cond: &Expr,
        then_block: &Block,
        elifs: &[(Expr, Block)],
        else_block: Option<&Block>,
        span: Span,
    ) -> Result<(), EmitError> {
        let mut end_jumps = Vec::new();
        let mut branches: Vec<(&Expr, &Block)> = vec![(cond, then_block)];
        branches.extend(elifs.iter().map(|(c, b)| (c, b)));
        let branch_count = branches.len();
        for (i, (branch_cond, branch_block)) in branches.into_iter().enumerate() {
            self.emit_expr(branch_cond)?;
            let skip = self.emit_jump(OpCode::JumpIfFalse, span);
            self.emit_op(OpCode::Pop, span);
            self.emit_block(branch_block)?;
            let is_last = i + 1 == branch_count && else_block.is_none();
            if !is_last {
                end_jumps.push(self.emit_jump(OpCode::Jump, span));
            }
            self.patch_jump(skip)?;
            self.emit_op(OpCode::Pop, span);
        }
        if let Some(block) = else_block {
            self.emit_block(block)?;
        }
        for jump in end_jumps {
            self.patch_jump(jump)?;
        }
        Ok(())
    }

    fn emit_while(&mut self, cond: &Expr, body: &Block, span: Span) -> Result<(), EmitError> {
        let start = self.chunk.len();
        self.emit_expr(cond)?;
        let exit = self.emit_jump(OpCode::JumpIfFalse, span);
        self.emit_op(OpCode::Pop, span);
        self.loops.push(LoopContext {
            kind: LoopKind::While,
            start,
            break_jumps: Vec::new(),
            continue_jumps: Vec::new(),
        });
        self.emit_block(body)?;
        let context = self
            .loops
            .pop()
            .ok_or_else(|| EmitError::Internal("loop context underflow".to_string()))?;
        self.emit_loop(start, span)?;
        self.patch_jump(exit)?;
        // The fall-through pop above is skipped when the condition jump
        // fires, so the exit path pops the condition here.
        self.emit_op(OpCode::Pop, span);
        for jump in context.break_jumps {
            self.patch_jump(jump)?;
        }
        Ok(())
    }

    fn emit_for(
        &mut self,
        start: &Expr,
        end: &Expr,
        step: Option<&Expr>,
        body: &Block,
        slot: Option<u8>,
        span: Span,
    ) -> Result<(), EmitError> {
        let iter_slot = self.slot_of(slot, "for-loop iterator")?;
        let iter_ty = self.type_of(start)?;
        // Initialize the iterator from the start expression.
        self.emit_expr(start)?;
        self.emit_op(OpCode::SetGlobal, span);
        self.emit_byte(iter_slot, span);
        self.emit_op(OpCode::Pop, span);
        // Header: load, compare with end, conditional exit.
        let loop_start = self.chunk.len();
        self.emit_op(OpCode::GetGlobal, span);
        self.emit_byte(iter_slot, span);
        self.emit_expr(end)?;
        let downward = matches!(
            step.map(|s| &s.kind),
            Some(ExprKind::Literal(LiteralValue::I32(v))) if *v < 0
        ) || matches!(
            step.map(|s| &s.kind),
            Some(ExprKind::Literal(LiteralValue::I64(v))) if *v < 0
        );
        self.emit_op(
            if downward {
                OpCode::Greater
            } else {
                OpCode::Less
            },
            span,
        );
        let exit = self.emit_jump(OpCode::JumpIfFalse, span);
        self.emit_op(OpCode::Pop, span);
        self.loops.push(LoopContext {
            kind: LoopKind::For,
            start: loop_start,
            break_jumps: Vec::new(),
            continue_jumps: Vec::new(),
        });
        self.emit_block(body)?;
        let context = self
            .loops
            .pop()
            .ok_or_else(|| EmitError::Internal("loop context underflow".to_string()))?;
        // Tail: advance the iterator. Continue lands here.
        for jump in context.continue_jumps {
            self.patch_jump(jump)?;
        }
        self.emit_op(OpCode::GetGlobal, span);
        self.emit_byte(iter_slot, span);
        match step {
            Some(step) => self.emit_expr(step)?,
            None => {
                let one = match iter_ty {
                    Type::I32 => Value::I32(1),
                    Type::I64 => Value::I64(1),
                    Type::U32 => Value::U32(1),
                    Type::U64 => Value::U64(1),
                    _ => {
                        return Err(EmitError::Internal(
                            "for-loop iterator is not an integer".to_string(),
                        ))
                    }
                };
                self.emit_constant(one, span)?;
            }
        }
        self.emit_op(arith_op(BinaryOp::Add, &iter_ty)?, span);
        self.emit_op(OpCode::SetGlobal, span);
        self.emit_byte(iter_slot, span);
        self.emit_op(OpCode::Pop, span);
        self.emit_loop(loop_start, span)?;
        self.patch_jump(exit)?;
        self.emit_op(OpCode::Pop, span);
        for jump in context.break_jumps {
            self.patch_jump(jump)?;
        }
        Ok(())
    }

    fn emit_assign(
        &mut self,
        target: &AssignTarget,
        value: &Expr,
        span: Span,
    ) -> Result<(), EmitError> {
        match target {
            AssignTarget::Name { slot, .. } => {
                let slot = self.slot_of(*slot, "assignment target")?;
                self.emit_expr(value)?;
                self.emit_op(OpCode::SetGlobal, span);
                self.emit_byte(slot, span);
                self.emit_op(OpCode::Pop, span);
            }
            AssignTarget::Index { target, index } => {
                self.emit_expr(target)?;
                self.emit_expr(index)?;
                self.emit_expr(value)?;
                self.emit_op(OpCode::ArraySet, span);
                self.emit_op(OpCode::Pop, span);
            }
            AssignTarget::Field {
                receiver, index, ..
            } => {
                let index = self.slot_of(*index, "field assignment")?;
                self.emit_expr(receiver)?;
                self.emit_expr(value)?;
                self.emit_op(OpCode::SetField, span);
                self.emit_byte(index, span);
                self.emit_op(OpCode::Pop, span);
            }
        }
        Ok(())
    }

    fn emit_print(&mut self, args: &[Expr], newline: bool, span: Span) -> Result<(), EmitError> {
        if args.len() >= 2 {
            let ExprKind::Literal(LiteralValue::Str(format)) = &args[0].kind else {
                return Err(EmitError::Internal(
                    "format print without a constant format string".to_string(),
                ));
            };
            // Split the prefix before the first placeholder so it reaches
            // stdout before the arguments evaluate.
            let mut format = format.as_str();
            if let Some(at) = format.find("{}") {
                let prefix = &format[..at];
                if !prefix.is_empty() {
                    self.emit_string_constant(prefix, span)?;
                    self.emit_op(OpCode::PrintNoNewline, span);
                    format = &format[at..];
                }
            }
            self.emit_string_constant(format, span)?;
            for arg in &args[1..] {
                self.emit_expr(arg)?;
            }
            self.emit_constant(Value::I32((args.len() - 1) as i32), span)?;
            self.emit_op(
                if newline {
                    OpCode::FormatPrint
                } else {
                    OpCode::FormatPrintNoNewline
                },
                span,
            );
            return Ok(());
        }
        match args.first() {
            Some(arg) => self.emit_expr(arg)?,
            None => self.emit_string_constant("", span)?,
        }
        self.emit_op(
            if newline {
                OpCode::Print
            } else {
                OpCode::PrintNoNewline
            },
            span,
        );
        Ok(())
    }

    /// A function body wrapped in an unconditional jump: top-level
    /// execution falls past the definition. The prologue pops arguments
    /// right-to-left into the parameter slots; the epilogue makes falling
    /// off the end behave as `return nil`.
    fn emit_function(&mut self, decl: &FunctionDecl) -> Result<(), EmitError> {
        let span = decl.span;
        let slot = self.slot_of(decl.slot, "function")?;
        let over = self.emit_jump(OpCode::Jump, span);
        let entry = self.chunk.len();
        self.ctx.set_function(
            slot,
            FunctionEntry {
                offset: entry,
                arity: decl.params.len() as u8,
            },
        );
        for param in decl.params.iter().rev() {
            let param_slot = self.slot_of(param.slot, "parameter")?;
            self.emit_op(OpCode::SetGlobal, param.span);
            self.emit_byte(param_slot, param.span);
            self.emit_op(OpCode::Pop, param.span);
        }
        self.emit_block(&decl.body)?;
        self.emit_op(OpCode::Nil, span);
        self.emit_op(OpCode::Return, span);
        self.patch_jump(over)?;
        debug!(function = %decl.name, entry, "emitted function");
        Ok(())
    }

    /// Emit a module's code (once) at its first import site: the region is
    /// jumped over, functions are emitted as usual, and the module's other
    /// top-level statements become its initializer function.
    fn emit_module_unit(&mut self, module_index: u8) -> Result<(), EmitError> {
        let (unit_emitted, init_slot, ast) = {
            let Some(unit) = self.loader.unit_by_module_index(module_index) else {
                return Err(EmitError::Internal("module unit missing".to_string()));
            };
            if unit.emitted {
                (true, None, Vec::new())
            } else {
                unit.emitted = true;
                (false, unit.init_slot, std::mem::take(&mut unit.ast))
            }
        };
        if unit_emitted {
            return Ok(());
        }
        let init_slot =
            init_slot.ok_or_else(|| EmitError::Internal("module has no init slot".to_string()))?;
        let span = Span::default();
        let over = self.emit_jump(OpCode::Jump, span);
        for stmt in &ast {
            if let StmtKind::Function(decl) = &stmt.kind {
                if decl.generics.is_empty() {
                    self.emit_function(decl)?;
                }
            }
        }
        // Initializer: every non-declaration top-level statement, run once.
        let entry = self.chunk.len();
        self.ctx
            .set_function(init_slot, FunctionEntry { offset: entry, arity: 0 });
        for stmt in &ast {
            match &stmt.kind {
                StmtKind::Function(_) | StmtKind::StructDecl { .. } | StmtKind::EnumDecl { .. } => {
                }
                _ => self.emit_stmt(stmt)?,
            }
        }
        self.emit_op(OpCode::Nil, span);
        self.emit_op(OpCode::Return, span);
        self.patch_jump(over)?;
        // Return the AST so nested importers see the unit intact.
        if let Some(unit) = self.loader.unit_by_module_index(module_index) {
            unit.ast = ast;
        }
        Ok(())
    }

    // ---- expressions ----

    fn emit_expr(&mut self, expr: &Expr) -> Result<(), EmitError> {
        let span = expr.span;
        match &expr.kind {
            ExprKind::Literal(lit) => self.emit_literal(lit, span)?,
            ExprKind::ArrayLiteral(elements) => {
                if elements.len() > u8::MAX as usize {
                    return Err(EmitError::Internal(
                        "array literal exceeds 255 elements".to_string(),
                    ));
                }
                for element in elements {
                    self.emit_expr(element)?;
                }
                self.emit_op(OpCode::MakeArray, span);
                self.emit_byte(elements.len() as u8, span);
            }
            ExprKind::StructLiteral {
                fields, resolved, ..
            } => {
                let id = resolved
                    .ok_or_else(|| EmitError::Internal("unresolved struct literal".to_string()))?;
                for (_, value) in fields {
                    self.emit_expr(value)?;
                }
                self.emit_op(OpCode::MakeStruct, span);
                self.emit_byte(id.0 as u8, span);
                self.emit_byte(fields.len() as u8, span);
            }
            ExprKind::Variable { slot, .. } => {
                let slot = self.slot_of(*slot, "variable")?;
                self.emit_op(OpCode::GetGlobal, span);
                self.emit_byte(slot, span);
            }
            ExprKind::Unary { op, operand } => {
                self.emit_expr(operand)?;
                match op {
                    UnaryOp::Neg => {
                        let op = match self.type_of(operand)? {
                            Type::I32 => OpCode::NegI32,
                            Type::I64 => OpCode::NegI64,
                            Type::F64 => OpCode::NegF64,
                            other => {
                                return Err(EmitError::Internal(format!(
                                    "cannot negate {:?}",
                                    other
                                )))
                            }
                        };
                        self.emit_op(op, span);
                    }
                    UnaryOp::Not => self.emit_op(OpCode::Not, span),
                    UnaryOp::BitNot => self.emit_op(OpCode::BitNot, span),
                }
            }
            ExprKind::Binary {
                op,
                lhs,
                rhs,
                lhs_conv,
                rhs_conv,
            } => {
                self.emit_expr(lhs)?;
                if let Some(conversion) = lhs_conv {
                    self.emit_conversion(*conversion, span);
                }
                self.emit_expr(rhs)?;
                if let Some(conversion) = rhs_conv {
                    self.emit_conversion(*conversion, span);
                }
                self.emit_binary_op(*op, expr, span)?;
            }
            ExprKind::Logical { op, lhs, rhs } => match op {
                LogicalOp::And => {
                    self.emit_expr(lhs)?;
                    let short = self.emit_jump(OpCode::JumpIfFalse, span);
                    self.emit_op(OpCode::Pop, span);
                    self.emit_expr(rhs)?;
                    self.patch_jump(short)?;
                }
                LogicalOp::Or => {
                    self.emit_expr(lhs)?;
                    let rhs_jump = self.emit_jump(OpCode::JumpIfFalse, span);
                    let end = self.emit_jump(OpCode::Jump, span);
                    self.patch_jump(rhs_jump)?;
                    self.emit_op(OpCode::Pop, span);
                    self.emit_expr(rhs)?;
                    self.patch_jump(end)?;
                }
            },
            ExprKind::Index { target, index } => {
                self.emit_expr(target)?;
                self.emit_expr(index)?;
                self.emit_op(OpCode::ArrayGet, span);
            }
            ExprKind::Slice { target, start, end } => {
                self.emit_expr(target)?;
                let mut flags = 0u8;
                if let Some(start) = start {
                    self.emit_expr(start)?;
                    flags |= SLICE_HAS_START;
                }
                if let Some(end) = end {
                    self.emit_expr(end)?;
                    flags |= SLICE_HAS_END;
                }
                self.emit_op(OpCode::Slice, span);
                self.emit_byte(flags, span);
            }
            ExprKind::Field {
                receiver, index, ..
            } => {
                let index =
                    self.slot_of(*index, "field access")?;
                self.emit_expr(receiver)?;
                self.emit_op(OpCode::GetField, span);
                self.emit_byte(index, span);
            }
            ExprKind::Call { args, target, .. } => {
                let target = target
                    .as_ref()
                    .ok_or_else(|| EmitError::Internal("unresolved call".to_string()))?;
                for arg in args {
                    self.emit_expr(arg)?;
                }
                match target {
                    CallTarget::Native(index) => {
                        self.emit_op(OpCode::CallNative, span);
                        self.emit_byte(*index, span);
                        self.emit_byte(args.len() as u8, span);
                    }
                    CallTarget::Function { slot } => {
                        self.emit_op(OpCode::Call, span);
                        self.emit_byte(*slot, span);
                        self.emit_byte(args.len() as u8, span);
                    }
                    CallTarget::EnumVariant { enum_id, variant } => {
                        self.emit_op(OpCode::MakeEnum, span);
                        self.emit_byte(enum_id.0 as u8, span);
                        self.emit_byte(*variant, span);
                        self.emit_byte(args.len() as u8, span);
                    }
                }
            }
            ExprKind::Cast {
                operand,
                conversion,
                ..
            } => {
                self.emit_expr(operand)?;
                if let Some(conversion) = conversion {
                    self.emit_conversion(*conversion, span);
                }
            }
        }
        Ok(())
    }

    fn emit_literal(&mut self, lit: &LiteralValue, span: Span) -> Result<(), EmitError> {
        match lit {
            LiteralValue::Nil => self.emit_op(OpCode::Nil, span),
            LiteralValue::Bool(true) => self.emit_op(OpCode::True, span),
            LiteralValue::Bool(false) => self.emit_op(OpCode::False, span),
            LiteralValue::I32(v) => self.emit_constant(Value::I32(*v), span)?,
            LiteralValue::I64(v) => self.emit_constant(Value::I64(*v), span)?,
            LiteralValue::U32(v) => self.emit_constant(Value::U32(*v), span)?,
            LiteralValue::U64(v) => self.emit_constant(Value::U64(*v), span)?,
            LiteralValue::F64(v) => self.emit_constant(Value::F64(*v), span)?,
            LiteralValue::Str(s) => self.emit_string_constant(s, span)?,
        }
        Ok(())
    }

    fn emit_conversion(&mut self, conversion: Conversion, span: Span) {
        self.emit_op(OpCode::Convert, span);
        self.emit_byte(conversion.into(), span);
    }

    /// Operators are type-dispatched at emission; the operand types were
    /// settled by the checker.
    fn emit_binary_op(&mut self, op: BinaryOp, expr: &Expr, span: Span) -> Result<(), EmitError> {
        let opcode = match op {
            BinaryOp::Add if expr.ty == Some(Type::Str) => OpCode::Concat,
            BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Mod => {
                arith_op(op, &self.type_of(expr)?)?
            }
            BinaryOp::BitAnd => OpCode::BitAnd,
            BinaryOp::BitOr => OpCode::BitOr,
            BinaryOp::BitXor => OpCode::BitXor,
            BinaryOp::Shl => OpCode::Shl,
            BinaryOp::Shr => OpCode::Shr,
            BinaryOp::Eq => OpCode::Equal,
            BinaryOp::Ne => OpCode::NotEqual,
            BinaryOp::Lt => OpCode::Less,
            BinaryOp::Le => OpCode::LessEqual,
            BinaryOp::Gt => OpCode::Greater,
            BinaryOp::Ge => OpCode::GreaterEqual,
        };
        self.emit_op(opcode, span);
        Ok(())
    }
}

/// Typed opcode for an arithmetic operator at a scalar type.
fn arith_op(op: BinaryOp, ty: &Type) -> Result<OpCode, EmitError> {
    use OpCode::*;
    let table = match op {
        BinaryOp::Add => [AddI32, AddI64, AddU32, AddU64, AddF64],
        BinaryOp::Sub => [SubI32, SubI64, SubU32, SubU64, SubF64],
        BinaryOp::Mul => [MulI32, MulI64, MulU32, MulU64, MulF64],
        BinaryOp::Div => [DivI32, DivI64, DivU32, DivU64, DivF64],
        BinaryOp::Mod => {
            let opcode = match ty {
                Type::I32 => ModI32,
                Type::I64 => ModI64,
                Type::U32 => ModU32,
                Type::U64 => ModU64,
                other => {
                    return Err(EmitError::Internal(format!("'%' on {:?}", other)));
                }
            };
            return Ok(opcode);
        }
        other => {
            return Err(EmitError::Internal(format!(
                "not an arithmetic operator: {:?}",
                other
            )))
        }
    };
    let opcode = match ty {
        Type::I32 => table[0],
        Type::I64 => table[1],
        Type::U32 => table[2],
        Type::U64 => table[3],
        Type::F64 => table[4],
        other => {
            return Err(EmitError::Internal(format!(
                "arithmetic on non-numeric type {:?}",
                other
            )));
        }
    };
    Ok(opcode)
}
