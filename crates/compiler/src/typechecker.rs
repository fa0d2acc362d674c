//! Type checker for Orus.
//!
//! A single bottom-up pass per top-level statement. The checker annotates
//! the tree in place: every expression gets a resolved type, variables get
//! their global slot, binary operands get promotion conversion tags,
//! qualified calls are rewritten to their flat mangled form, and module
//! field accesses become direct global references. Literal folding rewrites
//! literal nodes (value and type together), so re-checking a folded literal
//! is a no-op.
//!
//! Generic functions are recorded during a declaration prepass and
//! monomorphized per call site: each distinct instantiation becomes a
//! checked clone queued for the emitter under a hidden `name$t...` slot.

use crate::ast::{
    AssignTarget, BinaryOp, Block, CallTarget, DeclKind, Expr, ExprKind, FunctionDecl,
    LiteralValue, Span, Stmt, StmtKind, TypeExpr, TypeExprKind, UnaryOp,
};
use crate::builtins::check_builtin_call;
use crate::diagnostics::{Diagnostic, FileSpan};
use crate::modules::{LoadError, ModuleExport, ModuleLoader};
use crate::symbols::{SymbolError, SymbolTable};
use orus_core::chunk::Conversion;
use orus_core::natives;
use orus_core::types::{EnumId, FieldDef, FunctionType, StructId, Type, VariantDef};
use orus_core::{Context, ModuleInfo, Value};
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::debug;

struct CurrentFunction {
    return_type: Type,
    /// Return-type checks are suppressed while the signature is generic.
    suppress_return_checks: bool,
}

pub struct TypeChecker<'a> {
    ctx: &'a mut Context,
    loader: &'a mut ModuleLoader,
    symbols: &'a mut SymbolTable,
    /// Declaration ASTs by function slot, for generic resolution.
    function_decls: &'a mut HashMap<u8, FunctionDecl>,
    /// Mangled specialization name -> slot, shared across compiles.
    spec_slots: &'a mut HashMap<String, u8>,
    /// Checked monomorphized clones, for the emitter.
    specializations: Vec<(u8, FunctionDecl)>,
    diagnostics: Vec<Diagnostic>,
    file: String,
    dir: PathBuf,
    scope_depth: u32,
    /// Generic-name bindings; the top frame is consulted when resolving
    /// type expressions.
    generic_frames: Vec<HashMap<String, Type>>,
    current_function: Option<CurrentFunction>,
}

impl<'a> TypeChecker<'a> {
    pub fn new(
        ctx: &'a mut Context,
        loader: &'a mut ModuleLoader,
        symbols: &'a mut SymbolTable,
        function_decls: &'a mut HashMap<u8, FunctionDecl>,
        spec_slots: &'a mut HashMap<String, u8>,
        file: &str,
        dir: PathBuf,
    ) -> Self {
        TypeChecker {
            ctx,
            loader,
            symbols,
            function_decls,
            spec_slots,
            specializations: Vec::new(),
            diagnostics: Vec::new(),
            file: file.to_string(),
            dir,
            scope_depth: 0,
            generic_frames: Vec::new(),
            current_function: None,
        }
    }

    /// Check a program: declaration prepass, then each statement in order.
    pub fn check_program(&mut self, stmts: &mut [Stmt]) {
        self.predeclare(stmts);
        for stmt in stmts.iter_mut() {
            self.check_stmt(stmt);
        }
    }

    /// Consume the checker, yielding queued specializations and diagnostics.
    pub fn finish(self) -> (Vec<(u8, FunctionDecl)>, Vec<Diagnostic>) {
        (self.specializations, self.diagnostics)
    }

    pub fn has_errors(&self) -> bool {
        !self.diagnostics.is_empty()
    }

    // ---- diagnostics helpers ----

    fn file_span(&self, span: Span) -> FileSpan {
        FileSpan {
            file: self.file.clone(),
            span,
        }
    }

    fn error(&mut self, span: Span, code: &'static str, message: impl Into<String>) {
        self.diagnostics
            .push(Diagnostic::new(code, message, self.file_span(span)));
    }

    fn error_diag(&mut self, diagnostic: Diagnostic) {
        self.diagnostics.push(diagnostic);
    }

    fn type_name(&self, ty: &Type) -> String {
        ty.name(&self.ctx.registry)
    }

    fn declare_global_checked(
        &mut self,
        name: &str,
        ty: Type,
        public: bool,
        span: Span,
    ) -> Option<u8> {
        match self.ctx.declare_global(name, ty, public) {
            Ok(slot) => Some(slot),
            Err(message) => {
                self.error(span, "E1020", message);
                None
            }
        }
    }

    // ---- type expression resolution ----

    fn resolve_type_expr(&mut self, te: &TypeExpr) -> Option<Type> {
        match &te.kind {
            TypeExprKind::Array(elem) => {
                Some(Type::Array(Box::new(self.resolve_type_expr(elem)?)))
            }
            TypeExprKind::Named { name, generic_args } => {
                if generic_args.is_empty() {
                    if let Some(bound) = self
                        .generic_frames
                        .last()
                        .and_then(|frame| frame.get(name))
                        .cloned()
                    {
                        return Some(bound);
                    }
                    match name.as_str() {
                        "i32" => return Some(Type::I32),
                        "i64" => return Some(Type::I64),
                        "u32" => return Some(Type::U32),
                        "u64" => return Some(Type::U64),
                        "f64" => return Some(Type::F64),
                        "bool" => return Some(Type::Bool),
                        "string" => return Some(Type::Str),
                        "void" => return Some(Type::Void),
                        "nil" => return Some(Type::Nil),
                        _ => {}
                    }
                }
                if let Some(id) = self.ctx.registry.struct_by_name(name) {
                    return self.resolve_named_struct(id, name, generic_args, te.span);
                }
                if let Some(id) = self.ctx.registry.enum_by_name(name) {
                    return self.resolve_named_enum(id, name, generic_args, te.span);
                }
                self.error(te.span, "E1011", format!("unknown type '{}'", name));
                None
            }
        }
    }

    fn resolve_named_struct(
        &mut self,
        id: StructId,
        name: &str,
        generic_args: &[TypeExpr],
        span: Span,
    ) -> Option<Type> {
        let template_generics = self.ctx.registry.struct_type(id)?.generics.len();
        if template_generics != generic_args.len() {
            self.error(
                span,
                "E1018",
                format!(
                    "struct '{}' expects {} generic argument(s), got {}",
                    name,
                    template_generics,
                    generic_args.len()
                ),
            );
            return None;
        }
        if generic_args.is_empty() {
            return Some(Type::Struct(id));
        }
        let mut args = Vec::new();
        for arg in generic_args {
            args.push(self.resolve_type_expr(arg)?);
        }
        match self.ctx.registry.instantiate_struct(id, &args) {
            Ok(instance) => Some(Type::Struct(instance)),
            Err(message) => {
                self.error(span, "E1018", message);
                None
            }
        }
    }

    fn resolve_named_enum(
        &mut self,
        id: EnumId,
        name: &str,
        generic_args: &[TypeExpr],
        span: Span,
    ) -> Option<Type> {
        let template_generics = self.ctx.registry.enum_type(id)?.generics.len();
        if template_generics != generic_args.len() {
            self.error(
                span,
                "E1018",
                format!(
                    "enum '{}' expects {} generic argument(s), got {}",
                    name,
                    template_generics,
                    generic_args.len()
                ),
            );
            return None;
        }
        if generic_args.is_empty() {
            return Some(Type::Enum(id));
        }
        let mut args = Vec::new();
        for arg in generic_args {
            args.push(self.resolve_type_expr(arg)?);
        }
        match self.ctx.registry.instantiate_enum(id, &args) {
            Ok(instance) => Some(Type::Enum(instance)),
            Err(message) => {
                self.error(span, "E1018", message);
                None
            }
        }
    }

    // ---- declaration prepass ----

    /// Register struct/enum descriptors (two phases, so field types can
    /// reference later declarations), then function signatures, so forward
    /// and recursive references resolve.
    fn predeclare(&mut self, stmts: &mut [Stmt]) {
        // Phase 1: descriptor names.
        for stmt in stmts.iter() {
            match &stmt.kind {
                StmtKind::StructDecl { name, generics, .. } => {
                    let descriptor = orus_core::StructType {
                        name: name.clone(),
                        fields: Vec::new(),
                        generics: generics.clone(),
                    };
                    if let Err(message) = self.ctx.registry.declare_struct(descriptor) {
                        self.error(stmt.span, "E1013", message);
                    }
                }
                StmtKind::EnumDecl { name, generics, .. } => {
                    let descriptor = orus_core::EnumType {
                        name: name.clone(),
                        variants: Vec::new(),
                        generics: generics.clone(),
                    };
                    if let Err(message) = self.ctx.registry.declare_enum(descriptor) {
                        self.error(stmt.span, "E1013", message);
                    }
                }
                _ => {}
            }
        }
        // Phase 2: descriptor contents.
        for stmt in stmts.iter() {
            match &stmt.kind {
                StmtKind::StructDecl {
                    name,
                    generics,
                    fields,
                    ..
                } => {
                    let name = name.clone();
                    let frame: HashMap<String, Type> = generics
                        .iter()
                        .map(|g| (g.clone(), Type::Generic(g.clone())))
                        .collect();
                    let fields = fields.clone();
                    self.generic_frames.push(frame);
                    let mut resolved = Vec::new();
                    for (field_name, field_ty) in &fields {
                        if let Some(ty) = self.resolve_type_expr(field_ty) {
                            resolved.push(FieldDef {
                                name: field_name.clone(),
                                ty,
                            });
                        }
                    }
                    self.generic_frames.pop();
                    if let Some(id) = self.ctx.registry.struct_by_name(&name) {
                        self.ctx.registry.set_struct_fields(id, resolved);
                    }
                }
                StmtKind::EnumDecl {
                    name,
                    generics,
                    variants,
                    ..
                } => {
                    let name = name.clone();
                    let frame: HashMap<String, Type> = generics
                        .iter()
                        .map(|g| (g.clone(), Type::Generic(g.clone())))
                        .collect();
                    let variants = variants.clone();
                    self.generic_frames.push(frame);
                    let mut resolved = Vec::new();
                    for (variant_name, fields) in &variants {
                        let mut field_names = Vec::new();
                        let mut field_types = Vec::new();
                        for (field_name, field_ty) in fields {
                            if let Some(ty) = self.resolve_type_expr(field_ty) {
                                field_names.push(field_name.clone());
                                field_types.push(ty);
                            }
                        }
                        resolved.push(VariantDef {
                            name: variant_name.clone(),
                            field_names,
                            field_types,
                        });
                    }
                    self.generic_frames.pop();
                    if let Some(id) = self.ctx.registry.enum_by_name(&name) {
                        self.ctx.registry.set_enum_variants(id, resolved);
                    }
                }
                _ => {}
            }
        }
        // Phase 3: function signatures.
        for stmt in stmts.iter_mut() {
            if let StmtKind::Function(decl) = &mut stmt.kind {
                self.predeclare_function(decl);
            }
        }
    }

    fn predeclare_function(&mut self, decl: &mut FunctionDecl) {
        let frame: HashMap<String, Type> = decl
            .generics
            .iter()
            .map(|g| (g.clone(), Type::Generic(g.clone())))
            .collect();
        self.generic_frames.push(frame);
        let mut params = Vec::new();
        for param in &decl.params {
            params.push(self.resolve_type_expr(&param.ty).unwrap_or(Type::Nil));
        }
        let ret = match &decl.return_type {
            Some(te) => self.resolve_type_expr(te).unwrap_or(Type::Void),
            None => Type::Void,
        };
        self.generic_frames.pop();

        let fn_type = Type::Function(Box::new(FunctionType {
            ret,
            params: params.clone(),
        }));
        let Some(slot) =
            self.declare_global_checked(&decl.name, fn_type.clone(), decl.public, decl.span)
        else {
            return;
        };
        decl.slot = Some(slot);
        for (param, ty) in decl.params.iter_mut().zip(params) {
            let span = param.span;
            let name = param.name.clone();
            param.slot = match self.ctx.declare_global(&name, ty, false) {
                Ok(slot) => Some(slot),
                Err(message) => {
                    self.error(span, "E1020", message);
                    None
                }
            };
        }
        if let Err(error) = self.symbols.add(
            &decl.name,
            decl.span,
            fn_type,
            self.scope_depth,
            slot,
            false,
            false,
            None,
        ) {
            self.report_symbol_error(&decl.name, decl.span, error);
        }
        self.function_decls.insert(slot, decl.clone());
        debug!(function = %decl.name, slot, "predeclared function");
    }

    fn report_symbol_error(&mut self, name: &str, span: Span, error: SymbolError) {
        let (previous, what) = match error {
            SymbolError::Duplicate { previous } => (previous, "already declared in this scope"),
            SymbolError::ShadowsConst { previous } => (previous, "shadows a const binding"),
        };
        let diag = Diagnostic::new(
            "E1013",
            format!("'{}' {}", name, what),
            self.file_span(span),
        )
        .with_secondary(self.file_span(previous), "previous declaration");
        self.error_diag(diag);
    }

    // ---- statements ----

    fn check_stmt(&mut self, stmt: &mut Stmt) {
        let span = stmt.span;
        match &mut stmt.kind {
            StmtKind::Expression(expr) => {
                self.check_expr(expr);
            }
            StmtKind::Print { args, newline: _ } => {
                self.check_print(args, span);
            }
            StmtKind::Declaration {
                kind,
                name,
                mutable,
                public,
                declared,
                init,
                slot,
            } => {
                let kind = *kind;
                let mutable = *mutable;
                let public = *public;
                let name = name.clone();
                let declared = declared.clone();
                *slot =
                    self.check_declaration(kind, &name, mutable, public, &declared, init, span);
            }
            StmtKind::Assign { target, value } => self.check_assignment(target, value, span),
            StmtKind::If {
                cond,
                then_block,
                elifs,
                else_block,
            } => {
                self.check_condition(cond);
                self.check_block(then_block);
                for (elif_cond, elif_block) in elifs {
                    self.check_condition(elif_cond);
                    self.check_block(elif_block);
                }
                if let Some(block) = else_block {
                    self.check_block(block);
                }
            }
            StmtKind::While { cond, body } => {
                self.check_condition(cond);
                self.check_block(body);
            }
            StmtKind::For {
                var,
                start,
                end,
                step,
                body,
                slot,
            } => {
                let var = var.clone();
                *slot = self.check_for(&var, start, end, step.as_mut(), body, span);
            }
            StmtKind::Block(block) => self.check_block(block),
            StmtKind::Function(decl) => {
                if decl.generics.is_empty() {
                    self.check_function_body(decl, true);
                }
                // Generic bodies are checked per instantiation, with the
                // concrete types substituted.
            }
            StmtKind::StructDecl { .. } | StmtKind::EnumDecl { .. } => {
                // Fully handled by the prepass.
            }
            StmtKind::Return { value } => self.check_return(value.as_mut(), span),
            StmtKind::Break | StmtKind::Continue => {}
            StmtKind::TryCatch {
                try_block,
                err_name,
                err_slot,
                catch_block,
            } => {
                let err_name = err_name.clone();
                self.check_block(try_block);
                self.scope_depth += 1;
                let depth = self.scope_depth;
                let slot = self.declare_global_checked(&err_name, Type::Str, false, span);
                if let Some(slot) = slot {
                    if let Err(error) =
                        self.symbols
                            .add(&err_name, span, Type::Str, depth, slot, false, false, None)
                    {
                        self.report_symbol_error(&err_name, span, error);
                    }
                }
                *err_slot = slot;
                self.check_block(catch_block);
                self.symbols.remove_from_scope(depth);
                self.scope_depth -= 1;
            }
            StmtKind::Use {
                path,
                alias,
                module_index,
            } => {
                let path = path.clone();
                let alias = alias.clone();
                *module_index = self.check_use(&path, &alias, span);
            }
        }
    }

    fn check_condition(&mut self, cond: &mut Expr) {
        if let Some(ty) = self.check_expr(cond) {
            if ty != Type::Bool {
                let name = self.type_name(&ty);
                self.error(
                    cond.span,
                    "E1003",
                    format!("condition must be 'bool', got '{}'", name),
                );
            }
        }
    }

    fn check_block(&mut self, block: &mut Block) {
        if block.scoped {
            self.scope_depth += 1;
        }
        let depth = self.scope_depth;
        self.predeclare(&mut block.stmts);
        for stmt in &mut block.stmts {
            self.check_stmt(stmt);
        }
        if block.scoped {
            self.symbols.remove_from_scope(depth);
            self.scope_depth -= 1;
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn check_declaration(
        &mut self,
        kind: DeclKind,
        name: &str,
        mutable: bool,
        public: bool,
        declared: &Option<TypeExpr>,
        init: &mut Expr,
        span: Span,
    ) -> Option<u8> {
        if kind == DeclKind::Const && !matches!(init.kind, ExprKind::Literal(_)) {
            self.error(
                span,
                "E1019",
                "const declarations require a literal initializer",
            );
            return None;
        }
        let init_ty = self.check_expr(init)?;
        if init_ty == Type::Void {
            self.error(init.span, "E1002", "cannot bind a void expression");
            return None;
        }
        let declared_ty = match declared {
            Some(te) => Some(self.resolve_type_expr(te)?),
            None => None,
        };
        let final_ty = match declared_ty {
            Some(target) => {
                if init_ty != target && !self.fold_expr_to(init, &target) {
                    let want = self.type_name(&target);
                    let got = self.type_name(&init_ty);
                    self.error(
                        init.span,
                        "E1002",
                        format!("mismatched types: expected '{}', got '{}'", want, got),
                    );
                    return None;
                }
                target
            }
            None => init_ty,
        };
        let slot = self.declare_global_checked(name, final_ty.clone(), public, span)?;
        if let Err(error) = self.symbols.add(
            name,
            span,
            final_ty,
            self.scope_depth,
            slot,
            mutable,
            kind == DeclKind::Const,
            None,
        ) {
            self.report_symbol_error(name, span, error);
            return None;
        }
        if kind == DeclKind::Const {
            // Const values are stored into their slot immediately.
            if let ExprKind::Literal(lit) = &init.kind {
                let lit = lit.clone();
                let value = self.literal_to_value(&lit);
                self.ctx.set_global_value(slot, value);
            }
        }
        Some(slot)
    }

    fn literal_to_value(&mut self, lit: &LiteralValue) -> Value {
        match lit {
            LiteralValue::I32(v) => Value::I32(*v),
            LiteralValue::I64(v) => Value::I64(*v),
            LiteralValue::U32(v) => Value::U32(*v),
            LiteralValue::U64(v) => Value::U64(*v),
            LiteralValue::F64(v) => Value::F64(*v),
            LiteralValue::Bool(v) => Value::Bool(*v),
            LiteralValue::Str(s) => Value::Obj(self.ctx.heap.alloc_str(s)),
            LiteralValue::Nil => Value::Nil,
        }
    }

    fn check_assignment(&mut self, target: &mut AssignTarget, value: &mut Expr, span: Span) {
        match target {
            AssignTarget::Name { name, slot } => {
                let name = name.clone();
                let (declared, symbol_slot) = {
                    let Some(symbol) = self.symbols.find(&name) else {
                        self.undefined_variable(&name, span);
                        return;
                    };
                    let previous = symbol.span;
                    if symbol.is_module_alias() {
                        self.error(span, "E1027", "cannot assign to a module alias");
                        return;
                    }
                    if symbol.is_const {
                        let diag = Diagnostic::new(
                            "E1009",
                            format!("cannot assign to const '{}'", name),
                            self.file_span(span),
                        )
                        .with_secondary(self.file_span(previous), "declared const here");
                        self.error_diag(diag);
                        return;
                    }
                    if !symbol.mutable {
                        let diag = Diagnostic::new(
                            "E1008",
                            format!("cannot assign to immutable binding '{}'", name),
                            self.file_span(span),
                        )
                        .with_secondary(self.file_span(previous), "declared without 'mut' here")
                        .with_help(format!("declare it as 'let mut {} = ...'", name));
                        self.error_diag(diag);
                        return;
                    }
                    (symbol.ty.clone(), symbol.slot)
                };
                let Some(value_ty) = self.check_expr(value) else {
                    return;
                };
                let refined = match (&declared, &value_ty) {
                    // First real assignment upgrades a nil slot.
                    (Type::Nil, other) if *other != Type::Nil && *other != Type::Void => {
                        Some(other.clone())
                    }
                    (Type::Array(elem), Type::Array(got)) if **elem == Type::Nil => {
                        Some(Type::Array(got.clone()))
                    }
                    _ => None,
                };
                if let Some(new_ty) = refined {
                    if let Some(symbol) = self.symbols.find_mut(&name) {
                        symbol.ty = new_ty.clone();
                    }
                    self.ctx.set_global_type(symbol_slot, new_ty);
                } else if value_ty != declared && !self.fold_expr_to(value, &declared) {
                    let want = self.type_name(&declared);
                    let got = self.type_name(&value_ty);
                    self.error(
                        value.span,
                        "E1002",
                        format!("mismatched types: expected '{}', got '{}'", want, got),
                    );
                    return;
                }
                *slot = Some(symbol_slot);
            }
            AssignTarget::Index { target, index } => {
                let Some(target_ty) = self.check_expr(target) else {
                    return;
                };
                let Type::Array(elem) = target_ty else {
                    let name = self.type_name(&target_ty);
                    self.error(target.span, "E1023", format!("cannot index into '{}'", name));
                    return;
                };
                self.check_integer_index(index);
                if let Some(value_ty) = self.check_expr(value) {
                    if value_ty != *elem && !self.fold_expr_to(value, &elem) {
                        let want = self.type_name(&elem);
                        let got = self.type_name(&value_ty);
                        self.error(
                            value.span,
                            "E1002",
                            format!("mismatched types: expected '{}', got '{}'", want, got),
                        );
                    }
                }
            }
            AssignTarget::Field {
                receiver,
                field,
                index,
            } => {
                let field = field.clone();
                let Some(receiver_ty) = self.check_expr(receiver) else {
                    return;
                };
                let receiver_span = receiver.span;
                let Some((field_index, field_ty)) =
                    self.struct_field(&receiver_ty, &field, receiver_span)
                else {
                    return;
                };
                *index = Some(field_index);
                if let Some(value_ty) = self.check_expr(value) {
                    if value_ty != field_ty && !self.fold_expr_to(value, &field_ty) {
                        let want = self.type_name(&field_ty);
                        let got = self.type_name(&value_ty);
                        self.error(
                            value.span,
                            "E1002",
                            format!("mismatched types: expected '{}', got '{}'", want, got),
                        );
                    }
                }
            }
        }
    }

    fn check_integer_index(&mut self, index: &mut Expr) {
        if let Some(ty) = self.check_expr(index) {
            if !ty.is_integer() {
                let name = self.type_name(&ty);
                self.error(
                    index.span,
                    "E1023",
                    format!("index must be an integer, got '{}'", name),
                );
            }
        }
    }

    fn struct_field(&mut self, receiver_ty: &Type, field: &str, span: Span) -> Option<(u8, Type)> {
        let Type::Struct(id) = receiver_ty else {
            let name = self.type_name(receiver_ty);
            self.error(
                span,
                "E1012",
                format!("field access on non-struct type '{}'", name),
            );
            return None;
        };
        let descriptor = self.ctx.registry.struct_type(*id)?;
        match descriptor.field_index(field) {
            Some(index) => {
                let ty = descriptor.fields[index].ty.clone();
                Some((index as u8, ty))
            }
            None => {
                let struct_name = descriptor.name.clone();
                self.error(
                    span,
                    "E1012",
                    format!("struct '{}' has no field '{}'", struct_name, field),
                );
                None
            }
        }
    }

    fn check_for(
        &mut self,
        var: &str,
        start: &mut Expr,
        end: &mut Expr,
        step: Option<&mut Expr>,
        body: &mut Block,
        span: Span,
    ) -> Option<u8> {
        let start_ty = self.check_expr(start)?;
        let end_ty = self.check_expr(end)?;
        if !start_ty.is_integer() {
            let name = self.type_name(&start_ty);
            self.error(
                start.span,
                "E1016",
                format!("for-loop bounds must be integers, got '{}'", name),
            );
            return None;
        }
        let iter_ty = start_ty;
        if end_ty != iter_ty && !self.fold_expr_to(end, &iter_ty) {
            let want = self.type_name(&iter_ty);
            let got = self.type_name(&end_ty);
            self.error(
                end.span,
                "E1016",
                format!(
                    "for-loop bounds must agree: start is '{}', end is '{}'",
                    want, got
                ),
            );
            return None;
        }
        if let Some(step) = step {
            let step_ty = self.check_expr(step)?;
            if step_ty != iter_ty && !self.fold_expr_to(step, &iter_ty) {
                let want = self.type_name(&iter_ty);
                let got = self.type_name(&step_ty);
                self.error(
                    step.span,
                    "E1016",
                    format!("for-loop step must be '{}', got '{}'", want, got),
                );
                return None;
            }
        }
        // The iterator lives in its own scope wrapping the body.
        self.scope_depth += 1;
        let depth = self.scope_depth;
        let slot = self.declare_global_checked(var, iter_ty.clone(), false, span);
        if let Some(slot) = slot {
            if let Err(error) = self
                .symbols
                .add(var, span, iter_ty, depth, slot, false, false, None)
            {
                self.report_symbol_error(var, span, error);
            }
        }
        self.check_block(body);
        self.symbols.remove_from_scope(depth);
        self.scope_depth -= 1;
        slot
    }

    fn check_function_body(&mut self, decl: &mut FunctionDecl, enforce_returns: bool) {
        let frame: HashMap<String, Type> = decl
            .generics
            .iter()
            .map(|g| (g.clone(), Type::Generic(g.clone())))
            .collect();
        let has_frame = !frame.is_empty();
        if has_frame {
            self.generic_frames.push(frame);
        }
        let ret = match &decl.return_type {
            Some(te) => self.resolve_type_expr(te).unwrap_or(Type::Void),
            None => Type::Void,
        };
        let suppress = ret.contains_generic();
        let previous = self.current_function.replace(CurrentFunction {
            return_type: ret.clone(),
            suppress_return_checks: suppress,
        });

        self.scope_depth += 1;
        let depth = self.scope_depth;
        for param in &decl.params {
            let Some(slot) = param.slot else { continue };
            let ty = self.resolve_type_expr(&param.ty).unwrap_or(Type::Nil);
            if let Err(error) =
                self.symbols
                    .add(&param.name, param.span, ty, depth, slot, true, false, None)
            {
                self.report_symbol_error(&param.name, param.span, error);
            }
        }
        self.check_block(&mut decl.body);
        self.symbols.remove_from_scope(depth);
        self.scope_depth -= 1;
        self.current_function = previous;
        if has_frame {
            self.generic_frames.pop();
        }

        if enforce_returns
            && ret != Type::Void
            && ret != Type::Nil
            && !suppress
            && !block_always_returns(&decl.body)
        {
            let name = self.type_name(&ret);
            let diag = Diagnostic::new(
                "E1014",
                format!("function '{}' must return '{}' on all paths", decl.name, name),
                self.file_span(decl.span),
            )
            .with_help("add a return statement at the end of the function");
            self.error_diag(diag);
        }
    }

    fn check_return(&mut self, value: Option<&mut Expr>, span: Span) {
        let Some(current) = &self.current_function else {
            self.error(span, "E1015", "return outside of a function");
            return;
        };
        let expected = current.return_type.clone();
        let suppress = current.suppress_return_checks;
        match value {
            Some(expr) => {
                let Some(actual) = self.check_expr(expr) else {
                    return;
                };
                if suppress || actual.contains_generic() {
                    return;
                }
                if actual != expected && !self.fold_expr_to(expr, &expected) {
                    let want = self.type_name(&expected);
                    let got = self.type_name(&actual);
                    self.error(
                        expr.span,
                        "E1015",
                        format!("return type mismatch: expected '{}', got '{}'", want, got),
                    );
                }
            }
            None => {
                if expected != Type::Void && expected != Type::Nil && !suppress {
                    let name = self.type_name(&expected);
                    self.error(
                        span,
                        "E1015",
                        format!("this function must return a value of type '{}'", name),
                    );
                }
            }
        }
    }

    fn check_print(&mut self, args: &mut [Expr], span: Span) {
        if args.len() >= 2 {
            // Format print: constant format string, one `{}` per argument.
            let placeholder_count = match &args[0].kind {
                ExprKind::Literal(LiteralValue::Str(fmt)) => fmt.matches("{}").count(),
                _ => {
                    self.error(
                        args[0].span,
                        "E1026",
                        "format print requires a constant string as its first argument",
                    );
                    return;
                }
            };
            args[0].ty = Some(Type::Str);
            let value_count = args.len() - 1;
            if placeholder_count != value_count {
                self.error(
                    span,
                    "E1026",
                    format!(
                        "format string has {} placeholder(s) but {} argument(s) were supplied",
                        placeholder_count, value_count
                    ),
                );
            }
            for arg in &mut args[1..] {
                self.check_expr(arg);
            }
            return;
        }
        for arg in args.iter_mut() {
            if self.check_expr(arg).is_none() {
                return;
            }
        }
        // Simple print of a struct goes through its to_string method when
        // one is defined.
        if let Some(arg) = args.first_mut() {
            let struct_id = match &arg.ty {
                Some(Type::Struct(id)) => *id,
                _ => return,
            };
            let Some(descriptor) = self.ctx.registry.struct_type(struct_id) else {
                return;
            };
            let base = descriptor
                .name
                .split('<')
                .next()
                .unwrap_or(&descriptor.name)
                .to_string();
            let mangled = format!("{}_to_string", base);
            let slot = match self.symbols.find(&mangled) {
                Some(symbol) => symbol.slot,
                None => return,
            };
            let ret = match self.ctx.global_type(slot) {
                Some(Type::Function(f)) => f.ret.clone(),
                _ => return,
            };
            let receiver =
                std::mem::replace(arg, Expr::new(ExprKind::Literal(LiteralValue::Nil), span));
            let mut call = Expr::new(
                ExprKind::Call {
                    callee: Box::new(Expr::new(
                        ExprKind::Variable {
                            name: mangled,
                            slot: Some(slot),
                        },
                        span,
                    )),
                    generic_args: Vec::new(),
                    args: vec![receiver],
                    target: Some(CallTarget::Function { slot }),
                },
                span,
            );
            call.ty = Some(ret);
            *arg = call;
        }
    }

    fn check_use(&mut self, path: &str, alias: &str, span: Span) -> Option<u8> {
        let importer_dir = self.dir.clone();
        let unit_index = match self.loader.load(path, &importer_dir) {
            Ok(index) => index,
            Err(LoadError::Parse(diagnostics)) => {
                self.diagnostics.extend(diagnostics);
                self.error(span, "E1021", format!("module '{}' has errors", path));
                return None;
            }
            Err(LoadError::NotFound(message))
            | Err(LoadError::Io(message))
            | Err(LoadError::Cycle(message)) => {
                self.error(span, "E1021", message);
                return None;
            }
        };
        let (checked, module_index) = {
            let unit = self.loader.unit(unit_index)?;
            (unit.checked, unit.index)
        };
        let module_index = if checked {
            module_index
        } else {
            self.check_module(unit_index, span)?
        };
        if let Err(error) = self.symbols.add(
            alias,
            span,
            Type::Nil,
            self.scope_depth,
            0,
            false,
            false,
            Some(module_index),
        ) {
            self.report_symbol_error(alias, span, error);
        }
        Some(module_index)
    }

    /// Check a freshly loaded module in its own symbol table and collect its
    /// exports. The module's globals land in the shared slot space.
    fn check_module(&mut self, unit_index: usize, span: Span) -> Option<u8> {
        let (name, path, file_label, mut ast) = {
            let unit = self.loader.unit_mut(unit_index)?;
            (
                unit.name.clone(),
                unit.path.clone(),
                unit.file_label.clone(),
                std::mem::take(&mut unit.ast),
            )
        };
        let module_index = self.ctx.add_module(ModuleInfo {
            name: name.clone(),
            path: path.clone(),
            init_slot: None,
            initialized: false,
        });
        let init_slot = self.declare_global_checked(
            &format!("{}::init", name),
            Type::Function(Box::new(FunctionType {
                ret: Type::Void,
                params: Vec::new(),
            })),
            false,
            span,
        )?;
        if let Some(info) = self.ctx.module_mut(module_index) {
            info.init_slot = Some(init_slot);
        }
        self.loader.begin_check(unit_index);

        // Swap in a fresh symbol table and module file context.
        let mut module_symbols = SymbolTable::new();
        std::mem::swap(self.symbols, &mut module_symbols);
        let saved_file = std::mem::replace(&mut self.file, file_label);
        let saved_dir = std::mem::replace(
            &mut self.dir,
            path.parent().map(PathBuf::from).unwrap_or_default(),
        );
        let saved_depth = std::mem::replace(&mut self.scope_depth, 0);

        self.check_program(&mut ast);

        self.scope_depth = saved_depth;
        self.dir = saved_dir;
        self.file = saved_file;
        std::mem::swap(self.symbols, &mut module_symbols);
        self.loader.end_check(unit_index);

        // Collect module-level exports from the annotated tree.
        let mut exports = Vec::new();
        for stmt in &ast {
            match &stmt.kind {
                StmtKind::Declaration {
                    name,
                    public,
                    slot: Some(slot),
                    ..
                } => exports.push(ModuleExport {
                    name: name.clone(),
                    slot: *slot,
                    public: *public,
                }),
                StmtKind::Function(decl) => {
                    if let Some(slot) = decl.slot {
                        exports.push(ModuleExport {
                            name: decl.name.clone(),
                            slot,
                            public: decl.public,
                        });
                    }
                }
                _ => {}
            }
        }
        let unit = self.loader.unit_mut(unit_index)?;
        unit.ast = ast;
        unit.exports = exports;
        unit.init_slot = Some(init_slot);
        unit.index = module_index;
        unit.checked = true;
        Some(module_index)
    }

    // ---- expressions ----

    fn check_expr(&mut self, expr: &mut Expr) -> Option<Type> {
        let span = expr.span;
        let ty = match &mut expr.kind {
            ExprKind::Literal(lit) => Some(lit.static_type()),
            ExprKind::ArrayLiteral(_) => self.check_array_literal(expr),
            ExprKind::StructLiteral { .. } => self.check_struct_literal(expr),
            ExprKind::Variable { name, slot } => {
                let name = name.clone();
                match self.symbols.find(&name) {
                    Some(symbol) => {
                        let is_module = symbol.is_module_alias();
                        let symbol_slot = symbol.slot;
                        let symbol_ty = symbol.ty.clone();
                        if is_module {
                            self.error(
                                span,
                                "E1027",
                                format!("module alias '{}' is not a value", name),
                            );
                            None
                        } else {
                            *slot = Some(symbol_slot);
                            Some(symbol_ty)
                        }
                    }
                    None => {
                        self.undefined_variable(&name, span);
                        None
                    }
                }
            }
            ExprKind::Unary { op, operand } => {
                let op = *op;
                let operand_ty = self.check_expr(operand)?;
                self.check_unary(op, operand_ty, span)
            }
            ExprKind::Binary { .. } => self.check_binary(expr),
            ExprKind::Logical { lhs, rhs, .. } => {
                let lt = self.check_expr(lhs);
                let lspan = lhs.span;
                let rt = self.check_expr(rhs);
                let rspan = rhs.span;
                for (ty, side) in [(lt, lspan), (rt, rspan)] {
                    if let Some(ty) = ty {
                        if ty != Type::Bool {
                            let name = self.type_name(&ty);
                            self.error(
                                side,
                                "E1025",
                                format!("logical operands must be 'bool', got '{}'", name),
                            );
                        }
                    }
                }
                Some(Type::Bool)
            }
            ExprKind::Index { target, index } => {
                let target_ty = self.check_expr(target)?;
                self.check_integer_index(index);
                match target_ty {
                    Type::Array(elem) => Some(*elem),
                    other => {
                        let name = self.type_name(&other);
                        self.error(span, "E1023", format!("cannot index into '{}'", name));
                        None
                    }
                }
            }
            ExprKind::Slice { target, start, end } => {
                let target_ty = self.check_expr(target)?;
                if let Some(start) = start {
                    self.check_integer_index(start);
                }
                if let Some(end) = end {
                    self.check_integer_index(end);
                }
                match target_ty {
                    Type::Array(_) => Some(target_ty),
                    other => {
                        let name = self.type_name(&other);
                        self.error(span, "E1023", format!("cannot slice '{}'", name));
                        None
                    }
                }
            }
            ExprKind::Field { .. } => self.check_field(expr),
            ExprKind::Call { .. } => self.check_call(expr),
            ExprKind::Cast { .. } => self.check_cast(expr),
        };
        if let Some(ty) = &ty {
            expr.ty = Some(ty.clone());
        }
        ty
    }

    fn undefined_variable(&mut self, name: &str, span: Span) {
        let shadow_span = self.symbols.find_any(name).map(|s| s.span);
        let mut diag = Diagnostic::new(
            "E1001",
            format!("undefined variable '{}'", name),
            self.file_span(span),
        );
        if let Some(previous) = shadow_span {
            diag = diag.with_secondary(
                self.file_span(previous),
                "a binding with this name went out of scope here",
            );
        }
        self.error_diag(diag);
    }

    fn check_array_literal(&mut self, expr: &mut Expr) -> Option<Type> {
        let count = match &expr.kind {
            ExprKind::ArrayLiteral(elements) => elements.len(),
            _ => return None,
        };
        if count == 0 {
            // Element type refined at the first assignment site.
            return Some(Type::Array(Box::new(Type::Nil)));
        }
        let mut element_ty: Option<Type> = None;
        for i in 0..count {
            let ty = {
                let ExprKind::ArrayLiteral(elements) = &mut expr.kind else {
                    return None;
                };
                self.check_expr(&mut elements[i])?
            };
            match &element_ty {
                None => element_ty = Some(ty),
                Some(existing) if *existing == ty => {}
                Some(existing) => {
                    let existing = existing.clone();
                    let folded = {
                        let ExprKind::ArrayLiteral(elements) = &mut expr.kind else {
                            return None;
                        };
                        self.fold_expr_to(&mut elements[i], &existing)
                    };
                    if !folded {
                        let want = self.type_name(&existing);
                        let got = self.type_name(&ty);
                        let element_span = match &expr.kind {
                            ExprKind::ArrayLiteral(elements) => elements[i].span,
                            _ => expr.span,
                        };
                        self.error(
                            element_span,
                            "E1017",
                            format!(
                                "array elements must share one type: expected '{}', got '{}'",
                                want, got
                            ),
                        );
                        return None;
                    }
                }
            }
        }
        Some(Type::Array(Box::new(element_ty?)))
    }

    fn check_struct_literal(&mut self, expr: &mut Expr) -> Option<Type> {
        let span = expr.span;
        let (name, generic_args) = match &expr.kind {
            ExprKind::StructLiteral {
                name, generic_args, ..
            } => (name.clone(), generic_args.clone()),
            _ => return None,
        };
        let Some(base_id) = self.ctx.registry.struct_by_name(&name) else {
            self.error(span, "E1011", format!("unknown struct '{}'", name));
            return None;
        };
        let ty = self.resolve_named_struct(base_id, &name, &generic_args, span)?;
        let Type::Struct(id) = ty else { return None };
        let descriptor_fields: Vec<FieldDef> = self.ctx.registry.struct_type(id)?.fields.clone();
        // Count check, then reorder literal fields into declaration order.
        {
            let ExprKind::StructLiteral {
                fields, resolved, ..
            } = &mut expr.kind
            else {
                return None;
            };
            if fields.len() != descriptor_fields.len() {
                let (supplied, declared) = (fields.len(), descriptor_fields.len());
                self.error(
                    span,
                    "E1024",
                    format!(
                        "struct '{}' has {} field(s), literal supplies {}",
                        name, declared, supplied
                    ),
                );
                return None;
            }
            let mut source = std::mem::take(fields);
            let mut ordered: Vec<(String, Expr)> = Vec::with_capacity(source.len());
            let mut missing: Option<String> = None;
            for def in &descriptor_fields {
                match source.iter().position(|(n, _)| *n == def.name) {
                    Some(at) => ordered.push(source.remove(at)),
                    None => {
                        missing = Some(def.name.clone());
                        break;
                    }
                }
            }
            if let Some(field) = missing {
                self.error(
                    span,
                    "E1012",
                    format!("missing field '{}' in struct literal", field),
                );
                return None;
            }
            if let Some((stray, _)) = source.first() {
                let stray = stray.clone();
                self.error(
                    span,
                    "E1012",
                    format!("struct '{}' has no field '{}'", name, stray),
                );
                return None;
            }
            *fields = ordered;
            *resolved = Some(id);
        }
        // Field value checks against declared types.
        for (i, def) in descriptor_fields.iter().enumerate() {
            let value_ty = {
                let ExprKind::StructLiteral { fields, .. } = &mut expr.kind else {
                    return None;
                };
                self.check_expr(&mut fields[i].1)
            };
            let Some(value_ty) = value_ty else { continue };
            if value_ty != def.ty {
                let folded = {
                    let ExprKind::StructLiteral { fields, .. } = &mut expr.kind else {
                        return None;
                    };
                    self.fold_expr_to(&mut fields[i].1, &def.ty)
                };
                if !folded {
                    let want = self.type_name(&def.ty);
                    let got = self.type_name(&value_ty);
                    let value_span = match &expr.kind {
                        ExprKind::StructLiteral { fields, .. } => fields[i].1.span,
                        _ => span,
                    };
                    self.error(
                        value_span,
                        "E1002",
                        format!("field '{}': expected '{}', got '{}'", def.name, want, got),
                    );
                }
            }
        }
        Some(Type::Struct(id))
    }

    fn check_unary(&mut self, op: UnaryOp, operand_ty: Type, span: Span) -> Option<Type> {
        match op {
            UnaryOp::Neg => {
                if matches!(operand_ty, Type::U32 | Type::U64) {
                    self.error(span, "E1025", "cannot negate an unsigned integer");
                    return None;
                }
                if !operand_ty.is_numeric() {
                    let name = self.type_name(&operand_ty);
                    self.error(
                        span,
                        "E1025",
                        format!("unary '-' requires a numeric operand, got '{}'", name),
                    );
                    return None;
                }
                Some(operand_ty)
            }
            UnaryOp::Not => {
                if operand_ty != Type::Bool {
                    let name = self.type_name(&operand_ty);
                    self.error(
                        span,
                        "E1025",
                        format!("'not' requires a bool operand, got '{}'", name),
                    );
                    return None;
                }
                Some(Type::Bool)
            }
            UnaryOp::BitNot => {
                if !operand_ty.is_integer() {
                    let name = self.type_name(&operand_ty);
                    self.error(
                        span,
                        "E1025",
                        format!("'~' requires an integer operand, got '{}'", name),
                    );
                    return None;
                }
                Some(operand_ty)
            }
        }
    }

    fn check_binary(&mut self, expr: &mut Expr) -> Option<Type> {
        let span = expr.span;
        let op = match &expr.kind {
            ExprKind::Binary { op, .. } => *op,
            _ => return None,
        };
        let lt = match &mut expr.kind {
            ExprKind::Binary { lhs, .. } => self.check_expr(lhs)?,
            _ => return None,
        };
        let rt = match &mut expr.kind {
            ExprKind::Binary { rhs, .. } => self.check_expr(rhs)?,
            _ => return None,
        };
        self.binary_result(op, &lt, &rt, expr, span)
    }

    fn binary_result(
        &mut self,
        op: BinaryOp,
        lt: &Type,
        rt: &Type,
        expr: &mut Expr,
        span: Span,
    ) -> Option<Type> {
        match op {
            // `+` doubles as string concatenation.
            BinaryOp::Add if *lt == Type::Str || *rt == Type::Str => {
                if *lt == Type::Nil || *rt == Type::Nil {
                    self.error(span, "E1002", "cannot concatenate nil with a string");
                    return None;
                }
                let ExprKind::Binary {
                    lhs_conv, rhs_conv, ..
                } = &mut expr.kind
                else {
                    return None;
                };
                if *lt != Type::Str {
                    *lhs_conv = Some(Conversion::ToString);
                }
                if *rt != Type::Str {
                    *rhs_conv = Some(Conversion::ToString);
                }
                Some(Type::Str)
            }
            BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div => {
                let (common, lc, rc) = self.numeric_common(lt, rt, expr, false, op, span)?;
                let ExprKind::Binary {
                    lhs_conv, rhs_conv, ..
                } = &mut expr.kind
                else {
                    return None;
                };
                *lhs_conv = lc;
                *rhs_conv = rc;
                Some(common)
            }
            BinaryOp::Mod => {
                let (common, lc, rc) = self.numeric_common(lt, rt, expr, true, op, span)?;
                let ExprKind::Binary {
                    lhs_conv, rhs_conv, ..
                } = &mut expr.kind
                else {
                    return None;
                };
                *lhs_conv = lc;
                *rhs_conv = rc;
                Some(common)
            }
            BinaryOp::BitAnd
            | BinaryOp::BitOr
            | BinaryOp::BitXor
            | BinaryOp::Shl
            | BinaryOp::Shr => {
                if !lt.is_integer() || !rt.is_integer() {
                    let (l, r) = (self.type_name(lt), self.type_name(rt));
                    self.error(
                        span,
                        "E1002",
                        format!(
                            "'{}' requires integer operands, got '{}' and '{}'",
                            op.symbol(),
                            l,
                            r
                        ),
                    );
                    return None;
                }
                if lt != rt {
                    let folded = {
                        let ExprKind::Binary { lhs, rhs, .. } = &mut expr.kind else {
                            return None;
                        };
                        // One literal side may fold; there is no promotion
                        // for bitwise operators.
                        let folded_rhs = self.fold_expr_to(rhs, lt);
                        folded_rhs || self.fold_expr_to(lhs, rt)
                    };
                    if !folded {
                        let (l, r) = (self.type_name(lt), self.type_name(rt));
                        self.error(
                            span,
                            "E1002",
                            format!(
                                "'{}' requires both operands to share one integer type, got '{}' and '{}'",
                                op.symbol(),
                                l,
                                r
                            ),
                        );
                        return None;
                    }
                }
                let ExprKind::Binary { lhs, .. } = &expr.kind else {
                    return None;
                };
                Some(lhs.ty.clone().unwrap_or_else(|| lt.clone()))
            }
            BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
                let (_, lc, rc) = self.numeric_common(lt, rt, expr, false, op, span)?;
                let ExprKind::Binary {
                    lhs_conv, rhs_conv, ..
                } = &mut expr.kind
                else {
                    return None;
                };
                *lhs_conv = lc;
                *rhs_conv = rc;
                Some(Type::Bool)
            }
            BinaryOp::Eq | BinaryOp::Ne => {
                // Equality is heterogeneous at runtime; only promotable
                // numeric pairs need conversions recorded.
                if lt.is_numeric() && rt.is_numeric() && lt != rt {
                    let (_, lc, rc) = self.numeric_common(lt, rt, expr, false, op, span)?;
                    let ExprKind::Binary {
                        lhs_conv, rhs_conv, ..
                    } = &mut expr.kind
                    else {
                        return None;
                    };
                    *lhs_conv = lc;
                    *rhs_conv = rc;
                }
                Some(Type::Bool)
            }
        }
    }

    /// Common numeric type of a binary operation: equal types, a folded
    /// literal side, or the i64/f64 promotions with conversion tags.
    fn numeric_common(
        &mut self,
        lt: &Type,
        rt: &Type,
        expr: &mut Expr,
        integer_only: bool,
        op: BinaryOp,
        span: Span,
    ) -> Option<(Type, Option<Conversion>, Option<Conversion>)> {
        let valid = |t: &Type| {
            if integer_only {
                t.is_integer()
            } else {
                t.is_numeric()
            }
        };
        if !valid(lt) || !valid(rt) {
            let (l, r) = (self.type_name(lt), self.type_name(rt));
            let wanted = if integer_only { "integer" } else { "numeric" };
            self.error(
                span,
                "E1002",
                format!(
                    "'{}' requires {} operands, got '{}' and '{}'",
                    op.symbol(),
                    wanted,
                    l,
                    r
                ),
            );
            return None;
        }
        if lt == rt {
            return Some((lt.clone(), None, None));
        }
        {
            let ExprKind::Binary { lhs, rhs, .. } = &mut expr.kind else {
                return None;
            };
            if self.fold_expr_to(rhs, lt) {
                return Some((lt.clone(), None, None));
            }
            if self.fold_expr_to(lhs, rt) {
                return Some((rt.clone(), None, None));
            }
        }
        let promote = |small: &Type, big: &Type| -> Option<Conversion> {
            match (small, big) {
                (Type::I32, Type::I64) => Some(Conversion::I32ToI64),
                (Type::U32, Type::I64) => Some(Conversion::U32ToI64),
                (Type::I32, Type::F64) if !integer_only => Some(Conversion::I32ToF64),
                (Type::U32, Type::F64) if !integer_only => Some(Conversion::U32ToF64),
                _ => None,
            }
        };
        if let Some(conv) = promote(rt, lt) {
            return Some((lt.clone(), None, Some(conv)));
        }
        if let Some(conv) = promote(lt, rt) {
            return Some((rt.clone(), Some(conv), None));
        }
        let (l, r) = (self.type_name(lt), self.type_name(rt));
        self.error(
            span,
            "E1002",
            format!(
                "mismatched operand types for '{}': '{}' and '{}'",
                op.symbol(),
                l,
                r
            ),
        );
        None
    }

    // ---- literal folding ----

    /// Fold `expr` to `target` when it is a literal (or an array literal)
    /// whose value converts losslessly. Rewrites the node in place and
    /// returns whether the expression now has the target type. Re-folding
    /// an already-folded literal is a no-op.
    fn fold_expr_to(&mut self, expr: &mut Expr, target: &Type) -> bool {
        if expr.ty.as_ref() == Some(target) {
            return true;
        }
        match (&mut expr.kind, target) {
            (ExprKind::Literal(lit), _) => {
                if let Some(folded) = fold_literal(lit, target) {
                    *lit = folded;
                    expr.ty = Some(target.clone());
                    true
                } else {
                    false
                }
            }
            (ExprKind::ArrayLiteral(elements), Type::Array(elem_ty)) => {
                // Empty literal: refine in place. Non-empty: fold each
                // element to the target element type.
                if elements.is_empty() {
                    expr.ty = Some(target.clone());
                    return true;
                }
                let elem: &Type = elem_ty;
                let ok = elements.iter_mut().all(|e| {
                    if e.ty.as_ref() == Some(elem) {
                        return true;
                    }
                    if let ExprKind::Literal(lit) = &mut e.kind {
                        if let Some(folded) = fold_literal(lit, elem) {
                            *lit = folded;
                            e.ty = Some(elem.clone());
                            return true;
                        }
                    }
                    false
                });
                if ok {
                    expr.ty = Some(target.clone());
                }
                ok
            }
            _ => false,
        }
    }

    // ---- field access ----

    fn check_field(&mut self, expr: &mut Expr) -> Option<Type> {
        let span = expr.span;
        // Module alias and enum-variant heads rewrite the node entirely.
        let head_plan = {
            let ExprKind::Field {
                receiver, field, ..
            } = &expr.kind
            else {
                return None;
            };
            match &receiver.kind {
                ExprKind::Variable { name, .. } => {
                    let head = name.clone();
                    let member = field.clone();
                    match self.symbols.find(&head).and_then(|s| s.module) {
                        Some(module_index) => Some((Some((module_index, head, member)), None)),
                        None => {
                            if self.symbols.find(&head).is_none() {
                                self.ctx
                                    .registry
                                    .enum_by_name(&head)
                                    .map(|id| (None, Some((id, member))))
                            } else {
                                None
                            }
                        }
                    }
                }
                _ => None,
            }
        };
        if let Some((module_plan, enum_plan)) = head_plan {
            if let Some((module_index, alias, member)) = module_plan {
                return self.rewrite_module_access(expr, module_index, &alias, &member, span);
            }
            if let Some((enum_id, variant)) = enum_plan {
                return self.check_enum_construction(expr, enum_id, &variant, Vec::new(), span);
            }
        }
        let field = {
            let ExprKind::Field { field, .. } = &expr.kind else {
                return None;
            };
            field.clone()
        };
        let (receiver_ty, receiver_span) = {
            let ExprKind::Field { receiver, .. } = &mut expr.kind else {
                return None;
            };
            let ty = self.check_expr(receiver)?;
            (ty, receiver.span)
        };
        let (field_index, field_ty) = self.struct_field(&receiver_ty, &field, receiver_span)?;
        let ExprKind::Field { index, .. } = &mut expr.kind else {
            return None;
        };
        *index = Some(field_index);
        Some(field_ty)
    }

    /// `alias.name` becomes a direct global reference to the exported slot.
    fn rewrite_module_access(
        &mut self,
        expr: &mut Expr,
        module_index: u8,
        alias: &str,
        member: &str,
        span: Span,
    ) -> Option<Type> {
        let export = {
            let Some(unit) = self.loader.unit_by_module_index(module_index) else {
                self.error(span, "E1021", format!("module '{}' is not loaded", alias));
                return None;
            };
            match unit.export(member) {
                Some(export) => Ok((export.slot, export.public)),
                None => Err(unit.name.clone()),
            }
        };
        let (slot, public) = match export {
            Ok(pair) => pair,
            Err(module_name) => {
                self.error(
                    span,
                    "E1001",
                    format!("module '{}' has no member '{}'", module_name, member),
                );
                return None;
            }
        };
        if !public {
            let diag = Diagnostic::new(
                "E1010",
                format!("'{}' is private to its module", member),
                self.file_span(span),
            )
            .with_help(format!("mark '{}' as 'pub' where it is declared", member));
            self.error_diag(diag);
            return None;
        }
        expr.kind = ExprKind::Variable {
            name: format!("{}.{}", alias, member),
            slot: Some(slot),
        };
        self.ctx.global_type(slot).cloned()
    }

    fn check_enum_construction(
        &mut self,
        expr: &mut Expr,
        enum_id: EnumId,
        variant_name: &str,
        mut args: Vec<Expr>,
        span: Span,
    ) -> Option<Type> {
        let (enum_name, generics, variant_index, variant) = {
            let descriptor = self.ctx.registry.enum_type(enum_id)?;
            let enum_name = descriptor.name.clone();
            let Some(variant_index) = descriptor.variant_index(variant_name) else {
                self.error(
                    span,
                    "E1011",
                    format!("enum '{}' has no variant '{}'", enum_name, variant_name),
                );
                return None;
            };
            (
                enum_name,
                descriptor.generics.clone(),
                variant_index,
                descriptor.variants[variant_index].clone(),
            )
        };
        if variant.field_types.len() != args.len() {
            self.error(
                span,
                "E1005",
                format!(
                    "variant '{}.{}' takes {} argument(s), got {}",
                    enum_name,
                    variant_name,
                    variant.field_types.len(),
                    args.len()
                ),
            );
            return None;
        }
        // Deduce generic arguments from the payload, if any.
        let final_id = if generics.is_empty() {
            enum_id
        } else {
            let mut bindings = HashMap::new();
            for (param, arg) in variant.field_types.iter().zip(args.iter()) {
                let arg_ty = arg.ty.clone()?;
                if !unify(param, &arg_ty, &mut bindings) {
                    let (want, got) = (self.type_name(param), self.type_name(&arg_ty));
                    self.error(
                        arg.span,
                        "E1006",
                        format!("variant field expects '{}', got '{}'", want, got),
                    );
                    return None;
                }
            }
            let mut type_args = Vec::new();
            for g in &generics {
                match bindings.get(g) {
                    Some(ty) => type_args.push(ty.clone()),
                    None => {
                        self.error(
                            span,
                            "E1018",
                            format!(
                                "cannot deduce generic parameter '{}' for enum '{}'",
                                g, enum_name
                            ),
                        );
                        return None;
                    }
                }
            }
            match self.ctx.registry.instantiate_enum(enum_id, &type_args) {
                Ok(id) => id,
                Err(message) => {
                    self.error(span, "E1018", message);
                    return None;
                }
            }
        };
        // Concrete field checks against the (possibly instantiated) variant.
        let concrete = self.ctx.registry.enum_type(final_id)?.variants[variant_index].clone();
        for (arg, want) in args.iter_mut().zip(&concrete.field_types) {
            let Some(got) = arg.ty.clone() else { continue };
            if got != *want && !self.fold_expr_to(arg, want) {
                let (want, got) = (self.type_name(want), self.type_name(&got));
                self.error(
                    arg.span,
                    "E1006",
                    format!("variant field expects '{}', got '{}'", want, got),
                );
            }
        }
        expr.kind = ExprKind::Call {
            callee: Box::new(Expr::new(
                ExprKind::Variable {
                    name: format!("{}.{}", enum_name, variant_name),
                    slot: None,
                },
                span,
            )),
            generic_args: Vec::new(),
            args,
            target: Some(CallTarget::EnumVariant {
                enum_id: final_id,
                variant: variant_index as u8,
            }),
        };
        Some(Type::Enum(final_id))
    }

    // ---- calls ----

    fn check_call(&mut self, expr: &mut Expr) -> Option<Type> {
        let span = expr.span;
        self.normalize_callee(expr, span)?;
        // Enum constructions are fully resolved by normalization.
        if let ExprKind::Call {
            target: Some(CallTarget::EnumVariant { enum_id, .. }),
            ..
        } = &expr.kind
        {
            return Some(Type::Enum(*enum_id));
        }
        let (name, preset_slot, generic_args) = {
            let ExprKind::Call {
                callee,
                generic_args,
                ..
            } = &expr.kind
            else {
                return None;
            };
            match &callee.kind {
                ExprKind::Variable { name, slot } => {
                    (name.clone(), *slot, generic_args.clone())
                }
                _ => {
                    self.error(span, "E1022", "expression is not callable");
                    return None;
                }
            }
        };

        // Builtins are checked before user functions.
        if preset_slot.is_none() {
            if let Some((native_index, def)) = natives::lookup(&name) {
                return self.check_native_call(expr, &name, native_index, def, span);
            }
        }

        // User function (by preset slot from module rewriting, or by name).
        let fn_slot = match preset_slot {
            Some(slot) => slot,
            None => match self.symbols.find(&name) {
                Some(symbol) if matches!(symbol.ty, Type::Function(_)) => symbol.slot,
                Some(_) => {
                    self.error(span, "E1022", format!("'{}' is not a function", name));
                    return None;
                }
                None => {
                    let shadow_span = self.symbols.find_any(&name).map(|s| s.span);
                    let mut diag = Diagnostic::new(
                        "E1004",
                        format!("undefined function '{}'", name),
                        self.file_span(span),
                    );
                    if let Some(previous) = shadow_span {
                        diag = diag.with_secondary(self.file_span(previous), "defined here");
                    }
                    self.error_diag(diag);
                    return None;
                }
            },
        };
        self.check_user_call(expr, fn_slot, &name, &generic_args, span)
    }

    fn check_native_call(
        &mut self,
        expr: &mut Expr,
        name: &str,
        native_index: u8,
        def: &natives::NativeDef,
        span: Span,
    ) -> Option<Type> {
        let argc = {
            let ExprKind::Call { args, .. } = &expr.kind else {
                return None;
            };
            args.len()
        };
        if !def.arity.accepts(argc as u8) {
            self.error(
                span,
                "E1005",
                format!(
                    "builtin '{}' takes {} argument(s), got {}",
                    name,
                    def.arity.describe(),
                    argc
                ),
            );
            return None;
        }
        let mut arg_types = Vec::with_capacity(argc);
        for i in 0..argc {
            let ty = {
                let ExprKind::Call { args, .. } = &mut expr.kind else {
                    return None;
                };
                self.check_expr(&mut args[i])?
            };
            arg_types.push(ty);
        }
        // `push` folds its value argument to the array's element type.
        if name == "push" && argc == 2 {
            if let Type::Array(elem) = arg_types[0].clone() {
                let elem: Type = *elem;
                if elem != Type::Nil {
                    let folded = {
                        let ExprKind::Call { args, .. } = &mut expr.kind else {
                            return None;
                        };
                        self.fold_expr_to(&mut args[1], &elem)
                    };
                    if folded {
                        arg_types[1] = elem;
                    }
                }
            }
        }
        match check_builtin_call(name, &arg_types) {
            Ok(result) => {
                let ExprKind::Call { target, .. } = &mut expr.kind else {
                    return None;
                };
                *target = Some(CallTarget::Native(native_index));
                Some(result)
            }
            Err(message) => {
                self.error(span, "E1006", message);
                None
            }
        }
    }

    /// Rewrite qualified callees (`Type.method`, `alias.name`, instance
    /// method receivers) into flat `Variable` callees.
    fn normalize_callee(&mut self, expr: &mut Expr, span: Span) -> Option<()> {
        enum Plan {
            Done,
            Module(u8, String, String),
            Static(String),
            Enum(EnumId, String),
            Instance,
        }
        let plan = {
            let ExprKind::Call { callee, .. } = &expr.kind else {
                return Some(());
            };
            match &callee.kind {
                ExprKind::Variable { .. } => Plan::Done,
                ExprKind::Field {
                    receiver, field, ..
                } => {
                    if let ExprKind::Variable { name, .. } = &receiver.kind {
                        match self.symbols.find(name) {
                            Some(symbol) => match symbol.module {
                                Some(index) => Plan::Module(index, name.clone(), field.clone()),
                                None => Plan::Instance,
                            },
                            None => {
                                if self.ctx.registry.struct_by_name(name).is_some() {
                                    Plan::Static(format!("{}_{}", name, field))
                                } else if let Some(enum_id) =
                                    self.ctx.registry.enum_by_name(name)
                                {
                                    Plan::Enum(enum_id, field.clone())
                                } else {
                                    Plan::Instance
                                }
                            }
                        }
                    } else {
                        Plan::Instance
                    }
                }
                _ => {
                    self.error(span, "E1022", "expression is not callable");
                    return None;
                }
            }
        };
        match plan {
            Plan::Done => Some(()),
            Plan::Static(mangled) => {
                let ExprKind::Call { callee, .. } = &mut expr.kind else {
                    return None;
                };
                callee.kind = ExprKind::Variable {
                    name: mangled,
                    slot: None,
                };
                Some(())
            }
            Plan::Module(module_index, alias, member) => {
                let mut head = Expr::new(
                    ExprKind::Variable {
                        name: alias.clone(),
                        slot: None,
                    },
                    span,
                );
                self.rewrite_module_access(&mut head, module_index, &alias, &member, span)?;
                let ExprKind::Call { callee, .. } = &mut expr.kind else {
                    return None;
                };
                **callee = head;
                Some(())
            }
            Plan::Enum(enum_id, variant) => {
                let mut args = {
                    let ExprKind::Call { args, .. } = &mut expr.kind else {
                        return None;
                    };
                    std::mem::take(args)
                };
                // Arguments are checked before deduction.
                for arg in args.iter_mut() {
                    self.check_expr(arg)?;
                }
                self.check_enum_construction(expr, enum_id, &variant, args, span)?;
                Some(())
            }
            Plan::Instance => {
                // Check the receiver to learn its struct type, then rewrite
                // to `Struct_method(receiver, args...)`.
                let receiver_ty = {
                    let ExprKind::Call { callee, .. } = &mut expr.kind else {
                        return None;
                    };
                    let ExprKind::Field { receiver, .. } = &mut callee.kind else {
                        return None;
                    };
                    self.check_expr(receiver)?
                };
                let Type::Struct(id) = receiver_ty else {
                    let name = self.type_name(&receiver_ty);
                    self.error(
                        span,
                        "E1022",
                        format!("method call on non-struct type '{}'", name),
                    );
                    return None;
                };
                let base = {
                    let descriptor = self.ctx.registry.struct_type(id)?;
                    descriptor
                        .name
                        .split('<')
                        .next()
                        .unwrap_or(&descriptor.name)
                        .to_string()
                };
                let ExprKind::Call { callee, args, .. } = &mut expr.kind else {
                    return None;
                };
                let ExprKind::Field {
                    receiver, field, ..
                } = &mut callee.kind
                else {
                    return None;
                };
                let mangled = format!("{}_{}", base, field);
                let receiver_expr = std::mem::replace(
                    receiver,
                    Box::new(Expr::new(ExprKind::Literal(LiteralValue::Nil), span)),
                );
                args.insert(0, *receiver_expr);
                callee.kind = ExprKind::Variable {
                    name: mangled,
                    slot: None,
                };
                Some(())
            }
        }
    }

    fn check_user_call(
        &mut self,
        expr: &mut Expr,
        fn_slot: u8,
        name: &str,
        generic_args: &[TypeExpr],
        span: Span,
    ) -> Option<Type> {
        let Some(Type::Function(signature)) = self.ctx.global_type(fn_slot).cloned() else {
            self.error(span, "E1022", format!("'{}' is not a function", name));
            return None;
        };
        let decl = self.function_decls.get(&fn_slot).cloned();
        let is_generic = decl.as_ref().is_some_and(|d| !d.generics.is_empty());

        let argc = {
            let ExprKind::Call { args, .. } = &expr.kind else {
                return None;
            };
            args.len()
        };
        if argc != signature.params.len() {
            self.error(
                span,
                "E1005",
                format!(
                    "function '{}' takes {} argument(s), got {}",
                    name,
                    signature.params.len(),
                    argc
                ),
            );
            return None;
        }

        // Check arguments first; generic deduction needs their types.
        let mut arg_types = Vec::with_capacity(argc);
        for i in 0..argc {
            let ty = {
                let ExprKind::Call { args, .. } = &mut expr.kind else {
                    return None;
                };
                self.check_expr(&mut args[i])?
            };
            arg_types.push(ty);
        }

        if !is_generic {
            if !self.check_call_arguments(expr, &arg_types, &signature.params) {
                return None;
            }
            let ExprKind::Call { target, .. } = &mut expr.kind else {
                return None;
            };
            *target = Some(CallTarget::Function { slot: fn_slot });
            return Some(signature.ret.clone());
        }

        // Generic call: explicit arguments or unification.
        let decl = decl?;
        let mut bindings: HashMap<String, Type> = HashMap::new();
        if !generic_args.is_empty() {
            if generic_args.len() != decl.generics.len() {
                self.error(
                    span,
                    "E1018",
                    format!(
                        "function '{}' expects {} generic argument(s), got {}",
                        name,
                        decl.generics.len(),
                        generic_args.len()
                    ),
                );
                return None;
            }
            for (g, te) in decl.generics.iter().zip(generic_args) {
                let ty = self.resolve_type_expr(te)?;
                bindings.insert(g.clone(), ty);
            }
        } else {
            for (param, arg_ty) in signature.params.iter().zip(&arg_types) {
                if !unify(param, arg_ty, &mut bindings) {
                    let (want, got) = (self.type_name(param), self.type_name(arg_ty));
                    self.error(
                        span,
                        "E1006",
                        format!(
                            "cannot unify argument of type '{}' with parameter '{}'",
                            got, want
                        ),
                    );
                    return None;
                }
            }
            for g in &decl.generics {
                if !bindings.contains_key(g) {
                    self.error(
                        span,
                        "E1018",
                        format!("cannot deduce generic parameter '{}' of '{}'", g, name),
                    );
                    return None;
                }
            }
        }

        // Substituted parameter checks (folding included).
        let params: Vec<Type> = signature
            .params
            .iter()
            .map(|p| p.substitute(&bindings))
            .collect();
        if !self.check_call_arguments(expr, &arg_types, &params) {
            return None;
        }
        let ret = signature.ret.substitute(&bindings);
        let spec_slot = self.get_or_create_specialization(&decl, &bindings, span)?;
        let ExprKind::Call { target, .. } = &mut expr.kind else {
            return None;
        };
        *target = Some(CallTarget::Function { slot: spec_slot });
        Some(ret)
    }

    /// Per-argument exact-or-folded type checks.
    fn check_call_arguments(
        &mut self,
        expr: &mut Expr,
        arg_types: &[Type],
        params: &[Type],
    ) -> bool {
        for (i, (got, want)) in arg_types.iter().zip(params).enumerate() {
            if got == want {
                continue;
            }
            let (folded, arg_span) = {
                let ExprKind::Call { args, .. } = &mut expr.kind else {
                    return false;
                };
                (self.fold_expr_to(&mut args[i], want), args[i].span)
            };
            if !folded {
                let (want, got) = (self.type_name(want), self.type_name(got));
                self.error(
                    arg_span,
                    "E1006",
                    format!("argument type mismatch: expected '{}', got '{}'", want, got),
                );
                return false;
            }
        }
        true
    }

    /// Monomorphize a generic declaration for one set of bindings, checking
    /// the clone with concrete types and queueing it for emission.
    fn get_or_create_specialization(
        &mut self,
        decl: &FunctionDecl,
        bindings: &HashMap<String, Type>,
        span: Span,
    ) -> Option<u8> {
        let mut mangled = decl.name.clone();
        for g in &decl.generics {
            mangled.push('$');
            mangled.push_str(&bindings[g].name(&self.ctx.registry));
        }
        if let Some(&slot) = self.spec_slots.get(&mangled) {
            return Some(slot);
        }
        debug!(specialization = %mangled, "monomorphizing");
        let Some(Type::Function(signature)) =
            decl.slot.and_then(|s| self.ctx.global_type(s)).cloned()
        else {
            return None;
        };
        let concrete = FunctionType {
            ret: signature.ret.substitute(bindings),
            params: signature
                .params
                .iter()
                .map(|p| p.substitute(bindings))
                .collect(),
        };
        let spec_slot = self.declare_global_checked(
            &mangled,
            Type::Function(Box::new(concrete.clone())),
            false,
            span,
        )?;
        // Insert before checking the body so recursive calls terminate.
        self.spec_slots.insert(mangled.clone(), spec_slot);

        let mut clone = decl.clone();
        clone.name = mangled;
        clone.generics.clear();
        clone.slot = Some(spec_slot);
        for (param, ty) in clone.params.iter_mut().zip(&concrete.params) {
            let name = param.name.clone();
            param.slot = match self.ctx.declare_global(&name, ty.clone(), false) {
                Ok(slot) => Some(slot),
                Err(message) => {
                    self.error(param.span, "E1020", message);
                    None
                }
            };
        }
        self.generic_frames.push(bindings.clone());
        self.check_function_body(&mut clone, true);
        self.generic_frames.pop();
        self.specializations.push((spec_slot, clone));
        Some(spec_slot)
    }

    // ---- casts ----

    fn check_cast(&mut self, expr: &mut Expr) -> Option<Type> {
        let span = expr.span;
        let target_expr = {
            let ExprKind::Cast { target, .. } = &expr.kind else {
                return None;
            };
            target.clone()
        };
        let operand_ty = {
            let ExprKind::Cast { operand, .. } = &mut expr.kind else {
                return None;
            };
            self.check_expr(operand)?
        };
        let target_ty = self.resolve_type_expr(&target_expr)?;
        if operand_ty == target_ty {
            // Casting a value to its own type is a no-op.
            let ExprKind::Cast { conversion, .. } = &mut expr.kind else {
                return None;
            };
            *conversion = None;
            return Some(target_ty);
        }
        let allowed = (operand_ty.is_numeric() && target_ty.is_numeric())
            || (operand_ty.is_numeric() && target_ty == Type::Bool)
            || (operand_ty == Type::Bool && target_ty.is_numeric())
            || (operand_ty.is_primitive() && target_ty == Type::Str);
        if !allowed {
            let (from, to) = (self.type_name(&operand_ty), self.type_name(&target_ty));
            self.error(span, "E1007", format!("cannot cast '{}' to '{}'", from, to));
            return None;
        }
        // Literal operands fold at compile time; the node becomes the
        // converted literal.
        let folded = {
            let ExprKind::Cast { operand, .. } = &expr.kind else {
                return None;
            };
            match &operand.kind {
                ExprKind::Literal(lit) => cast_literal(lit, &target_ty),
                _ => None,
            }
        };
        if let Some(folded) = folded {
            expr.kind = ExprKind::Literal(folded);
            return Some(target_ty);
        }
        let conversion = conversion_for(&operand_ty, &target_ty);
        let ExprKind::Cast {
            conversion: conv, ..
        } = &mut expr.kind
        else {
            return None;
        };
        *conv = conversion;
        Some(target_ty)
    }
}

/// Structural unification of a (possibly generic) parameter type against a
/// concrete argument type.
fn unify(param: &Type, arg: &Type, bindings: &mut HashMap<String, Type>) -> bool {
    match (param, arg) {
        (Type::Generic(name), concrete) => match bindings.get(name) {
            Some(bound) => bound == concrete,
            None => {
                bindings.insert(name.clone(), concrete.clone());
                true
            }
        },
        (Type::Array(p), Type::Array(a)) => unify(p, a, bindings),
        (Type::Function(p), Type::Function(a)) => {
            p.params.len() == a.params.len()
                && unify(&p.ret, &a.ret, bindings)
                && p.params
                    .iter()
                    .zip(&a.params)
                    .all(|(x, y)| unify(x, y, bindings))
        }
        _ => param == arg,
    }
}

/// Lossless literal conversion used by declarations, arguments and binary
/// operands: integer literals widen to any integer type that holds the
/// value, and integers convert exactly to f64.
fn fold_literal(lit: &LiteralValue, target: &Type) -> Option<LiteralValue> {
    let int_value: Option<i128> = match lit {
        LiteralValue::I32(v) => Some(*v as i128),
        LiteralValue::I64(v) => Some(*v as i128),
        LiteralValue::U32(v) => Some(*v as i128),
        LiteralValue::U64(v) => Some(*v as i128),
        _ => None,
    };
    match (int_value, target) {
        (Some(v), Type::I32) => i32::try_from(v).ok().map(LiteralValue::I32),
        (Some(v), Type::I64) => i64::try_from(v).ok().map(LiteralValue::I64),
        (Some(v), Type::U32) => u32::try_from(v).ok().map(LiteralValue::U32),
        (Some(v), Type::U64) => u64::try_from(v).ok().map(LiteralValue::U64),
        (Some(v), Type::F64) => Some(LiteralValue::F64(v as f64)),
        _ => None,
    }
}

/// `as`-cast folding on literal operands: wrapping integer conversions,
/// truncating float-to-int, boolean and string conversions.
fn cast_literal(lit: &LiteralValue, target: &Type) -> Option<LiteralValue> {
    let as_f64 = |lit: &LiteralValue| -> Option<f64> {
        Some(match lit {
            LiteralValue::I32(v) => *v as f64,
            LiteralValue::I64(v) => *v as f64,
            LiteralValue::U32(v) => *v as f64,
            LiteralValue::U64(v) => *v as f64,
            LiteralValue::F64(v) => *v,
            LiteralValue::Bool(v) => *v as u8 as f64,
            _ => return None,
        })
    };
    let as_u64_bits = |lit: &LiteralValue| -> Option<u64> {
        Some(match lit {
            LiteralValue::I32(v) => *v as i64 as u64,
            LiteralValue::I64(v) => *v as u64,
            LiteralValue::U32(v) => *v as u64,
            LiteralValue::U64(v) => *v,
            LiteralValue::F64(v) => *v as i64 as u64,
            LiteralValue::Bool(v) => *v as u64,
            _ => return None,
        })
    };
    match target {
        Type::I32 => Some(LiteralValue::I32(as_u64_bits(lit)? as u32 as i32)),
        Type::I64 => Some(LiteralValue::I64(as_u64_bits(lit)? as i64)),
        Type::U32 => Some(LiteralValue::U32(as_u64_bits(lit)? as u32)),
        Type::U64 => Some(LiteralValue::U64(as_u64_bits(lit)?)),
        Type::F64 => Some(LiteralValue::F64(as_f64(lit)?)),
        Type::Bool => Some(LiteralValue::Bool(as_f64(lit)? != 0.0)),
        Type::Str => Some(LiteralValue::Str(match lit {
            LiteralValue::I32(v) => v.to_string(),
            LiteralValue::I64(v) => v.to_string(),
            LiteralValue::U32(v) => v.to_string(),
            LiteralValue::U64(v) => v.to_string(),
            LiteralValue::F64(v) => v.to_string(),
            LiteralValue::Bool(v) => v.to_string(),
            LiteralValue::Str(s) => s.clone(),
            LiteralValue::Nil => return None,
        })),
        _ => None,
    }
}

/// Runtime conversion tag for a checked, non-folded cast.
fn conversion_for(from: &Type, to: &Type) -> Option<Conversion> {
    use Conversion::*;
    Some(match (from, to) {
        (Type::I32, Type::I64) => I32ToI64,
        (Type::I32, Type::U32) => I32ToU32,
        (Type::I32, Type::U64) => I32ToU64,
        (Type::I32, Type::F64) => I32ToF64,
        (Type::I64, Type::I32) => I64ToI32,
        (Type::I64, Type::U32) => I64ToU32,
        (Type::I64, Type::U64) => I64ToU64,
        (Type::I64, Type::F64) => I64ToF64,
        (Type::U32, Type::I32) => U32ToI32,
        (Type::U32, Type::I64) => U32ToI64,
        (Type::U32, Type::U64) => U32ToU64,
        (Type::U32, Type::F64) => U32ToF64,
        (Type::U64, Type::I32) => U64ToI32,
        (Type::U64, Type::I64) => U64ToI64,
        (Type::U64, Type::U32) => U64ToU32,
        (Type::U64, Type::F64) => U64ToF64,
        (Type::F64, Type::I32) => F64ToI32,
        (Type::F64, Type::I64) => F64ToI64,
        (Type::F64, Type::U32) => F64ToU32,
        (Type::F64, Type::U64) => F64ToU64,
        (Type::I32, Type::Bool) => I32ToBool,
        (Type::I64, Type::Bool) => I64ToBool,
        (Type::U32, Type::Bool) => U32ToBool,
        (Type::U64, Type::Bool) => U64ToBool,
        (Type::F64, Type::Bool) => F64ToBool,
        (Type::Bool, Type::I32) => BoolToI32,
        (Type::Bool, Type::I64) => BoolToI64,
        (Type::Bool, Type::U32) => BoolToU32,
        (Type::Bool, Type::U64) => BoolToU64,
        (Type::Bool, Type::F64) => BoolToF64,
        (_, Type::Str) => ToString,
        _ => return None,
    })
}

/// Conservative all-paths-return analysis.
fn block_always_returns(block: &Block) -> bool {
    block.stmts.iter().any(stmt_always_returns)
}

fn stmt_always_returns(stmt: &Stmt) -> bool {
    match &stmt.kind {
        StmtKind::Return { .. } => true,
        StmtKind::Block(block) => block_always_returns(block),
        StmtKind::If {
            then_block,
            elifs,
            else_block,
            ..
        } => {
            else_block.as_ref().is_some_and(block_always_returns)
                && block_always_returns(then_block)
                && elifs.iter().all(|(_, b)| block_always_returns(b))
        }
        StmtKind::TryCatch {
            try_block,
            catch_block,
            ..
        } => block_always_returns(try_block) && block_always_returns(catch_block),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse;

    fn check(source: &str) -> (Vec<Stmt>, Vec<Diagnostic>, Context) {
        let mut ctx = Context::new();
        let mut loader = ModuleLoader::new(Vec::new());
        let mut symbols = SymbolTable::new();
        let mut decls = HashMap::new();
        let mut specs = HashMap::new();
        let (mut stmts, parse_diags) = parse(source, "test.orus");
        assert!(parse_diags.is_empty(), "parse errors: {:?}", parse_diags);
        let mut checker = TypeChecker::new(
            &mut ctx,
            &mut loader,
            &mut symbols,
            &mut decls,
            &mut specs,
            "test.orus",
            PathBuf::from("."),
        );
        checker.check_program(&mut stmts);
        let (_, diags) = checker.finish();
        (stmts, diags, ctx)
    }

    fn check_ok(source: &str) -> (Vec<Stmt>, Context) {
        let (stmts, diags, ctx) = check(source);
        assert!(diags.is_empty(), "unexpected diagnostics: {:#?}", diags);
        (stmts, ctx)
    }

    fn first_error(source: &str) -> Diagnostic {
        let (_, diags, _) = check(source);
        diags.into_iter().next().expect("expected a diagnostic")
    }

    #[test]
    fn test_literal_types_and_slots() {
        let (stmts, _) = check_ok("let x: i32 = 14\nlet y = x\n");
        let StmtKind::Declaration { slot, .. } = &stmts[0].kind else {
            panic!();
        };
        assert_eq!(*slot, Some(0));
        let StmtKind::Declaration { init, .. } = &stmts[1].kind else {
            panic!();
        };
        assert_eq!(init.ty, Some(Type::I32));
        let ExprKind::Variable { slot, .. } = &init.kind else {
            panic!();
        };
        assert_eq!(*slot, Some(0));
    }

    #[test]
    fn test_literal_widening_fold() {
        let (stmts, _) = check_ok("let x: i64 = 5\n");
        let StmtKind::Declaration { init, .. } = &stmts[0].kind else {
            panic!();
        };
        assert_eq!(init.kind, ExprKind::Literal(LiteralValue::I64(5)));
        assert_eq!(init.ty, Some(Type::I64));
    }

    #[test]
    fn test_negative_literal_rejects_u32() {
        let diag = first_error("let x: u32 = -1\n");
        assert_eq!(diag.code, "E1002");
    }

    #[test]
    fn test_promotion_records_conversion() {
        let (stmts, _) = check_ok("let a: i64 = 1000\nlet b = a + (1 + 2) * 1\nlet c: i32 = 3\nlet d = a + c\n");
        let StmtKind::Declaration { init, .. } = &stmts[3].kind else {
            panic!();
        };
        let ExprKind::Binary { rhs_conv, .. } = &init.kind else {
            panic!();
        };
        assert_eq!(*rhs_conv, Some(Conversion::I32ToI64));
        assert_eq!(init.ty, Some(Type::I64));
    }

    #[test]
    fn test_string_concat_marks_to_string() {
        let (stmts, _) = check_ok("let s = \"n = \" + 42\n");
        let StmtKind::Declaration { init, .. } = &stmts[0].kind else {
            panic!();
        };
        let ExprKind::Binary {
            lhs_conv, rhs_conv, ..
        } = &init.kind
        else {
            panic!();
        };
        assert_eq!(*lhs_conv, None);
        assert_eq!(*rhs_conv, Some(Conversion::ToString));
        assert_eq!(init.ty, Some(Type::Str));
    }

    #[test]
    fn test_modulo_rejects_floats() {
        let diag = first_error("let x = 1.5 % 2.0\n");
        assert_eq!(diag.code, "E1002");
    }

    #[test]
    fn test_condition_must_be_bool() {
        let diag = first_error("if 1 { print(\"x\") }\n");
        assert_eq!(diag.code, "E1003");
    }

    #[test]
    fn test_undefined_variable() {
        let diag = first_error("let x = missing\n");
        assert_eq!(diag.code, "E1001");
    }

    #[test]
    fn test_assignment_mutability() {
        let diag = first_error("let x = 1\nx = 2\n");
        assert_eq!(diag.code, "E1008");
        let (_, diags, _) = check("let mut x = 1\nx = 2\n");
        assert!(diags.is_empty());
    }

    #[test]
    fn test_const_rules() {
        let diag = first_error("const k = 1 + 2\n");
        assert_eq!(diag.code, "E1019");
        let diag = first_error("const k = 5\nk = 6\n");
        assert_eq!(diag.code, "E1009");
        // Const value is stored immediately.
        let (stmts, ctx) = check_ok("const k = 5\n");
        let StmtKind::Declaration { slot, .. } = &stmts[0].kind else {
            panic!();
        };
        assert_eq!(ctx.global_value(slot.unwrap()), Value::I32(5));
    }

    #[test]
    fn test_function_call_and_recursion() {
        let (stmts, _) = check_ok(
            "fn fact(n: i32) -> i32 { if n <= 1 { return 1 } return n * fact(n - 1) }\n",
        );
        let StmtKind::Function(decl) = &stmts[0].kind else {
            panic!();
        };
        assert_eq!(decl.slot, Some(0));
        assert_eq!(decl.params[0].slot, Some(1));
    }

    #[test]
    fn test_missing_return_detected() {
        let diag = first_error("fn f(x: i32) -> i32 { if x > 0 { return 1 } }\n");
        assert_eq!(diag.code, "E1014");
    }

    #[test]
    fn test_call_arity_and_types() {
        let diag = first_error("fn f(x: i32) -> i32 { return x }\nlet y = f(1, 2)\n");
        assert_eq!(diag.code, "E1005");
        let diag = first_error("fn f(x: i32) -> i32 { return x }\nlet y = f(true)\n");
        assert_eq!(diag.code, "E1006");
    }

    #[test]
    fn test_builtin_checked_first() {
        let (stmts, _) = check_ok("let a = [1, 2, 3]\nlet n = len(a)\n");
        let StmtKind::Declaration { init, .. } = &stmts[1].kind else {
            panic!();
        };
        let ExprKind::Call { target, .. } = &init.kind else {
            panic!();
        };
        assert!(matches!(target, Some(CallTarget::Native(_))));
        assert_eq!(init.ty, Some(Type::I32));
    }

    #[test]
    fn test_empty_array_refined_on_assignment() {
        let (stmts, _) = check_ok("let mut a = []\na = [1, 2]\n");
        let StmtKind::Declaration { init, .. } = &stmts[0].kind else {
            panic!();
        };
        assert_eq!(init.ty, Some(Type::Array(Box::new(Type::Nil))));
        let StmtKind::Assign { value, .. } = &stmts[1].kind else {
            panic!();
        };
        assert_eq!(value.ty, Some(Type::Array(Box::new(Type::I32))));
    }

    #[test]
    fn test_cast_folds_literals() {
        let (stmts, _) = check_ok("let x = 300 as u32\n");
        let StmtKind::Declaration { init, .. } = &stmts[0].kind else {
            panic!();
        };
        assert_eq!(init.kind, ExprKind::Literal(LiteralValue::U32(300)));
    }

    #[test]
    fn test_cast_string_source_rejected() {
        let diag = first_error("let x = \"5\" as i32\n");
        assert_eq!(diag.code, "E1007");
    }

    #[test]
    fn test_struct_literal_and_field_access() {
        let (stmts, _) = check_ok(
            "struct Point { x: i32, y: i32 }\nlet p = Point { y: 2, x: 1 }\nlet a = p.x\n",
        );
        let StmtKind::Declaration { init, .. } = &stmts[1].kind else {
            panic!();
        };
        // Fields are reordered to declaration order.
        let ExprKind::StructLiteral { fields, .. } = &init.kind else {
            panic!();
        };
        assert_eq!(fields[0].0, "x");
        let StmtKind::Declaration { init, .. } = &stmts[2].kind else {
            panic!();
        };
        let ExprKind::Field { index, .. } = &init.kind else {
            panic!();
        };
        assert_eq!(*index, Some(0));
        assert_eq!(init.ty, Some(Type::I32));
    }

    #[test]
    fn test_unknown_field() {
        let diag =
            first_error("struct Point { x: i32, y: i32 }\nlet p = Point { x: 1, y: 2 }\nlet z = p.z\n");
        assert_eq!(diag.code, "E1012");
    }

    #[test]
    fn test_method_call_rewrites_to_mangled() {
        let (stmts, _) = check_ok(
            "struct Point { x: i32, y: i32 }\n\
             impl Point { fn sum(self) -> i32 { return self.x + self.y } }\n\
             let p = Point { x: 1, y: 2 }\nlet s = p.sum()\n",
        );
        let StmtKind::Declaration { init, .. } = &stmts[3].kind else {
            panic!();
        };
        let ExprKind::Call { callee, args, .. } = &init.kind else {
            panic!();
        };
        let ExprKind::Variable { name, .. } = &callee.kind else {
            panic!();
        };
        assert_eq!(name, "Point_sum");
        assert_eq!(args.len(), 1); // receiver prepended
    }

    #[test]
    fn test_generic_monomorphization() {
        let mut ctx = Context::new();
        let mut loader = ModuleLoader::new(Vec::new());
        let mut symbols = SymbolTable::new();
        let mut decls = HashMap::new();
        let mut specs = HashMap::new();
        let (mut stmts, parse_diags) = parse(
            "fn id<T>(x: T) -> T { return x }\nlet a = id(5)\nlet b = id(\"s\")\nlet c = id(7)\n",
            "test.orus",
        );
        assert!(parse_diags.is_empty());
        let mut checker = TypeChecker::new(
            &mut ctx,
            &mut loader,
            &mut symbols,
            &mut decls,
            &mut specs,
            "test.orus",
            PathBuf::from("."),
        );
        checker.check_program(&mut stmts);
        let (specializations, diags) = checker.finish();
        assert!(diags.is_empty(), "{:#?}", diags);
        // Two distinct instantiations, the third call reuses the first.
        assert_eq!(specializations.len(), 2);
        let StmtKind::Declaration { init, .. } = &stmts[1].kind else {
            panic!();
        };
        assert_eq!(init.ty, Some(Type::I32));
        let StmtKind::Declaration { init, .. } = &stmts[2].kind else {
            panic!();
        };
        assert_eq!(init.ty, Some(Type::Str));
    }

    #[test]
    fn test_enum_construction() {
        let (stmts, _) = check_ok(
            "enum Shape { Circle(r: f64), Dot }\nlet c = Shape.Circle(1.5)\nlet d = Shape.Dot\n",
        );
        let StmtKind::Declaration { init, .. } = &stmts[1].kind else {
            panic!();
        };
        let ExprKind::Call { target, .. } = &init.kind else {
            panic!();
        };
        assert!(matches!(
            target,
            Some(CallTarget::EnumVariant { variant: 0, .. })
        ));
        let StmtKind::Declaration { init, .. } = &stmts[2].kind else {
            panic!();
        };
        assert!(matches!(init.ty, Some(Type::Enum(_))));
    }

    #[test]
    fn test_scope_shadowing() {
        let (_, diags, _) = check("let x = 1\n{ let x = 2\nprint(\"{}\", x) }\n");
        assert!(diags.is_empty(), "{:#?}", diags);
        let diag = first_error("let x = 1\nlet x = 2\n");
        assert_eq!(diag.code, "E1013");
    }

    #[test]
    fn test_for_loop_iterator_scoping() {
        let (_, diags, _) = check("for i in 0..3 { print(\"{}\", i) }\nlet x = i\n");
        // The iterator is out of scope after the loop.
        assert!(diags.iter().any(|d| d.code == "E1001"));
    }

    #[test]
    fn test_fold_idempotence() {
        // Checking an already-folded literal again changes nothing.
        let mut lit = LiteralValue::I64(5);
        let folded = fold_literal(&lit, &Type::I64).unwrap();
        assert_eq!(folded, lit);
        lit = folded;
        assert_eq!(fold_literal(&lit, &Type::I64).unwrap(), lit);
    }

    #[test]
    fn test_format_print_placeholder_count() {
        let diag = first_error("print(\"{} {}\", 1)\n");
        assert_eq!(diag.code, "E1026");
    }

    #[test]
    fn test_bitwise_requires_same_type() {
        let diag = first_error("let a: i64 = 1\nlet b: u32 = 2\nlet c = a & b\n");
        assert_eq!(diag.code, "E1002");
        let (_, diags, _) = check("let a: i64 = 7\nlet c = a & 3\n");
        assert!(diags.is_empty(), "{:#?}", diags);
    }
}
