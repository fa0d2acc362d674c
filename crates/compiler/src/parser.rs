//! Parser for Orus.
//!
//! Recursive-descent statements with a Pratt expression core. Statements
//! end at a newline, a `;`, or the closing brace of a block-shaped
//! statement (`if n <= 1 { return 1 } return ...` is two statements).
//! Errors enter panic mode: tokens are discarded until a newline or a
//! statement keyword, which suppresses cascades.

use crate::ast::{
    AssignTarget, BinaryOp, Block, DeclKind, Expr, ExprKind, FunctionDecl, LiteralValue,
    LogicalOp, Param, Span, Stmt, StmtKind, TypeExpr, TypeExprKind, UnaryOp,
};
use crate::diagnostics::{Diagnostic, FileSpan};
use crate::lexer::{scan, IntSuffix, Token, TokenKind};

/// Parse a source file into top-level statements plus any diagnostics.
pub fn parse(source: &str, file: &str) -> (Vec<Stmt>, Vec<Diagnostic>) {
    let tokens = scan(source);
    Parser::new(tokens, file).run()
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    file: String,
    diagnostics: Vec<Diagnostic>,
    panic_mode: bool,
}

impl Parser {
    fn new(tokens: Vec<Token>, file: &str) -> Self {
        Parser {
            tokens,
            pos: 0,
            file: file.to_string(),
            diagnostics: Vec::new(),
            panic_mode: false,
        }
    }

    fn run(mut self) -> (Vec<Stmt>, Vec<Diagnostic>) {
        let mut stmts = Vec::new();
        self.skip_newlines();
        while !self.check(&TokenKind::Eof) {
            self.parse_declaration(&mut stmts);
            self.skip_newlines();
        }
        (stmts, self.diagnostics)
    }

    // ---- token plumbing ----

    fn peek(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn peek_kind(&self) -> &TokenKind {
        &self.peek().kind
    }

    fn peek_at(&self, offset: usize) -> &Token {
        &self.tokens[(self.pos + offset).min(self.tokens.len() - 1)]
    }

    fn previous(&self) -> &Token {
        &self.tokens[self.pos.saturating_sub(1)]
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        token
    }

    fn check(&self, kind: &TokenKind) -> bool {
        self.peek_kind() == kind
    }

    fn matches(&mut self, kind: &TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn span_of(&self, token: &Token) -> Span {
        Span::new(token.line, token.column, token.length())
    }

    fn here(&self) -> Span {
        self.span_of(self.peek())
    }

    fn file_span(&self, span: Span) -> FileSpan {
        FileSpan {
            file: self.file.clone(),
            span,
        }
    }

    fn error_at(&mut self, span: Span, code: &'static str, message: impl Into<String>) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        self.diagnostics
            .push(Diagnostic::new(code, message, self.file_span(span)));
    }

    fn consume(&mut self, kind: &TokenKind, message: &str) -> Option<Token> {
        if self.check(kind) {
            return Some(self.advance());
        }
        let span = self.here();
        let found = self.peek().to_string();
        self.error_at(span, "E0002", format!("{}, found {}", message, found));
        None
    }

    fn consume_identifier(&mut self, what: &str) -> Option<Token> {
        if self.check(&TokenKind::Identifier) {
            return Some(self.advance());
        }
        let span = self.here();
        let found = self.peek().to_string();
        self.error_at(span, "E0002", format!("expected {}, found {}", what, found));
        None
    }

    fn skip_newlines(&mut self) {
        while self.check(&TokenKind::Newline) || self.check(&TokenKind::Semicolon) {
            self.advance();
        }
    }

    /// Discard tokens until a statement boundary.
    fn synchronize(&mut self) {
        self.panic_mode = false;
        while !self.check(&TokenKind::Eof) {
            if matches!(
                self.peek_kind(),
                TokenKind::Newline | TokenKind::Semicolon | TokenKind::RightBrace
            ) {
                return;
            }
            if self.peek_kind().starts_statement() {
                return;
            }
            self.advance();
        }
    }

    // ---- declarations and statements ----

    fn parse_declaration(&mut self, out: &mut Vec<Stmt>) {
        // Surface scan errors as diagnostics here, with their position.
        if let TokenKind::Error(message) = self.peek_kind().clone() {
            let span = self.here();
            self.advance();
            self.error_at(span, "E0001", message);
            self.synchronize();
            return;
        }
        let public = self.matches(&TokenKind::Pub);
        let stmt = match self.peek_kind() {
            TokenKind::Fn => self.function_statement(public, None),
            TokenKind::Struct => self.struct_declaration(public),
            TokenKind::Enum => self.enum_declaration(public),
            TokenKind::Impl => {
                self.impl_block(out);
                None
            }
            TokenKind::Let | TokenKind::Static | TokenKind::Const => {
                self.variable_declaration(public)
            }
            _ => {
                if public {
                    let span = self.here();
                    self.error_at(span, "E0002", "expected a declaration after 'pub'");
                }
                self.statement()
            }
        };
        if let Some(stmt) = stmt {
            out.push(stmt);
        }
        if self.panic_mode {
            self.synchronize();
        }
    }

    fn statement(&mut self) -> Option<Stmt> {
        let stmt = match self.peek_kind() {
            TokenKind::If => self.if_statement(),
            TokenKind::While => self.while_statement(),
            TokenKind::For => self.for_statement(),
            TokenKind::Return => self.return_statement(),
            TokenKind::Break => {
                let span = self.here();
                self.advance();
                self.end_of_statement();
                Some(Stmt {
                    kind: StmtKind::Break,
                    span,
                })
            }
            TokenKind::Continue => {
                let span = self.here();
                self.advance();
                self.end_of_statement();
                Some(Stmt {
                    kind: StmtKind::Continue,
                    span,
                })
            }
            TokenKind::Try => self.try_statement(),
            TokenKind::Use => self.use_statement(),
            TokenKind::Print => self.print_statement(true),
            TokenKind::PrintNoNewline => self.print_statement(false),
            TokenKind::LeftBrace => {
                let span = self.here();
                let mut block = self.block()?;
                block.scoped = true;
                Some(Stmt {
                    kind: StmtKind::Block(block),
                    span,
                })
            }
            _ => self.expression_statement(),
        };
        stmt
    }

    /// Statements that do not end with `}` must be followed by a separator.
    fn end_of_statement(&mut self) {
        if matches!(
            self.peek_kind(),
            TokenKind::Newline
                | TokenKind::Semicolon
                | TokenKind::RightBrace
                | TokenKind::Eof
        ) {
            if !self.check(&TokenKind::RightBrace) && !self.check(&TokenKind::Eof) {
                self.advance();
            }
            return;
        }
        let span = self.here();
        let found = self.peek().to_string();
        self.error_at(
            span,
            "E0002",
            format!("expected newline or ';' after statement, found {}", found),
        );
    }

    fn variable_declaration(&mut self, public: bool) -> Option<Stmt> {
        let kind = match self.advance().kind {
            TokenKind::Static => DeclKind::Static,
            TokenKind::Const => DeclKind::Const,
            _ => DeclKind::Let,
        };
        let mutable = match kind {
            DeclKind::Let => self.matches(&TokenKind::Mut),
            // `static` is mutable storage; `const` never is.
            DeclKind::Static => true,
            DeclKind::Const => false,
        };
        let name_token = self.consume_identifier("a variable name")?;
        let span = self.span_of(&name_token);
        let declared = if self.matches(&TokenKind::Colon) {
            Some(self.type_expression()?)
        } else {
            None
        };
        if kind == DeclKind::Static && declared.is_none() {
            self.error_at(span, "E0005", "'static' declarations require a type annotation");
        }
        self.consume(&TokenKind::Equal, "expected '=' after declaration name")?;
        let init = self.expression()?;
        self.end_of_statement();
        Some(Stmt {
            kind: StmtKind::Declaration {
                kind,
                name: name_token.lexeme,
                mutable,
                public,
                declared,
                init,
                slot: None,
            },
            span,
        })
    }

    fn function_statement(&mut self, public: bool, self_type: Option<&str>) -> Option<Stmt> {
        let decl = self.function_declaration(public, self_type)?;
        let span = decl.span;
        Some(Stmt {
            kind: StmtKind::Function(decl),
            span,
        })
    }

    fn function_declaration(
        &mut self,
        public: bool,
        self_type: Option<&str>,
    ) -> Option<FunctionDecl> {
        self.consume(&TokenKind::Fn, "expected 'fn'")?;
        let name_token = self.consume_identifier("a function name")?;
        let span = self.span_of(&name_token);
        let name = match self_type {
            Some(type_name) => format!("{}_{}", type_name, name_token.lexeme),
            None => name_token.lexeme.clone(),
        };
        let generics = if self.check(&TokenKind::Less) {
            self.generic_parameters()?
        } else {
            Vec::new()
        };
        self.consume(&TokenKind::LeftParen, "expected '(' after function name")?;
        let mut params = Vec::new();
        if !self.check(&TokenKind::RightParen) {
            loop {
                let param_token = self.consume_identifier("a parameter name")?;
                let param_span = self.span_of(&param_token);
                let ty = if param_token.lexeme == "self" && self_type.is_some() {
                    // Methods take the receiver as an implicit first
                    // parameter typed as the impl target.
                    TypeExpr {
                        kind: TypeExprKind::Named {
                            name: self_type.map(str::to_string)?,
                            generic_args: Vec::new(),
                        },
                        span: param_span,
                    }
                } else {
                    self.consume(&TokenKind::Colon, "expected ':' after parameter name")?;
                    self.type_expression()?
                };
                params.push(Param {
                    name: param_token.lexeme,
                    ty,
                    span: param_span,
                    slot: None,
                });
                if !self.matches(&TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(&TokenKind::RightParen, "expected ')' after parameters")?;
        let return_type = if self.matches(&TokenKind::Arrow) {
            Some(self.type_expression()?)
        } else {
            None
        };
        let body = self.block()?;
        Some(FunctionDecl {
            name,
            generics,
            params,
            return_type,
            body,
            public,
            span,
            slot: None,
        })
    }

    fn generic_parameters(&mut self) -> Option<Vec<String>> {
        self.consume(&TokenKind::Less, "expected '<'")?;
        let mut names = Vec::new();
        loop {
            let token = self.consume_identifier("a generic parameter name")?;
            names.push(token.lexeme);
            if !self.matches(&TokenKind::Comma) {
                break;
            }
        }
        self.consume(&TokenKind::Greater, "expected '>' after generic parameters")?;
        Some(names)
    }

    fn struct_declaration(&mut self, public: bool) -> Option<Stmt> {
        self.consume(&TokenKind::Struct, "expected 'struct'")?;
        let name_token = self.consume_identifier("a struct name")?;
        let span = self.span_of(&name_token);
        let generics = if self.check(&TokenKind::Less) {
            self.generic_parameters()?
        } else {
            Vec::new()
        };
        self.consume(&TokenKind::LeftBrace, "expected '{' after struct name")?;
        self.skip_newlines();
        let mut fields = Vec::new();
        while !self.check(&TokenKind::RightBrace) && !self.check(&TokenKind::Eof) {
            let field_token = self.consume_identifier("a field name")?;
            self.consume(&TokenKind::Colon, "expected ':' after field name")?;
            let ty = self.type_expression()?;
            fields.push((field_token.lexeme, ty));
            // Fields separate by comma, newline, or both.
            self.matches(&TokenKind::Comma);
            self.skip_newlines();
        }
        self.consume(&TokenKind::RightBrace, "expected '}' after struct fields")?;
        Some(Stmt {
            kind: StmtKind::StructDecl {
                name: name_token.lexeme,
                generics,
                fields,
                public,
            },
            span,
        })
    }

    fn enum_declaration(&mut self, public: bool) -> Option<Stmt> {
        self.consume(&TokenKind::Enum, "expected 'enum'")?;
        let name_token = self.consume_identifier("an enum name")?;
        let span = self.span_of(&name_token);
        let generics = if self.check(&TokenKind::Less) {
            self.generic_parameters()?
        } else {
            Vec::new()
        };
        self.consume(&TokenKind::LeftBrace, "expected '{' after enum name")?;
        self.skip_newlines();
        let mut variants = Vec::new();
        while !self.check(&TokenKind::RightBrace) && !self.check(&TokenKind::Eof) {
            let variant_token = self.consume_identifier("a variant name")?;
            let mut fields = Vec::new();
            if self.matches(&TokenKind::LeftParen) {
                if !self.check(&TokenKind::RightParen) {
                    loop {
                        let field_token = self.consume_identifier("a field name")?;
                        self.consume(&TokenKind::Colon, "expected ':' after field name")?;
                        let ty = self.type_expression()?;
                        fields.push((field_token.lexeme, ty));
                        if !self.matches(&TokenKind::Comma) {
                            break;
                        }
                    }
                }
                self.consume(&TokenKind::RightParen, "expected ')' after variant fields")?;
            }
            variants.push((variant_token.lexeme, fields));
            // Variants separate by comma, newline, or both.
            self.matches(&TokenKind::Comma);
            self.skip_newlines();
        }
        self.consume(&TokenKind::RightBrace, "expected '}' after enum variants")?;
        Some(Stmt {
            kind: StmtKind::EnumDecl {
                name: name_token.lexeme,
                generics,
                variants,
                public,
            },
            span,
        })
    }

    /// `impl Type { fn ... }` desugars to flat `Type_method` functions.
    fn impl_block(&mut self, out: &mut Vec<Stmt>) {
        self.advance(); // impl
        let Some(name_token) = self.consume_identifier("a type name after 'impl'") else {
            return;
        };
        let type_name = name_token.lexeme;
        if self
            .consume(&TokenKind::LeftBrace, "expected '{' after impl type")
            .is_none()
        {
            return;
        }
        self.skip_newlines();
        while !self.check(&TokenKind::RightBrace) && !self.check(&TokenKind::Eof) {
            let public = self.matches(&TokenKind::Pub);
            if let Some(stmt) = self.function_statement(public, Some(&type_name)) {
                out.push(stmt);
            }
            if self.panic_mode {
                self.synchronize();
            }
            self.skip_newlines();
        }
        self.consume(&TokenKind::RightBrace, "expected '}' after impl block");
    }

    fn if_statement(&mut self) -> Option<Stmt> {
        let span = self.here();
        self.advance(); // if
        let cond = self.expression()?;
        let then_block = self.scoped_block()?;
        let mut elifs = Vec::new();
        let mut else_block = None;
        loop {
            if self.matches(&TokenKind::Elif) {
                let elif_cond = self.expression()?;
                let elif_block = self.scoped_block()?;
                elifs.push((elif_cond, elif_block));
            } else if self.matches(&TokenKind::Else) {
                else_block = Some(self.scoped_block()?);
                break;
            } else {
                break;
            }
        }
        Some(Stmt {
            kind: StmtKind::If {
                cond,
                then_block,
                elifs,
                else_block,
            },
            span,
        })
    }

    fn while_statement(&mut self) -> Option<Stmt> {
        let span = self.here();
        self.advance(); // while
        let cond = self.expression()?;
        let body = self.scoped_block()?;
        Some(Stmt {
            kind: StmtKind::While { cond, body },
            span,
        })
    }

    fn for_statement(&mut self) -> Option<Stmt> {
        let span = self.here();
        self.advance(); // for
        let var_token = self.consume_identifier("an iterator name")?;
        self.consume(&TokenKind::In, "expected 'in' after iterator name")?;
        let start = self.expression()?;
        self.consume(&TokenKind::DotDot, "expected '..' in for-loop range")?;
        let end = self.expression()?;
        let step = if self.matches(&TokenKind::DotDot) {
            Some(self.expression()?)
        } else {
            None
        };
        let body = self.scoped_block()?;
        Some(Stmt {
            kind: StmtKind::For {
                var: var_token.lexeme,
                start,
                end,
                step,
                body,
                slot: None,
            },
            span,
        })
    }

    fn return_statement(&mut self) -> Option<Stmt> {
        let span = self.here();
        self.advance(); // return
        let value = if matches!(
            self.peek_kind(),
            TokenKind::Newline | TokenKind::Semicolon | TokenKind::RightBrace | TokenKind::Eof
        ) {
            None
        } else {
            Some(self.expression()?)
        };
        self.end_of_statement();
        Some(Stmt {
            kind: StmtKind::Return { value },
            span,
        })
    }

    fn try_statement(&mut self) -> Option<Stmt> {
        let span = self.here();
        self.advance(); // try
        let try_block = self.scoped_block()?;
        self.consume(&TokenKind::Catch, "expected 'catch' after try block")?;
        let err_token = self.consume_identifier("an error binding name")?;
        let catch_block = self.scoped_block()?;
        Some(Stmt {
            kind: StmtKind::TryCatch {
                try_block,
                err_name: err_token.lexeme,
                err_slot: None,
                catch_block,
            },
            span,
        })
    }

    fn use_statement(&mut self) -> Option<Stmt> {
        let span = self.here();
        self.advance(); // use
        let path = match self.peek_kind().clone() {
            TokenKind::Str(path) => {
                self.advance();
                path
            }
            _ => {
                self.error_at(span, "E0002", "expected a string path after 'use'");
                return None;
            }
        };
        self.consume(&TokenKind::As, "expected 'as' after module path")?;
        let alias_token = self.consume_identifier("a module alias")?;
        self.end_of_statement();
        Some(Stmt {
            kind: StmtKind::Use {
                path,
                alias: alias_token.lexeme,
                module_index: None,
            },
            span,
        })
    }

    fn print_statement(&mut self, newline: bool) -> Option<Stmt> {
        let span = self.here();
        self.advance(); // print / print_no_newline
        self.consume(&TokenKind::LeftParen, "expected '(' after 'print'")?;
        let mut args = Vec::new();
        if !self.check(&TokenKind::RightParen) {
            loop {
                args.push(self.expression()?);
                if !self.matches(&TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(&TokenKind::RightParen, "expected ')' after print arguments")?;
        self.end_of_statement();
        Some(Stmt {
            kind: StmtKind::Print { args, newline },
            span,
        })
    }

    fn expression_statement(&mut self) -> Option<Stmt> {
        let expr = self.expression()?;
        let span = expr.span;
        if self.matches(&TokenKind::Equal) {
            let target = match expr.kind {
                ExprKind::Variable { name, slot } => AssignTarget::Name { name, slot },
                ExprKind::Index { target, index } => AssignTarget::Index {
                    target: *target,
                    index: *index,
                },
                ExprKind::Field {
                    receiver,
                    field,
                    index,
                } => AssignTarget::Field {
                    receiver: *receiver,
                    field,
                    index,
                },
                _ => {
                    self.error_at(span, "E0003", "invalid assignment target");
                    return None;
                }
            };
            let value = self.expression()?;
            self.end_of_statement();
            return Some(Stmt {
                kind: StmtKind::Assign { target, value },
                span,
            });
        }
        self.end_of_statement();
        Some(Stmt {
            kind: StmtKind::Expression(expr),
            span,
        })
    }

    fn scoped_block(&mut self) -> Option<Block> {
        let mut block = self.block()?;
        block.scoped = true;
        Some(block)
    }

    fn block(&mut self) -> Option<Block> {
        self.consume(&TokenKind::LeftBrace, "expected '{'")?;
        let mut stmts = Vec::new();
        self.skip_newlines();
        while !self.check(&TokenKind::RightBrace) && !self.check(&TokenKind::Eof) {
            self.parse_declaration(&mut stmts);
            self.skip_newlines();
        }
        self.consume(&TokenKind::RightBrace, "expected '}' to close block")?;
        Some(Block {
            stmts,
            scoped: false,
        })
    }

    // ---- types ----

    fn type_expression(&mut self) -> Option<TypeExpr> {
        let span = self.here();
        if self.matches(&TokenKind::LeftBracket) {
            let element = self.type_expression()?;
            self.consume(&TokenKind::RightBracket, "expected ']' in array type")?;
            return Some(TypeExpr {
                kind: TypeExprKind::Array(Box::new(element)),
                span,
            });
        }
        if self.check(&TokenKind::Nil) {
            self.advance();
            return Some(TypeExpr {
                kind: TypeExprKind::Named {
                    name: "nil".to_string(),
                    generic_args: Vec::new(),
                },
                span,
            });
        }
        let name_token = self.consume_identifier("a type name")?;
        let mut generic_args = Vec::new();
        if self.check(&TokenKind::Less) {
            self.advance();
            loop {
                generic_args.push(self.type_expression()?);
                if !self.matches(&TokenKind::Comma) {
                    break;
                }
            }
            self.consume(&TokenKind::Greater, "expected '>' after generic arguments")?;
        }
        Some(TypeExpr {
            kind: TypeExprKind::Named {
                name: name_token.lexeme,
                generic_args,
            },
            span,
        })
    }

    // ---- expressions (precedence climbing) ----

    fn expression(&mut self) -> Option<Expr> {
        self.or_expression()
    }

    fn or_expression(&mut self) -> Option<Expr> {
        let mut expr = self.and_expression()?;
        while self.matches(&TokenKind::Or) {
            let rhs = self.and_expression()?;
            let span = expr.span;
            expr = Expr::new(
                ExprKind::Logical {
                    op: LogicalOp::Or,
                    lhs: Box::new(expr),
                    rhs: Box::new(rhs),
                },
                span,
            );
        }
        Some(expr)
    }

    fn and_expression(&mut self) -> Option<Expr> {
        let mut expr = self.equality()?;
        while self.matches(&TokenKind::And) {
            let rhs = self.equality()?;
            let span = expr.span;
            expr = Expr::new(
                ExprKind::Logical {
                    op: LogicalOp::And,
                    lhs: Box::new(expr),
                    rhs: Box::new(rhs),
                },
                span,
            );
        }
        Some(expr)
    }

    fn binary_level(
        &mut self,
        ops: &[(TokenKind, BinaryOp)],
        next: fn(&mut Self) -> Option<Expr>,
    ) -> Option<Expr> {
        let mut expr = next(self)?;
        'outer: loop {
            for (token, op) in ops {
                if self.check(token) {
                    let op_token = self.advance();
                    let rhs = next(self)?;
                    let span = self.span_of(&op_token);
                    expr = Expr::new(
                        ExprKind::Binary {
                            op: *op,
                            lhs: Box::new(expr),
                            rhs: Box::new(rhs),
                            lhs_conv: None,
                            rhs_conv: None,
                        },
                        span,
                    );
                    continue 'outer;
                }
            }
            break;
        }
        Some(expr)
    }

    fn equality(&mut self) -> Option<Expr> {
        self.binary_level(
            &[
                (TokenKind::EqualEqual, BinaryOp::Eq),
                (TokenKind::BangEqual, BinaryOp::Ne),
            ],
            Self::comparison,
        )
    }

    fn comparison(&mut self) -> Option<Expr> {
        // `<` opens generic arguments in call position; the postfix parser
        // has already claimed those, so plain `<` here is always less-than.
        self.binary_level(
            &[
                (TokenKind::Less, BinaryOp::Lt),
                (TokenKind::LessEqual, BinaryOp::Le),
                (TokenKind::Greater, BinaryOp::Gt),
                (TokenKind::GreaterEqual, BinaryOp::Ge),
            ],
            Self::bit_or,
        )
    }

    fn bit_or(&mut self) -> Option<Expr> {
        self.binary_level(&[(TokenKind::Pipe, BinaryOp::BitOr)], Self::bit_xor)
    }

    fn bit_xor(&mut self) -> Option<Expr> {
        self.binary_level(&[(TokenKind::Caret, BinaryOp::BitXor)], Self::bit_and)
    }

    fn bit_and(&mut self) -> Option<Expr> {
        self.binary_level(&[(TokenKind::Amp, BinaryOp::BitAnd)], Self::shift)
    }

    fn shift(&mut self) -> Option<Expr> {
        self.binary_level(
            &[
                (TokenKind::Shl, BinaryOp::Shl),
                (TokenKind::Shr, BinaryOp::Shr),
            ],
            Self::term,
        )
    }

    fn term(&mut self) -> Option<Expr> {
        self.binary_level(
            &[
                (TokenKind::Plus, BinaryOp::Add),
                (TokenKind::Minus, BinaryOp::Sub),
            ],
            Self::factor,
        )
    }

    fn factor(&mut self) -> Option<Expr> {
        self.binary_level(
            &[
                (TokenKind::Star, BinaryOp::Mul),
                (TokenKind::Slash, BinaryOp::Div),
                (TokenKind::Percent, BinaryOp::Mod),
            ],
            Self::cast,
        )
    }

    fn cast(&mut self) -> Option<Expr> {
        let mut expr = self.unary()?;
        while self.matches(&TokenKind::As) {
            let target = self.type_expression()?;
            let span = expr.span;
            expr = Expr::new(
                ExprKind::Cast {
                    operand: Box::new(expr),
                    target,
                    conversion: None,
                },
                span,
            );
        }
        Some(expr)
    }

    fn unary(&mut self) -> Option<Expr> {
        let op = match self.peek_kind() {
            TokenKind::Minus => Some(UnaryOp::Neg),
            TokenKind::Not => Some(UnaryOp::Not),
            TokenKind::Tilde => Some(UnaryOp::BitNot),
            _ => None,
        };
        if let Some(op) = op {
            let op_token = self.advance();
            let operand = self.unary()?;
            let span = self.span_of(&op_token);
            // Fold negation into integer/float literals so `-5` is a
            // literal, not a runtime negation.
            if op == UnaryOp::Neg {
                if let ExprKind::Literal(lit) = &operand.kind {
                    if let Some(folded) = negate_literal(lit) {
                        return Some(Expr::new(ExprKind::Literal(folded), span));
                    }
                }
            }
            return Some(Expr::new(
                ExprKind::Unary {
                    op,
                    operand: Box::new(operand),
                },
                span,
            ));
        }
        self.postfix()
    }

    fn postfix(&mut self) -> Option<Expr> {
        let mut expr = self.primary()?;
        loop {
            if self.check(&TokenKind::LeftParen) {
                expr = self.finish_call(expr, Vec::new())?;
            } else if self.check(&TokenKind::Less) && self.looks_like_generic_args() {
                let generic_args = self.generic_argument_list()?;
                if self.check(&TokenKind::LeftBrace) {
                    expr = self.finish_struct_literal(expr, generic_args)?;
                } else {
                    expr = self.finish_call(expr, generic_args)?;
                }
            } else if self.matches(&TokenKind::LeftBracket) {
                expr = self.finish_index_or_slice(expr)?;
            } else if self.matches(&TokenKind::Dot) {
                let field_token = self.consume_identifier("a field name after '.'")?;
                let span = self.span_of(&field_token);
                expr = Expr::new(
                    ExprKind::Field {
                        receiver: Box::new(expr),
                        field: field_token.lexeme,
                        index: None,
                    },
                    span,
                );
            } else if self.check(&TokenKind::LeftBrace) && is_struct_literal_head(&expr) {
                expr = self.finish_struct_literal(expr, Vec::new())?;
            } else {
                break;
            }
        }
        Some(expr)
    }

    /// Decide whether `<` after a name opens a generic-argument list: scan
    /// ahead for a matching `>` followed by `(` or `{`, admitting only
    /// tokens that can occur inside a type list.
    fn looks_like_generic_args(&self) -> bool {
        let mut depth = 0usize;
        let mut offset = 0usize;
        loop {
            let token = self.peek_at(offset);
            match &token.kind {
                TokenKind::Less => depth += 1,
                TokenKind::Greater => {
                    depth -= 1;
                    if depth == 0 {
                        return matches!(
                            self.peek_at(offset + 1).kind,
                            TokenKind::LeftParen | TokenKind::LeftBrace
                        );
                    }
                }
                TokenKind::Identifier
                | TokenKind::Comma
                | TokenKind::Nil
                | TokenKind::LeftBracket
                | TokenKind::RightBracket => {}
                _ => return false,
            }
            offset += 1;
            if offset > 64 {
                return false;
            }
        }
    }

    fn generic_argument_list(&mut self) -> Option<Vec<TypeExpr>> {
        self.consume(&TokenKind::Less, "expected '<'")?;
        let mut args = Vec::new();
        loop {
            args.push(self.type_expression()?);
            if !self.matches(&TokenKind::Comma) {
                break;
            }
        }
        self.consume(&TokenKind::Greater, "expected '>' after generic arguments")?;
        Some(args)
    }

    fn finish_call(&mut self, callee: Expr, generic_args: Vec<TypeExpr>) -> Option<Expr> {
        self.consume(&TokenKind::LeftParen, "expected '('")?;
        let mut args = Vec::new();
        if !self.check(&TokenKind::RightParen) {
            loop {
                args.push(self.expression()?);
                if !self.matches(&TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(&TokenKind::RightParen, "expected ')' after arguments")?;
        let span = callee.span;
        Some(Expr::new(
            ExprKind::Call {
                callee: Box::new(callee),
                generic_args,
                args,
                target: None,
            },
            span,
        ))
    }

    fn finish_struct_literal(&mut self, head: Expr, generic_args: Vec<TypeExpr>) -> Option<Expr> {
        let span = head.span;
        let name = match head.kind {
            ExprKind::Variable { name, .. } => name,
            _ => {
                self.error_at(span, "E0002", "expected a struct name before '{'");
                return None;
            }
        };
        self.consume(&TokenKind::LeftBrace, "expected '{'")?;
        self.skip_newlines();
        let mut fields = Vec::new();
        if !self.check(&TokenKind::RightBrace) {
            loop {
                let field_token = self.consume_identifier("a field name")?;
                self.consume(&TokenKind::Colon, "expected ':' after field name")?;
                let value = self.expression()?;
                fields.push((field_token.lexeme, value));
                self.skip_newlines();
                if !self.matches(&TokenKind::Comma) {
                    break;
                }
                self.skip_newlines();
                if self.check(&TokenKind::RightBrace) {
                    break;
                }
            }
        }
        self.consume(&TokenKind::RightBrace, "expected '}' after struct fields")?;
        Some(Expr::new(
            ExprKind::StructLiteral {
                name,
                generic_args,
                fields,
                resolved: None,
            },
            span,
        ))
    }

    fn finish_index_or_slice(&mut self, target: Expr) -> Option<Expr> {
        let span = target.span;
        // `[..]`, `[..end]`
        if self.matches(&TokenKind::DotDot) {
            let end = if self.check(&TokenKind::RightBracket) {
                None
            } else {
                Some(Box::new(self.expression()?))
            };
            self.consume(&TokenKind::RightBracket, "expected ']' after slice")?;
            return Some(Expr::new(
                ExprKind::Slice {
                    target: Box::new(target),
                    start: None,
                    end,
                },
                span,
            ));
        }
        let first = self.expression()?;
        if self.matches(&TokenKind::DotDot) {
            // `[start..]`, `[start..end]`
            let end = if self.check(&TokenKind::RightBracket) {
                None
            } else {
                Some(Box::new(self.expression()?))
            };
            self.consume(&TokenKind::RightBracket, "expected ']' after slice")?;
            return Some(Expr::new(
                ExprKind::Slice {
                    target: Box::new(target),
                    start: Some(Box::new(first)),
                    end,
                },
                span,
            ));
        }
        self.consume(&TokenKind::RightBracket, "expected ']' after index")?;
        Some(Expr::new(
            ExprKind::Index {
                target: Box::new(target),
                index: Box::new(first),
            },
            span,
        ))
    }

    fn primary(&mut self) -> Option<Expr> {
        let token = self.peek().clone();
        let span = self.span_of(&token);
        match token.kind {
            TokenKind::Int(value, suffix) => {
                self.advance();
                let literal = int_literal(value, suffix, span, self)?;
                Some(Expr::new(ExprKind::Literal(literal), span))
            }
            TokenKind::Float(value) => {
                self.advance();
                Some(Expr::new(ExprKind::Literal(LiteralValue::F64(value)), span))
            }
            TokenKind::Str(value) => {
                self.advance();
                Some(Expr::new(ExprKind::Literal(LiteralValue::Str(value)), span))
            }
            TokenKind::True => {
                self.advance();
                Some(Expr::new(
                    ExprKind::Literal(LiteralValue::Bool(true)),
                    span,
                ))
            }
            TokenKind::False => {
                self.advance();
                Some(Expr::new(
                    ExprKind::Literal(LiteralValue::Bool(false)),
                    span,
                ))
            }
            TokenKind::Nil => {
                self.advance();
                Some(Expr::new(ExprKind::Literal(LiteralValue::Nil), span))
            }
            TokenKind::Identifier => {
                self.advance();
                Some(Expr::new(
                    ExprKind::Variable {
                        name: token.lexeme,
                        slot: None,
                    },
                    span,
                ))
            }
            TokenKind::LeftParen => {
                self.advance();
                let expr = self.expression()?;
                self.consume(&TokenKind::RightParen, "expected ')' after expression")?;
                Some(expr)
            }
            TokenKind::LeftBracket => {
                self.advance();
                let mut elements = Vec::new();
                if !self.check(&TokenKind::RightBracket) {
                    loop {
                        elements.push(self.expression()?);
                        if !self.matches(&TokenKind::Comma) {
                            break;
                        }
                    }
                }
                self.consume(&TokenKind::RightBracket, "expected ']' after array literal")?;
                Some(Expr::new(ExprKind::ArrayLiteral(elements), span))
            }
            TokenKind::Error(message) => {
                self.advance();
                self.error_at(span, "E0001", message);
                None
            }
            _ => {
                self.error_at(
                    span,
                    "E0002",
                    format!("expected an expression, found {}", token),
                );
                None
            }
        }
    }
}

/// Struct literals require a capitalized head (`Point { ... }`) so that
/// `if x { ... }` keeps its condition.
fn is_struct_literal_head(expr: &Expr) -> bool {
    match &expr.kind {
        ExprKind::Variable { name, .. } => {
            name.chars().next().is_some_and(|c| c.is_ascii_uppercase())
        }
        _ => false,
    }
}

fn int_literal(
    value: u64,
    suffix: IntSuffix,
    span: Span,
    parser: &mut Parser,
) -> Option<LiteralValue> {
    match suffix {
        IntSuffix::None => {
            if let Ok(v) = i32::try_from(value) {
                Some(LiteralValue::I32(v))
            } else if let Ok(v) = i64::try_from(value) {
                Some(LiteralValue::I64(v))
            } else {
                Some(LiteralValue::U64(value))
            }
        }
        IntSuffix::I64 => match i64::try_from(value) {
            Ok(v) => Some(LiteralValue::I64(v)),
            Err(_) => {
                parser.error_at(span, "E0004", "integer literal is out of range for i64");
                None
            }
        },
        IntSuffix::U32 => match u32::try_from(value) {
            Ok(v) => Some(LiteralValue::U32(v)),
            Err(_) => {
                parser.error_at(span, "E0004", "integer literal is out of range for u32");
                None
            }
        },
        IntSuffix::U64 => Some(LiteralValue::U64(value)),
    }
}

fn negate_literal(lit: &LiteralValue) -> Option<LiteralValue> {
    match lit {
        LiteralValue::I32(v) => Some(LiteralValue::I32(v.checked_neg()?)),
        LiteralValue::I64(v) => {
            let negated = v.checked_neg()?;
            if let Ok(narrow) = i32::try_from(negated) {
                Some(LiteralValue::I32(narrow))
            } else {
                Some(LiteralValue::I64(negated))
            }
        }
        LiteralValue::F64(v) => Some(LiteralValue::F64(-v)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_ok(source: &str) -> Vec<Stmt> {
        let (stmts, diags) = parse(source, "test.orus");
        assert!(diags.is_empty(), "unexpected diagnostics: {:?}", diags);
        stmts
    }

    #[test]
    fn test_parse_let_with_expression() {
        let stmts = parse_ok("let x: i32 = 2 + 3 * 4\n");
        assert_eq!(stmts.len(), 1);
        let StmtKind::Declaration { name, init, .. } = &stmts[0].kind else {
            panic!("expected declaration, got {:?}", stmts[0].kind);
        };
        assert_eq!(name, "x");
        // Precedence: 2 + (3 * 4)
        let ExprKind::Binary { op, rhs, .. } = &init.kind else {
            panic!("expected binary init");
        };
        assert_eq!(*op, BinaryOp::Add);
        assert!(matches!(
            rhs.kind,
            ExprKind::Binary {
                op: BinaryOp::Mul,
                ..
            }
        ));
    }

    #[test]
    fn test_parse_function_and_same_line_statements() {
        let stmts = parse_ok("fn fact(n: i32) -> i32 { if n <= 1 { return 1 } return n * fact(n - 1) }\n");
        let StmtKind::Function(decl) = &stmts[0].kind else {
            panic!("expected function");
        };
        assert_eq!(decl.name, "fact");
        assert_eq!(decl.params.len(), 1);
        assert_eq!(decl.body.stmts.len(), 2);
        assert!(matches!(decl.body.stmts[0].kind, StmtKind::If { .. }));
        assert!(matches!(decl.body.stmts[1].kind, StmtKind::Return { .. }));
    }

    #[test]
    fn test_negative_literal_folds() {
        let stmts = parse_ok("let x = -5\n");
        let StmtKind::Declaration { init, .. } = &stmts[0].kind else {
            panic!();
        };
        assert_eq!(init.kind, ExprKind::Literal(LiteralValue::I32(-5)));
    }

    #[test]
    fn test_struct_literal_requires_capitalized_head() {
        // `Point { ... }` is a literal...
        let stmts = parse_ok("let p = Point { x: 1, y: 2 }\n");
        let StmtKind::Declaration { init, .. } = &stmts[0].kind else {
            panic!();
        };
        assert!(matches!(init.kind, ExprKind::StructLiteral { .. }));
        // ...while `if x { }` keeps its condition.
        let stmts = parse_ok("if x { print(\"y\") }\n");
        let StmtKind::If { cond, .. } = &stmts[0].kind else {
            panic!();
        };
        assert!(matches!(cond.kind, ExprKind::Variable { .. }));
    }

    #[test]
    fn test_generic_call_vs_less_than() {
        let stmts = parse_ok("let a = id<i32>(5)\nlet b = x < y\n");
        let StmtKind::Declaration { init, .. } = &stmts[0].kind else {
            panic!();
        };
        let ExprKind::Call { generic_args, .. } = &init.kind else {
            panic!("expected generic call, got {:?}", init.kind);
        };
        assert_eq!(generic_args.len(), 1);
        let StmtKind::Declaration { init, .. } = &stmts[1].kind else {
            panic!();
        };
        assert!(matches!(
            init.kind,
            ExprKind::Binary {
                op: BinaryOp::Lt,
                ..
            }
        ));
    }

    #[test]
    fn test_for_with_step() {
        let stmts = parse_ok("for i in 0..10..2 { print(\"{}\", i) }\n");
        let StmtKind::For { var, step, .. } = &stmts[0].kind else {
            panic!();
        };
        assert_eq!(var, "i");
        assert!(step.is_some());
    }

    #[test]
    fn test_slice_forms() {
        let stmts = parse_ok("let a = xs[1..3]\nlet b = xs[..2]\nlet c = xs[2..]\nlet d = xs[1]\n");
        let kinds: Vec<_> = stmts
            .iter()
            .map(|s| match &s.kind {
                StmtKind::Declaration { init, .. } => &init.kind,
                _ => panic!(),
            })
            .collect();
        assert!(matches!(
            kinds[0],
            ExprKind::Slice {
                start: Some(_),
                end: Some(_),
                ..
            }
        ));
        assert!(matches!(
            kinds[1],
            ExprKind::Slice {
                start: None,
                end: Some(_),
                ..
            }
        ));
        assert!(matches!(
            kinds[2],
            ExprKind::Slice {
                start: Some(_),
                end: None,
                ..
            }
        ));
        assert!(matches!(kinds[3], ExprKind::Index { .. }));
    }

    #[test]
    fn test_impl_block_mangles_methods() {
        let stmts = parse_ok("impl Point { fn dist(self) -> f64 { return 0.0 } }\n");
        let StmtKind::Function(decl) = &stmts[0].kind else {
            panic!();
        };
        assert_eq!(decl.name, "Point_dist");
        assert_eq!(decl.params.len(), 1);
        assert_eq!(decl.params[0].name, "self");
    }

    #[test]
    fn test_method_call_parses_as_field_call() {
        let stmts = parse_ok("p.dist()\n");
        let StmtKind::Expression(expr) = &stmts[0].kind else {
            panic!();
        };
        let ExprKind::Call { callee, .. } = &expr.kind else {
            panic!();
        };
        assert!(matches!(callee.kind, ExprKind::Field { .. }));
    }

    #[test]
    fn test_try_catch() {
        let stmts = parse_ok("try { print(\"a\") } catch e { print(e) }\n");
        let StmtKind::TryCatch { err_name, .. } = &stmts[0].kind else {
            panic!();
        };
        assert_eq!(err_name, "e");
    }

    #[test]
    fn test_use_statement() {
        let stmts = parse_ok("use \"lib/math\" as math\n");
        let StmtKind::Use { path, alias, .. } = &stmts[0].kind else {
            panic!();
        };
        assert_eq!(path, "lib/math");
        assert_eq!(alias, "math");
    }

    #[test]
    fn test_panic_mode_recovers_per_statement() {
        let (stmts, diags) = parse("let = 5\nlet y = 2\n", "test.orus");
        assert_eq!(diags.len(), 1);
        // The second statement still parses.
        assert!(stmts
            .iter()
            .any(|s| matches!(&s.kind, StmtKind::Declaration { name, .. } if name == "y")));
    }

    #[test]
    fn test_enum_declaration() {
        let stmts = parse_ok("enum Shape { Circle(r: f64), Point }\n");
        let StmtKind::EnumDecl { name, variants, .. } = &stmts[0].kind else {
            panic!();
        };
        assert_eq!(name, "Shape");
        assert_eq!(variants.len(), 2);
        assert_eq!(variants[0].1.len(), 1);
        assert!(variants[1].1.is_empty());
    }

    #[test]
    fn test_cast_expression() {
        let stmts = parse_ok("let x = y as i64\n");
        let StmtKind::Declaration { init, .. } = &stmts[0].kind else {
            panic!();
        };
        assert!(matches!(init.kind, ExprKind::Cast { .. }));
    }
}
