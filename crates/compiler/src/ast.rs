//! Abstract syntax tree for Orus.
//!
//! The tree is built by the parser and annotated in place by the type
//! checker: expression nodes carry `ty: Option<Type>` (non-`None` after a
//! successful check, statements excepted), variable and declaration nodes
//! get their global slot bound, binary operands get promotion conversion
//! tags, and call nodes get a resolved [`CallTarget`]. The emitter only
//! reads the annotated tree.

use orus_core::chunk::Conversion;
use orus_core::types::{EnumId, StructId, Type};

/// Source span of a token or expression within the current file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Span {
    /// 1-based line.
    pub line: u32,
    /// 1-based column.
    pub column: u32,
    pub length: u32,
}

impl Span {
    pub fn new(line: u32, column: u32, length: u32) -> Self {
        Span {
            line,
            column,
            length,
        }
    }
}

/// A literal value as written (possibly rewritten by literal folding).
#[derive(Debug, Clone, PartialEq)]
pub enum LiteralValue {
    I32(i32),
    I64(i64),
    U32(u32),
    U64(u64),
    F64(f64),
    Bool(bool),
    Str(String),
    Nil,
}

impl LiteralValue {
    pub fn static_type(&self) -> Type {
        match self {
            LiteralValue::I32(_) => Type::I32,
            LiteralValue::I64(_) => Type::I64,
            LiteralValue::U32(_) => Type::U32,
            LiteralValue::U64(_) => Type::U64,
            LiteralValue::F64(_) => Type::F64,
            LiteralValue::Bool(_) => Type::Bool,
            LiteralValue::Str(_) => Type::Str,
            LiteralValue::Nil => Type::Nil,
        }
    }
}

/// A type as written in source, resolved to a [`Type`] by the checker.
#[derive(Debug, Clone, PartialEq)]
pub struct TypeExpr {
    pub kind: TypeExprKind,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TypeExprKind {
    /// `i32`, `Point`, `Pair<i32, str>`, a generic parameter name, ...
    Named {
        name: String,
        generic_args: Vec<TypeExpr>,
    },
    /// `[T]`
    Array(Box<TypeExpr>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Not,
    BitNot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    BitAnd,
    BitOr,
    BitXor,
    Shl,
    Shr,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl BinaryOp {
    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinaryOp::Eq | BinaryOp::Ne | BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge
        )
    }

    pub fn is_bitwise(self) -> bool {
        matches!(
            self,
            BinaryOp::BitAnd | BinaryOp::BitOr | BinaryOp::BitXor | BinaryOp::Shl | BinaryOp::Shr
        )
    }

    pub fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Mod => "%",
            BinaryOp::BitAnd => "&",
            BinaryOp::BitOr => "|",
            BinaryOp::BitXor => "^",
            BinaryOp::Shl => "<<",
            BinaryOp::Shr => ">>",
            BinaryOp::Eq => "==",
            BinaryOp::Ne => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicalOp {
    And,
    Or,
}

/// Resolved callee, filled in by the checker.
#[derive(Debug, Clone, PartialEq)]
pub enum CallTarget {
    /// Builtin dispatched through `CALL_NATIVE`.
    Native(u8),
    /// User function at a global slot (free function, mangled method, or a
    /// monomorphized generic specialization).
    Function { slot: u8 },
    /// `Enum.Variant(args)` construction.
    EnumVariant {
        enum_id: EnumId,
        variant: u8,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Expr {
    pub kind: ExprKind,
    pub span: Span,
    /// Resolved type; set by the checker for every expression node.
    pub ty: Option<Type>,
}

impl Expr {
    pub fn new(kind: ExprKind, span: Span) -> Self {
        Expr {
            kind,
            span,
            ty: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExprKind {
    Literal(LiteralValue),
    ArrayLiteral(Vec<Expr>),
    StructLiteral {
        name: String,
        generic_args: Vec<TypeExpr>,
        fields: Vec<(String, Expr)>,
        /// Interned descriptor, set by the checker.
        resolved: Option<StructId>,
    },
    Variable {
        name: String,
        /// Global slot, bound by the checker.
        slot: Option<u8>,
    },
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
        /// Promotion/to-string conversion for the left operand.
        lhs_conv: Option<Conversion>,
        /// Promotion/to-string conversion for the right operand.
        rhs_conv: Option<Conversion>,
    },
    Logical {
        op: LogicalOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Index {
        target: Box<Expr>,
        index: Box<Expr>,
    },
    Slice {
        target: Box<Expr>,
        start: Option<Box<Expr>>,
        end: Option<Box<Expr>>,
    },
    Field {
        receiver: Box<Expr>,
        field: String,
        /// Field position inside the struct, set by the checker.
        index: Option<u8>,
    },
    Call {
        callee: Box<Expr>,
        generic_args: Vec<TypeExpr>,
        args: Vec<Expr>,
        /// Resolution recorded by the checker.
        target: Option<CallTarget>,
    },
    Cast {
        operand: Box<Expr>,
        target: TypeExpr,
        /// Runtime conversion; `None` when the cast folded away.
        conversion: Option<Conversion>,
    },
}

/// Assignment left-hand side.
#[derive(Debug, Clone, PartialEq)]
pub enum AssignTarget {
    Name {
        name: String,
        slot: Option<u8>,
    },
    Index {
        target: Expr,
        index: Expr,
    },
    Field {
        receiver: Expr,
        field: String,
        index: Option<u8>,
    },
}

/// Statement sequence; `scoped` blocks open a symbol scope.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Block {
    pub stmts: Vec<Stmt>,
    pub scoped: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeclKind {
    Let,
    Static,
    Const,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub name: String,
    pub ty: TypeExpr,
    pub span: Span,
    /// Dedicated global slot (parameters share the global slot space).
    pub slot: Option<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FunctionDecl {
    /// Flat global name; methods arrive pre-mangled (`Type_method`).
    pub name: String,
    pub generics: Vec<String>,
    pub params: Vec<Param>,
    pub return_type: Option<TypeExpr>,
    pub body: Block,
    pub public: bool,
    pub span: Span,
    /// Global slot, bound during the declaration prepass.
    pub slot: Option<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Stmt {
    pub kind: StmtKind,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StmtKind {
    Expression(Expr),
    Print {
        args: Vec<Expr>,
        newline: bool,
    },
    Declaration {
        kind: DeclKind,
        name: String,
        mutable: bool,
        public: bool,
        declared: Option<TypeExpr>,
        init: Expr,
        slot: Option<u8>,
    },
    Assign {
        target: AssignTarget,
        value: Expr,
    },
    If {
        cond: Expr,
        then_block: Block,
        elifs: Vec<(Expr, Block)>,
        else_block: Option<Block>,
    },
    While {
        cond: Expr,
        body: Block,
    },
    For {
        var: String,
        start: Expr,
        end: Expr,
        step: Option<Expr>,
        body: Block,
        slot: Option<u8>,
    },
    Block(Block),
    Function(FunctionDecl),
    StructDecl {
        name: String,
        generics: Vec<String>,
        fields: Vec<(String, TypeExpr)>,
        public: bool,
    },
    EnumDecl {
        name: String,
        generics: Vec<String>,
        variants: Vec<(String, Vec<(String, TypeExpr)>)>,
        public: bool,
    },
    Return {
        value: Option<Expr>,
    },
    Break,
    Continue,
    TryCatch {
        try_block: Block,
        err_name: String,
        err_slot: Option<u8>,
        catch_block: Block,
    },
    Use {
        path: String,
        alias: String,
        module_index: Option<u8>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_literal_static_types() {
        assert_eq!(LiteralValue::I32(1).static_type(), Type::I32);
        assert_eq!(LiteralValue::Nil.static_type(), Type::Nil);
        assert_eq!(LiteralValue::Str("s".into()).static_type(), Type::Str);
    }

    #[test]
    fn test_binary_op_classes() {
        assert!(BinaryOp::Eq.is_comparison());
        assert!(!BinaryOp::Add.is_comparison());
        assert!(BinaryOp::Shl.is_bitwise());
        assert_eq!(BinaryOp::Mod.symbol(), "%");
    }
}
