//! Scoped symbol table.
//!
//! Symbols live in one flat array. Leaving a scope deactivates (never
//! removes) the symbols declared in it, so a later "undefined variable"
//! diagnostic can still point at the out-of-scope definition site.

use crate::ast::Span;
use orus_core::types::Type;

#[derive(Debug, Clone)]
pub struct Symbol {
    pub name: String,
    /// Definition site, for diagnostics.
    pub span: Span,
    pub ty: Type,
    pub depth: u32,
    pub slot: u8,
    pub mutable: bool,
    pub is_const: bool,
    /// Module-registry index when this symbol is a `use` alias.
    pub module: Option<u8>,
    pub active: bool,
}

impl Symbol {
    pub fn is_module_alias(&self) -> bool {
        self.module.is_some()
    }
}

#[derive(Debug, Default)]
pub struct SymbolTable {
    symbols: Vec<Symbol>,
}

impl SymbolTable {
    pub fn new() -> Self {
        SymbolTable::default()
    }

    /// Add a binding. Rejects a duplicate active name in the same scope, and
    /// shadowing of a const from any enclosing scope.
    #[allow(clippy::too_many_arguments)]
    pub fn add(
        &mut self,
        name: &str,
        span: Span,
        ty: Type,
        depth: u32,
        slot: u8,
        mutable: bool,
        is_const: bool,
        module: Option<u8>,
    ) -> Result<(), SymbolError> {
        if let Some(existing) = self.find(name) {
            if existing.depth == depth {
                return Err(SymbolError::Duplicate {
                    previous: existing.span,
                });
            }
            if existing.is_const {
                return Err(SymbolError::ShadowsConst {
                    previous: existing.span,
                });
            }
        }
        self.symbols.push(Symbol {
            name: name.to_string(),
            span,
            ty,
            depth,
            slot,
            mutable,
            is_const,
            module,
            active: true,
        });
        Ok(())
    }

    /// Most recent active symbol with the given name.
    pub fn find(&self, name: &str) -> Option<&Symbol> {
        self.symbols
            .iter()
            .rev()
            .find(|s| s.active && s.name == name)
    }

    pub fn find_mut(&mut self, name: &str) -> Option<&mut Symbol> {
        self.symbols
            .iter_mut()
            .rev()
            .find(|s| s.active && s.name == name)
    }

    /// Most recent symbol with the given name regardless of active state.
    /// Lets "undefined variable" diagnostics reference a definition that has
    /// gone out of scope.
    pub fn find_any(&self, name: &str) -> Option<&Symbol> {
        self.symbols.iter().rev().find(|s| s.name == name)
    }

    /// Deactivate every symbol declared at `depth` or deeper.
    pub fn remove_from_scope(&mut self, depth: u32) {
        for symbol in &mut self.symbols {
            if symbol.depth >= depth {
                symbol.active = false;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolError {
    /// Same active name in the same scope.
    Duplicate { previous: Span },
    /// Inner-scope shadowing of a const binding.
    ShadowsConst { previous: Span },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn add(table: &mut SymbolTable, name: &str, depth: u32, slot: u8) -> Result<(), SymbolError> {
        table.add(
            name,
            Span::default(),
            Type::I32,
            depth,
            slot,
            false,
            false,
            None,
        )
    }

    #[test]
    fn test_find_returns_most_recent_active() {
        let mut table = SymbolTable::new();
        add(&mut table, "x", 0, 0).unwrap();
        add(&mut table, "x", 1, 1).unwrap();
        assert_eq!(table.find("x").unwrap().slot, 1);
        table.remove_from_scope(1);
        assert_eq!(table.find("x").unwrap().slot, 0);
    }

    #[test]
    fn test_duplicate_in_same_scope_rejected() {
        let mut table = SymbolTable::new();
        add(&mut table, "x", 0, 0).unwrap();
        assert!(matches!(
            add(&mut table, "x", 0, 1),
            Err(SymbolError::Duplicate { .. })
        ));
    }

    #[test]
    fn test_const_cannot_be_shadowed() {
        let mut table = SymbolTable::new();
        table
            .add(
                "limit",
                Span::default(),
                Type::I32,
                0,
                0,
                false,
                true,
                None,
            )
            .unwrap();
        assert!(matches!(
            add(&mut table, "limit", 2, 1),
            Err(SymbolError::ShadowsConst { .. })
        ));
    }

    #[test]
    fn test_scope_exit_deactivates_everything_at_or_below() {
        let mut table = SymbolTable::new();
        add(&mut table, "a", 1, 0).unwrap();
        add(&mut table, "b", 2, 1).unwrap();
        add(&mut table, "c", 3, 2).unwrap();
        table.remove_from_scope(2);
        assert!(table.find("a").is_some());
        assert!(table.find("b").is_none());
        assert!(table.find("c").is_none());
        // The definitions survive for diagnostics.
        assert!(table.find_any("c").is_some());
    }

    #[test]
    fn test_find_never_returns_closed_scope_symbol() {
        let mut table = SymbolTable::new();
        add(&mut table, "tmp", 5, 0).unwrap();
        table.remove_from_scope(5);
        assert!(table.find("tmp").is_none());
        // Re-declaring in a fresh scope at the same depth works.
        add(&mut table, "tmp", 5, 1).unwrap();
        assert_eq!(table.find("tmp").unwrap().slot, 1);
    }
}
