use std::collections::HashMap;

use crate::bytecode::compile_error::CompileError;
use crate::lang::value::Value;
use crate::types::TypeId;

// =============================================================================
// SYMBOLS - Named entities owned by exactly one scope
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum SymbolKind {
    /// Named constant.
    Const(Value),
    /// Type alias; the symbol's own type is the type-of-types.
    TypeAlias(TypeId),
    /// Instance variable with a dense slot id.
    SelfVar { slot: u8 },
    /// The function result variable.
    ResultVar,
}

#[derive(Debug, Clone)]
pub struct Symbol {
    pub name: String,
    /// Type of the symbol's value.
    pub type_id: TypeId,
    pub kind: SymbolKind,
}

impl Symbol {
    pub fn is_self_var(&self) -> bool {
        matches!(self.kind, SymbolKind::SelfVar { .. })
    }

    pub fn is_definition(&self) -> bool {
        matches!(self.kind, SymbolKind::Const(_) | SymbolKind::TypeAlias(_))
    }

    pub fn slot(&self) -> u8 {
        match self.kind {
            SymbolKind::SelfVar { slot } => slot,
            _ => panic!("fatal: symbol '{}' has no slot", self.name),
        }
    }
}

/// Identifier table of one scope. Insertion order is preserved for
/// iteration and dumps; lookup goes through the name index.
#[derive(Debug, Default)]
pub struct SymbolTable {
    by_name: HashMap<String, usize>,
    ordered: Vec<Symbol>,
}

impl SymbolTable {
    pub fn new() -> Self {
        SymbolTable::default()
    }

    /// Insert a symbol; duplicate names within one scope are a compile
    /// error, not a fatal.
    pub fn add_unique(&mut self, sym: Symbol) -> Result<(), CompileError> {
        if self.by_name.contains_key(&sym.name) {
            return Err(CompileError::DuplicateIdent(sym.name));
        }
        self.by_name.insert(sym.name.clone(), self.ordered.len());
        self.ordered.push(sym);
        Ok(())
    }

    pub fn find(&self, name: &str) -> Option<&Symbol> {
        self.by_name.get(name).map(|i| &self.ordered[*i])
    }

    pub fn is_empty(&self) -> bool {
        self.ordered.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Symbol> {
        self.ordered.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sym(name: &str) -> Symbol {
        Symbol {
            name: name.to_string(),
            type_id: TypeId::from_index(0),
            kind: SymbolKind::Const(Value::Int(0)),
        }
    }

    #[test]
    fn test_add_and_find() {
        let mut t = SymbolTable::new();
        assert!(t.is_empty());
        t.add_unique(sym("abc")).unwrap();
        t.add_unique(sym("def")).unwrap();
        assert!(t.find("abc").is_some());
        assert!(t.find("def").is_some());
        assert!(t.find("xyz").is_none());
        assert!(!t.is_empty());
    }

    #[test]
    fn test_duplicate_is_error() {
        let mut t = SymbolTable::new();
        t.add_unique(sym("abc")).unwrap();
        let err = t.add_unique(sym("abc")).unwrap_err();
        assert!(matches!(err, CompileError::DuplicateIdent(n) if n == "abc"));
    }

    #[test]
    fn test_order_preserved() {
        let mut t = SymbolTable::new();
        for name in ["c", "a", "b"] {
            t.add_unique(sym(name)).unwrap();
        }
        let names: Vec<_> = t.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["c", "a", "b"]);
    }
}
