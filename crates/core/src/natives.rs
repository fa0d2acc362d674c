//! Native (builtin) function metadata.
//!
//! The single source of truth for the builtin name set, native indices and
//! arities. The compiler checks call shapes against this table and emits
//! `CALL_NATIVE` with the index; the runtime installs its implementations in
//! the same order. Keeping both sides keyed off one table means they cannot
//! drift.

/// Accepted argument counts for a native.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NativeArity {
    Exact(u8),
    Range(u8, u8),
}

impl NativeArity {
    pub fn accepts(self, argc: u8) -> bool {
        match self {
            NativeArity::Exact(n) => argc == n,
            NativeArity::Range(lo, hi) => argc >= lo && argc <= hi,
        }
    }

    pub fn describe(self) -> String {
        match self {
            NativeArity::Exact(n) => n.to_string(),
            NativeArity::Range(lo, hi) => format!("{} to {}", lo, hi),
        }
    }
}

/// One entry of the builtin table.
#[derive(Debug, Clone, Copy)]
pub struct NativeDef {
    pub name: &'static str,
    pub arity: NativeArity,
}

/// The fixed builtin set, in native-index order.
pub const NATIVES: &[NativeDef] = &[
    NativeDef {
        name: "len",
        arity: NativeArity::Exact(1),
    },
    NativeDef {
        name: "substring",
        arity: NativeArity::Exact(3),
    },
    NativeDef {
        name: "push",
        arity: NativeArity::Exact(2),
    },
    NativeDef {
        name: "pop",
        arity: NativeArity::Exact(1),
    },
    NativeDef {
        name: "reserve",
        arity: NativeArity::Exact(2),
    },
    NativeDef {
        name: "range",
        arity: NativeArity::Range(2, 3),
    },
    NativeDef {
        name: "sum",
        arity: NativeArity::Exact(1),
    },
    NativeDef {
        name: "min",
        arity: NativeArity::Exact(1),
    },
    NativeDef {
        name: "max",
        arity: NativeArity::Exact(1),
    },
    NativeDef {
        name: "type_of",
        arity: NativeArity::Exact(1),
    },
    NativeDef {
        name: "is_type",
        arity: NativeArity::Exact(2),
    },
    NativeDef {
        name: "input",
        arity: NativeArity::Exact(0),
    },
    NativeDef {
        name: "int",
        arity: NativeArity::Exact(1),
    },
    NativeDef {
        name: "float",
        arity: NativeArity::Exact(1),
    },
    NativeDef {
        name: "timestamp",
        arity: NativeArity::Exact(0),
    },
    NativeDef {
        name: "sorted",
        arity: NativeArity::Exact(1),
    },
    NativeDef {
        name: "module_name",
        arity: NativeArity::Exact(0),
    },
    NativeDef {
        name: "module_path",
        arity: NativeArity::Exact(0),
    },
    NativeDef {
        name: "native_pow",
        arity: NativeArity::Exact(2),
    },
    NativeDef {
        name: "native_sqrt",
        arity: NativeArity::Exact(1),
    },
];

/// Look up a builtin by name, returning its native index and entry.
pub fn lookup(name: &str) -> Option<(u8, &'static NativeDef)> {
    NATIVES
        .iter()
        .position(|n| n.name == name)
        .map(|i| (i as u8, &NATIVES[i]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_known_names() {
        let (index, def) = lookup("len").unwrap();
        assert_eq!(index, 0);
        assert_eq!(def.arity, NativeArity::Exact(1));
        assert!(lookup("no_such_builtin").is_none());
    }

    #[test]
    fn test_table_fits_byte_index() {
        assert!(NATIVES.len() <= u8::MAX as usize);
    }

    #[test]
    fn test_names_are_unique() {
        for (i, a) in NATIVES.iter().enumerate() {
            for b in &NATIVES[i + 1..] {
                assert_ne!(a.name, b.name);
            }
        }
    }

    #[test]
    fn test_range_arity() {
        let (_, def) = lookup("range").unwrap();
        assert!(def.arity.accepts(2));
        assert!(def.arity.accepts(3));
        assert!(!def.arity.accepts(1));
    }
}
