//! The interpreter context.
//!
//! One [`Context`] holds everything the compiler and the VM share: the heap,
//! the type registry, the global slot table (values, declared types, names,
//! visibility), the function entry table, the module registry and the
//! compiler's temporary GC roots. It is passed explicitly through both
//! pipelines; tests create as many independent contexts as they like.

use crate::object::{Heap, Obj};
use crate::types::{Type, TypeRegistry};
use crate::value::{ObjId, Value};
use std::path::PathBuf;

/// Global slots are byte-indexed in the instruction stream.
pub const MAX_GLOBALS: usize = 256;

/// Where a compiled function body starts and how many arguments it pops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FunctionEntry {
    pub offset: usize,
    pub arity: u8,
}

/// A compiled module known to the context.
#[derive(Debug, Clone)]
pub struct ModuleInfo {
    pub name: String,
    pub path: PathBuf,
    /// Slot of the module's initializer function, if it has top-level code.
    pub init_slot: Option<u8>,
    /// Set once the initializer has run.
    pub initialized: bool,
}

/// Shared compiler/VM state.
pub struct Context {
    pub heap: Heap,
    pub registry: TypeRegistry,
    global_values: Vec<Value>,
    global_types: Vec<Type>,
    global_names: Vec<String>,
    global_public: Vec<bool>,
    functions: Vec<Option<FunctionEntry>>,
    modules: Vec<ModuleInfo>,
    /// Values pinned by the compiler while it builds transient object
    /// graphs (e.g. a folded constant array before its slot exists).
    temp_roots: Vec<Value>,
}

impl Context {
    pub fn new() -> Self {
        Context {
            heap: Heap::new(),
            registry: TypeRegistry::new(),
            global_values: Vec::new(),
            global_types: Vec::new(),
            global_names: Vec::new(),
            global_public: Vec::new(),
            functions: Vec::new(),
            modules: Vec::new(),
            temp_roots: Vec::new(),
        }
    }

    // ---- global slot table ----

    /// Allocate the next global slot. Fails when the byte-indexed space is
    /// exhausted.
    pub fn declare_global(
        &mut self,
        name: &str,
        ty: Type,
        public: bool,
    ) -> Result<u8, String> {
        if self.global_values.len() >= MAX_GLOBALS {
            return Err(format!(
                "too many global declarations (limit {})",
                MAX_GLOBALS
            ));
        }
        let slot = self.global_values.len() as u8;
        self.global_values.push(Value::Nil);
        self.global_types.push(ty);
        self.global_names.push(name.to_string());
        self.global_public.push(public);
        self.functions.push(None);
        Ok(slot)
    }

    pub fn global_count(&self) -> usize {
        self.global_values.len()
    }

    pub fn global_value(&self, slot: u8) -> Value {
        self.global_values
            .get(slot as usize)
            .copied()
            .unwrap_or(Value::Nil)
    }

    pub fn set_global_value(&mut self, slot: u8, value: Value) {
        if let Some(entry) = self.global_values.get_mut(slot as usize) {
            *entry = value;
        }
    }

    pub fn global_type(&self, slot: u8) -> Option<&Type> {
        self.global_types.get(slot as usize)
    }

    /// Update the declared type of a slot (nil-to-concrete refinement on
    /// first real assignment).
    pub fn set_global_type(&mut self, slot: u8, ty: Type) {
        if let Some(entry) = self.global_types.get_mut(slot as usize) {
            *entry = ty;
        }
    }

    pub fn global_name(&self, slot: u8) -> Option<&str> {
        self.global_names.get(slot as usize).map(String::as_str)
    }

    pub fn global_is_public(&self, slot: u8) -> bool {
        self.global_public.get(slot as usize).copied().unwrap_or(false)
    }

    // ---- function table ----

    pub fn set_function(&mut self, slot: u8, entry: FunctionEntry) {
        if let Some(cell) = self.functions.get_mut(slot as usize) {
            *cell = Some(entry);
        }
    }

    pub fn function(&self, slot: u8) -> Option<FunctionEntry> {
        self.functions.get(slot as usize).copied().flatten()
    }

    // ---- module registry ----

    pub fn add_module(&mut self, info: ModuleInfo) -> u8 {
        self.modules.push(info);
        (self.modules.len() - 1) as u8
    }

    pub fn module(&self, index: u8) -> Option<&ModuleInfo> {
        self.modules.get(index as usize)
    }

    pub fn module_mut(&mut self, index: u8) -> Option<&mut ModuleInfo> {
        self.modules.get_mut(index as usize)
    }

    pub fn module_by_path(&self, path: &std::path::Path) -> Option<u8> {
        self.modules
            .iter()
            .position(|m| m.path == path)
            .map(|i| i as u8)
    }

    pub fn module_count(&self) -> usize {
        self.modules.len()
    }

    // ---- compiler roots ----

    pub fn push_temp_root(&mut self, value: Value) {
        self.temp_roots.push(value);
    }

    pub fn pop_temp_root(&mut self) {
        self.temp_roots.pop();
    }

    // ---- collection ----

    /// Run a full collection. `extra_roots` supplies the caller's live
    /// values (the VM's operand stack, constant pool and in-flight exception
    /// value); globals and the compiler's temporary roots are always marked.
    pub fn collect(&mut self, extra_roots: impl IntoIterator<Item = Value>) {
        for value in extra_roots {
            self.heap.mark_value(value);
        }
        for i in 0..self.global_values.len() {
            let value = self.global_values[i];
            self.heap.mark_value(value);
        }
        for i in 0..self.temp_roots.len() {
            let value = self.temp_roots[i];
            self.heap.mark_value(value);
        }
        self.heap.sweep();
    }

    // ---- value services shared by VM, natives and printing ----

    /// The `type_of` name of a runtime value.
    pub fn type_of_value(&self, value: Value) -> String {
        match value {
            Value::Obj(id) => match self.heap.get(id) {
                Some(Obj::Str(_)) => "string".to_string(),
                Some(Obj::Array(_)) => "array".to_string(),
                Some(Obj::IntArray(_)) => "int_array".to_string(),
                Some(Obj::Range(_)) => "range".to_string(),
                Some(Obj::Error(_)) => "error".to_string(),
                Some(Obj::Struct(s)) => self
                    .registry
                    .struct_type(s.type_id)
                    .map(|d| d.name.clone())
                    .unwrap_or_else(|| "struct".to_string()),
                Some(Obj::Enum(e)) => self
                    .registry
                    .enum_type(e.type_id)
                    .map(|d| d.name.clone())
                    .unwrap_or_else(|| "enum".to_string()),
                None => "nil".to_string(),
            },
            other => other.tag_name().to_string(),
        }
    }

    /// Render a value the way `print` and `{}` substitution show it.
    pub fn format_value(&self, value: Value) -> String {
        match value {
            Value::Obj(id) => self.format_object(id),
            other => other.to_string(),
        }
    }

    fn format_object(&self, id: ObjId) -> String {
        match self.heap.get(id) {
            Some(Obj::Str(s)) => s.to_string(),
            Some(Obj::Array(values)) => {
                let parts: Vec<String> =
                    values.iter().map(|v| self.format_value(*v)).collect();
                format!("[{}]", parts.join(", "))
            }
            Some(Obj::IntArray(values)) => {
                let parts: Vec<String> = values.iter().map(i64::to_string).collect();
                format!("[{}]", parts.join(", "))
            }
            Some(Obj::Range(r)) => format!("{}..{}", r.start, r.end),
            Some(Obj::Error(e)) => format!("{} error: {}", e.kind.label(), e.message),
            Some(Obj::Struct(s)) => {
                let Some(descriptor) = self.registry.struct_type(s.type_id) else {
                    return "<struct>".to_string();
                };
                let parts: Vec<String> = descriptor
                    .fields
                    .iter()
                    .zip(&s.fields)
                    .map(|(f, v)| format!("{}: {}", f.name, self.format_value(*v)))
                    .collect();
                format!("{} {{ {} }}", descriptor.name, parts.join(", "))
            }
            Some(Obj::Enum(e)) => {
                let Some(descriptor) = self.registry.enum_type(e.type_id) else {
                    return "<enum>".to_string();
                };
                let variant = descriptor
                    .variants
                    .get(e.variant as usize)
                    .map(|v| v.name.as_str())
                    .unwrap_or("?");
                if e.fields.is_empty() {
                    format!("{}.{}", descriptor.name, variant)
                } else {
                    let parts: Vec<String> =
                        e.fields.iter().map(|v| self.format_value(*v)).collect();
                    format!("{}.{}({})", descriptor.name, variant, parts.join(", "))
                }
            }
            None => "nil".to_string(),
        }
    }

    /// Heterogeneous equality: identical tags compare by value, strings by
    /// contents, arrays and structs by identity, enums structurally, mixed
    /// tags are never equal.
    pub fn values_equal(&self, a: Value, b: Value) -> bool {
        match (a, b) {
            (Value::Obj(x), Value::Obj(y)) => match (self.heap.get(x), self.heap.get(y)) {
                (Some(Obj::Str(s)), Some(Obj::Str(t))) => s == t,
                (Some(Obj::Enum(p)), Some(Obj::Enum(q))) => {
                    p.type_id == q.type_id
                        && p.variant == q.variant
                        && p.fields.len() == q.fields.len()
                        && p.fields
                            .iter()
                            .zip(&q.fields)
                            .all(|(u, v)| self.values_equal(*u, *v))
                }
                _ => x == y,
            },
            (Value::I32(x), Value::I32(y)) => x == y,
            (Value::I64(x), Value::I64(y)) => x == y,
            (Value::U32(x), Value::U32(y)) => x == y,
            (Value::U64(x), Value::U64(y)) => x == y,
            (Value::F64(x), Value::F64(y)) => x == y,
            (Value::Bool(x), Value::Bool(y)) => x == y,
            (Value::Nil, Value::Nil) => true,
            _ => false,
        }
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_declare_global_allocates_sequential_slots() {
        let mut ctx = Context::new();
        let a = ctx.declare_global("a", Type::I32, false).unwrap();
        let b = ctx.declare_global("b", Type::Bool, true).unwrap();
        assert_eq!((a, b), (0, 1));
        assert_eq!(ctx.global_name(1), Some("b"));
        assert!(ctx.global_is_public(1));
        assert!(!ctx.global_is_public(0));
    }

    #[test]
    fn test_global_limit() {
        let mut ctx = Context::new();
        for i in 0..MAX_GLOBALS {
            ctx.declare_global(&format!("g{}", i), Type::I32, false)
                .unwrap();
        }
        assert!(ctx.declare_global("overflow", Type::I32, false).is_err());
    }

    #[test]
    fn test_string_equality_by_contents() {
        let mut ctx = Context::new();
        let a = Value::Obj(ctx.heap.alloc_str("same"));
        let b = Value::Obj(ctx.heap.alloc_str("same"));
        assert_ne!(a, b); // identity differs
        assert!(ctx.values_equal(a, b)); // contents match
    }

    #[test]
    fn test_array_equality_by_identity() {
        let mut ctx = Context::new();
        let a = Value::Obj(ctx.heap.alloc(Obj::Array(vec![Value::I32(1)])));
        let b = Value::Obj(ctx.heap.alloc(Obj::Array(vec![Value::I32(1)])));
        assert!(!ctx.values_equal(a, b));
        assert!(ctx.values_equal(a, a));
    }

    #[test]
    fn test_mixed_tags_not_equal() {
        let ctx = Context::new();
        assert!(!ctx.values_equal(Value::I32(1), Value::I64(1)));
        assert!(!ctx.values_equal(Value::Nil, Value::Bool(false)));
    }

    #[test]
    fn test_collect_keeps_globals_and_temp_roots() {
        let mut ctx = Context::new();
        let slot = ctx.declare_global("s", Type::Str, false).unwrap();
        let kept = ctx.heap.alloc_str("kept");
        ctx.set_global_value(slot, Value::Obj(kept));
        let pinned = ctx.heap.alloc_str("pinned");
        ctx.push_temp_root(Value::Obj(pinned));
        let doomed = ctx.heap.alloc_str("doomed");
        ctx.collect(std::iter::empty());
        assert_eq!(ctx.heap.str_value(kept), Some("kept"));
        assert_eq!(ctx.heap.str_value(pinned), Some("pinned"));
        assert_eq!(ctx.heap.get(doomed), None);
    }

    #[test]
    fn test_format_value() {
        let mut ctx = Context::new();
        let s = Value::Obj(ctx.heap.alloc_str("hi"));
        assert_eq!(ctx.format_value(s), "hi");
        let arr = Value::Obj(ctx.heap.alloc(Obj::Array(vec![Value::I32(1), s])));
        assert_eq!(ctx.format_value(arr), "[1, hi]");
        assert_eq!(ctx.format_value(Value::Nil), "nil");
    }
}
