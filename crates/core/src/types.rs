//! Type descriptors and their registries.
//!
//! `Type` is a closed sum over the language's type kinds. Struct and enum
//! descriptors are interned in a [`TypeRegistry`] keyed by name; `Type`
//! refers to them by id so type equality stays a cheap derived comparison.
//! Instantiating a generic descriptor produces a substituted copy interned
//! under a mangled name (`Pair<i32, str>`), so repeated instantiations share
//! one id.

use std::collections::HashMap;
use std::fmt::Write as _;

/// Interned struct descriptor id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StructId(pub u16);

/// Interned enum descriptor id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EnumId(pub u16);

/// Function signature (return type first, parameter types in order).
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionType {
    pub ret: Type,
    pub params: Vec<Type>,
}

/// A resolved type.
#[derive(Debug, Clone, PartialEq)]
pub enum Type {
    I32,
    I64,
    U32,
    U64,
    F64,
    Bool,
    Str,
    Void,
    Nil,
    Array(Box<Type>),
    Function(Box<FunctionType>),
    Struct(StructId),
    Enum(EnumId),
    /// Named generic placeholder, bound by the enclosing declaration.
    Generic(String),
}

impl Type {
    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            Type::I32 | Type::I64 | Type::U32 | Type::U64 | Type::F64
        )
    }

    pub fn is_integer(&self) -> bool {
        matches!(self, Type::I32 | Type::I64 | Type::U32 | Type::U64)
    }

    /// True for types admissible as a cast source/target alongside bool.
    pub fn is_primitive(&self) -> bool {
        matches!(
            self,
            Type::I32 | Type::I64 | Type::U32 | Type::U64 | Type::F64 | Type::Bool | Type::Str
        )
    }

    /// Whether any generic placeholder occurs inside this type.
    pub fn contains_generic(&self) -> bool {
        match self {
            Type::Generic(_) => true,
            Type::Array(elem) => elem.contains_generic(),
            Type::Function(f) => {
                f.ret.contains_generic() || f.params.iter().any(Type::contains_generic)
            }
            _ => false,
        }
    }

    /// Replace generic placeholders according to `bindings`. Unbound
    /// placeholders are left untouched.
    pub fn substitute(&self, bindings: &HashMap<String, Type>) -> Type {
        match self {
            Type::Generic(name) => bindings.get(name).cloned().unwrap_or_else(|| self.clone()),
            Type::Array(elem) => Type::Array(Box::new(elem.substitute(bindings))),
            Type::Function(f) => Type::Function(Box::new(FunctionType {
                ret: f.ret.substitute(bindings),
                params: f.params.iter().map(|p| p.substitute(bindings)).collect(),
            })),
            other => other.clone(),
        }
    }

    /// Human-readable name; registry access resolves struct/enum ids.
    pub fn name(&self, registry: &TypeRegistry) -> String {
        match self {
            Type::I32 => "i32".to_string(),
            Type::I64 => "i64".to_string(),
            Type::U32 => "u32".to_string(),
            Type::U64 => "u64".to_string(),
            Type::F64 => "f64".to_string(),
            Type::Bool => "bool".to_string(),
            Type::Str => "string".to_string(),
            Type::Void => "void".to_string(),
            Type::Nil => "nil".to_string(),
            Type::Array(elem) => format!("[{}]", elem.name(registry)),
            Type::Function(f) => {
                let mut s = String::from("fn(");
                for (i, p) in f.params.iter().enumerate() {
                    if i > 0 {
                        s.push_str(", ");
                    }
                    s.push_str(&p.name(registry));
                }
                let _ = write!(s, ") -> {}", f.ret.name(registry));
                s
            }
            Type::Struct(id) => registry
                .struct_type(*id)
                .map(|s| s.name.clone())
                .unwrap_or_else(|| "<struct>".to_string()),
            Type::Enum(id) => registry
                .enum_type(*id)
                .map(|e| e.name.clone())
                .unwrap_or_else(|| "<enum>".to_string()),
            Type::Generic(name) => name.clone(),
        }
    }
}

/// One named, typed struct field.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldDef {
    pub name: String,
    pub ty: Type,
}

/// Struct descriptor.
#[derive(Debug, Clone, PartialEq)]
pub struct StructType {
    pub name: String,
    pub fields: Vec<FieldDef>,
    pub generics: Vec<String>,
}

impl StructType {
    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }
}

/// One enum variant: parallel field-name/field-type lists.
#[derive(Debug, Clone, PartialEq)]
pub struct VariantDef {
    pub name: String,
    pub field_names: Vec<String>,
    pub field_types: Vec<Type>,
}

/// Enum descriptor.
#[derive(Debug, Clone, PartialEq)]
pub struct EnumType {
    pub name: String,
    pub variants: Vec<VariantDef>,
    pub generics: Vec<String>,
}

impl EnumType {
    pub fn variant_index(&self, name: &str) -> Option<usize> {
        self.variants.iter().position(|v| v.name == name)
    }
}

/// Process-wide intern tables for struct and enum descriptors.
///
/// Entries are never removed: a declared descriptor (or an instantiated
/// generic copy) lives for the registry's lifetime, which makes every
/// descriptor a permanent GC root by construction.
#[derive(Debug, Default)]
pub struct TypeRegistry {
    structs: Vec<StructType>,
    enums: Vec<EnumType>,
    struct_names: HashMap<String, StructId>,
    enum_names: HashMap<String, EnumId>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        TypeRegistry::default()
    }

    /// Register a struct descriptor. Fails on a duplicate name.
    pub fn declare_struct(&mut self, descriptor: StructType) -> Result<StructId, String> {
        if self.struct_names.contains_key(&descriptor.name) {
            return Err(format!("struct '{}' is already defined", descriptor.name));
        }
        let id = StructId(self.structs.len() as u16);
        self.struct_names.insert(descriptor.name.clone(), id);
        self.structs.push(descriptor);
        Ok(id)
    }

    /// Register an enum descriptor. Fails on a duplicate name.
    pub fn declare_enum(&mut self, descriptor: EnumType) -> Result<EnumId, String> {
        if self.enum_names.contains_key(&descriptor.name) {
            return Err(format!("enum '{}' is already defined", descriptor.name));
        }
        let id = EnumId(self.enums.len() as u16);
        self.enum_names.insert(descriptor.name.clone(), id);
        self.enums.push(descriptor);
        Ok(id)
    }

    pub fn struct_type(&self, id: StructId) -> Option<&StructType> {
        self.structs.get(id.0 as usize)
    }

    pub fn enum_type(&self, id: EnumId) -> Option<&EnumType> {
        self.enums.get(id.0 as usize)
    }

    pub fn struct_by_name(&self, name: &str) -> Option<StructId> {
        self.struct_names.get(name).copied()
    }

    pub fn enum_by_name(&self, name: &str) -> Option<EnumId> {
        self.enum_names.get(name).copied()
    }

    pub fn struct_count(&self) -> usize {
        self.structs.len()
    }

    /// Fill in the fields of a pre-declared struct. Declaration happens in
    /// two phases so descriptors can reference later declarations.
    pub fn set_struct_fields(&mut self, id: StructId, fields: Vec<FieldDef>) {
        if let Some(descriptor) = self.structs.get_mut(id.0 as usize) {
            descriptor.fields = fields;
        }
    }

    /// Fill in the variants of a pre-declared enum.
    pub fn set_enum_variants(&mut self, id: EnumId, variants: Vec<VariantDef>) {
        if let Some(descriptor) = self.enums.get_mut(id.0 as usize) {
            descriptor.variants = variants;
        }
    }

    /// Instantiate a generic struct with concrete arguments. The substituted
    /// copy is interned under a mangled name so repeated instantiations
    /// resolve to the same id.
    pub fn instantiate_struct(
        &mut self,
        id: StructId,
        args: &[Type],
    ) -> Result<StructId, String> {
        let template = self
            .struct_type(id)
            .ok_or_else(|| "unknown struct descriptor".to_string())?
            .clone();
        if template.generics.len() != args.len() {
            return Err(format!(
                "struct '{}' expects {} generic argument(s), got {}",
                template.name,
                template.generics.len(),
                args.len()
            ));
        }
        if args.is_empty() {
            return Ok(id);
        }
        let mangled = mangle_instance(&template.name, args, self);
        if let Some(existing) = self.struct_by_name(&mangled) {
            return Ok(existing);
        }
        let bindings: HashMap<String, Type> = template
            .generics
            .iter()
            .cloned()
            .zip(args.iter().cloned())
            .collect();
        let instance = StructType {
            name: mangled,
            fields: template
                .fields
                .iter()
                .map(|f| FieldDef {
                    name: f.name.clone(),
                    ty: f.ty.substitute(&bindings),
                })
                .collect(),
            generics: Vec::new(),
        };
        self.declare_struct(instance)
    }

    /// Instantiate a generic enum with concrete arguments (same interning
    /// scheme as structs).
    pub fn instantiate_enum(&mut self, id: EnumId, args: &[Type]) -> Result<EnumId, String> {
        let template = self
            .enum_type(id)
            .ok_or_else(|| "unknown enum descriptor".to_string())?
            .clone();
        if template.generics.len() != args.len() {
            return Err(format!(
                "enum '{}' expects {} generic argument(s), got {}",
                template.name,
                template.generics.len(),
                args.len()
            ));
        }
        if args.is_empty() {
            return Ok(id);
        }
        let mangled = mangle_instance(&template.name, args, self);
        if let Some(existing) = self.enum_by_name(&mangled) {
            return Ok(existing);
        }
        let bindings: HashMap<String, Type> = template
            .generics
            .iter()
            .cloned()
            .zip(args.iter().cloned())
            .collect();
        let instance = EnumType {
            name: mangled,
            variants: template
                .variants
                .iter()
                .map(|v| VariantDef {
                    name: v.name.clone(),
                    field_names: v.field_names.clone(),
                    field_types: v
                        .field_types
                        .iter()
                        .map(|t| t.substitute(&bindings))
                        .collect(),
                })
                .collect(),
            generics: Vec::new(),
        };
        self.declare_enum(instance)
    }
}

fn mangle_instance(base: &str, args: &[Type], registry: &TypeRegistry) -> String {
    let mut name = String::from(base);
    name.push('<');
    for (i, arg) in args.iter().enumerate() {
        if i > 0 {
            name.push_str(", ");
        }
        name.push_str(&arg.name(registry));
    }
    name.push('>');
    name
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair_template() -> StructType {
        StructType {
            name: "Pair".to_string(),
            fields: vec![
                FieldDef {
                    name: "first".to_string(),
                    ty: Type::Generic("T".to_string()),
                },
                FieldDef {
                    name: "second".to_string(),
                    ty: Type::Generic("U".to_string()),
                },
            ],
            generics: vec!["T".to_string(), "U".to_string()],
        }
    }

    #[test]
    fn test_duplicate_struct_rejected() {
        let mut reg = TypeRegistry::new();
        reg.declare_struct(pair_template()).unwrap();
        assert!(reg.declare_struct(pair_template()).is_err());
    }

    #[test]
    fn test_substitution() {
        let mut bindings = HashMap::new();
        bindings.insert("T".to_string(), Type::I64);
        let ty = Type::Array(Box::new(Type::Generic("T".to_string())));
        assert_eq!(ty.substitute(&bindings), Type::Array(Box::new(Type::I64)));
        // Unbound placeholders survive.
        let other = Type::Generic("U".to_string());
        assert_eq!(other.substitute(&bindings), other);
    }

    #[test]
    fn test_instantiation_is_interned() {
        let mut reg = TypeRegistry::new();
        let id = reg.declare_struct(pair_template()).unwrap();
        let a = reg.instantiate_struct(id, &[Type::I32, Type::Str]).unwrap();
        let b = reg.instantiate_struct(id, &[Type::I32, Type::Str]).unwrap();
        let c = reg.instantiate_struct(id, &[Type::F64, Type::Str]).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        let inst = reg.struct_type(a).unwrap();
        assert_eq!(inst.name, "Pair<i32, string>");
        assert_eq!(inst.fields[0].ty, Type::I32);
        assert_eq!(inst.fields[1].ty, Type::Str);
    }

    #[test]
    fn test_instantiation_arity_checked() {
        let mut reg = TypeRegistry::new();
        let id = reg.declare_struct(pair_template()).unwrap();
        assert!(reg.instantiate_struct(id, &[Type::I32]).is_err());
    }

    #[test]
    fn test_type_names() {
        let reg = TypeRegistry::new();
        assert_eq!(Type::Array(Box::new(Type::I32)).name(&reg), "[i32]");
        let f = Type::Function(Box::new(FunctionType {
            ret: Type::Bool,
            params: vec![Type::I32, Type::Str],
        }));
        assert_eq!(f.name(&reg), "fn(i32, string) -> bool");
    }

    #[test]
    fn test_contains_generic() {
        assert!(Type::Array(Box::new(Type::Generic("T".into()))).contains_generic());
        assert!(!Type::Array(Box::new(Type::I32)).contains_generic());
    }
}
