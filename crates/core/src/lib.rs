//! Core data model for the Orus language.
//!
//! Everything the compiler and the virtual machine share lives here: the
//! tagged [`Value`] union, the garbage-collected [`Heap`] of boxed objects,
//! the bytecode [`Chunk`] with its constant pool and line table, the
//! [`Type`] descriptors and their registries, and the [`Context`] that ties
//! the global slot table, function table and module registry together.
//!
//! The compiler writes into a `Context` (slot allocation, constant values,
//! interned struct/enum descriptors) and the VM reads and mutates the same
//! `Context` at runtime. There are no process-wide singletons: tests build as
//! many independent contexts as they need.

pub mod chunk;
pub mod context;
pub mod natives;
pub mod object;
pub mod types;
pub mod value;

pub use chunk::{Chunk, Conversion, OpCode};
pub use context::{Context, FunctionEntry, ModuleInfo, MAX_GLOBALS};
pub use natives::{NativeArity, NativeDef, NATIVES};
pub use object::{EnumInstance, ErrorKind, ErrorObj, Heap, Obj, RangeObj, StructInstance};
pub use types::{
    EnumId, EnumType, FieldDef, FunctionType, StructId, StructType, Type, TypeRegistry, VariantDef,
};
pub use value::{ObjId, Value};
