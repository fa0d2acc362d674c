//! Shape checks for builtin calls.
//!
//! The builtin name set, native indices and arities live in
//! `orus_core::natives`; this module knows each builtin's parameter shape
//! and result type. Arity is validated by the caller against the shared
//! table before the shape check runs.

use orus_core::types::Type;

/// Validate argument types for the builtin at `name` and compute the call's
/// result type. Returns a plain message on failure; the checker wraps it
/// into a diagnostic at the call span.
pub fn check_builtin_call(name: &str, args: &[Type]) -> Result<Type, String> {
    match name {
        "len" => match &args[0] {
            Type::Array(_) | Type::Str => Ok(Type::I32),
            other => Err(expected(name, "an array or string", other)),
        },
        "substring" => {
            require(name, &args[0], &Type::Str)?;
            require_integer(name, &args[1])?;
            require_integer(name, &args[2])?;
            Ok(Type::Str)
        }
        "push" => match &args[0] {
            Type::Array(elem) => {
                if **elem == Type::Nil || **elem == args[1] {
                    Ok(Type::Void)
                } else {
                    Err(format!(
                        "push: element type mismatch (array of {:?}, value {:?})",
                        elem, args[1]
                    ))
                }
            }
            other => Err(expected(name, "an array", other)),
        },
        "pop" => match &args[0] {
            Type::Array(elem) => Ok((**elem).clone()),
            other => Err(expected(name, "an array", other)),
        },
        "reserve" => match &args[0] {
            Type::Array(_) => {
                require_integer(name, &args[1])?;
                Ok(Type::Void)
            }
            other => Err(expected(name, "an array", other)),
        },
        "range" => {
            for arg in args {
                require_integer(name, arg)?;
            }
            Ok(Type::Array(Box::new(Type::I64)))
        }
        "sum" | "min" | "max" => match &args[0] {
            Type::Array(elem) if elem.is_numeric() => Ok((**elem).clone()),
            other => Err(expected(name, "an array of numbers", other)),
        },
        "type_of" => Ok(Type::Str),
        "is_type" => {
            require(name, &args[1], &Type::Str)?;
            Ok(Type::Bool)
        }
        "input" => Ok(Type::Str),
        "int" => {
            require_primitive(name, &args[0])?;
            Ok(Type::I32)
        }
        "float" => {
            require_primitive(name, &args[0])?;
            Ok(Type::F64)
        }
        "timestamp" => Ok(Type::F64),
        "sorted" => match &args[0] {
            Type::Array(elem) if elem.is_numeric() || **elem == Type::Str => {
                Ok(Type::Array(elem.clone()))
            }
            other => Err(expected(name, "a sortable array", other)),
        },
        "module_name" | "module_path" => Ok(Type::Str),
        "native_pow" => {
            require(name, &args[0], &Type::F64)?;
            require(name, &args[1], &Type::F64)?;
            Ok(Type::F64)
        }
        "native_sqrt" => {
            require(name, &args[0], &Type::F64)?;
            Ok(Type::F64)
        }
        other => Err(format!("unknown builtin '{}'", other)),
    }
}

fn expected(builtin: &str, wanted: &str, got: &Type) -> String {
    format!("{}: expected {}, got {:?}", builtin, wanted, got)
}

fn require(builtin: &str, got: &Type, wanted: &Type) -> Result<(), String> {
    if got == wanted {
        Ok(())
    } else {
        Err(format!(
            "{}: expected {:?}, got {:?}",
            builtin, wanted, got
        ))
    }
}

fn require_integer(builtin: &str, got: &Type) -> Result<(), String> {
    if got.is_integer() {
        Ok(())
    } else {
        Err(expected(builtin, "an integer", got))
    }
}

fn require_primitive(builtin: &str, got: &Type) -> Result<(), String> {
    if got.is_primitive() {
        Ok(())
    } else {
        Err(expected(builtin, "a primitive value", got))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_len_accepts_arrays_and_strings() {
        assert_eq!(
            check_builtin_call("len", &[Type::Array(Box::new(Type::I32))]),
            Ok(Type::I32)
        );
        assert_eq!(check_builtin_call("len", &[Type::Str]), Ok(Type::I32));
        assert!(check_builtin_call("len", &[Type::Bool]).is_err());
    }

    #[test]
    fn test_pop_returns_element_type() {
        assert_eq!(
            check_builtin_call("pop", &[Type::Array(Box::new(Type::F64))]),
            Ok(Type::F64)
        );
    }

    #[test]
    fn test_push_checks_element_type() {
        let arr = Type::Array(Box::new(Type::I32));
        assert_eq!(
            check_builtin_call("push", &[arr.clone(), Type::I32]),
            Ok(Type::Void)
        );
        assert!(check_builtin_call("push", &[arr, Type::Str]).is_err());
        // Pushing into an empty-literal array refines at runtime.
        let nil_arr = Type::Array(Box::new(Type::Nil));
        assert_eq!(
            check_builtin_call("push", &[nil_arr, Type::I32]),
            Ok(Type::Void)
        );
    }

    #[test]
    fn test_sum_requires_numeric_elements() {
        assert_eq!(
            check_builtin_call("sum", &[Type::Array(Box::new(Type::I64))]),
            Ok(Type::I64)
        );
        assert!(check_builtin_call("sum", &[Type::Array(Box::new(Type::Str))]).is_err());
    }

    #[test]
    fn test_range_returns_int_array() {
        assert_eq!(
            check_builtin_call("range", &[Type::I32, Type::I32]),
            Ok(Type::Array(Box::new(Type::I64)))
        );
        assert!(check_builtin_call("range", &[Type::F64, Type::I32]).is_err());
    }
}
