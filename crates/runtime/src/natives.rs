//! Native (builtin) function implementations.
//!
//! Dispatched by `CALL_NATIVE` through the index order defined in
//! `orus_core::natives`. Each native receives its popped arguments and the
//! shared context; failures are plain [`RuntimeError`]s without location,
//! which the VM stamps with the faulting instruction's position.

use crate::error::RuntimeError;
use orus_core::{natives, Context, Obj, RangeObj, Value};
use std::io::BufRead;
use std::time::{SystemTime, UNIX_EPOCH};

/// Static program identity reported by `module_name` / `module_path`.
pub struct NativeEnv {
    pub program_name: String,
    pub program_path: String,
}

pub fn call_native(
    index: u8,
    args: &[Value],
    ctx: &mut Context,
    env: &NativeEnv,
) -> Result<Value, RuntimeError> {
    let Some(def) = natives::NATIVES.get(index as usize) else {
        return Err(RuntimeError::fatal(format!(
            "unknown native index {}",
            index
        )));
    };
    if !def.arity.accepts(args.len() as u8) {
        return Err(RuntimeError::fatal(format!(
            "native '{}' called with {} argument(s)",
            def.name,
            args.len()
        )));
    }
    match def.name {
        "len" => native_len(args[0], ctx),
        "substring" => native_substring(args, ctx),
        "push" => native_push(args, ctx),
        "pop" => native_pop(args[0], ctx),
        "reserve" => native_reserve(args, ctx),
        "range" => native_range(args, ctx),
        "sum" | "min" | "max" => native_fold(def.name, args[0], ctx),
        "type_of" => {
            let name = ctx.type_of_value(args[0]);
            Ok(Value::Obj(ctx.heap.alloc_str(&name)))
        }
        "is_type" => {
            let actual = ctx.type_of_value(args[0]);
            let expected = expect_str(args[1], ctx)?;
            Ok(Value::Bool(actual == expected))
        }
        "input" => {
            let mut line = String::new();
            std::io::stdin()
                .lock()
                .read_line(&mut line)
                .map_err(|e| RuntimeError::io(format!("failed to read input: {}", e)))?;
            while line.ends_with('\n') || line.ends_with('\r') {
                line.pop();
            }
            Ok(Value::Obj(ctx.heap.alloc_str(&line)))
        }
        "int" => native_int(args[0], ctx),
        "float" => native_float(args[0], ctx),
        "timestamp" => {
            let now = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map_err(|e| RuntimeError::io(format!("clock error: {}", e)))?;
            Ok(Value::F64(now.as_secs_f64()))
        }
        "sorted" => native_sorted(args[0], ctx),
        "module_name" => Ok(Value::Obj(ctx.heap.alloc_str(&env.program_name))),
        "module_path" => Ok(Value::Obj(ctx.heap.alloc_str(&env.program_path))),
        "native_pow" => {
            let (a, b) = (expect_f64(args[0])?, expect_f64(args[1])?);
            Ok(Value::F64(a.powf(b)))
        }
        "native_sqrt" => Ok(Value::F64(expect_f64(args[0])?.sqrt())),
        other => Err(RuntimeError::fatal(format!(
            "native '{}' not implemented",
            other
        ))),
    }
}

fn expect_f64(value: Value) -> Result<f64, RuntimeError> {
    match value {
        Value::F64(v) => Ok(v),
        other => Err(RuntimeError::type_error(format!(
            "expected f64, got {}",
            other.tag_name()
        ))),
    }
}

fn expect_str(value: Value, ctx: &Context) -> Result<String, RuntimeError> {
    value
        .as_obj()
        .and_then(|id| ctx.heap.str_value(id))
        .map(str::to_string)
        .ok_or_else(|| {
            RuntimeError::type_error(format!("expected string, got {}", value.tag_name()))
        })
}

fn native_len(value: Value, ctx: &Context) -> Result<Value, RuntimeError> {
    let Some(id) = value.as_obj() else {
        return Err(RuntimeError::type_error("len expects an array or string"));
    };
    let length = match ctx.heap.get(id) {
        Some(Obj::Array(values)) => values.len(),
        Some(Obj::IntArray(values)) => values.len(),
        Some(Obj::Str(s)) => s.chars().count(),
        Some(Obj::Range(r)) => r.count() as usize,
        _ => return Err(RuntimeError::type_error("len expects an array or string")),
    };
    Ok(Value::I32(length as i32))
}

fn native_substring(args: &[Value], ctx: &mut Context) -> Result<Value, RuntimeError> {
    let source = expect_str(args[0], ctx)?;
    let start = expect_index(args[1], "substring start")?;
    let count = expect_index(args[2], "substring length")?;
    let chars: Vec<char> = source.chars().collect();
    let start = start.min(chars.len());
    let end = start.saturating_add(count).min(chars.len());
    let result: String = chars[start..end].iter().collect();
    Ok(Value::Obj(ctx.heap.alloc_str(&result)))
}

fn expect_index(value: Value, what: &str) -> Result<usize, RuntimeError> {
    match value.as_int() {
        Some(v) if v >= 0 => Ok(v as usize),
        Some(v) => Err(RuntimeError::runtime(format!("{} is negative ({})", what, v))),
        None => Err(RuntimeError::type_error(format!("{} must be an integer", what))),
    }
}

fn native_push(args: &[Value], ctx: &mut Context) -> Result<Value, RuntimeError> {
    let Some(id) = args[0].as_obj() else {
        return Err(RuntimeError::type_error("push expects an array"));
    };
    let value = args[1];
    match ctx.heap.get_mut(id) {
        Some(Obj::Array(values)) => {
            values.push(value);
            Ok(Value::Nil)
        }
        Some(Obj::IntArray(values)) => match value.as_int() {
            Some(v) => {
                values.push(v);
                Ok(Value::Nil)
            }
            None => Err(RuntimeError::type_error(
                "push into an integer array requires an integer",
            )),
        },
        _ => Err(RuntimeError::type_error("push expects an array")),
    }
}

fn native_pop(value: Value, ctx: &mut Context) -> Result<Value, RuntimeError> {
    let Some(id) = value.as_obj() else {
        return Err(RuntimeError::type_error("pop expects an array"));
    };
    match ctx.heap.get_mut(id) {
        Some(Obj::Array(values)) => values
            .pop()
            .ok_or_else(|| RuntimeError::runtime("pop from an empty array")),
        Some(Obj::IntArray(values)) => values
            .pop()
            .map(Value::I64)
            .ok_or_else(|| RuntimeError::runtime("pop from an empty array")),
        _ => Err(RuntimeError::type_error("pop expects an array")),
    }
}

fn native_reserve(args: &[Value], ctx: &mut Context) -> Result<Value, RuntimeError> {
    let Some(id) = args[0].as_obj() else {
        return Err(RuntimeError::type_error("reserve expects an array"));
    };
    let additional = expect_index(args[1], "reserve capacity")?;
    match ctx.heap.get_mut(id) {
        Some(Obj::Array(values)) => {
            values.reserve(additional);
            Ok(Value::Nil)
        }
        Some(Obj::IntArray(values)) => {
            values.reserve(additional);
            Ok(Value::Nil)
        }
        _ => Err(RuntimeError::type_error("reserve expects an array")),
    }
}

fn native_range(args: &[Value], ctx: &mut Context) -> Result<Value, RuntimeError> {
    let start = args[0]
        .as_int()
        .ok_or_else(|| RuntimeError::type_error("range bounds must be integers"))?;
    let end = args[1]
        .as_int()
        .ok_or_else(|| RuntimeError::type_error("range bounds must be integers"))?;
    let step = match args.get(2) {
        Some(v) => v
            .as_int()
            .ok_or_else(|| RuntimeError::type_error("range step must be an integer"))?,
        None => 1,
    };
    if step == 0 {
        return Err(RuntimeError::runtime("range step must not be zero"));
    }
    let id = ctx.heap.alloc(Obj::Range(RangeObj { start, end, step }));
    Ok(Value::Obj(id))
}

/// `sum`, `min` and `max` over arrays, integer arrays and ranges.
fn native_fold(name: &str, value: Value, ctx: &mut Context) -> Result<Value, RuntimeError> {
    let Some(id) = value.as_obj() else {
        return Err(RuntimeError::type_error(format!(
            "{} expects an array of numbers",
            name
        )));
    };
    enum Nums {
        Ints(Vec<i64>),
        Floats(Vec<f64>),
        Values(Vec<Value>),
    }
    let nums = match ctx.heap.get(id) {
        Some(Obj::IntArray(values)) => Nums::Ints(values.clone()),
        Some(Obj::Range(r)) => Nums::Ints(r.iter().collect()),
        Some(Obj::Array(values)) => match values.first() {
            Some(Value::F64(_)) => Nums::Floats(
                values
                    .iter()
                    .map(|v| match v {
                        Value::F64(f) => Ok(*f),
                        _ => Err(RuntimeError::type_error("mixed element types")),
                    })
                    .collect::<Result<_, _>>()?,
            ),
            _ => Nums::Values(values.clone()),
        },
        _ => {
            return Err(RuntimeError::type_error(format!(
                "{} expects an array of numbers",
                name
            )))
        }
    };
    match nums {
        Nums::Ints(values) => {
            if values.is_empty() && name != "sum" {
                return Err(RuntimeError::runtime(format!("{} of an empty array", name)));
            }
            let result = match name {
                "sum" => values.iter().sum::<i64>(),
                "min" => *values.iter().min().unwrap_or(&0),
                _ => *values.iter().max().unwrap_or(&0),
            };
            Ok(Value::I64(result))
        }
        Nums::Floats(values) => {
            if values.is_empty() && name != "sum" {
                return Err(RuntimeError::runtime(format!("{} of an empty array", name)));
            }
            let result = match name {
                "sum" => values.iter().sum::<f64>(),
                "min" => values.iter().copied().fold(f64::INFINITY, f64::min),
                _ => values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            };
            Ok(Value::F64(result))
        }
        Nums::Values(values) => {
            // Same-tag integer values; the checker enforced numeric elements.
            let mut ints = Vec::with_capacity(values.len());
            for v in &values {
                match v.as_int() {
                    Some(n) => ints.push(n),
                    None => {
                        return Err(RuntimeError::type_error(format!(
                            "{} expects numeric elements",
                            name
                        )))
                    }
                }
            }
            if ints.is_empty() && name != "sum" {
                return Err(RuntimeError::runtime(format!("{} of an empty array", name)));
            }
            let result = match name {
                "sum" => ints.iter().sum::<i64>(),
                "min" => *ints.iter().min().unwrap_or(&0),
                _ => *ints.iter().max().unwrap_or(&0),
            };
            // Keep the element tag when all inputs share one.
            match values.first() {
                Some(Value::I32(_)) => Ok(Value::I32(result as i32)),
                Some(Value::U32(_)) => Ok(Value::U32(result as u32)),
                Some(Value::U64(_)) => Ok(Value::U64(result as u64)),
                _ => Ok(Value::I64(result)),
            }
        }
    }
}

fn native_int(value: Value, ctx: &Context) -> Result<Value, RuntimeError> {
    let result = match value {
        Value::I32(v) => v,
        Value::I64(v) => v as i32,
        Value::U32(v) => v as i32,
        Value::U64(v) => v as i32,
        Value::F64(v) => v as i32,
        Value::Bool(v) => v as i32,
        Value::Obj(id) => match ctx.heap.str_value(id) {
            Some(s) => s.trim().parse::<i32>().map_err(|_| {
                RuntimeError::runtime(format!("cannot parse '{}' as an integer", s.trim()))
            })?,
            None => return Err(RuntimeError::type_error("int expects a primitive value")),
        },
        Value::Nil => return Err(RuntimeError::type_error("int expects a primitive value")),
    };
    Ok(Value::I32(result))
}

fn native_float(value: Value, ctx: &Context) -> Result<Value, RuntimeError> {
    let result = match value {
        Value::I32(v) => v as f64,
        Value::I64(v) => v as f64,
        Value::U32(v) => v as f64,
        Value::U64(v) => v as f64,
        Value::F64(v) => v,
        Value::Bool(v) => v as u8 as f64,
        Value::Obj(id) => match ctx.heap.str_value(id) {
            Some(s) => s.trim().parse::<f64>().map_err(|_| {
                RuntimeError::runtime(format!("cannot parse '{}' as a float", s.trim()))
            })?,
            None => return Err(RuntimeError::type_error("float expects a primitive value")),
        },
        Value::Nil => return Err(RuntimeError::type_error("float expects a primitive value")),
    };
    Ok(Value::F64(result))
}

/// Ascending sort into a new array; the input is untouched.
fn native_sorted(value: Value, ctx: &mut Context) -> Result<Value, RuntimeError> {
    let Some(id) = value.as_obj() else {
        return Err(RuntimeError::type_error("sorted expects an array"));
    };
    match ctx.heap.get(id) {
        Some(Obj::IntArray(values)) => {
            let mut sorted = values.clone();
            sorted.sort_unstable();
            Ok(Value::Obj(ctx.heap.alloc(Obj::IntArray(sorted))))
        }
        Some(Obj::Array(values)) => {
            let mut sorted = values.clone();
            if sorted.iter().all(|v| matches!(v, Value::F64(_))) {
                sorted.sort_by(|a, b| {
                    let (Value::F64(x), Value::F64(y)) = (a, b) else {
                        return std::cmp::Ordering::Equal;
                    };
                    x.partial_cmp(y).unwrap_or(std::cmp::Ordering::Equal)
                });
            } else if sorted.iter().all(|v| v.as_int().is_some()) {
                sorted.sort_by_key(|v| v.as_int().unwrap_or(0));
            } else if sorted
                .iter()
                .all(|v| v.as_obj().is_some_and(|o| ctx.heap.str_value(o).is_some()))
            {
                let mut keyed: Vec<(String, Value)> = sorted
                    .iter()
                    .map(|v| {
                        let text = v
                            .as_obj()
                            .and_then(|o| ctx.heap.str_value(o))
                            .unwrap_or_default()
                            .to_string();
                        (text, *v)
                    })
                    .collect();
                keyed.sort_by(|a, b| a.0.cmp(&b.0));
                sorted = keyed.into_iter().map(|(_, v)| v).collect();
            } else {
                return Err(RuntimeError::type_error("sorted expects a sortable array"));
            }
            Ok(Value::Obj(ctx.heap.alloc(Obj::Array(sorted))))
        }
        _ => Err(RuntimeError::type_error("sorted expects an array")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env() -> NativeEnv {
        NativeEnv {
            program_name: "test".to_string(),
            program_path: "test.orus".to_string(),
        }
    }

    fn index_of(name: &str) -> u8 {
        natives::lookup(name).unwrap().0
    }

    #[test]
    fn test_len_and_push() {
        let mut ctx = Context::new();
        let arr = Value::Obj(ctx.heap.alloc(Obj::Array(vec![Value::I32(1)])));
        let n = call_native(index_of("len"), &[arr], &mut ctx, &env()).unwrap();
        assert_eq!(n, Value::I32(1));
        call_native(index_of("push"), &[arr, Value::I32(9)], &mut ctx, &env()).unwrap();
        let n = call_native(index_of("len"), &[arr], &mut ctx, &env()).unwrap();
        assert_eq!(n, Value::I32(2));
    }

    #[test]
    fn test_pop_empty_errors() {
        let mut ctx = Context::new();
        let arr = Value::Obj(ctx.heap.alloc(Obj::Array(Vec::new())));
        let error = call_native(index_of("pop"), &[arr], &mut ctx, &env()).unwrap_err();
        assert!(error.message.contains("empty"));
        assert!(!error.fatal);
    }

    #[test]
    fn test_sum_over_range() {
        let mut ctx = Context::new();
        let range = call_native(
            index_of("range"),
            &[Value::I32(1), Value::I32(5)],
            &mut ctx,
            &env(),
        )
        .unwrap();
        let total = call_native(index_of("sum"), &[range], &mut ctx, &env()).unwrap();
        assert_eq!(total, Value::I64(10));
    }

    #[test]
    fn test_sorted_leaves_sorted_input_unchanged() {
        let mut ctx = Context::new();
        let arr = Value::Obj(ctx.heap.alloc(Obj::Array(vec![
            Value::I32(1),
            Value::I32(2),
            Value::I32(3),
        ])));
        let sorted = call_native(index_of("sorted"), &[arr], &mut ctx, &env()).unwrap();
        let Some(Obj::Array(values)) = ctx.heap.get(sorted.as_obj().unwrap()) else {
            panic!();
        };
        assert_eq!(values, &vec![Value::I32(1), Value::I32(2), Value::I32(3)]);
        // New array, not the same object.
        assert_ne!(sorted, arr);
    }

    #[test]
    fn test_type_of_round_trips_is_type() {
        let mut ctx = Context::new();
        let value = Value::I64(5);
        let name = call_native(index_of("type_of"), &[value], &mut ctx, &env()).unwrap();
        let result = call_native(index_of("is_type"), &[value, name], &mut ctx, &env()).unwrap();
        assert_eq!(result, Value::Bool(true));
    }

    #[test]
    fn test_int_parses_and_rejects() {
        let mut ctx = Context::new();
        let s = Value::Obj(ctx.heap.alloc_str(" 42 "));
        assert_eq!(
            call_native(index_of("int"), &[s], &mut ctx, &env()).unwrap(),
            Value::I32(42)
        );
        let bad = Value::Obj(ctx.heap.alloc_str("nope"));
        assert!(call_native(index_of("int"), &[bad], &mut ctx, &env()).is_err());
    }

    #[test]
    fn test_substring() {
        let mut ctx = Context::new();
        let s = Value::Obj(ctx.heap.alloc_str("hello world"));
        let result = call_native(
            index_of("substring"),
            &[s, Value::I32(6), Value::I32(5)],
            &mut ctx,
            &env(),
        )
        .unwrap();
        assert_eq!(
            ctx.heap.str_value(result.as_obj().unwrap()),
            Some("world")
        );
    }

    #[test]
    fn test_native_pow_sqrt() {
        let mut ctx = Context::new();
        assert_eq!(
            call_native(
                index_of("native_pow"),
                &[Value::F64(2.0), Value::F64(10.0)],
                &mut ctx,
                &env()
            )
            .unwrap(),
            Value::F64(1024.0)
        );
        assert_eq!(
            call_native(index_of("native_sqrt"), &[Value::F64(9.0)], &mut ctx, &env()).unwrap(),
            Value::F64(3.0)
        );
    }
}
