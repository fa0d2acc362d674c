//! End-to-end interpreter tests: compile source through the real front end
//! and run it, asserting on program output.

use orus_compiler::compile;
use orus_core::Context;
use orus_runtime::{run_chunk, RuntimeError, VmOptions};

fn interpret(source: &str) -> Result<String, String> {
    let mut ctx = Context::new();
    let (chunk, _session) = compile(source, "test.orus", &mut ctx, Vec::new()).map_err(|diags| {
        diags
            .iter()
            .map(|d| format!("{}: {}", d.code, d.message))
            .collect::<Vec<_>>()
            .join("\n")
    })?;
    let mut out = Vec::new();
    run_chunk(&mut ctx, &chunk, 0, &mut out, VmOptions::default())
        .map_err(|e| e.to_string())?;
    Ok(String::from_utf8(out).expect("utf8 output"))
}

fn run_ok(source: &str) -> String {
    match interpret(source) {
        Ok(output) => output,
        Err(error) => panic!("program failed:\n{}", error),
    }
}

fn run_err(source: &str) -> RuntimeError {
    let mut ctx = Context::new();
    let (chunk, _) = compile(source, "test.orus", &mut ctx, Vec::new()).expect("compiles");
    let mut out = Vec::new();
    run_chunk(&mut ctx, &chunk, 0, &mut out, VmOptions::default())
        .expect_err("expected a runtime error")
}

#[test]
fn test_hello() {
    assert_eq!(run_ok("fn main() { print(\"hello\") }\n"), "hello\n");
}

#[test]
fn test_arithmetic_precedence() {
    assert_eq!(
        run_ok("fn main() { let x: i32 = 2 + 3 * 4 ; print(\"{}\", x) }\n"),
        "14\n"
    );
}

#[test]
fn test_recursive_factorial() {
    let source = "fn fact(n: i32) -> i32 { if n <= 1 { return 1 } return n * fact(n - 1) } \
                  fn main() { print(\"{}\", fact(6)) }\n";
    assert_eq!(run_ok(source), "720\n");
}

#[test]
fn test_array_push_and_len() {
    let source =
        "fn main() { let a = [1,2,3]; push(a, 4); print(\"{} {}\", len(a), a[3]) }\n";
    assert_eq!(run_ok(source), "4 4\n");
}

#[test]
fn test_try_catch_out_of_bounds() {
    let source = "fn main() { try { let arr = [1]; print(\"{}\", arr[5]) } catch e { print(\"caught: {}\", e) } }\n";
    let output = run_ok(source);
    assert!(
        output.starts_with("caught:"),
        "unexpected output: {}",
        output
    );
    assert_eq!(output.lines().count(), 1);
}

#[test]
fn test_for_loop_range() {
    assert_eq!(
        run_ok("fn main() { for i in 0..3 { print(\"{}\", i) } }\n"),
        "0\n1\n2\n"
    );
}

#[test]
fn test_for_loop_with_step() {
    assert_eq!(
        run_ok("fn main() { for i in 0..10..3 { print(\"{}\", i) } }\n"),
        "0\n3\n6\n9\n"
    );
}

#[test]
fn test_while_with_break_continue() {
    let source = "fn main() {\n\
                  let mut i = 0\n\
                  while true {\n\
                  i = i + 1\n\
                  if i == 2 { continue }\n\
                  if i > 4 { break }\n\
                  print(\"{}\", i)\n\
                  }\n\
                  }\n";
    assert_eq!(run_ok(source), "1\n3\n4\n");
}

#[test]
fn test_string_concat_with_to_string() {
    assert_eq!(
        run_ok("fn main() { print(\"n = \" + 42) }\n"),
        "n = 42\n"
    );
}

#[test]
fn test_promotion_preserves_value() {
    let source = "fn main() { let big: i64 = 5000000000\nlet small: i32 = 7\nprint(\"{}\", big + small) }\n";
    assert_eq!(run_ok(source), "5000000007\n");
}

#[test]
fn test_u64_cast_wraps_to_i32() {
    let source = "fn main() { let x: u64 = 4294967296\nprint(\"{}\", x as i32) }\n";
    assert_eq!(run_ok(source), "0\n");
}

#[test]
fn test_cast_to_own_type_is_noop() {
    let source = "fn main() { let x: i32 = 9\nprint(\"{}\", x as i32) }\n";
    assert_eq!(run_ok(source), "9\n");
}

#[test]
fn test_index_equal_to_len_raises() {
    let error = run_err("fn main() { let a = [1, 2]\nlet i = 2\nprint(\"{}\", a[i]) }\n");
    assert!(error.message.contains("out of bounds"));
    assert_eq!(error.line, 3);
}

#[test]
fn test_division_by_zero_raises() {
    let error = run_err("fn main() { let z = 0\nprint(\"{}\", 1 / z) }\n");
    assert!(error.message.contains("division by zero"));
}

#[test]
fn test_float_division_yields_infinity() {
    assert_eq!(
        run_ok("fn main() { let z = 0.0\nprint(\"{}\", 1.0 / z) }\n"),
        "inf\n"
    );
}

#[test]
fn test_modulo_by_zero_raises() {
    let error = run_err("fn main() { let z = 0\nprint(\"{}\", 5 % z) }\n");
    assert!(error.message.contains("division by zero"));
}

#[test]
fn test_struct_methods_and_field_set() {
    let source = "struct Point { x: i32, y: i32 }\n\
                  impl Point { fn sum(self) -> i32 { return self.x + self.y } }\n\
                  fn main() {\n\
                  let p = Point { x: 1, y: 2 }\n\
                  p.x = 10\n\
                  print(\"{}\", p.sum())\n\
                  }\n";
    assert_eq!(run_ok(source), "12\n");
}

#[test]
fn test_struct_to_string_used_by_print() {
    let source = "struct Point { x: i32, y: i32 }\n\
                  impl Point { fn to_string(self) -> string { return \"(\" + self.x + \", \" + self.y + \")\" } }\n\
                  fn main() { let p = Point { x: 3, y: 4 }\nprint(p) }\n";
    assert_eq!(run_ok(source), "(3, 4)\n");
}

#[test]
fn test_enum_variants_and_equality() {
    let source = "enum Color { Red, Green }\n\
                  fn main() {\n\
                  let a = Color.Red\n\
                  let b = Color.Red\n\
                  let c = Color.Green\n\
                  print(\"{}\", a == b)\n\
                  print(\"{}\", a == c)\n\
                  }\n";
    assert_eq!(run_ok(source), "true\nfalse\n");
}

#[test]
fn test_generic_function_two_instantiations() {
    let source = "fn first<T>(xs: [T]) -> T { return xs[0] }\n\
                  fn main() {\n\
                  print(\"{}\", first([7, 8]))\n\
                  print(\"{}\", first([\"a\", \"b\"]))\n\
                  }\n";
    assert_eq!(run_ok(source), "7\na\n");
}

#[test]
fn test_generic_explicit_arguments() {
    let source = "fn zero<T>(x: T) -> T { return x }\n\
                  fn main() { print(\"{}\", zero<i64>(5)) }\n";
    assert_eq!(run_ok(source), "5\n");
}

#[test]
fn test_print_prefix_split_ordering() {
    // The prefix before the first placeholder reaches stdout before the
    // argument evaluates; an argument that raises proves the ordering.
    let mut ctx = Context::new();
    let (chunk, _) = compile(
        "fn boom() -> i32 { let z = 0\nreturn 1 / z }\nfn main() { print(\"before: {}\", boom()) }\n",
        "test.orus",
        &mut ctx,
        Vec::new(),
    )
    .expect("compiles");
    let mut out = Vec::new();
    let result = run_chunk(&mut ctx, &chunk, 0, &mut out, VmOptions::default());
    assert!(result.is_err());
    assert_eq!(String::from_utf8(out).unwrap(), "before: ");
}

#[test]
fn test_logical_short_circuit() {
    let source = "fn side() -> bool { print(\"evaluated\")\nreturn true }\n\
                  fn main() {\n\
                  if false and side() { print(\"no\") }\n\
                  if true or side() { print(\"yes\") }\n\
                  }\n";
    assert_eq!(run_ok(source), "yes\n");
}

#[test]
fn test_sorted_is_idempotent_on_sorted_input() {
    let source = "fn main() {\n\
                  let a = [3, 1, 2]\n\
                  let s = sorted(a)\n\
                  let t = sorted(s)\n\
                  print(\"{} {} {}\", t[0], t[1], t[2])\n\
                  print(\"{}\", a[0])\n\
                  }\n";
    assert_eq!(run_ok(source), "1 2 3\n3\n");
}

#[test]
fn test_type_of_round_trip() {
    let source = "fn main() {\n\
                  let t = type_of(5)\n\
                  print(\"{}\", is_type(5, t))\n\
                  print(t)\n\
                  }\n";
    assert_eq!(run_ok(source), "true\ni32\n");
}

#[test]
fn test_slice_forms() {
    let source = "fn main() {\n\
                  let a = [10, 20, 30, 40]\n\
                  let b = a[1..3]\n\
                  print(\"{} {} {}\", len(b), b[0], b[1])\n\
                  let c = a[..2]\n\
                  print(\"{}\", len(c))\n\
                  let d = a[2..]\n\
                  print(\"{}\", d[0])\n\
                  }\n";
    assert_eq!(run_ok(source), "2 20 30\n2\n30\n");
}

#[test]
fn test_range_builtin_folds() {
    let source = "fn main() { print(\"{} {}\", sum(range(1, 5)), len(range(0, 10, 2)) ) }\n";
    assert_eq!(run_ok(source), "10 5\n");
}

#[test]
fn test_gc_stress_allocation_loop() {
    // Churn enough string garbage to force several collections; the live
    // accumulator array must survive them.
    let source = "fn main() {\n\
                  let keep = [\"start\"]\n\
                  let mut i = 0\n\
                  while i < 5000 {\n\
                  let tmp = \"garbage \" + i\n\
                  i = i + 1\n\
                  }\n\
                  push(keep, \"end\")\n\
                  print(\"{} {} {}\", len(keep), keep[0], keep[1])\n\
                  }\n";
    assert_eq!(run_ok(source), "2 start end\n");
}

#[test]
fn test_nested_try_rethrow_to_outer() {
    let source = "fn main() {\n\
                  try {\n\
                  try { let z = 0\nprint(\"{}\", 1 / z) } catch inner { print(\"inner: {}\", inner) }\n\
                  let a = [1]\n\
                  print(\"{}\", a[9])\n\
                  } catch outer { print(\"outer: {}\", outer) }\n\
                  }\n";
    let output = run_ok(source);
    assert!(output.contains("inner: "));
    assert!(output.contains("outer: "));
}

#[test]
fn test_error_across_call_unwinds_frames() {
    let source = "fn risky() -> i32 { let z = 0\nreturn 1 / z }\n\
                  fn main() {\n\
                  try { print(\"{}\", risky()) } catch e { print(\"caught: {}\", e) }\n\
                  print(\"after\")\n\
                  }\n";
    let output = run_ok(source);
    assert!(output.starts_with("caught:"));
    assert!(output.ends_with("after\n"));
}

#[test]
fn test_uncaught_error_reports_location() {
    let error = run_err("fn main() {\nlet a = [1]\nlet i = 3\nprint(\"{}\", a[i])\n}\n");
    assert_eq!(error.line, 4);
    assert!(error.column > 0);
}

#[test]
fn test_static_and_const_globals() {
    // `static` declarations are mutable module-level slots.
    let source = "const LIMIT = 10\n\
                  static count: i32 = 0\n\
                  fn bump() { count = count + 1 }\n\
                  fn main() { bump()\nbump()\nprint(\"{} {}\", count, LIMIT) }\n";
    assert_eq!(run_ok(source), "2 10\n");
}

#[test]
fn test_nil_refinement_on_first_assignment() {
    let source = "fn main() {\n\
                  let mut x = nil\n\
                  x = 5\n\
                  print(\"{}\", x + 1)\n\
                  }\n";
    assert_eq!(run_ok(source), "6\n");
}
