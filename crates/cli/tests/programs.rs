//! Whole-program tests through the CLI pipeline: modules on disk, project
//! manifests, and exit-code behavior.

use orus_cli::{execute, Mode, EXIT_COMPILE_ERROR, EXIT_OK, EXIT_RUNTIME_ERROR};
use std::path::{Path, PathBuf};

fn write(dir: &Path, name: &str, source: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, source).unwrap();
    path
}

fn run(path: &Path) -> (i32, String) {
    let mut out = Vec::new();
    let code = execute(path, &mut out, Mode::Run, false);
    (code, String::from_utf8(out).unwrap())
}

#[test]
fn test_module_import_and_public_access() {
    let dir = tempfile::tempdir().unwrap();
    write(
        dir.path(),
        "mathx.orus",
        "pub fn double(x: i32) -> i32 { return x * 2 }\n\
         pub let scale = 10\n\
         print(\"init\")\n",
    );
    let main = write(
        dir.path(),
        "main.orus",
        "use \"mathx\" as mathx\n\
         fn main() { print(\"{} {}\", mathx.double(21), mathx.scale) }\n",
    );
    let (code, output) = run(&main);
    assert_eq!(code, EXIT_OK);
    // The module initializer runs exactly once, before main's body uses it.
    assert_eq!(output, "init\n42 10\n");
}

#[test]
fn test_module_initializer_runs_once() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "counter.orus", "print(\"counted\")\npub let n = 1\n");
    write(
        dir.path(),
        "middle.orus",
        "use \"counter\" as counter\npub fn peek() -> i32 { return counter.n }\n",
    );
    let main = write(
        dir.path(),
        "main.orus",
        "use \"counter\" as counter\n\
         use \"middle\" as middle\n\
         fn main() { print(\"{} {}\", counter.n, middle.peek()) }\n",
    );
    let (code, output) = run(&main);
    assert_eq!(code, EXIT_OK);
    let counted = output.matches("counted").count();
    assert_eq!(counted, 1, "initializer ran {} times:\n{}", counted, output);
    assert!(output.ends_with("1 1\n"));
}

#[test]
fn test_private_module_member_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "secret.orus", "let hidden = 5\n");
    let main = write(
        dir.path(),
        "main.orus",
        "use \"secret\" as secret\nfn main() { print(\"{}\", secret.hidden) }\n",
    );
    let (code, _) = run(&main);
    assert_eq!(code, EXIT_COMPILE_ERROR);
}

#[test]
fn test_missing_module_is_compile_error() {
    let dir = tempfile::tempdir().unwrap();
    let main = write(
        dir.path(),
        "main.orus",
        "use \"nowhere\" as nowhere\nfn main() { }\n",
    );
    let (code, _) = run(&main);
    assert_eq!(code, EXIT_COMPILE_ERROR);
}

#[test]
fn test_manifest_module_paths() {
    let dir = tempfile::tempdir().unwrap();
    let lib = dir.path().join("lib");
    std::fs::create_dir(&lib).unwrap();
    write(&lib, "util.orus", "pub fn three() -> i32 { return 3 }\n");
    write(
        dir.path(),
        "orus.toml",
        "[project]\nname = \"demo\"\nmodule-paths = [\"lib\"]\n",
    );
    let main = write(
        dir.path(),
        "main.orus",
        "use \"util\" as util\nfn main() { print(\"{}\", util.three()) }\n",
    );
    let (code, output) = run(&main);
    assert_eq!(code, EXIT_OK);
    assert_eq!(output, "3\n");
}

#[test]
fn test_runtime_error_exit_code_with_catchless_program() {
    let dir = tempfile::tempdir().unwrap();
    let main = write(
        dir.path(),
        "main.orus",
        "fn main() { let a = [1]\nlet i = 1\nprint(\"{}\", a[i]) }\n",
    );
    let (code, _) = run(&main);
    assert_eq!(code, EXIT_RUNTIME_ERROR);
}

#[test]
fn test_caught_error_exits_cleanly() {
    let dir = tempfile::tempdir().unwrap();
    let main = write(
        dir.path(),
        "main.orus",
        "fn main() { try { let a = [1]\nlet i = 1\nprint(\"{}\", a[i]) } catch e { print(\"ok\") } }\n",
    );
    let (code, output) = run(&main);
    assert_eq!(code, EXIT_OK);
    assert_eq!(output, "ok\n");
}

#[test]
fn test_disasm_lists_module_imports() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "m.orus", "pub let x = 1\n");
    let main = write(
        dir.path(),
        "main.orus",
        "use \"m\" as m\nfn main() { print(\"{}\", m.x) }\n",
    );
    let mut out = Vec::new();
    assert_eq!(execute(&main, &mut out, Mode::Disasm, false), EXIT_OK);
    let listing = String::from_utf8(out).unwrap();
    assert!(listing.contains("Import"));
}
