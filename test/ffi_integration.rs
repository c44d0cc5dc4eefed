//! FFI Integration Tests
//!
//! End-to-end calls into the system C and math libraries through declared
//! signatures. Linux only: library names are the glibc sonames.

#![cfg(target_os = "linux")]

use std::sync::Arc;
use std::thread;

use typed_dl::ffi::{FfiError, Runtime, Value};
use typed_dl::{LibrarySpec, Manifest};

const LIBC: &str = "libc.so.6";
const LIBM: &str = "libm.so.6";
const NO_ARGS: &[&str] = &[];

// ============================================================================
// Loading
// ============================================================================

#[test]
fn test_open_nonexistent_path() {
    let runtime = Runtime::new();
    match runtime.open("/nonexistent/path") {
        Err(FfiError::LoadError(msg)) => assert!(!msg.is_empty()),
        other => panic!("expected LoadError, got {:?}", other),
    }
    assert!(runtime.open_handles().is_empty());
}

#[test]
fn test_open_invalid_library() {
    let path = std::env::temp_dir().join(format!("typed_dl_not_elf_{}.so", std::process::id()));
    std::fs::write(&path, b"this is not a shared object").unwrap();

    let runtime = Runtime::new();
    let result = runtime.open(path.to_str().unwrap());
    std::fs::remove_file(&path).ok();

    assert!(matches!(result, Err(FfiError::LoadError(_))));
}

#[test]
fn test_declare_nonexistent_symbol() {
    let runtime = Runtime::new();
    let libc = runtime.open(LIBC).unwrap();
    assert!(matches!(
        runtime.declare(&libc, "nonexistent_symbol", NO_ARGS, "void"),
        Err(FfiError::SymbolNotFound(_))
    ));
}

#[test]
fn test_declare_unknown_tag() {
    let runtime = Runtime::new();
    let libc = runtime.open(LIBC).unwrap();
    assert!(matches!(
        runtime.declare(&libc, "foo", &["bogus"], "int"),
        Err(FfiError::UnknownTypeTag(ref t)) if t == "bogus"
    ));
    assert!(matches!(
        runtime.declare(&libc, "abs", &["int"], "long"),
        Err(FfiError::UnknownTypeTag(ref t)) if t == "long"
    ));
}

// ============================================================================
// Calls
// ============================================================================

#[test]
fn test_abs() {
    let runtime = Runtime::new();
    let libc = runtime.open(LIBC).unwrap();
    let abs = runtime.declare(&libc, "abs", &["int"], "int").unwrap();

    assert_eq!(abs.call(&[Value::Int(-5)]).unwrap(), Value::Int(5));
    assert_eq!(abs.call(&[Value::Int(7)]).unwrap(), Value::Int(7));
}

#[test]
fn test_strlen() {
    let runtime = Runtime::new();
    let libc = runtime.open(LIBC).unwrap();
    let strlen = runtime.declare(&libc, "strlen", &["string"], "int").unwrap();

    assert_eq!(strlen.call(&[Value::from("hello")]).unwrap(), Value::Int(5));
    assert_eq!(strlen.call(&[Value::from("")]).unwrap(), Value::Int(0));
    // Multi-byte UTF-8 is passed through as bytes.
    assert_eq!(strlen.call(&[Value::from("héllo")]).unwrap(), Value::Int(6));
}

#[test]
fn test_arity_mismatch() {
    let runtime = Runtime::new();
    let libc = runtime.open(LIBC).unwrap();
    let abs = runtime.declare(&libc, "abs", &["int"], "int").unwrap();

    assert!(matches!(
        abs.call(&[]),
        Err(FfiError::ArityMismatch {
            expected: 1,
            got: 0
        })
    ));
    assert!(matches!(
        abs.call(&[Value::Int(1), Value::Int(2)]),
        Err(FfiError::ArityMismatch {
            expected: 1,
            got: 2
        })
    ));
}

#[test]
fn test_wrong_argument_kind() {
    let runtime = Runtime::new();
    let libc = runtime.open(LIBC).unwrap();
    let strlen = runtime.declare(&libc, "strlen", &["string"], "int").unwrap();

    assert!(matches!(
        strlen.call(&[Value::Int(5)]),
        Err(FfiError::ArgumentType { index: 0, .. })
    ));
}

#[test]
fn test_double_arguments() {
    let runtime = Runtime::new();
    let libm = runtime.open(LIBM).unwrap();
    let pow = runtime
        .declare(&libm, "pow", &["double", "double"], "double")
        .unwrap();

    assert_eq!(
        pow.call(&[Value::Float(2.0), Value::Float(10.0)]).unwrap(),
        Value::Float(1024.0)
    );
    // Integers widen for double parameters.
    assert_eq!(
        pow.call(&[Value::Int(3), Value::Int(2)]).unwrap(),
        Value::Float(9.0)
    );
}

#[test]
fn test_mixed_double_and_int_arguments() {
    let runtime = Runtime::new();
    let libm = runtime.open(LIBM).unwrap();
    let ldexp = runtime
        .declare(&libm, "ldexp", &["double", "int"], "double")
        .unwrap();

    assert_eq!(
        ldexp.call(&[Value::Float(1.5), Value::Int(3)]).unwrap(),
        Value::Float(12.0)
    );
}

#[test]
fn test_string_and_int_arguments() {
    let runtime = Runtime::new();
    let libc = runtime.open(LIBC).unwrap();
    let strchr = runtime
        .declare(&libc, "strchr", &["string", "int"], "string")
        .unwrap();
    let strtod = runtime
        .declare(&libc, "strtod", &["string", "pointer"], "double")
        .unwrap();

    assert_eq!(
        strchr
            .call(&[Value::from("hello"), Value::Int(i64::from(b'l'))])
            .unwrap(),
        Value::Str("llo".to_string())
    );
    // Not found returns NULL, which converts to the empty string.
    assert_eq!(
        strchr
            .call(&[Value::from("hello"), Value::Int(i64::from(b'z'))])
            .unwrap(),
        Value::Str(String::new())
    );
    assert_eq!(
        strtod
            .call(&[Value::from("2.5e2"), Value::Pointer(runtime.null_pointer())])
            .unwrap(),
        Value::Float(250.0)
    );
}

#[test]
fn test_pointer_round_trip() {
    let runtime = Runtime::new();
    let libc = runtime.open(LIBC).unwrap();
    let strdup = runtime.declare(&libc, "strdup", &["string"], "pointer").unwrap();
    let strlen = runtime.declare(&libc, "strlen", &["pointer"], "int").unwrap();
    let free = runtime.declare(&libc, "free", &["pointer"], "void").unwrap();

    let copy = strdup.call(&[Value::from("pointer test")]).unwrap();
    let ptr = copy.as_pointer().expect("strdup returns a pointer");
    assert!(!ptr.is_null());

    assert_eq!(strlen.call(&[copy.clone()]).unwrap(), Value::Int(12));
    assert_eq!(free.call(&[copy]).unwrap(), Value::Void);
}

#[test]
fn test_null_pointer_argument() {
    let runtime = Runtime::new();
    let libc = runtime.open(LIBC).unwrap();
    let free = runtime.declare(&libc, "free", &["pointer"], "void").unwrap();

    // free(NULL) is a no-op.
    assert_eq!(
        free.call(&[Value::Pointer(runtime.null_pointer())]).unwrap(),
        Value::Void
    );
}

#[test]
fn test_pointer_from_other_runtime_rejected() {
    let ours = Runtime::new();
    let theirs = Runtime::new();
    let libc = ours.open(LIBC).unwrap();
    let free = ours.declare(&libc, "free", &["pointer"], "void").unwrap();

    assert!(matches!(
        free.call(&[Value::Pointer(theirs.null_pointer())]),
        Err(FfiError::ForeignPointer { index: 0 })
    ));
}

// ============================================================================
// Handle lifetime
// ============================================================================

#[test]
fn test_call_after_close() {
    let runtime = Runtime::new();
    let libc = runtime.open(LIBC).unwrap();
    let abs = runtime.declare(&libc, "abs", &["int"], "int").unwrap();
    let strlen = runtime.declare(&libc, "strlen", &["string"], "int").unwrap();

    runtime.close(&libc);

    assert!(matches!(abs.call(&[Value::Int(-5)]), Err(FfiError::HandleClosed)));
    assert!(matches!(
        strlen.call(&[Value::from("hello")]),
        Err(FfiError::HandleClosed)
    ));
    assert_eq!(
        runtime.last_error().as_deref(),
        Some("Library handle is closed")
    );
}

#[test]
fn test_same_path_twice_is_independent() {
    let runtime = Runtime::new();
    let first = runtime.open(LIBC).unwrap();
    let second = runtime.open(LIBC).unwrap();
    assert_ne!(first.id(), second.id());
    assert_eq!(runtime.open_handles().len(), 2);

    let abs_first = runtime.declare(&first, "abs", &["int"], "int").unwrap();
    let abs_second = runtime.declare(&second, "abs", &["int"], "int").unwrap();

    runtime.close(&first);

    assert!(matches!(
        abs_first.call(&[Value::Int(-1)]),
        Err(FfiError::HandleClosed)
    ));
    assert_eq!(abs_second.call(&[Value::Int(-1)]).unwrap(), Value::Int(1));
    assert_eq!(runtime.open_handles().len(), 1);
}

#[test]
fn test_dropping_runtime_invalidates_functions() {
    let abs = {
        let runtime = Runtime::new();
        let libc = runtime.open(LIBC).unwrap();
        runtime.declare(&libc, "abs", &["int"], "int").unwrap()
    };

    assert!(!abs.is_live());
    assert!(matches!(abs.call(&[Value::Int(-3)]), Err(FfiError::HandleClosed)));
}

// ============================================================================
// Concurrency
// ============================================================================

#[test]
fn test_concurrent_calls() {
    let runtime = Arc::new(Runtime::new());
    let libc = runtime.open(LIBC).unwrap();
    let abs = runtime.declare(&libc, "abs", &["int"], "int").unwrap();

    let workers: Vec<_> = (0..8)
        .map(|i| {
            let abs = abs.clone();
            let runtime = Arc::clone(&runtime);
            let libc = libc.clone();
            thread::spawn(move || {
                // Each thread also exercises the handle table.
                let strlen = runtime.declare(&libc, "strlen", &["string"], "int").unwrap();
                for n in 0..200 {
                    let v = -(i * 1000 + n);
                    assert_eq!(abs.call(&[Value::Int(v)]).unwrap(), Value::Int(-v));
                }
                strlen.call(&[Value::from("thread")]).unwrap()
            })
        })
        .collect();

    for worker in workers {
        assert_eq!(worker.join().unwrap(), Value::Int(6));
    }
}

#[test]
fn test_concurrent_open_close() {
    let runtime = Arc::new(Runtime::new());

    let workers: Vec<_> = (0..4)
        .map(|_| {
            let runtime = Arc::clone(&runtime);
            thread::spawn(move || {
                for _ in 0..25 {
                    let libc = runtime.open(LIBC).unwrap();
                    let abs = runtime.declare(&libc, "abs", &["int"], "int").unwrap();
                    assert_eq!(abs.call(&[Value::Int(-9)]).unwrap(), Value::Int(9));
                    runtime.close(&libc);
                    assert!(matches!(abs.call(&[Value::Int(-9)]), Err(FfiError::HandleClosed)));
                }
            })
        })
        .collect();

    for worker in workers {
        worker.join().unwrap();
    }
    assert!(runtime.open_handles().is_empty());
}

// ============================================================================
// Manifests
// ============================================================================

#[test]
fn test_load_manifest() {
    let manifest: Manifest = r#"
[[library]]
name = "c"
path = "libc.so.6"

[library.symbols.abs]
args = ["int"]
ret = "int"

[library.symbols.not_exported_anywhere]

[[library]]
name = "m"
path = "libm.so.6"

[library.symbols.sqrt]
args = ["double"]
ret = "double"
"#
    .parse()
    .unwrap();

    let runtime = Runtime::with_config(&manifest.runtime_config());
    let bindings = runtime.load_manifest(&manifest).unwrap();
    assert_eq!(bindings.len(), 2);

    let c = &bindings[0];
    assert_eq!(c.missing(), &["not_exported_anywhere".to_string()]);
    assert_eq!(
        c.get("abs").unwrap().call(&[Value::Int(-4)]).unwrap(),
        Value::Int(4)
    );

    let m = &bindings[1];
    assert_eq!(
        m.get("sqrt").unwrap().call(&[Value::Float(81.0)]).unwrap(),
        Value::Float(9.0)
    );
}

#[test]
fn test_bind_library_open_failure() {
    let runtime = Runtime::new();
    let spec = LibrarySpec::new("ghost")
        .with_path("/nonexistent/libghost.so")
        .with_symbol("anything", NO_ARGS, "void");

    assert!(matches!(
        runtime.bind_library(&spec),
        Err(FfiError::LoadError(_))
    ));
}

#[test]
fn test_load_manifest_is_all_or_nothing() {
    let manifest: Manifest = r#"
[[library]]
name = "c"
path = "libc.so.6"

[library.symbols.abs]
args = ["int"]
ret = "int"

[[library]]
name = "ghost"
path = "/nonexistent/libghost.so"
"#
    .parse()
    .unwrap();

    let runtime = Runtime::with_config(&manifest.runtime_config());
    assert!(matches!(
        runtime.load_manifest(&manifest),
        Err(FfiError::LoadError(_))
    ));
    assert!(runtime.open_handles().is_empty());

    // The runtime stays usable afterwards.
    let libc = runtime.open(LIBC).unwrap();
    assert_eq!(runtime.open_handles().len(), 1);
    runtime.close(&libc);
}

#[test]
fn test_close_from_foreign_runtime_keeps_library_open() {
    let owner = Runtime::new();
    let other = Runtime::new();
    let libc = owner.open(LIBC).unwrap();
    let abs = owner.declare(&libc, "abs", &["int"], "int").unwrap();

    other.close(&libc);

    assert!(abs.is_live());
    assert_eq!(abs.call(&[Value::Int(-7)]).unwrap(), Value::Int(7));
    assert_eq!(owner.open_handles().len(), 1);
    assert!(other.open_handles().is_empty());
}
