//! Integration Test: Panic Prohibition
//!
//! **Policy**: Production code propagates errors with `?` or handles them.
//! It does not call `unwrap()` or `expect()`.
//! **Exceptions**: Test code (#[cfg(test)] modules), doc comments.

use architectural_enforcement::{is_panicking_unwrap, scan};

#[test]
fn test_no_unwrap_in_production_code() {
    let violations = scan(|lines, idx| is_panicking_unwrap(lines[idx].1));

    if !violations.is_empty() {
        eprintln!("\n❌ CRITICAL: unwrap()/expect() found in production code!\n");
        for violation in &violations {
            eprintln!("  ❌ {violation}");
        }
        eprintln!("\n✅ Return a Result, use `let ... else`, or fall back with `unwrap_or`.");

        panic!(
            "\nFound {} panic site(s) in production code.\nFix these before merging!",
            violations.len()
        );
    }
}
