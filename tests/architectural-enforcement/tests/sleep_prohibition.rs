//! Integration Test: Sleep Prohibition
//!
//! **Policy**: Production code waits on I/O, timers from `tokio::time::interval`,
//! or channels. It does not sleep.
//! **Exceptions**: Reconnect backoff and shutdown grace periods, test code.

use architectural_enforcement::{is_backoff_context, is_sleep_call, production_files, scan};

#[test]
fn test_production_sources_found() {
    assert!(
        !production_files().is_empty(),
        "no production sources found; check PRODUCTION_ROOTS"
    );
}

#[test]
fn test_no_sleep_in_production_code() {
    let violations = scan(|lines, idx| {
        is_sleep_call(lines[idx].1) && !is_backoff_context(lines, idx)
    });

    if !violations.is_empty() {
        eprintln!("\n❌ CRITICAL: Sleep calls found in production code!\n");
        for violation in &violations {
            eprintln!("  ❌ {violation}");
        }
        eprintln!("\n✅ ACCEPTABLE sleep uses:");
        eprintln!("  - Reconnect backoff");
        eprintln!("  - Unsubscribe grace on shutdown");
        eprintln!("  - Test code (#[cfg(test)] modules)");
        eprintln!("\n❌ FORBIDDEN:");
        eprintln!("  - Sleep in polling loops (use tokio::time::interval)");
        eprintln!("  - Sleep as poor man's synchronization");

        panic!(
            "\nFound {} sleep violation(s) in production code.\nFix these before merging!",
            violations.len()
        );
    }
}
