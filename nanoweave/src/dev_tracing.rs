//! Development helper for log output.

/// Install a `tracing` subscriber filtered by `RUST_LOG`, if it is set.
///
/// Tests and benches call `nanoweave::dev_tracing::init_tracing()` to see
/// the `[REQ]`/`[SUB]`/`[ENGINE]` traces, e.g. `RUST_LOG=nanoweave_proto=trace`.
/// A no-op when `RUST_LOG` is unset or a global subscriber already exists.
pub fn init_tracing() {
    if std::env::var_os("RUST_LOG").is_some() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }
}
