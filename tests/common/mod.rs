use tracing_subscriber::EnvFilter;

/// Install a fmt subscriber so `RUST_LOG=debug cargo test` shows the
/// machine's tracing output. Safe to call from every test; only the first
/// call wins.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
