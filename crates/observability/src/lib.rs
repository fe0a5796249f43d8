//! Process-wide tracing setup shared by saleflow binaries.

/// Initialize tracing for the process with the default settings.
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init(tracing::TracingConfig::from_env());
}

/// Tracing configuration (filters, output format).
pub mod tracing;
