//! Per-handle configuration.
//!
//! Every container handle carries its own [`ContainerOptions`]; there is no
//! global configuration and no environment variable is consulted.  The
//! struct derives `Deserialize` so handles can be configured from whatever
//! file format an embedding application already loads.

use serde::Deserialize;

/// Behavioral knobs of a container handle.
///
/// These do not participate in handle identity: two handles addressing the
/// same `(account, container, prefix)` compare equal regardless of options.
#[derive(Debug, Clone, Deserialize)]
pub struct ContainerOptions {
    /// Worker budget for parallel block transfers.
    #[serde(default = "default_n_threads")]
    pub n_threads: usize,

    /// Seconds allowed for establishing TCP + TLS.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_s: u64,

    /// Seconds within which at least one byte must flow in either direction
    /// before the progress watchdog aborts a request.
    #[serde(default = "default_read_timeout")]
    pub read_timeout_s: u64,

    /// Total request attempts per operation, first try included.
    #[serde(default = "default_n_retries")]
    pub n_retries: u32,

    /// Values above zero enable per-request debug logging.
    #[serde(default)]
    pub verbosity: u8,
}

impl Default for ContainerOptions {
    fn default() -> Self {
        Self {
            n_threads: default_n_threads(),
            connect_timeout_s: default_connect_timeout(),
            read_timeout_s: default_read_timeout(),
            n_retries: default_n_retries(),
            verbosity: 0,
        }
    }
}

// -- Defaults ----------------------------------------------------------------

fn default_n_threads() -> usize {
    std::thread::available_parallelism()
        .map(std::num::NonZeroUsize::get)
        .unwrap_or(1)
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_read_timeout() -> u64 {
    30
}

fn default_n_retries() -> u32 {
    10
}

// -- Tests --------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_timeouts_and_retries() {
        let options = ContainerOptions::default();
        assert_eq!(options.connect_timeout_s, 10);
        assert_eq!(options.read_timeout_s, 30);
        assert_eq!(options.n_retries, 10);
        assert_eq!(options.verbosity, 0);
        assert!(options.n_threads >= 1);
    }

    #[test]
    fn test_deserialize_fills_defaults() {
        let options: ContainerOptions = serde_json::from_str("{\"n_threads\": 4}").unwrap();
        assert_eq!(options.n_threads, 4);
        assert_eq!(options.n_retries, 10);
        assert_eq!(options.read_timeout_s, 30);
    }
}
