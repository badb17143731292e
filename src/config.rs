//! Engine configuration: sizes the KV cache and prefetch pool, and reads
//! the two environment variables the external interface recognizes.

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub max_seq_len: usize,
    pub kv_block_size: u32,
    pub prefetch_depth: u32,
    pub use_mmap: bool,
    pub verbose: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig { max_seq_len: 2048, kv_block_size: 32, prefetch_depth: 3, use_mmap: false, verbose: false }
    }
}

impl EngineConfig {
    /// Reads `PREFETCH_DEPTH` (u32, default 3; 0 maps to 2, the minimum
    /// supported depth) and `DEBUG` (any non-empty value enables verbose
    /// operator checks via the `debug` log level), layering them over
    /// `Default::default()`.
    pub fn from_env() -> Self {
        let mut cfg = EngineConfig::default();

        if let Ok(raw) = std::env::var("PREFETCH_DEPTH") {
            match raw.parse::<u32>() {
                Ok(0) => cfg.prefetch_depth = 2,
                Ok(d) => cfg.prefetch_depth = d,
                Err(_) => log::warn!("PREFETCH_DEPTH={raw:?} is not a valid u32, using default {}", cfg.prefetch_depth),
            }
        }

        cfg.verbose = std::env::var("DEBUG").is_ok_and(|v| !v.is_empty());
        cfg
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_matches_spec_suggested_sizes() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.max_seq_len, 2048);
        assert_eq!(cfg.kv_block_size, 32);
        assert_eq!(cfg.prefetch_depth, 3);
    }
}
