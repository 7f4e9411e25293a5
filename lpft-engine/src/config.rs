//! Engine construction parameters (§10.2). Never reads environment
//! variables itself (§6); the surrounding binary is responsible for
//! assembling this from argv.

use compact_str::CompactString;
use lpft_core::TableMap;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub chassis: CompactString,
    /// Emit the legacy `ct_label.natted` hairpin-detection flow alongside
    /// `ct_mark.natted` for every load balancer (§4.8).
    pub lb_legacy_ct_label_compat: bool,
    pub cache_byte_budget: usize,
    pub tables: TableMap,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            chassis: CompactString::new(""),
            lb_legacy_ct_label_compat: false,
            cache_byte_budget: 16 * 1024 * 1024,
            tables: TableMap::default(),
        }
    }
}
