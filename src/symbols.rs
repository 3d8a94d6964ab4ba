// =============================================================================
// Symbol Registry — copy-on-write symbol specifications
// =============================================================================
//
// The registry is read on every tick and every order validation, and written
// only by the admin path.  Readers load an `Arc` snapshot and take no lock;
// writers rebuild the map and publish it atomically via `ArcSwap`.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::Serialize;

use crate::config::SymbolConfig;

/// Immutable view of one symbol's contract terms.
#[derive(Debug, Clone, Serialize)]
pub struct SymbolSpec {
    pub name: String,
    pub contract_size: f64,
    pub pip_size: f64,
    pub pip_value: f64,
    /// Margin requirement as a percentage of notional.
    pub margin_percent: f64,
    pub commission_per_lot: f64,
    pub min_lot: f64,
    pub exposure_limit_lots: f64,
    pub enabled: bool,
}

impl From<&SymbolConfig> for SymbolSpec {
    fn from(c: &SymbolConfig) -> Self {
        Self {
            name: c.name.clone(),
            contract_size: c.contract_size,
            pip_size: c.pip_size,
            pip_value: c.pip_value,
            margin_percent: c.margin_percent,
            commission_per_lot: c.commission_per_lot,
            min_lot: c.min_lot,
            exposure_limit_lots: c.exposure_limit_lots,
            enabled: c.enabled,
        }
    }
}

type SymbolMap = HashMap<String, Arc<SymbolSpec>>;

/// Process-wide symbol registry.
pub struct SymbolRegistry {
    map: ArcSwap<SymbolMap>,
}

impl SymbolRegistry {
    pub fn new(symbols: &[SymbolConfig]) -> Self {
        let mut map = SymbolMap::new();
        for cfg in symbols {
            map.insert(cfg.name.clone(), Arc::new(SymbolSpec::from(cfg)));
        }
        Self {
            map: ArcSwap::from_pointee(map),
        }
    }

    /// Lock-free lookup of a symbol spec.
    pub fn get(&self, name: &str) -> Option<Arc<SymbolSpec>> {
        self.map.load().get(name).cloned()
    }

    /// All known symbol names.
    pub fn names(&self) -> Vec<String> {
        self.map.load().keys().cloned().collect()
    }

    /// All specs, cloned for admin listing and serialization.
    pub fn all(&self) -> Vec<SymbolSpec> {
        self.map.load().values().map(|s| (**s).clone()).collect()
    }

    /// Insert or replace a spec. Admin path only; publishes a new snapshot.
    pub fn upsert(&self, spec: SymbolSpec) {
        let current = self.map.load_full();
        let mut next: SymbolMap = (*current).clone();
        next.insert(spec.name.clone(), Arc::new(spec));
        self.map.store(Arc::new(next));
    }

    /// Remove a symbol. Returns whether it existed.
    pub fn remove(&self, name: &str) -> bool {
        let current = self.map.load_full();
        if !current.contains_key(name) {
            return false;
        }
        let mut next: SymbolMap = (*current).clone();
        next.remove(name);
        self.map.store(Arc::new(next));
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;

    #[test]
    fn lookup_and_upsert() {
        let config = RuntimeConfig::default();
        let registry = SymbolRegistry::new(&config.symbols);

        let eurusd = registry.get("EURUSD").expect("EURUSD seeded by default");
        assert!(eurusd.enabled);
        assert_eq!(eurusd.contract_size, 100_000.0);

        let mut disabled = (*eurusd).clone();
        disabled.enabled = false;
        registry.upsert(disabled);
        assert!(!registry.get("EURUSD").unwrap().enabled);
    }

    #[test]
    fn remove_unknown_symbol_is_noop() {
        let registry = SymbolRegistry::new(&[]);
        assert!(!registry.remove("GHOST"));
    }
}
