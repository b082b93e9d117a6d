//! fab-config
//!
//! Layered YAML configuration for the funding-rate arbitrage engine (spec
//! §6.3). Files are merged in the order given (base -> environment ->
//! per-venue overrides, by convention) and deserialized into [`Settings`].
//! `serde` only checks shape, not ranges, so [`Settings::validate`] runs the
//! field-level constraints (`> 0`, `(0,1)`, hysteresis ordering) that plain
//! `serde_yaml` deserialization has no equivalent for.
//!
//! Credential loading (env var interpolation, secret storage) is out of
//! scope: [`Credentials`] holds opaque strings and this crate never
//! inspects or logs them.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Deployment environment (spec §6.3).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Environment {
    Prod,
    Staging,
    Dev,
}

/// Opaque venue credentials. Never inspected beyond presence checks; never
/// logged (callers must not `Debug`-print this into production logs — the
/// derive here is for test fixtures only).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Credentials {
    pub api_key: Option<String>,
    pub api_secret: Option<String>,
    pub passphrase: Option<String>,
    pub private_key: Option<String>,
}

impl Credentials {
    /// True when at least one credential field is populated.
    pub fn is_present(&self) -> bool {
        self.api_key.is_some() || self.api_secret.is_some() || self.private_key.is_some()
    }
}

/// Per-venue connection + symbol configuration (spec §6.3).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VenueConfig {
    pub base_url: String,
    pub websocket_url: Option<String>,
    #[serde(default)]
    pub symbols: Vec<String>,
    pub account_id: Option<String>,
    #[serde(default)]
    pub credentials: Credentials,
}

/// Portfolio- and position-level risk caps (spec §6.3 `risk`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RiskConfig {
    pub max_total_notional: f64,
    pub max_symbol_notional: f64,
    pub max_leverage: f64,
    pub margin_buffer_ratio: f64,
    pub drift_threshold_bps: f64,
}

/// Strategy Engine + rebalance thresholds (spec §6.3 `strategy`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StrategyThresholds {
    pub min_edge_bps: f64,
    pub exit_edge_bps: f64,
    pub funding_horizon_hours: f64,
    pub rebalance_interval_seconds: u64,
    pub stale_data_seconds: u64,
    pub tracked_symbols: Vec<String>,
}

/// Time-in-force policy names accepted from config, mapped onto
/// `fab_schemas::TimeInForce` by the controller.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeInForceName {
    Ioc,
    Gtt,
    PostOnly,
}

/// Execution-wide defaults (spec §6.3 `execution`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExecutionConfig {
    pub order_notional: f64,
    #[serde(default = "default_slippage_bps")]
    pub slippage_bps: f64,
    pub time_in_force: TimeInForceName,
    /// Cross-venue mid-price spread gate for Sizing & Price Coordination
    /// (spec §4.3's `max_spread_bps`). Not itemized under spec §6.3's
    /// `execution` group in spec.md's enumeration, but §4.3 needs it as an
    /// input, so it's carried here rather than reusing an unrelated
    /// threshold from another config group.
    #[serde(default = "default_max_spread_bps")]
    pub max_spread_bps: f64,
}

fn default_slippage_bps() -> f64 {
    5.0
}

fn default_max_spread_bps() -> f64 {
    25.0
}

fn default_base_currency() -> String {
    "USDC".to_string()
}

/// Top-level settings document (spec §6.3).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Settings {
    pub environment: Environment,
    #[serde(default = "default_base_currency")]
    pub base_currency: String,
    pub poll_interval_seconds: u64,
    pub primary: VenueConfig,
    pub hedge: VenueConfig,
    pub risk: RiskConfig,
    pub strategy: StrategyThresholds,
    pub execution: ExecutionConfig,
}

impl Settings {
    /// Field-level range/ordering validation spec.md §6.3 enumerates
    /// alongside each config group. Returns the first violation found.
    pub fn validate(&self) -> Result<()> {
        if self.poll_interval_seconds == 0 {
            bail!("poll_interval_seconds must be > 0");
        }

        if self.risk.max_total_notional <= 0.0 {
            bail!("risk.max_total_notional must be > 0");
        }
        if self.risk.max_symbol_notional <= 0.0 {
            bail!("risk.max_symbol_notional must be > 0");
        }
        if self.risk.max_leverage <= 0.0 {
            bail!("risk.max_leverage must be > 0");
        }
        if !(self.risk.margin_buffer_ratio > 0.0 && self.risk.margin_buffer_ratio < 1.0) {
            bail!("risk.margin_buffer_ratio must be in (0, 1)");
        }
        if self.risk.drift_threshold_bps <= 0.0 {
            bail!("risk.drift_threshold_bps must be > 0");
        }

        if self.strategy.min_edge_bps <= 0.0 {
            bail!("strategy.min_edge_bps must be > 0");
        }
        if self.strategy.exit_edge_bps <= 0.0 {
            bail!("strategy.exit_edge_bps must be > 0");
        }
        if !(self.strategy.exit_edge_bps < self.strategy.min_edge_bps) {
            bail!("strategy.exit_edge_bps must be < strategy.min_edge_bps (hysteresis required)");
        }
        if self.strategy.funding_horizon_hours <= 0.0 {
            bail!("strategy.funding_horizon_hours must be > 0");
        }
        if self.strategy.rebalance_interval_seconds == 0 {
            bail!("strategy.rebalance_interval_seconds must be > 0");
        }
        if self.strategy.stale_data_seconds == 0 {
            bail!("strategy.stale_data_seconds must be > 0");
        }
        if self.strategy.tracked_symbols.is_empty() {
            bail!("strategy.tracked_symbols must have at least one entry");
        }

        if self.execution.order_notional <= 0.0 {
            bail!("execution.order_notional must be > 0");
        }
        if self.execution.slippage_bps <= 0.0 {
            bail!("execution.slippage_bps must be > 0");
        }
        if self.execution.max_spread_bps <= 0.0 {
            bail!("execution.max_spread_bps must be > 0");
        }

        Ok(())
    }
}

/// Result of loading and merging a layered config: the typed `Settings`,
/// the canonical (sorted-key) JSON it was parsed from, and a content hash
/// of that canonical form — useful for log-correlating which exact config
/// a run started under.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub settings: Settings,
    pub canonical_json: String,
    pub config_hash: String,
}

/// Load and deep-merge YAML files in order (later files override earlier
/// ones), then parse the merged document into [`Settings`] and validate it.
///
/// Merges via `serde_json::Value`, canonicalizes by sorting object keys,
/// and hashes the canonical bytes with SHA-256.
pub fn load_layered_yaml(paths: &[&str]) -> Result<LoadedConfig> {
    let mut merged = Value::Object(Default::default());

    for path in paths {
        let body = fs::read_to_string(path).with_context(|| format!("read config: {path}"))?;
        let yaml_value: serde_yaml::Value =
            serde_yaml::from_str(&body).with_context(|| format!("parse yaml: {path}"))?;
        let json_value = serde_json::to_value(yaml_value).context("yaml -> json conversion failed")?;
        deep_merge(&mut merged, json_value);
    }

    load_from_value(merged)
}

/// Load a single config file — convenience wrapper over
/// [`load_layered_yaml`] for the common one-file case (e.g. `--profile`).
pub fn load_yaml_file(path: impl AsRef<Path>) -> Result<LoadedConfig> {
    let path = path.as_ref().to_str().context("config path is not valid UTF-8")?;
    load_layered_yaml(&[path])
}

fn load_from_value(merged: Value) -> Result<LoadedConfig> {
    let canonical = canonicalize_json(&merged);

    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    let config_hash = hex::encode(hasher.finalize());

    let settings: Settings =
        serde_json::from_str(&canonical).context("config document does not match the expected schema")?;
    settings.validate().context("config failed validation")?;

    Ok(LoadedConfig { settings, canonical_json: canonical, config_hash })
}

/// Deep-merge: objects merge recursively; arrays and scalars are replaced
/// wholesale by the later document.
fn deep_merge(dst: &mut Value, src: Value) {
    match (dst, src) {
        (Value::Object(dst_map), Value::Object(src_map)) => {
            for (k, v) in src_map {
                match dst_map.get_mut(&k) {
                    Some(existing) => deep_merge(existing, v),
                    None => {
                        dst_map.insert(k, v);
                    }
                }
            }
        }
        (dst_slot, src_val) => {
            *dst_slot = src_val;
        }
    }
}

/// Canonicalize JSON by sorting all object keys recursively and emitting
/// compact JSON — makes the resulting hash stable regardless of source key
/// order across the merged layers.
fn canonicalize_json(v: &Value) -> String {
    let sorted = sort_keys(v);
    serde_json::to_string(&sorted).expect("json serialization must not fail")
}

fn sort_keys(v: &Value) -> Value {
    match v {
        Value::Object(map) => {
            let mut keys: Vec<_> = map.keys().cloned().collect();
            keys.sort();
            let mut new = serde_json::Map::new();
            for k in keys {
                new.insert(k.clone(), sort_keys(&map[&k]));
            }
            Value::Object(new)
        }
        Value::Array(arr) => Value::Array(arr.iter().map(sort_keys).collect()),
        _ => v.clone(),
    }
}

/// Group the typed `RiskConfig`/`StrategyThresholds`/`ExecutionConfig` into
/// whatever per-venue symbol-spec lookup the controller needs at startup.
/// Not itself part of spec §6.3 — a small convenience the controller uses
/// to validate that both venues were configured with the same tracked
/// symbol set before wiring adapters.
pub fn tracked_symbol_overlap(settings: &Settings) -> BTreeMap<String, (bool, bool)> {
    let mut overlap = BTreeMap::new();
    for symbol in &settings.primary.symbols {
        overlap.entry(symbol.clone()).or_insert((false, false)).0 = true;
    }
    for symbol in &settings.hedge.symbols {
        overlap.entry(symbol.clone()).or_insert((false, false)).1 = true;
    }
    overlap
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_yaml() -> &'static str {
        r#"
environment: dev
poll_interval_seconds: 30
primary:
  base_url: "https://primary.example"
  symbols: ["ETH", "BTC"]
hedge:
  base_url: "https://hedge.example"
  symbols: ["ETH", "BTC"]
risk:
  max_total_notional: 10000
  max_symbol_notional: 3000
  max_leverage: 5
  margin_buffer_ratio: 0.2
  drift_threshold_bps: 50
strategy:
  min_edge_bps: 20
  exit_edge_bps: 5
  funding_horizon_hours: 8
  rebalance_interval_seconds: 60
  stale_data_seconds: 30
  tracked_symbols: ["ETH", "BTC"]
execution:
  order_notional: 1000
  slippage_bps: 5
  time_in_force: ioc
"#
    }

    #[test]
    fn loads_and_validates_a_well_formed_document() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("base.yaml");
        std::fs::write(&path, base_yaml()).unwrap();

        let loaded = load_yaml_file(&path).unwrap();
        assert_eq!(loaded.settings.environment, Environment::Dev);
        assert_eq!(loaded.settings.strategy.tracked_symbols, vec!["ETH", "BTC"]);
        assert_eq!(loaded.config_hash.len(), 64);
    }

    #[test]
    fn later_layer_overrides_earlier_scalars() {
        let dir = tempfile::tempdir().unwrap();
        let base_path = dir.path().join("base.yaml");
        std::fs::write(&base_path, base_yaml()).unwrap();

        let override_path = dir.path().join("override.yaml");
        std::fs::write(&override_path, "strategy:\n  min_edge_bps: 40\n").unwrap();

        let base_str = base_path.to_str().unwrap();
        let override_str = override_path.to_str().unwrap();
        let loaded = load_layered_yaml(&[base_str, override_str]).unwrap();
        assert_eq!(loaded.settings.strategy.min_edge_bps, 40.0);
        // Untouched fields survive the merge.
        assert_eq!(loaded.settings.strategy.exit_edge_bps, 5.0);
    }

    #[test]
    fn rejects_hysteresis_violation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.yaml");
        let mut doc = base_yaml().to_string();
        doc = doc.replace("exit_edge_bps: 5", "exit_edge_bps: 20");
        std::fs::write(&path, doc).unwrap();

        assert!(load_yaml_file(&path).is_err());
    }

    #[test]
    fn rejects_margin_buffer_out_of_range() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.yaml");
        let doc = base_yaml().replace("margin_buffer_ratio: 0.2", "margin_buffer_ratio: 1.5");
        std::fs::write(&path, doc).unwrap();

        assert!(load_yaml_file(&path).is_err());
    }

    #[test]
    fn rejects_empty_tracked_symbols() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.yaml");
        let doc = base_yaml().replace(r#"tracked_symbols: ["ETH", "BTC"]"#, "tracked_symbols: []");
        std::fs::write(&path, doc).unwrap();

        assert!(load_yaml_file(&path).is_err());
    }

    #[test]
    fn config_hash_is_stable_regardless_of_key_order() {
        let dir = tempfile::tempdir().unwrap();
        let path_a = dir.path().join("a.yaml");
        std::fs::write(&path_a, base_yaml()).unwrap();

        // Same content, different key order at the top level.
        let reordered = format!("{}\n", base_yaml());
        let path_b = dir.path().join("b.yaml");
        std::fs::write(&path_b, reordered).unwrap();

        let a = load_yaml_file(&path_a).unwrap();
        let b = load_yaml_file(&path_b).unwrap();
        assert_eq!(a.config_hash, b.config_hash);
    }

    #[test]
    fn credentials_are_never_required_to_be_present() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("base.yaml");
        std::fs::write(&path, base_yaml()).unwrap();
        let loaded = load_yaml_file(&path).unwrap();
        assert!(!loaded.settings.primary.credentials.is_present());
    }

    #[test]
    fn tracked_symbol_overlap_flags_venue_coverage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("base.yaml");
        let doc = base_yaml().replace(r#"symbols: ["ETH", "BTC"]
hedge:"#, "symbols: [\"ETH\", \"BTC\", \"SOL\"]\nhedge:");
        std::fs::write(&path, doc).unwrap();
        let loaded = load_yaml_file(&path).unwrap();

        let overlap = tracked_symbol_overlap(&loaded.settings);
        assert_eq!(overlap.get("SOL"), Some(&(true, false)));
        assert_eq!(overlap.get("ETH"), Some(&(true, true)));
    }
}
