//! Setup fingerprints for entry de-duplication.
//!
//! Two signals describing the same setup (same symbol, timeframe, type,
//! confirmed bar and quantized indicator values) hash to the same key.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

const HASH_PREFIX_LEN: usize = 16;

/// Inputs of a setup fingerprint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetupContext {
    pub symbol: String,
    pub timeframe: String,
    pub signal_type: String,
    /// Open time of the confirmed bar, in epoch milliseconds.
    pub bar_time_ms: i64,
    pub entry_ref: Decimal,
    pub adx: f64,
    pub rsi: f64,
    pub bb_width: f64,
    pub vol_spike_mult: f64,
    #[serde(default)]
    pub extras: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SetupFingerprint(String);

impl SetupFingerprint {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SetupFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for SetupFingerprint {
    fn from(value: String) -> Self {
        Self(value)
    }
}

fn quantize(value: f64, decimals: usize) -> String {
    if !value.is_finite() {
        return "nan".to_string();
    }
    let s = format!("{value:.decimals$}");
    // -0.000 and 0.000 describe the same setup
    if s.trim_start_matches('-').chars().all(|c| c == '0' || c == '.') {
        return s.trim_start_matches('-').to_string();
    }
    s
}

impl SetupContext {
    /// Canonical payload: compact JSON with lexicographically sorted keys.
    #[must_use]
    pub fn canonical_payload(&self) -> String {
        let mut payload: BTreeMap<&str, Value> = BTreeMap::new();
        payload.insert("symbol", Value::from(self.symbol.to_ascii_uppercase()));
        payload.insert("tf", Value::from(self.timeframe.as_str()));
        payload.insert("signal_type", Value::from(self.signal_type.as_str()));
        payload.insert("bar_ts_ms", Value::from(self.bar_time_ms));
        payload.insert(
            "entry_ref",
            Value::from(self.entry_ref.round_dp(6).normalize().to_string()),
        );
        payload.insert("adx", Value::from(quantize(self.adx, 3)));
        payload.insert("rsi", Value::from(quantize(self.rsi, 3)));
        payload.insert("bb_width", Value::from(quantize(self.bb_width, 6)));
        payload.insert("vol_spike_mult", Value::from(quantize(self.vol_spike_mult, 3)));
        let extras: serde_json::Map<String, Value> = self
            .extras
            .iter()
            .map(|(k, v)| (k.clone(), Value::from(v.as_str())))
            .collect();
        payload.insert("extras", Value::Object(extras));

        // BTreeMap serializes in key order; serde_json never reorders a map it is handed
        serde_json::to_string(&payload).unwrap_or_default()
    }

    /// `"{signal_type}:{first 16 hex chars of sha256(canonical payload)}"`.
    #[must_use]
    pub fn fingerprint(&self) -> SetupFingerprint {
        let digest = Sha256::digest(self.canonical_payload().as_bytes());
        let hex = hex::encode(digest);
        SetupFingerprint(format!("{}:{}", self.signal_type, &hex[..HASH_PREFIX_LEN]))
    }
}
