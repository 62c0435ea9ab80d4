//! Kubernetes quantity parsing.
//!
//! CPU quantities come in whole cores (`"4"`), millicores (`"500m"`), or — from
//! the metrics endpoint — nanocores (`"125000000n"`). Memory quantities use
//! binary suffixes (`Ki`/`Mi`/`Gi`/`Ti`) or decimal ones (`k`/`M`/`G`/`T`), with
//! a bare number meaning raw bytes. Everything is normalized to millicores and
//! bytes so pool arithmetic works on a single unit.

/// Parse a Kubernetes CPU quantity to millicores. Unparseable input yields 0.
pub fn parse_cpu_millicores(value: &str) -> f64 {
    let value = value.trim();
    if let Some(n) = value.strip_suffix('n') {
        return n.parse::<f64>().unwrap_or(0.0) / 1_000_000.0;
    }
    if let Some(u) = value.strip_suffix('u') {
        return u.parse::<f64>().unwrap_or(0.0) / 1_000.0;
    }
    if let Some(m) = value.strip_suffix('m') {
        return m.parse::<f64>().unwrap_or(0.0);
    }
    // Bare numeric string means whole cores.
    value.parse::<f64>().map(|v| v * 1000.0).unwrap_or(0.0)
}

/// Parse a Kubernetes memory quantity to bytes. Unparseable input yields 0.
pub fn parse_memory_bytes(value: &str) -> f64 {
    let value = value.trim();
    const BINARY: [(&str, f64); 4] = [
        ("Ki", 1024.0),
        ("Mi", 1024.0 * 1024.0),
        ("Gi", 1024.0 * 1024.0 * 1024.0),
        ("Ti", 1024.0 * 1024.0 * 1024.0 * 1024.0),
    ];
    for (suffix, multiplier) in BINARY {
        if let Some(n) = value.strip_suffix(suffix) {
            return n.parse::<f64>().map(|v| v * multiplier).unwrap_or(0.0);
        }
    }
    const DECIMAL: [(&str, f64); 4] = [
        ("k", 1e3),
        ("M", 1e6),
        ("G", 1e9),
        ("T", 1e12),
    ];
    for (suffix, multiplier) in DECIMAL {
        if let Some(n) = value.strip_suffix(suffix) {
            return n.parse::<f64>().map(|v| v * multiplier).unwrap_or(0.0);
        }
    }
    value.parse::<f64>().unwrap_or(0.0)
}

/// Round a percentage to one decimal place for output.
pub fn round_percent(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}
