//! Sensitive-value scrubbing.
//!
//! Every envelope is walked before serialization and three pattern families
//! are replaced with stable tokens: IPv4 addresses (octet-validated),
//! configured subscription IDs, and cluster API-server FQDNs. Node names are
//! preserved. Four-part version strings such as `1.30.5.0` can match the IPv4
//! pattern; that cosmetic false positive is accepted.
//!
//! Scrubbing is idempotent: the replacement tokens contain nothing the
//! patterns can match, so `scrub(scrub(x)) == scrub(x)`.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

// Octet-validated dotted quad: each octet is 0-255, no leading-zero ambiguity
// worth fighting over in diagnostics output.
static IP_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"\b(?:(?:25[0-5]|2[0-4][0-9]|1[0-9]{2}|[1-9]?[0-9])\.){3}(?:25[0-5]|2[0-4][0-9]|1[0-9]{2}|[1-9]?[0-9])\b",
    )
    .expect("static regex")
});

// AKS API-server hostnames end in .azmk8s.io.
static FQDN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b[\w.-]+\.azmk8s\.io\b").expect("static regex"));

/// Redaction engine built once at startup from the cluster map.
#[derive(Debug, Clone, Default)]
pub struct Scrubber {
    /// Alternation of the configured subscription UUIDs, case-insensitive.
    /// `None` when no clusters are configured (unit tests mostly).
    subscription_re: Option<Regex>,
}

impl Scrubber {
    pub fn new(subscription_ids: &[String]) -> Self {
        let subscription_re = if subscription_ids.is_empty() {
            None
        } else {
            // UUIDs are hex and hyphens, safe to join into an alternation.
            let pattern = format!("(?i)\\b(?:{})\\b", subscription_ids.join("|"));
            Regex::new(&pattern).ok()
        };
        Self { subscription_re }
    }

    /// Scrub a single string.
    pub fn scrub_text(&self, text: &str) -> String {
        let mut out = IP_RE.replace_all(text, "[REDACTED_IP]").into_owned();
        if let Some(re) = &self.subscription_re {
            out = re.replace_all(&out, "[REDACTED_SUBSCRIPTION]").into_owned();
        }
        FQDN_RE.replace_all(&out, "[REDACTED_FQDN]").into_owned()
    }

    /// Walk a JSON value in place, scrubbing every string leaf.
    pub fn scrub_value(&self, value: &mut Value) {
        match value {
            Value::String(s) => {
                let scrubbed = self.scrub_text(s);
                if scrubbed != *s {
                    *s = scrubbed;
                }
            }
            Value::Array(items) => {
                for item in items {
                    self.scrub_value(item);
                }
            }
            Value::Object(map) => {
                for (_, v) in map.iter_mut() {
                    self.scrub_value(v);
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn scrubber() -> Scrubber {
        Scrubber::new(&["12345678-1234-1234-1234-123456789abc".to_string()])
    }

    #[test]
    fn redacts_valid_ipv4() {
        assert_eq!(
            scrubber().scrub_text("node at 10.240.0.5 is ready"),
            "node at [REDACTED_IP] is ready"
        );
    }

    #[test]
    fn leaves_invalid_octets_alone() {
        let text = "version 1.300.5.999 is not an address";
        assert_eq!(scrubber().scrub_text(text), text);
    }

    #[test]
    fn four_part_version_is_cosmetic_false_positive() {
        // Documented and accepted: octet-valid version strings get redacted.
        assert_eq!(
            scrubber().scrub_text("image tag 1.30.5.0"),
            "image tag [REDACTED_IP]"
        );
    }

    #[test]
    fn redacts_configured_subscription_case_insensitive() {
        assert_eq!(
            scrubber().scrub_text("sub 12345678-1234-1234-1234-123456789ABC failed"),
            "sub [REDACTED_SUBSCRIPTION] failed"
        );
    }

    #[test]
    fn leaves_unrelated_uuids_alone() {
        let text = "pod uid deadbeef-0000-4444-8888-123456789abc";
        assert_eq!(scrubber().scrub_text(text), text);
    }

    #[test]
    fn redacts_cluster_fqdn() {
        assert_eq!(
            scrubber().scrub_text("dial aks-prod-abc123.hcp.eastus.azmk8s.io:443"),
            "dial [REDACTED_FQDN]:443"
        );
    }

    #[test]
    fn preserves_node_names() {
        let text = "aks-userpool-12345678-vmss000001 cordoned";
        assert_eq!(scrubber().scrub_text(text), text);
    }

    #[test]
    fn scrub_is_idempotent() {
        let s = scrubber();
        let once = s.scrub_text("10.0.0.1 on aks-x.azmk8s.io");
        assert_eq!(s.scrub_text(&once), once);
    }

    #[test]
    fn walks_nested_structures() {
        let s = scrubber();
        let mut v = json!({
            "summary": "endpoint 10.0.0.1 unreachable",
            "nested": {"list": ["fine", "host aks-1.hcp.westus2.azmk8s.io"]},
            "count": 3
        });
        s.scrub_value(&mut v);
        assert_eq!(v["summary"], "endpoint [REDACTED_IP] unreachable");
        assert_eq!(v["nested"]["list"][1], "host [REDACTED_FQDN]");
        assert_eq!(v["count"], 3);
    }

    #[test]
    fn empty_config_still_scrubs_static_patterns() {
        let s = Scrubber::new(&[]);
        assert_eq!(s.scrub_text("192.168.1.1"), "[REDACTED_IP]");
    }
}
