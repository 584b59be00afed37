//! Per-tenant template rendering
//!
//! Renders resource manifests, names, namespaces, labels, and annotations
//! from string templates plus per-row variables. The engine is stateless and
//! thread-safe: the function set is fixed at construction and the
//! environment is immutable afterwards.

mod engine;
mod filters;

use std::collections::BTreeMap;

pub use engine::Engine;
pub use filters::{to_host, trunc63};

/// Template variables available for rendering.
///
/// A `BTreeMap` so key iteration inside a template is deterministic and
/// never leaks map ordering.
pub type Variables = BTreeMap<String, minijinja::Value>;

/// Build variables from a tenant row.
///
/// Seeds `uid`, `hostOrUrl`, and `activate`, derives `host` via
/// [`to_host`], then layers `extras`. Extras may shadow derived keys such
/// as `host`, but never the three required keys.
pub fn build_variables(
    uid: &str,
    host_or_url: &str,
    activate: &str,
    extras: &BTreeMap<String, String>,
) -> Variables {
    let mut vars = Variables::new();

    vars.insert(
        "host".to_string(),
        minijinja::Value::from(to_host(host_or_url)),
    );

    for (key, value) in extras {
        vars.insert(key.clone(), minijinja::Value::from(value.clone()));
    }

    // Required keys win over any extra of the same name
    vars.insert("uid".to_string(), minijinja::Value::from(uid));
    vars.insert("hostOrUrl".to_string(), minijinja::Value::from(host_or_url));
    vars.insert("activate".to_string(), minijinja::Value::from(activate));

    vars
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_variables_seeds_required_and_derived() {
        let vars = build_variables("t-1", "https://user@example.com:8443/app", "1", &BTreeMap::new());
        assert_eq!(vars["uid"].as_str(), Some("t-1"));
        assert_eq!(
            vars["hostOrUrl"].as_str(),
            Some("https://user@example.com:8443/app")
        );
        assert_eq!(vars["activate"].as_str(), Some("1"));
        assert_eq!(vars["host"].as_str(), Some("example.com"));
    }

    #[test]
    fn test_extras_shadow_derived_but_not_required() {
        let mut extras = BTreeMap::new();
        extras.insert("host".to_string(), "override.example".to_string());
        extras.insert("uid".to_string(), "evil".to_string());
        extras.insert("plan".to_string(), "gold".to_string());

        let vars = build_variables("t-1", "tenant.example.com", "true", &extras);
        // host is derived, extras may replace it
        assert_eq!(vars["host"].as_str(), Some("override.example"));
        // the required triple is never shadowed
        assert_eq!(vars["uid"].as_str(), Some("t-1"));
        assert_eq!(vars["plan"].as_str(), Some("gold"));
    }
}
