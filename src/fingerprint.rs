//! Deterministic request fingerprinting.
//!
//! A fingerprint is a stable digest over the facets of an outbound request
//! that the [`InclusionPolicy`] selects. Two requests that agree on the
//! selected facets always produce the same fingerprint, which is what makes
//! deduplication possible at all.

use std::collections::{HashMap, HashSet};

use serde_json::{json, Value};
use sha2::{Digest, Sha256};

/// Namespace prefix for every cache key, so entries never collide with
/// unrelated keys in a shared Redis.
pub const KEY_PREFIX: &str = "idempotent:";

/// Request body as handed to the fingerprint builder.
#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    /// Structured value; canonicalized (recursive key sort) before hashing.
    Json(Value),
    /// Already-serialized payload; hashed as-is.
    Raw(String),
}

/// Immutable description of one outbound call.
///
/// `path` may be a bare path (`/orders?x=1`) or a full URL; scheme and host
/// are stripped during fingerprinting either way. Query parameters embedded
/// in `path` are merged with the `query` map; the map wins on key collision.
#[derive(Debug, Clone, Default)]
pub struct RequestDescriptor {
    pub method: String,
    pub path: String,
    pub query: HashMap<String, Vec<String>>,
    pub headers: HashMap<String, String>,
    pub body: Option<Body>,
    /// Escape hatch: bypass idempotency entirely for this call.
    pub skip: bool,
}

impl RequestDescriptor {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            ..Self::default()
        }
    }

    pub fn with_query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.entry(name.into()).or_default().push(value.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_json_body(mut self, value: Value) -> Self {
        self.body = Some(Body::Json(value));
        self
    }

    pub fn with_raw_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(Body::Raw(body.into()));
        self
    }

    pub fn skipped(mut self) -> Self {
        self.skip = true;
        self
    }
}

/// Which query parameters feed the fingerprint.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryInclusion {
    All,
    None,
    Only(HashSet<String>),
}

/// Selects the facets of a [`RequestDescriptor`] that feed the fingerprint.
/// Method is always included.
#[derive(Debug, Clone)]
pub struct InclusionPolicy {
    pub include_path: bool,
    pub include_query: QueryInclusion,
    /// Header names to include, matched case-insensitively. Empty by default:
    /// headers carry auth material and trace ids that would defeat dedup.
    pub include_headers: HashSet<String>,
    pub include_body: bool,
}

impl Default for InclusionPolicy {
    fn default() -> Self {
        Self {
            include_path: true,
            include_query: QueryInclusion::All,
            include_headers: HashSet::new(),
            include_body: true,
        }
    }
}

/// Compute the fingerprint of `descriptor` under `policy`.
///
/// Pure and total: no I/O, no failure modes. Returns
/// `"idempotent:" + lowercase hex SHA-256` over a canonical serialization of
/// the selected facets.
pub fn fingerprint(descriptor: &RequestDescriptor, policy: &InclusionPolicy) -> String {
    let method = if descriptor.method.trim().is_empty() {
        "GET".to_string()
    } else {
        descriptor.method.to_ascii_uppercase()
    };

    let (path, embedded_query) = split_path(&descriptor.path);

    let mut facets = serde_json::Map::new();
    facets.insert("method".into(), json!(method));

    if policy.include_path {
        facets.insert("path".into(), json!(path));
    }

    match &policy.include_query {
        QueryInclusion::None => {}
        QueryInclusion::All => {
            facets.insert(
                "query".into(),
                query_facet(&embedded_query, &descriptor.query, None),
            );
        }
        QueryInclusion::Only(names) => {
            facets.insert(
                "query".into(),
                query_facet(&embedded_query, &descriptor.query, Some(names)),
            );
        }
    }

    if !policy.include_headers.is_empty() {
        let wanted: HashSet<String> = policy
            .include_headers
            .iter()
            .map(|h| h.to_ascii_lowercase())
            .collect();
        let mut selected = serde_json::Map::new();
        for (name, value) in &descriptor.headers {
            let lower = name.to_ascii_lowercase();
            if wanted.contains(&lower) {
                selected.insert(lower, json!(value));
            }
        }
        facets.insert("headers".into(), Value::Object(selected));
    }

    if policy.include_body {
        // Absent body gets an explicit variant tag so it can never collide
        // with an explicit null or an empty string body.
        let body_facet = match &descriptor.body {
            Some(Body::Json(v)) => json!({ "json": v }),
            Some(Body::Raw(s)) => json!({ "raw": s }),
            None => json!({ "absent": true }),
        };
        facets.insert("body".into(), body_facet);
    }

    let mut canonical = String::new();
    write_canonical(&Value::Object(facets), &mut canonical);

    let digest = Sha256::digest(canonical.as_bytes());
    format!("{}{}", KEY_PREFIX, hex::encode(digest))
}

/// Split a URL-like path field into its path component and any embedded
/// query pairs. Scheme and host are discarded.
fn split_path(raw: &str) -> (String, Vec<(String, String)>) {
    if let Ok(parsed) = url::Url::parse(raw) {
        if parsed.has_host() {
            let pairs = parsed.query_pairs().into_owned().collect();
            return (parsed.path().to_string(), pairs);
        }
    }
    match raw.split_once('?') {
        Some((path, query)) => {
            let pairs = url::form_urlencoded::parse(query.as_bytes())
                .into_owned()
                .collect();
            (path.to_string(), pairs)
        }
        None => (raw.to_string(), Vec::new()),
    }
}

/// Merge URL-embedded pairs with the separate query map (map wins on key
/// collision), optionally filter to `only`, and sort keys and per-key values
/// so argument order never affects the digest.
fn query_facet(
    embedded: &[(String, String)],
    separate: &HashMap<String, Vec<String>>,
    only: Option<&HashSet<String>>,
) -> Value {
    let mut merged: HashMap<String, Vec<String>> = HashMap::new();
    for (name, value) in embedded {
        merged.entry(name.clone()).or_default().push(value.clone());
    }
    for (name, values) in separate {
        merged.insert(name.clone(), values.clone());
    }

    let mut facet = serde_json::Map::new();
    for (name, mut values) in merged {
        if let Some(names) = only {
            if !names.contains(&name) {
                continue;
            }
        }
        values.sort();
        facet.insert(name, json!(values));
    }
    Value::Object(facet)
}

/// Serialize a JSON value with object keys recursively sorted. The default
/// `serde_json` map already sorts, but canonical ordering is a correctness
/// requirement here, not a formatting preference, so it is enforced
/// explicitly.
fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push(':');
                write_canonical(&map[*key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn default_policy() -> InclusionPolicy {
        InclusionPolicy::default()
    }

    #[test]
    fn deterministic_across_calls() {
        let d = RequestDescriptor::new("POST", "/orders").with_json_body(json!({"a": 1}));
        assert_eq!(
            fingerprint(&d, &default_policy()),
            fingerprint(&d, &default_policy())
        );
    }

    #[test]
    fn fingerprint_has_namespace_prefix_and_hex_digest() {
        let fp = fingerprint(&RequestDescriptor::default(), &default_policy());
        let hex_part = fp.strip_prefix(KEY_PREFIX).unwrap();
        assert_eq!(hex_part.len(), 64);
        assert!(hex_part.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn empty_descriptor_defaults_to_get() {
        let empty = RequestDescriptor::default();
        let get = RequestDescriptor::new("get", "");
        assert_eq!(
            fingerprint(&empty, &default_policy()),
            fingerprint(&get, &default_policy())
        );
    }

    #[test]
    fn body_key_order_does_not_matter() {
        let a: Value = serde_json::from_str(r#"{"a":1,"b":{"x":1,"y":2}}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"b":{"y":2,"x":1},"a":1}"#).unwrap();
        let da = RequestDescriptor::new("POST", "/orders").with_json_body(a);
        let db = RequestDescriptor::new("POST", "/orders").with_json_body(b);
        assert_eq!(
            fingerprint(&da, &default_policy()),
            fingerprint(&db, &default_policy())
        );
    }

    #[test]
    fn absent_body_differs_from_null_and_empty_bodies() {
        let absent = RequestDescriptor::new("POST", "/x");
        let null = RequestDescriptor::new("POST", "/x").with_json_body(Value::Null);
        let empty = RequestDescriptor::new("POST", "/x").with_raw_body("");
        let p = default_policy();
        assert_ne!(fingerprint(&absent, &p), fingerprint(&null, &p));
        assert_ne!(fingerprint(&absent, &p), fingerprint(&empty, &p));
        assert_ne!(fingerprint(&null, &p), fingerprint(&empty, &p));
    }

    #[test]
    fn excluded_headers_do_not_affect_fingerprint() {
        let a = RequestDescriptor::new("POST", "/x").with_header("X-Request-Id", "1");
        let b = RequestDescriptor::new("POST", "/x").with_header("X-Request-Id", "2");
        assert_eq!(
            fingerprint(&a, &default_policy()),
            fingerprint(&b, &default_policy())
        );
    }

    #[test]
    fn included_headers_match_case_insensitively() {
        let mut policy = default_policy();
        policy.include_headers.insert("Idempotency-Key".into());

        let a = RequestDescriptor::new("POST", "/x").with_header("idempotency-key", "k1");
        let b = RequestDescriptor::new("POST", "/x").with_header("IDEMPOTENCY-KEY", "k1");
        let c = RequestDescriptor::new("POST", "/x").with_header("idempotency-key", "k2");
        assert_eq!(fingerprint(&a, &policy), fingerprint(&b, &policy));
        assert_ne!(fingerprint(&a, &policy), fingerprint(&c, &policy));
    }

    #[test]
    fn paths_differ_when_path_included() {
        let a = RequestDescriptor::new("POST", "/orders");
        let b = RequestDescriptor::new("POST", "/invoices");
        assert_ne!(
            fingerprint(&a, &default_policy()),
            fingerprint(&b, &default_policy())
        );

        let mut no_path = default_policy();
        no_path.include_path = false;
        assert_eq!(fingerprint(&a, &no_path), fingerprint(&b, &no_path));
    }

    #[test]
    fn scheme_and_host_are_stripped() {
        let full = RequestDescriptor::new("POST", "https://api.example.com/orders?a=1");
        let bare = RequestDescriptor::new("POST", "/orders?a=1");
        assert_eq!(
            fingerprint(&full, &default_policy()),
            fingerprint(&bare, &default_policy())
        );
    }

    #[test]
    fn separate_query_map_wins_over_embedded() {
        let embedded_only = RequestDescriptor::new("POST", "/x?a=override");
        let overridden = RequestDescriptor::new("POST", "/x?a=original").with_query("a", "override");
        assert_eq!(
            fingerprint(&embedded_only, &default_policy()),
            fingerprint(&overridden, &default_policy())
        );
    }

    #[test]
    fn query_only_filter_retains_listed_names() {
        let mut policy = default_policy();
        policy.include_query = QueryInclusion::Only(HashSet::from(["a".to_string()]));

        let a = RequestDescriptor::new("POST", "/x?a=1&b=1");
        let b = RequestDescriptor::new("POST", "/x?a=1&b=2");
        let c = RequestDescriptor::new("POST", "/x?a=2&b=1");
        assert_eq!(fingerprint(&a, &policy), fingerprint(&b, &policy));
        assert_ne!(fingerprint(&a, &policy), fingerprint(&c, &policy));
    }

    #[test]
    fn query_excluded_entirely() {
        let mut policy = default_policy();
        policy.include_query = QueryInclusion::None;
        let a = RequestDescriptor::new("POST", "/x?a=1");
        let b = RequestDescriptor::new("POST", "/x?a=2");
        assert_eq!(fingerprint(&a, &policy), fingerprint(&b, &policy));
    }

    #[test]
    fn query_argument_order_does_not_matter() {
        let a = RequestDescriptor::new("POST", "/x?a=1&b=2");
        let b = RequestDescriptor::new("POST", "/x?b=2&a=1");
        assert_eq!(
            fingerprint(&a, &default_policy()),
            fingerprint(&b, &default_policy())
        );
    }

    #[test]
    fn raw_body_is_not_canonicalized() {
        let a = RequestDescriptor::new("POST", "/x").with_raw_body(r#"{"a":1,"b":2}"#);
        let b = RequestDescriptor::new("POST", "/x").with_raw_body(r#"{"b":2,"a":1}"#);
        assert_ne!(
            fingerprint(&a, &default_policy()),
            fingerprint(&b, &default_policy())
        );
    }

    #[test]
    fn canonical_writer_sorts_nested_keys() {
        let mut out = String::new();
        write_canonical(&json!({"b": [1, {"z": 1, "a": 2}], "a": true}), &mut out);
        assert_eq!(out, r#"{"a":true,"b":[1,{"a":2,"z":1}]}"#);
    }
}
