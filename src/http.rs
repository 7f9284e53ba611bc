//! Glue between `reqwest` and the fingerprint builder. The crate never sends
//! requests itself; this only reads an already-built outbound request into a
//! [`RequestDescriptor`].

use std::collections::HashMap;

use reqwest::header::CONTENT_TYPE;
use reqwest::Request;

use crate::fingerprint::{Body, RequestDescriptor};

/// Build a descriptor from an outbound `reqwest` request.
///
/// JSON bodies (per `Content-Type`) become [`Body::Json`] so key order never
/// affects the fingerprint; everything else is [`Body::Raw`]. Streaming
/// bodies cannot be read without consuming them and are treated as absent.
pub fn descriptor_from_request(request: &Request) -> RequestDescriptor {
    let mut headers = HashMap::new();
    for (name, value) in request.headers() {
        if let Ok(value) = value.to_str() {
            headers.insert(name.as_str().to_string(), value.to_string());
        }
    }

    let is_json = request
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.contains("json"));

    let body = request
        .body()
        .and_then(|body| body.as_bytes())
        .map(|bytes| {
            if is_json {
                match serde_json::from_slice(bytes) {
                    Ok(value) => Body::Json(value),
                    Err(_) => Body::Raw(String::from_utf8_lossy(bytes).into_owned()),
                }
            } else {
                Body::Raw(String::from_utf8_lossy(bytes).into_owned())
            }
        });

    RequestDescriptor {
        method: request.method().as_str().to_string(),
        // Embedded query is split off by the fingerprint builder.
        path: request.url().to_string(),
        query: HashMap::new(),
        headers,
        body,
        skip: false,
    }
}
