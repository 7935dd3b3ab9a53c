//! Encodes non-GET request bodies into a compact query string for index
//! consumers, following the convention of prefixing a synthetic
//! `__wb_method` parameter.

use std::cmp;
use std::collections::HashMap;
use std::fmt::Write as _;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use http::Method;
use serde_json::Value;

use crate::message::Request;

const QUERY_STRING_LIMIT: usize = 4096;

const FORM_URLENCODED: &str = "application/x-www-form-urlencoded";
const JSON: &str = "application/json";
const PLAIN_TEXT: &str = "text/plain";

/// Encodes a request body into an index query string. GET requests carry no
/// body worth indexing and yield `None`.
pub fn encode(request: &Request) -> Option<String> {
    if request.method == Method::GET {
        return None;
    }
    let mut out = String::from("__wb_method=");
    out.push_str(request.method.as_str());
    let max_length = out.len() + 1 + QUERY_STRING_LIMIT;

    match request.content_type_base().as_deref() {
        Some(FORM_URLENCODED) => encode_form_body(&request.body, &mut out),
        Some(JSON) => encode_json_body(&request.body, &mut out, max_length, false),
        Some(PLAIN_TEXT) => encode_json_body(&request.body, &mut out, max_length, true),
        _ => encode_binary_body(&request.body, &mut out),
    }

    out.truncate(cmp::min(out.len(), max_length));
    Some(out)
}

fn encode_binary_body(body: &[u8], out: &mut String) {
    let body = &body[..cmp::min(body.len(), QUERY_STRING_LIMIT)];
    out.push_str("&__wb_post_data=");
    out.push_str(&BASE64.encode(body));
}

fn encode_form_body(body: &[u8], out: &mut String) {
    // Up to 3x the limit in case the body is fully percent encoded
    let body = &body[..cmp::min(body.len(), QUERY_STRING_LIMIT * 3)];
    match std::str::from_utf8(body) {
        Ok(text) => {
            out.push('&');
            percent_encode_non_percent(&percent_plus_decode(text), out);
        }
        Err(_) => encode_binary_body(body, out),
    }
}

fn encode_json_body(body: &[u8], out: &mut String, max_length: usize, binary_fallback: bool) {
    match serde_json::from_slice::<Value>(body) {
        Ok(value) => {
            let mut name_counts = HashMap::new();
            flatten_json(&value, None, &mut name_counts, out, max_length);
        }
        Err(_) => {
            if binary_fallback {
                encode_binary_body(body, out);
            }
        }
    }
}

// Scalars emit under the nearest field name; objects open a new name scope,
// arrays do not. Repeated names get a .N_ suffix from the second occurrence.
fn flatten_json(
    value: &Value,
    name: Option<&str>,
    name_counts: &mut HashMap<String, u64>,
    out: &mut String,
    max_length: usize,
) {
    if out.len() >= max_length {
        return;
    }
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                flatten_json(child, Some(key), name_counts, out, max_length);
            }
        }
        Value::Array(items) => {
            for child in items {
                flatten_json(child, name, name_counts, out, max_length);
            }
        }
        scalar => {
            let name = match name {
                Some(name) => name,
                None => return,
            };
            let serial = name_counts
                .entry(name.to_string())
                .and_modify(|count| *count += 1)
                .or_insert(1);
            let key = if *serial > 1 {
                format!("{}.{}_", name, serial)
            } else {
                name.to_string()
            };
            out.push('&');
            out.push_str(&percent_plus_encode(&key));
            out.push('=');
            match scalar {
                // Python-style names for downstream index compatibility
                Value::Null => out.push_str("None"),
                Value::Bool(false) => out.push_str("False"),
                Value::Bool(true) => out.push_str("True"),
                Value::Number(number) => {
                    let _ = write!(out, "{}", number);
                }
                Value::String(text) => out.push_str(&percent_plus_encode(text)),
                _ => unreachable!(),
            }
        }
    }
}

fn percent_plus_unreserved(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'.' | b'_' | b'~')
}

pub fn percent_plus_encode(text: &str) -> String {
    let mut out = String::new();
    for &byte in text.as_bytes() {
        if percent_plus_unreserved(byte) {
            out.push(byte as char);
        } else if byte == b' ' {
            out.push('+');
        } else {
            let _ = write!(out, "%{:02X}", byte);
        }
    }
    out
}

fn percent_plus_decode(text: &str) -> String {
    let bytes = text.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut at = 0;
    while at < bytes.len() {
        match bytes[at] {
            b'+' => {
                out.push(b' ');
                at += 1;
            }
            b'%' => match hex_pair(bytes.get(at + 1).copied(), bytes.get(at + 2).copied()) {
                Some(decoded) => {
                    out.push(decoded);
                    at += 3;
                }
                None => {
                    out.push(b'%');
                    at += 1;
                }
            },
            byte => {
                out.push(byte);
                at += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn hex_pair(high: Option<u8>, low: Option<u8>) -> Option<u8> {
    let high = (high? as char).to_digit(16)?;
    let low = (low? as char).to_digit(16)?;
    Some((high * 16 + low) as u8)
}

// Re-encode a decoded form body: control bytes, space, '#' and anything
// past ASCII get percent encoded, separators pass through untouched.
fn percent_encode_non_percent(text: &str, out: &mut String) {
    for &byte in text.as_bytes() {
        if byte == b'#' || byte <= 0x20 || byte >= 0x7f {
            let _ = write!(out, "%{:02X}", byte);
        } else {
            out.push(byte as char);
        }
    }
}

#[cfg(test)]
mod test_cdx_encoder {
    use super::*;
    use http::header::{HeaderValue, CONTENT_TYPE};
    use http::Uri;

    fn post(content_type: &'static str, body: &[u8]) -> Request {
        let uri: Uri = "http://example.org/submit".parse().unwrap();
        let mut request = Request::get(&uri, "test");
        request.method = Method::POST;
        request
            .headers
            .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
        request.body = body.to_vec();
        request
    }

    #[test]
    fn get_is_not_encoded() {
        let uri: Uri = "http://example.org/".parse().unwrap();
        let request = Request::get(&uri, "test");
        assert_eq!(encode(&request), None);
    }

    #[test]
    fn form_body() {
        let request = post(FORM_URLENCODED, b"q=hello+world&lang=en");
        assert_eq!(
            encode(&request).unwrap(),
            "__wb_method=POST&q=hello%20world&lang=en"
        );
    }

    #[test]
    fn form_body_percent_sequences_decode_then_reencode() {
        let request = post(FORM_URLENCODED, b"a=1&b=%20&c=%23");
        assert_eq!(encode(&request).unwrap(), "__wb_method=POST&a=1&b=%20&c=%23");
    }

    #[test]
    fn json_body_flattens_in_document_order() {
        let request = post(
            JSON,
            br#"{"a": 1, "b": {"c": "x y"}, "d": [true, null]}"#,
        );
        assert_eq!(
            encode(&request).unwrap(),
            "__wb_method=POST&a=1&c=x+y&d=True&d.2_=None"
        );
    }

    #[test]
    fn json_repeated_names_get_serials() {
        let request = post(JSON, br#"{"v": [1, 2, 3]}"#);
        assert_eq!(encode(&request).unwrap(), "__wb_method=POST&v=1&v.2_=2&v.3_=3");
    }

    #[test]
    fn plain_text_that_is_not_json_falls_back_to_binary() {
        let request = post(PLAIN_TEXT, b"just words");
        assert_eq!(
            encode(&request).unwrap(),
            format!("__wb_method=POST&__wb_post_data={}", BASE64.encode(b"just words"))
        );
    }

    #[test]
    fn unknown_content_type_is_base64() {
        let request = post("application/octet-stream", &[0xde, 0xad]);
        assert_eq!(encode(&request).unwrap(), "__wb_method=POST&__wb_post_data=3q0=");
    }

    #[test]
    fn output_is_capped() {
        let body: Vec<u8> = std::iter::repeat(b'x').take(QUERY_STRING_LIMIT * 4).collect();
        let mut form = b"k=".to_vec();
        form.extend_from_slice(&body);
        let request = post(FORM_URLENCODED, &form);

        let encoded = encode(&request).unwrap();
        assert!(encoded.len() <= "__wb_method=POST".len() + 1 + QUERY_STRING_LIMIT);
    }

    #[test]
    fn percent_plus_encode_reserved() {
        assert_eq!(percent_plus_encode("a b&c=d~"), "a+b%26c%3Dd~");
    }
}
