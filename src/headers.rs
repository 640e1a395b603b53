use core::fmt;
use std::collections::BTreeMap;

use hyper::header::HeaderMap;
use serde::Serialize;

/// Request headers keyed by canonical name (`X-Request-Id`), each carrying
/// every value seen in arrival order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Headers(pub BTreeMap<String, Vec<String>>);

impl Headers {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    pub fn insert(&mut self, k: &str, v: &str) {
        self.0
            .entry(Self::canonical_name(k))
            .or_default()
            .push(v.to_string());
    }

    #[cfg(test)]
    pub fn get(&self, k: &str) -> Option<&[String]> {
        self.0.get(&Self::canonical_name(k)).map(Vec::as_slice)
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Upper-cases the first letter and every letter following a hyphen,
    /// lower-cases the rest.
    pub fn canonical_name(name: &str) -> String {
        let mut upper = true;
        name.chars()
            .map(|c| {
                let out = if upper {
                    c.to_ascii_uppercase()
                } else {
                    c.to_ascii_lowercase()
                };
                upper = c == '-';
                out
            })
            .collect()
    }
}

impl From<&HeaderMap> for Headers {
    fn from(map: &HeaderMap) -> Self {
        let mut headers = Headers::new();
        for (name, value) in map {
            headers.insert(name.as_str(), &String::from_utf8_lossy(value.as_bytes()));
        }
        headers
    }
}

impl fmt::Display for Headers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            self.0
                .iter()
                .map(|(k, v)| format!("{}: {}\r\n", k, v.join(", ")))
                .collect::<String>()
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use hyper::header::HeaderValue;

    #[test]
    fn canonical_names() {
        let cases = [
            ("host", "Host"),
            ("x-request-id", "X-Request-Id"),
            ("CONTENT-TYPE", "Content-Type"),
            ("sec-websocket-key", "Sec-Websocket-Key"),
            ("-odd", "-Odd"),
        ];
        for (raw, expected) in cases {
            assert_eq!(Headers::canonical_name(raw), expected, "{}", raw);
        }
    }

    #[test]
    fn collects_repeated_values_in_order() {
        let mut map = HeaderMap::new();
        map.append("set-person", HeaderValue::from_static("lane-loves-go"));
        map.append("set-person", HeaderValue::from_static("prime-loves-zig"));
        map.insert("host", HeaderValue::from_static("localhost:8080"));

        let headers = Headers::from(&map);
        assert_eq!(headers.len(), 2);
        assert_eq!(
            headers.get("Set-Person").unwrap(),
            &["lane-loves-go".to_string(), "prime-loves-zig".to_string()]
        );
        assert_eq!(headers.get("HOST").unwrap(), &["localhost:8080".to_string()]);
    }

    #[test]
    fn serializes_as_name_to_values() {
        let mut headers = Headers::new();
        headers.insert("accept", "*/*");
        let json = serde_json::to_string(&headers).unwrap();
        assert_eq!(json, r#"{"Accept":["*/*"]}"#);
    }

    #[test]
    fn display_joins_values() {
        let mut headers = Headers::new();
        headers.insert("content-type", "text/plain");
        headers.insert("content-type", "application/json");
        assert_eq!(headers.to_string(), "Content-Type: text/plain, application/json\r\n");
    }
}
