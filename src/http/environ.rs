//! The request environment handed to backend applications.
//!
//! CGI-style variables plus a few structured extras (raw headers, parsed
//! query, request id). Built once per request by the service worker, after
//! the dispatcher has rewritten the URI.

use std::collections::BTreeMap;

use crate::net::connection::ConnectionRecord;

/// Parsed query string: every key maps to its values in order of appearance.
/// A bare `flag` (no `=`) contributes `None`.
pub type QueryDict = BTreeMap<String, Vec<Option<String>>>;

/// Split `k=v&k=v2&flag` into a [`QueryDict`]. Values are kept as sent, no
/// percent-decoding is applied. Empty keys are skipped.
pub fn parse_query(query: &str) -> QueryDict {
    let mut out = QueryDict::new();
    for part in query.split('&').filter(|p| !p.is_empty()) {
        let (key, value) = match part.split_once('=') {
            Some((k, v)) => (k, Some(v.to_string())),
            None => (part, None),
        };
        if key.is_empty() {
            continue;
        }
        out.entry(key.to_string()).or_default().push(value);
    }
    out
}

/// Request environment: CGI variables and the request metadata around them.
#[derive(Debug, Clone, Default)]
pub struct Environ {
    vars: BTreeMap<String, String>,
    raw_headers: Vec<(String, String)>,
    request_id: String,
    original_uri: String,
    query: QueryDict,
}

impl Environ {
    /// Build the environment for a parsed, dispatched connection.
    pub fn from_connection(conn: &ConnectionRecord) -> Self {
        let head = &conn.head;
        let mut vars = BTreeMap::new();

        vars.insert(
            "REQUEST_METHOD".to_string(),
            head.method().unwrap_or_default().to_ascii_uppercase(),
        );
        vars.insert("PATH_INFO".to_string(), head.path().to_string());
        vars.insert("SCRIPT_NAME".to_string(), conn.script_name.clone());
        vars.insert("SCRIPT_FILENAME".to_string(), conn.script_filename.clone());
        vars.insert("QUERY_STRING".to_string(), head.query().to_string());
        vars.insert(
            "SERVER_PROTOCOL".to_string(),
            head.protocol().unwrap_or("HTTP/1.0").to_string(),
        );
        vars.insert("SERVER_PORT".to_string(), conn.server_port.to_string());
        vars.insert("REMOTE_ADDR".to_string(), conn.client_addr.ip().to_string());
        vars.insert("REMOTE_PORT".to_string(), conn.client_addr.port().to_string());

        let scheme = if conn.secure { "https" } else { "http" };
        vars.insert("REQUEST_SCHEME".to_string(), scheme.to_string());
        if let Some(identity) = &conn.tls_info {
            if let Some(subject) = &identity.subject {
                vars.insert("SSL_CLIENT_S_DN".to_string(), subject.clone());
            }
            if let Some(issuer) = &identity.issuer {
                vars.insert("SSL_CLIENT_I_DN".to_string(), issuer.clone());
            }
        }

        let mut raw_headers = Vec::with_capacity(head.headers().len());
        for (name, value) in head.headers().iter() {
            raw_headers.push((name.to_string(), value.to_string()));
            match name.to_ascii_lowercase().as_str() {
                "content-type" => {
                    vars.insert("CONTENT_TYPE".to_string(), value.to_string());
                }
                "content-length" => {
                    vars.insert("CONTENT_LENGTH".to_string(), value.to_string());
                }
                "host" => {
                    vars.insert("HTTP_HOST".to_string(), value.to_string());
                    let (server_name, server_port) = value.split_once(':').unwrap_or((value, ""));
                    vars.insert("SERVER_NAME".to_string(), server_name.to_string());
                    if !server_port.is_empty() {
                        vars.insert("SERVER_PORT".to_string(), server_port.to_string());
                    }
                }
                other => {
                    let key = format!("HTTP_{}", other.to_ascii_uppercase().replace('-', "_"));
                    vars.insert(key, value.to_string());
                }
            }
        }

        Self {
            vars,
            raw_headers,
            request_id: conn.id.to_string(),
            original_uri: head.original_uri().unwrap_or_default().to_string(),
            query: parse_query(head.query()),
        }
    }

    /// Look up a CGI variable.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    /// Set or override a variable.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.vars.insert(key.into(), value.into());
    }

    /// All variables in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn method(&self) -> &str {
        self.get("REQUEST_METHOD").unwrap_or_default()
    }

    pub fn path_info(&self) -> &str {
        self.get("PATH_INFO").unwrap_or_default()
    }

    pub fn script_name(&self) -> &str {
        self.get("SCRIPT_NAME").unwrap_or_default()
    }

    pub fn query_string(&self) -> &str {
        self.get("QUERY_STRING").unwrap_or_default()
    }

    pub fn content_type(&self) -> Option<&str> {
        self.get("CONTENT_TYPE")
    }

    /// Declared body length, if present and numeric.
    pub fn content_length(&self) -> Option<u64> {
        self.get("CONTENT_LENGTH").and_then(|v| v.trim().parse().ok())
    }

    /// Headers as received, in order.
    pub fn raw_headers(&self) -> &[(String, String)] {
        &self.raw_headers
    }

    /// Case-insensitive lookup in the raw headers.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.raw_headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Request URI before any prefix rewriting.
    pub fn original_uri(&self) -> &str {
        &self.original_uri
    }

    pub fn query(&self) -> &QueryDict {
        &self.query
    }

    /// First value of a query parameter; `Some(None)` for a bare flag.
    pub fn query_first(&self, key: &str) -> Option<Option<&str>> {
        self.query.get(key).and_then(|v| v.first()).map(|v| v.as_deref())
    }

    /// True if the client asked for an interim `100 Continue`.
    pub fn expects_continue(&self) -> bool {
        self.header("expect")
            .map(|v| v.trim().eq_ignore_ascii_case("100-continue"))
            .unwrap_or(false)
    }
}
