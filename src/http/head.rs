//! Incremental HTTP head parsing.
//!
//! # Responsibilities
//! - Accumulate raw bytes until the header terminator is seen, however the
//!   bytes were chunked on the wire
//! - Split the request line into method, URI and protocol (or, for response
//!   heads, protocol, status code and message)
//! - Collect header lines into an ordered map
//! - Hand back any bytes read past the terminator: they are body bytes
//!
//! # Design Decisions
//! - Terminator is `\r?\n\r?\n`, so bare-LF clients are accepted
//! - Header lines without a colon are skipped, not rejected
//! - Duplicate header names: last value wins, first position is kept
//! - Exceeding `max_bytes` before the terminator is fatal

use std::fmt;

/// Default cap on the cumulative size of a head.
pub const DEFAULT_MAX_HEADER_BYTES: usize = 100_000;

/// Outcome of one [`HttpHead::consume`] call.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Consumed {
    /// The terminator was seen during this call.
    pub complete: bool,
    /// A fatal parse error was recorded during this call.
    pub error: bool,
    /// Bytes past the terminator. They belong to the body.
    pub leftover: Vec<u8>,
}

/// Ordered header list with case-insensitive lookup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a header. A replaced header keeps its position.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self
            .entries
            .iter_mut()
            .find(|(n, _)| n.eq_ignore_ascii_case(&name))
        {
            Some(entry) => entry.1 = value,
            None => self.entries.push((name, value)),
        }
    }

    /// Case-insensitive lookup.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn remove(&mut self, name: &str) -> Option<String> {
        let index = self
            .entries
            .iter()
            .position(|(n, _)| n.eq_ignore_ascii_case(name))?;
        Some(self.entries.remove(index).1)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A parsed HTTP request or response head.
///
/// Created empty and fed with [`consume`](HttpHead::consume). Once
/// [`is_complete`](HttpHead::is_complete) is true the head is frozen apart
/// from [`replace_uri`](HttpHead::replace_uri), which the dispatcher uses
/// for prefix rewriting.
#[derive(Debug, Clone)]
pub struct HttpHead {
    headline: Option<String>,
    method: Option<String>,
    status_code: Option<u16>,
    status_message: Option<String>,
    protocol: Option<String>,
    uri: Option<String>,
    original_uri: Option<String>,
    headers: Headers,
    raw: Vec<u8>,
    buffer: Vec<u8>,
    complete: bool,
    error: Option<String>,
    max_bytes: usize,
}

impl Default for HttpHead {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpHead {
    /// An empty head with the default size cap.
    pub fn new() -> Self {
        Self::with_limit(DEFAULT_MAX_HEADER_BYTES)
    }

    /// An empty head that fails once more than `max_bytes` are buffered
    /// without a terminator.
    pub fn with_limit(max_bytes: usize) -> Self {
        Self {
            headline: None,
            method: None,
            status_code: None,
            status_message: None,
            protocol: None,
            uri: None,
            original_uri: None,
            headers: Headers::new(),
            raw: Vec::new(),
            buffer: Vec::new(),
            complete: false,
            error: None,
            max_bytes,
        }
    }

    /// Build an outbound response head.
    pub fn response(status_code: u16, status_message: impl Into<String>) -> Self {
        let mut head = Self::new();
        head.protocol = Some("HTTP/1.1".to_string());
        head.status_code = Some(status_code);
        head.status_message = Some(status_message.into());
        head.complete = true;
        head
    }

    /// Feed the next chunk of bytes.
    ///
    /// Returns `complete = true` exactly once, on the call that completes the
    /// head. Input given after completion is returned untouched as leftover.
    pub fn consume(&mut self, input: &[u8]) -> Consumed {
        if self.complete || self.error.is_some() {
            return Consumed {
                complete: false,
                error: self.error.is_some(),
                leftover: input.to_vec(),
            };
        }

        // A terminator can straddle the previous chunk by up to 3 bytes.
        let scan_from = self.buffer.len().saturating_sub(3);
        self.buffer.extend_from_slice(input);

        let Some((head_end, body_start)) = find_terminator(&self.buffer, scan_from) else {
            let error = self.buffer.len() > self.max_bytes;
            if error {
                self.error = Some(format!("Request is too long: {}", self.buffer.len()));
            }
            return Consumed {
                complete: false,
                error,
                leftover: Vec::new(),
            };
        };

        self.complete = true;
        let buffer = std::mem::take(&mut self.buffer);
        let leftover = buffer[body_start..].to_vec();
        self.raw = buffer[..head_end].to_vec();

        let error = self.parse_raw().is_err();
        Consumed {
            complete: true,
            error,
            leftover: if error { Vec::new() } else { leftover },
        }
    }

    fn parse_raw(&mut self) -> Result<(), ()> {
        let text = String::from_utf8_lossy(&self.raw).into_owned();
        let mut lines = text.split('\n').map(str::trim);

        let headline = lines.next().unwrap_or_default().to_string();
        let words: Vec<&str> = headline.split_whitespace().collect();
        let is_response = words
            .first()
            .map(|w| w.to_ascii_lowercase().starts_with("http/"))
            .unwrap_or(false);
        // Status messages may contain spaces; request lines may not.
        if words.len() != 3 && !(is_response && words.len() > 3) {
            self.error = Some(format!(
                "Can not parse headline. len(words)={}",
                words.len()
            ));
            self.headline = Some(headline);
            return Err(());
        }

        if is_response {
            match words[1].parse::<u16>() {
                Ok(code) => self.status_code = Some(code),
                Err(_) => {
                    self.error = Some(format!("Invalid status code: {}", words[1]));
                    self.headline = Some(headline);
                    return Err(());
                }
            }
            self.status_message = Some(words[2..].join(" "));
            self.protocol = Some(words[0].to_ascii_uppercase());
        } else {
            self.method = Some(words[0].to_ascii_uppercase());
            self.uri = Some(words[1].to_string());
            self.original_uri = Some(words[1].to_string());
            self.protocol = Some(words[2].to_ascii_uppercase());
        }

        for line in lines {
            if line.is_empty() {
                continue;
            }
            if let Some((name, value)) = line.split_once(':') {
                self.headers.insert(name.trim(), value.trim());
            }
        }

        self.headline = Some(headline);
        Ok(())
    }

    /// The terminator has been seen.
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// The head parsed cleanly and carries an HTTP protocol token.
    pub fn is_valid(&self) -> bool {
        self.error.is_none()
            && self
                .protocol
                .as_deref()
                .map(|p| p.to_ascii_uppercase().starts_with("HTTP/"))
                .unwrap_or(false)
    }

    /// This is a request head (has a method).
    pub fn is_request(&self) -> bool {
        self.method.is_some()
    }

    /// This is a response head (has a status code).
    pub fn is_response(&self) -> bool {
        self.status_code.is_some()
    }

    /// A request, or a non-1xx response.
    pub fn is_final(&self) -> bool {
        match self.status_code {
            Some(code) => code / 100 != 1,
            None => self.is_request(),
        }
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn method(&self) -> Option<&str> {
        self.method.as_deref()
    }

    pub fn protocol(&self) -> Option<&str> {
        self.protocol.as_deref()
    }

    pub fn status_code(&self) -> Option<u16> {
        self.status_code
    }

    pub fn status_message(&self) -> Option<&str> {
        self.status_message.as_deref()
    }

    /// Current (possibly rewritten) request URI.
    pub fn uri(&self) -> Option<&str> {
        self.uri.as_deref()
    }

    /// Request URI as received.
    pub fn original_uri(&self) -> Option<&str> {
        self.original_uri.as_deref()
    }

    /// Replace the request URI. `original_uri` is unaffected.
    pub fn replace_uri(&mut self, uri: impl Into<String>) {
        self.uri = Some(uri.into());
    }

    /// URI without the query string.
    pub fn path(&self) -> &str {
        let uri = self.uri.as_deref().unwrap_or("");
        uri.split_once('?').map(|(p, _)| p).unwrap_or(uri)
    }

    /// Query string without the leading `?`, empty if absent.
    pub fn query(&self) -> &str {
        self.uri
            .as_deref()
            .and_then(|u| u.split_once('?'))
            .map(|(_, q)| q)
            .unwrap_or("")
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    /// Exact bytes of the head, terminator excluded.
    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    /// Replace a client's keep-alive request with `Connection: close`.
    pub fn force_connection_close(&mut self) {
        self.headers.insert("Connection", "close");
    }

    /// Request or status line.
    pub fn headline(&self, original: bool) -> String {
        let protocol = self.protocol.as_deref().unwrap_or("HTTP/1.1");
        if let Some(method) = &self.method {
            let uri = if original {
                self.original_uri.as_deref()
            } else {
                self.uri.as_deref()
            };
            format!("{} {} {}", method, uri.unwrap_or("/"), protocol)
        } else {
            format!(
                "{} {} {}",
                protocol,
                self.status_code.unwrap_or(200),
                self.status_message.as_deref().unwrap_or("")
            )
        }
    }

    /// Serialize the head, terminator included.
    pub fn to_bytes(&self, original: bool) -> Vec<u8> {
        let mut out = self.headline(original);
        out.push_str("\r\n");
        for (name, value) in self.headers.iter() {
            out.push_str(name);
            out.push_str(": ");
            out.push_str(value);
            out.push_str("\r\n");
        }
        out.push_str("\r\n");
        out.into_bytes()
    }
}

impl fmt::Display for HttpHead {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "HttpHead(headline='{}', status={:?})",
            self.headline.as_deref().unwrap_or(""),
            self.status_code
        )
    }
}

/// Locate `\r?\n\r?\n` at or after `from`.
/// Returns (end of head, start of body).
fn find_terminator(buf: &[u8], from: usize) -> Option<(usize, usize)> {
    let mut i = from;
    while i < buf.len() {
        if buf[i] == b'\n' {
            let mut j = i + 1;
            if j < buf.len() && buf[j] == b'\r' {
                j += 1;
            }
            if j < buf.len() && buf[j] == b'\n' {
                let start = if i > 0 && buf[i - 1] == b'\r' { i - 1 } else { i };
                return Some((start, j + 1));
            }
        }
        i += 1;
    }
    None
}
