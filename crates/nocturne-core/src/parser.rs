// src/parser.rs
use memchr::memmem;

use crate::config::{AddressMode, Limits};
use crate::error::ParseError;
use crate::http::{Method, Request, Version};

const HEAD_END: &[u8] = b"\r\n\r\n";

/// Parse a request head from the start of `buf`.
///
/// Returns `Ok(None)` while the head is incomplete, otherwise the request
/// and the length of its head. The body (if any) follows in `buf` and is
/// not consumed here.
pub fn parse_request(
    buf: &[u8],
    limits: &Limits,
    peer: &str,
) -> Result<Option<(Request, usize)>, ParseError> {
    let end = match memmem::find(buf, HEAD_END) {
        Some(end) => end,
        None if buf.len() >= limits.max_request_size => {
            return Err(ParseError::new(413, "Request head is too large"));
        }
        None => return Ok(None),
    };
    let head_len = end + HEAD_END.len();
    if head_len > limits.max_request_size {
        return Err(ParseError::new(413, "Request head is too large"));
    }

    // Every line but the last ends with CR, the search consumed the last CRLF
    let head = &buf[..end];
    let last = head.iter().filter(|&&c| c == b'\n').count();
    let mut lines = head.split(|&c| c == b'\n').enumerate().map(|(i, line)| {
        if i == last {
            Ok(line)
        } else {
            line.strip_suffix(b"\r")
                .ok_or(ParseError::new(400, "Malformed line ending"))
        }
    });

    let mut request = Request::default();
    let first = match lines.next() {
        Some(line) => line?,
        None => return Err(ParseError::new(400, "Empty request")),
    };
    parse_request_line(first, limits, &mut request)?;

    let mut keepalive = request.version == Version::Http11;
    let mut count = 0;
    for line in lines {
        let line = line?;
        count += 1;
        if count > limits.max_request_headers {
            return Err(ParseError::new(431, "Too many request headers"));
        }
        let (key, value) = parse_header(line)?;

        if key == "Cookie" {
            parse_cookies(&value, limits, &mut request)?;
        } else if key == "Connection" {
            keepalive = !value.eq_ignore_ascii_case("close");
        }
        request.headers.push(key, value);
    }

    if let Some(len) = request.header("Content-Length") {
        if len.is_empty() || !len.bytes().all(|c| c.is_ascii_digit()) {
            return Err(ParseError::new(400, "Invalid Content-Length"));
        }
        request.body_len = len
            .parse()
            .map_err(|_| ParseError::new(400, "Invalid Content-Length"))?;
    }
    if request.headers.contains_ignore_case("Transfer-Encoding") {
        return Err(ParseError::new(501, "Transfer-Encoding is not supported"));
    }
    if request.method == Method::Get && request.body_len > 0 {
        return Err(ParseError::new(400, "Refusing GET request with body"));
    }

    request.client_addr = match limits.addr_mode {
        AddressMode::Socket => peer.to_string(),
        AddressMode::XForwardedFor => {
            let value = request.header("X-Forwarded-For").unwrap_or("");
            let first = value.split(',').next().unwrap_or("").trim();
            if first.is_empty() {
                return Err(ParseError::new(400, "X-Forwarded-For header is missing or empty"));
            }
            first.to_string()
        }
        AddressMode::XRealIp => {
            let value = request.header("X-Real-IP").unwrap_or("").trim();
            if value.is_empty() {
                return Err(ParseError::new(400, "X-Real-IP header is missing or empty"));
            }
            value.to_string()
        }
    };

    request.keepalive = keepalive;
    Ok(Some((request, head_len)))
}

fn parse_request_line(line: &[u8], limits: &Limits, request: &mut Request) -> Result<(), ParseError> {
    let line = std::str::from_utf8(line).map_err(|_| ParseError::new(400, "Malformed request line"))?;
    let mut parts = line.split(' ');
    let (method, url, protocol) = match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(m), Some(u), Some(p), None) => (m, u, p),
        _ => return Err(ParseError::new(400, "Malformed request line")),
    };

    if method.is_empty() {
        return Err(ParseError::new(400, "Empty HTTP method"));
    }
    let (method, headers_only) = Method::from_bytes(method.as_bytes())
        .ok_or(ParseError::new(405, "Unsupported HTTP method"))?;
    request.method = method;
    request.headers_only = headers_only;

    if !url.starts_with('/') {
        return Err(ParseError::new(400, "Request URL does not start with '/'"));
    }
    if url.len() > limits.max_url_len {
        return Err(ParseError::new(414, "Request URL is too long"));
    }

    request.version = match protocol {
        "HTTP/1.1" => Version::Http11,
        "HTTP/1.0" => Version::Http10,
        _ => return Err(ParseError::new(400, "Unsupported HTTP protocol")),
    };

    let url = url.split('#').next().unwrap_or(url);
    let (path, query) = match url.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (url, None),
    };

    request.path = decode_path(path)?;
    if request.path.split('/').any(|segment| segment == "..") {
        return Err(ParseError::new(403, "Unsafe URL containing '..'"));
    }

    if let Some(query) = query {
        let pairs: Vec<(String, String)> = serde_urlencoded::from_str(query)
            .map_err(|_| ParseError::new(400, "Malformed query string"))?;
        for (key, value) in pairs {
            request.query.push(key, value);
        }
    }

    Ok(())
}

fn parse_header(line: &[u8]) -> Result<(String, String), ParseError> {
    if line.first().is_some_and(|&c| c == b' ' || c == b'\t') {
        return Err(ParseError::new(400, "Folded header lines are not supported"));
    }
    let colon = memchr::memchr(b':', line).ok_or(ParseError::new(400, "Malformed header line"))?;
    let (key, value) = (&line[..colon], &line[colon + 1..]);

    if key.is_empty() || !key.iter().all(|&c| is_token(c)) {
        return Err(ParseError::new(400, "Invalid header name"));
    }
    let value = trim_ows(value);
    if value.iter().any(|&c| (c < 0x20 && c != b'\t') || c == 0x7F) {
        return Err(ParseError::new(400, "Invalid header value"));
    }

    Ok((canonical_key(key), String::from_utf8_lossy(value).into_owned()))
}

fn parse_cookies(value: &str, limits: &Limits, request: &mut Request) -> Result<(), ParseError> {
    for pair in value.split(';') {
        let Some((name, value)) = pair.split_once('=') else {
            continue;
        };
        let name = name.trim();
        if name.is_empty() {
            continue;
        }
        if request.cookies.len() >= limits.max_request_cookies {
            return Err(ParseError::new(431, "Too many cookies"));
        }
        request.cookies.push(name, value.trim());
    }
    Ok(())
}

fn is_token(c: u8) -> bool {
    c.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&c)
}

fn trim_ows(mut value: &[u8]) -> &[u8] {
    while let [b' ' | b'\t', rest @ ..] = value {
        value = rest;
    }
    while let [rest @ .., b' ' | b'\t'] = value {
        value = rest;
    }
    value
}

/// `content-length` becomes `Content-Length`.
fn canonical_key(key: &[u8]) -> String {
    let mut upper = true;
    key.iter()
        .map(|&c| {
            let c = if upper { c.to_ascii_uppercase() } else { c.to_ascii_lowercase() };
            upper = c == b'-';
            c as char
        })
        .collect()
}

fn decode_path(raw: &str) -> Result<String, ParseError> {
    const MALFORMED: ParseError = ParseError::new(400, "Malformed URL path");

    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hi = bytes.get(i + 1).and_then(|&c| (c as char).to_digit(16));
            let lo = bytes.get(i + 2).and_then(|&c| (c as char).to_digit(16));
            match (hi, lo) {
                (Some(hi), Some(lo)) => out.push((hi * 16 + lo) as u8),
                _ => return Err(MALFORMED),
            }
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }

    if out.iter().any(|&c| c < 0x20 || c == 0x7F) {
        return Err(MALFORMED);
    }
    String::from_utf8(out).map_err(|_| MALFORMED)
}
