//! Response rewriting
//!
//! Makes backend responses usable through the gateway's path prefixes:
//! `Location` headers are redirected back to the gateway, and links in
//! HTML bodies are rewritten with regular expressions (no DOM parse, so
//! malformed markup is tolerated and multi-line or nested-quote attribute
//! values are not handled). gzip-encoded HTML is decoded, rewritten and
//! encoded again.
//!
//! Only `href` and `src` attributes inside tags are considered. Scripts,
//! stylesheets and `srcset` are left alone.

use crate::error::{GatewayError, Result};
use crate::http::headers::HeaderMap;
use crate::http::response::{Response, ResponseBuilder};
use crate::proxy::backend::{Backend, BackendSet};
use crate::proxy::upstream::CapturedResponse;
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use once_cell::sync::Lazy;
use regex::bytes::{Captures, Regex};
use std::io::{Read, Write};

/// `href`/`src` values starting with `/`
static ABS_LINK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?-u)<[^>]+\b(href|src)[ \t\n]*=[ \t\n]*["'](/[^"']+)["'][^>]*>"#)
        .expect("absolute link pattern")
});

/// `href`/`src` values not starting with `/`
static RELATIVE_LINK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?-u)<[^>]+\b(href|src)[ \t\n]*=[ \t\n]*["']([^/][^"']+)["'][^>]*>"#)
        .expect("relative link pattern")
});

/// A backend address and the gateway prefix that replaces it in links
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Replacement {
    pub from: String,
    pub to: String,
}

/// Per-request parameters for rewriting one backend's response
#[derive(Debug, Clone)]
pub struct RewriteContext {
    /// `http://<original host>/<backend name>`
    pub base_path: String,

    /// Host the client addressed
    pub original_host: String,

    /// Backend the request was routed to
    pub backend_name: String,

    /// Backend address as it shows up in absolute redirects
    pub expected_location: String,

    /// Links to any configured backend, pointed back through the gateway
    pub replacements: Vec<Replacement>,
}

impl RewriteContext {
    pub fn new(original_host: &str, backend: &Backend, backends: &BackendSet) -> Self {
        Self {
            base_path: format!("http://{}/{}", original_host, backend.name),
            original_host: original_host.to_string(),
            backend_name: backend.name.clone(),
            expected_location: backend.address.clone(),
            replacements: backends.link_replacements(original_host),
        }
    }
}

/// Turn a captured backend response into the response sent to the client.
///
/// Headers are copied verbatim except for `Location` and framing headers.
/// Non-HTML bodies pass through byte for byte.
pub fn rewrite(captured: CapturedResponse, ctx: &RewriteContext) -> Result<Response> {
    let CapturedResponse {
        status,
        mut headers,
        body,
    } = captured;

    headers.map_values("Location", |location| rewrite_location(location, ctx));

    // The body is re-framed with Content-Length by the writer
    headers.remove("Transfer-Encoding");
    headers.remove("Connection");
    headers.remove("Keep-Alive");

    let body = if is_html(&headers) && !body.is_empty() {
        let gzip = is_gzip(&headers);
        let rewritten = rewrite_html_body(&body, gzip, ctx)?;
        headers.insert("Content-Length", rewritten.len().to_string());
        tracing::trace!(gzip, before = body.len(), after = rewritten.len(), "Rewrote HTML body");
        rewritten
    } else {
        body
    };

    Ok(ResponseBuilder::new(status).headers(headers).body(body).build())
}

/// Point a redirect back through the gateway.
///
/// Server-relative locations get the base path prefixed; otherwise the
/// first occurrence of the backend address becomes `<host>/<backend>`.
pub fn rewrite_location(location: &str, ctx: &RewriteContext) -> String {
    if location.starts_with('/') {
        format!("{}{}", ctx.base_path, location)
    } else if ctx.expected_location.is_empty() {
        location.to_string()
    } else {
        location.replacen(
            &ctx.expected_location,
            &format!("{}/{}", ctx.original_host, ctx.backend_name),
            1,
        )
    }
}

fn rewrite_html_body(body: &[u8], gzip: bool, ctx: &RewriteContext) -> Result<Vec<u8>> {
    if gzip {
        let html = gunzip(body)?;
        gzip_encode(&rewrite_links(&html, ctx))
    } else {
        Ok(rewrite_links(body, ctx))
    }
}

/// Absolute, then external, then relative link rewriting.
///
/// The relative pass must see original relative values and must skip
/// links the external pass already made absolute.
pub fn rewrite_links(html: &[u8], ctx: &RewriteContext) -> Vec<u8> {
    let html = replace_absolute_links(html, &ctx.base_path);
    let html = replace_external_links(&html, &ctx.replacements);
    replace_relative_links(&html, &ctx.base_path)
}

/// Insert `base_path` in front of every `/`-rooted `href`/`src` value.
pub fn replace_absolute_links(html: &[u8], base_path: &str) -> Vec<u8> {
    add_prefix(html, &ABS_LINK, |_| base_path.to_string())
}

/// Replace backend addresses inside `href`/`src` values with their
/// gateway prefixes.
///
/// This is a plain substring substitution over the attribute span, not a
/// URL parse. Per match, the last occurrence on the line is replaced.
pub fn replace_external_links(html: &[u8], replacements: &[Replacement]) -> Vec<u8> {
    let mut result = html.to_vec();

    for replacement in replacements.iter().filter(|r| !r.from.is_empty()) {
        let pattern = format!(
            r#"(?-u)<[^>]+\b(href|src)[ \t\n]*=[ \t\n]*["'].*({}).*["'][^>]*>"#,
            regex::escape(&replacement.from)
        );
        let Ok(link) = Regex::new(&pattern) else {
            tracing::warn!(from = %replacement.from, "Skipping unusable link replacement");
            continue;
        };
        result = replace_group(&result, &link, replacement.to.as_bytes());
    }

    result
}

/// Insert `<base_path>/` in front of relative `href`/`src` values that are
/// not already `http://` or `https://` URLs.
pub fn replace_relative_links(html: &[u8], base_path: &str) -> Vec<u8> {
    let prefix = format!("{}/", base_path);
    add_prefix(html, &RELATIVE_LINK, |link| {
        if link.starts_with(b"http://") || link.starts_with(b"https://") {
            String::new()
        } else {
            prefix.clone()
        }
    })
}

/// Copy `s`, inserting a prefix before capture group 2 of every match.
/// Empty prefixes leave the input untouched.
fn add_prefix(s: &[u8], re: &Regex, prefix_for: impl Fn(&[u8]) -> String) -> Vec<u8> {
    let mut out = Vec::with_capacity(s.len());
    let mut last = 0;

    for caps in re.captures_iter(s) {
        let Some(value) = link_value(&caps) else {
            continue;
        };
        out.extend_from_slice(&s[last..value.start()]);
        out.extend_from_slice(prefix_for(value.as_bytes()).as_bytes());
        out.extend_from_slice(value.as_bytes());
        last = value.end();
    }

    out.extend_from_slice(&s[last..]);
    out
}

/// Copy `s`, replacing capture group 2 of every match with `to`
fn replace_group(s: &[u8], re: &Regex, to: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(s.len());
    let mut last = 0;

    for caps in re.captures_iter(s) {
        let Some(value) = link_value(&caps) else {
            continue;
        };
        out.extend_from_slice(&s[last..value.start()]);
        out.extend_from_slice(to);
        last = value.end();
    }

    out.extend_from_slice(&s[last..]);
    out
}

fn link_value<'h>(caps: &Captures<'h>) -> Option<regex::bytes::Match<'h>> {
    caps.get(2)
}

fn is_html(headers: &HeaderMap) -> bool {
    headers.get_all("Content-Type").any(|v| v.contains("html"))
}

fn is_gzip(headers: &HeaderMap) -> bool {
    headers
        .get_all("Content-Encoding")
        .any(|v| v.to_ascii_lowercase().contains("gzip"))
}

fn gunzip(body: &[u8]) -> Result<Vec<u8>> {
    let mut html = Vec::new();
    GzDecoder::new(body)
        .read_to_end(&mut html)
        .map_err(|e| GatewayError::Rewrite(format!("gzip decode failed: {}", e)))?;
    Ok(html)
}

fn gzip_encode(html: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(html.len() / 2), Compression::default());
    encoder
        .write_all(html)
        .map_err(|e| GatewayError::Rewrite(format!("gzip encode failed: {}", e)))?;
    encoder
        .finish()
        .map_err(|e| GatewayError::Rewrite(format!("gzip encode failed: {}", e)))
}
