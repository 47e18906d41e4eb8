use crate::http::headers::HeaderMap;

/// Request method.
///
/// Anything the gateway can parse is forwarded, so non-standard tokens
/// (WebDAV's `PROPFIND`, `MKCOL`, ...) survive as `Extension`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Method {
    GET,
    POST,
    PUT,
    DELETE,
    HEAD,
    OPTIONS,
    PATCH,
    TRACE,
    Extension(String),
}

/// A client request as read off the wire.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    /// Raw request target, query string included (`/server1/a?x=1`)
    pub path: String,
    pub version: String,
    pub headers: HeaderMap,
    /// De-chunked entity body; empty when there is none
    pub body: Vec<u8>,
}

/// Assembles a [`Request`]; method and path are mandatory.
#[derive(Default)]
pub struct RequestBuilder {
    method: Option<Method>,
    path: Option<String>,
    version: Option<String>,
    headers: HeaderMap,
    body: Vec<u8>,
}

impl Method {
    const STANDARD: [Method; 8] = [
        Method::GET,
        Method::POST,
        Method::PUT,
        Method::DELETE,
        Method::HEAD,
        Method::OPTIONS,
        Method::PATCH,
        Method::TRACE,
    ];

    /// Case-sensitive parse. Unknown all-caps tokens become `Extension`.
    ///
    /// ```
    /// # use http_ssh_gateway::http::request::Method;
    /// assert_eq!(Method::from_str("HEAD"), Some(Method::HEAD));
    /// assert_eq!(Method::from_str("MKCOL"), Some(Method::Extension("MKCOL".into())));
    /// assert_eq!(Method::from_str("head"), None);
    /// ```
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        if let Some(known) = Self::STANDARD.iter().find(|m| m.as_str() == s) {
            return Some(known.clone());
        }
        let token = !s.is_empty() && s.bytes().all(|b| b.is_ascii_uppercase());
        token.then(|| Method::Extension(s.to_string()))
    }

    /// Wire representation
    pub fn as_str(&self) -> &str {
        match self {
            Method::GET => "GET",
            Method::POST => "POST",
            Method::PUT => "PUT",
            Method::DELETE => "DELETE",
            Method::HEAD => "HEAD",
            Method::OPTIONS => "OPTIONS",
            Method::PATCH => "PATCH",
            Method::TRACE => "TRACE",
            Method::Extension(name) => name,
        }
    }
}

impl RequestBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn method(mut self, method: Method) -> Self {
        self.method = Some(method);
        self
    }

    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.append(key, value);
        self
    }

    pub fn body(mut self, body: Vec<u8>) -> Self {
        self.body = body;
        self
    }

    pub fn build(self) -> Result<Request, &'static str> {
        let (Some(method), Some(path)) = (self.method, self.path) else {
            return Err("request needs a method and a path");
        };
        Ok(Request {
            method,
            path,
            version: self.version.unwrap_or_else(|| "HTTP/1.1".into()),
            headers: self.headers,
            body: self.body,
        })
    }
}

impl Request {
    /// First value of a header, any name case
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key)
    }

    /// Whether the client connection stays open after this exchange.
    ///
    /// HTTP/1.1 defaults to keep-alive, HTTP/1.0 to close; an explicit
    /// `Connection` header wins either way.
    pub fn keep_alive(&self) -> bool {
        match self.header("Connection") {
            Some(v) if v.eq_ignore_ascii_case("close") => false,
            Some(v) if v.eq_ignore_ascii_case("keep-alive") => true,
            _ => self.version != "HTTP/1.0",
        }
    }

    /// Path component of the target, without query string.
    ///
    /// Absolute-form targets (`GET http://host/p HTTP/1.1`) are reduced to
    /// their path.
    pub fn path_only(&self) -> String {
        if self.path.starts_with("http://") || self.path.starts_with("https://") {
            if let Ok(url) = url::Url::parse(&self.path) {
                return url.path().to_string();
            }
        }
        match self.path.split_once('?') {
            Some((path, _)) => path.to_string(),
            None => self.path.clone(),
        }
    }

    /// Raw query string, if any
    pub fn query(&self) -> Option<&str> {
        self.path
            .split_once('?')
            .map(|(_, q)| q)
            .filter(|q| !q.is_empty())
    }

    /// Host the client addressed, from the `Host` header
    pub fn host(&self) -> Option<&str> {
        self.header("Host").filter(|h| !h.is_empty())
    }

    /// True when the client asked for `Expect: 100-continue`
    pub fn expects_continue(&self) -> bool {
        self.header("Expect")
            .map(|v| v.eq_ignore_ascii_case("100-continue"))
            .unwrap_or(false)
    }
}
