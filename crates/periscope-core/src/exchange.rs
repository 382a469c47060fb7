//! Intercepted exchange model.
//!
//! An [`Exchange`] is the engine-owned view of one request/response pair:
//! the request line facts the classifier needs, plus the single mutable
//! field the router is allowed to touch before the engine forwards the
//! request. Engines build one per transaction and drop it when the
//! transaction completes; the broadcast layer clones it per subscriber.

/// Upstream proxy endpoint applied to an exchange's routing target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamTarget {
    /// Upstream proxy host.
    pub host: String,
    /// Upstream proxy port.
    pub port: u16,
}

impl UpstreamTarget {
    /// Creates a new upstream target.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl std::fmt::Display for UpstreamTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// One intercepted request/response pair.
///
/// The scheme and port checks of the session classifier operate on the full
/// original request URI string ([`Exchange::uri`]), not on parsed
/// components; game servers have exposed HTTPS on non-standard ports where
/// only the URI text is authoritative.
#[derive(Debug, Clone)]
pub struct Exchange {
    host: String,
    uri: String,
    path: String,
    content_type: Option<String>,
    secure: bool,
    routing_target: Option<UpstreamTarget>,
}

impl Exchange {
    /// Creates an exchange from the request line facts.
    pub fn new(host: impl Into<String>, uri: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            uri: uri.into(),
            path: path.into(),
            content_type: None,
            secure: false,
            routing_target: None,
        }
    }

    /// Sets the content-type header value observed on the response.
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    /// Sets the engine-reported secure flag.
    pub fn with_secure_flag(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    /// Returns the request host.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Returns the full original request URI string.
    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Returns the absolute request path.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Returns the content-type header value, if one was observed.
    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    /// Returns true if the engine itself reported the connection as secured.
    pub fn secure_flag(&self) -> bool {
        self.secure
    }

    /// Returns the routing target, if the router assigned one.
    pub fn routing_target(&self) -> Option<&UpstreamTarget> {
        self.routing_target.as_ref()
    }

    /// Points the in-flight request at an upstream proxy.
    pub fn set_routing_target(&mut self, target: UpstreamTarget) {
        self.routing_target = Some(target);
    }
}
