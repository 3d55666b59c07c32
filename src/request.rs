//! Owned representation of an inbound request.
//!
//! Framework integrations convert their native request type into an
//! [`InboundRequest`] at the boundary; nothing in the pipeline depends on a
//! particular web framework.

use std::collections::HashMap;
use std::fmt;

/// HTTP method of an inbound request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HttpMethod {
    /// HTTP GET method
    Get,
    /// HTTP HEAD method
    Head,
    /// HTTP POST method
    Post,
    /// HTTP PUT method
    Put,
    /// HTTP DELETE method
    Delete,
    /// HTTP PATCH method
    Patch,
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HttpMethod::Get => write!(f, "GET"),
            HttpMethod::Head => write!(f, "HEAD"),
            HttpMethod::Post => write!(f, "POST"),
            HttpMethod::Put => write!(f, "PUT"),
            HttpMethod::Delete => write!(f, "DELETE"),
            HttpMethod::Patch => write!(f, "PATCH"),
        }
    }
}

/// An authenticated user or service principal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    /// Unique identifier for this principal
    pub id: String,
    /// Display name
    pub name: String,
    /// Tenant (organization, store) the principal is acting under, if any
    pub tenant_id: Option<String>,
}

impl Principal {
    /// Creates a principal without a tenant.
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            tenant_id: None,
        }
    }

    /// Scopes the principal to a tenant.
    pub fn with_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }
}

/// A file uploaded with the request body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedFile {
    /// Form field the file was submitted under
    pub field: String,
    /// Client-supplied file name
    pub file_name: String,
    /// Declared content type
    pub content_type: String,
    /// File contents
    pub bytes: Vec<u8>,
}

/// An inbound request as seen by the pipeline.
///
/// # Examples
///
/// ```
/// use guard_bridge::{HttpMethod, InboundRequest, Principal};
///
/// let mut request = InboundRequest::new("req-1", HttpMethod::Get, "/users/42?tab=profile");
/// request.set_principal(Some(Principal::new("user-1", "Alice")));
///
/// assert_eq!(request.path(), "/users/42");
/// assert_eq!(request.query_param("tab"), Some("profile"));
/// ```
#[derive(Debug, Clone)]
pub struct InboundRequest {
    request_id: String,
    method: HttpMethod,
    path: String,
    query_params: HashMap<String, String>,
    form_fields: HashMap<String, String>,
    files: Vec<UploadedFile>,
    cookies: HashMap<String, String>,
    headers: HashMap<String, String>,
    session_token: Option<String>,
    principal: Option<Principal>,
}

impl InboundRequest {
    /// Creates a request. A query string in `target` is split off and decoded.
    pub fn new(request_id: impl Into<String>, method: HttpMethod, target: &str) -> Self {
        let (path, query) = match target.split_once('?') {
            Some((path, query)) => (path, Some(query)),
            None => (target, None),
        };

        let mut request = Self {
            request_id: request_id.into(),
            method,
            path: path.to_string(),
            query_params: HashMap::new(),
            form_fields: HashMap::new(),
            files: Vec::new(),
            cookies: HashMap::new(),
            headers: HashMap::new(),
            session_token: None,
            principal: None,
        };
        if let Some(query) = query {
            for (key, value) in parse_query(query) {
                request.query_params.insert(key, value);
            }
        }
        request
    }

    /// Sets the authenticated principal resolved by the authentication layer.
    pub fn set_principal(&mut self, principal: Option<Principal>) {
        self.principal = principal;
    }

    /// Sets the opaque session token carried by the client.
    pub fn set_session_token(&mut self, token: Option<String>) {
        self.session_token = token;
    }

    /// Adds a query parameter.
    pub fn add_query_param(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.query_params.insert(key.into(), value.into());
    }

    /// Adds a decoded form body field.
    pub fn add_form_field(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.form_fields.insert(key.into(), value.into());
    }

    /// Adds an uploaded file.
    pub fn add_file(&mut self, file: UploadedFile) {
        self.files.push(file);
    }

    /// Adds a cookie.
    pub fn add_cookie(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.cookies.insert(name.into(), value.into());
    }

    /// Adds a header. Names are stored lowercase.
    pub fn add_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers
            .insert(name.into().to_ascii_lowercase(), value.into());
    }

    /// Returns the request identifier.
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Returns the HTTP method.
    pub fn method(&self) -> HttpMethod {
        self.method
    }

    /// Returns the path without the query string.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Returns a query parameter.
    pub fn query_param(&self, key: &str) -> Option<&str> {
        self.query_params.get(key).map(String::as_str)
    }

    /// Returns all query parameters.
    pub fn query_params(&self) -> &HashMap<String, String> {
        &self.query_params
    }

    /// Returns all form body fields.
    pub fn form_fields(&self) -> &HashMap<String, String> {
        &self.form_fields
    }

    /// Returns uploaded files.
    pub fn files(&self) -> &[UploadedFile] {
        &self.files
    }

    /// Returns all cookies.
    pub fn cookies(&self) -> &HashMap<String, String> {
        &self.cookies
    }

    /// Returns all headers, keyed by lowercase name.
    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }

    /// Returns a header by case-insensitive name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// Returns the session token, if the client sent one.
    pub fn session_token(&self) -> Option<&str> {
        self.session_token.as_deref()
    }

    /// Returns the principal attached by the authentication layer.
    pub fn principal(&self) -> Option<&Principal> {
        self.principal.as_ref()
    }
}

fn parse_query(query: &str) -> impl Iterator<Item = (String, String)> + '_ {
    query.split('&').filter(|pair| !pair.is_empty()).map(|pair| {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        (decode_component(key), decode_component(value))
    })
}

fn decode_component(raw: &str) -> String {
    let spaced = raw.replace('+', " ");
    match urlencoding::decode(&spaced) {
        Ok(decoded) => decoded.into_owned(),
        Err(_) => spaced,
    }
}
