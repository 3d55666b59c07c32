//! Route table: maps an inbound path to a handler descriptor.
//!
//! Routes are compiled once at startup into a [`RouteTable`] and never
//! mutated afterwards, so a table can be shared across request threads
//! behind an `Arc` without synchronization.
//!
//! Pattern syntax:
//!
//! - literal segments: `/users/profile`
//! - one-segment parameters: `/users/{id}`
//! - a wildcard tail as the last segment: `/assets/{path*}` or `/legacy/*`
//!
//! A pattern ending in a wildcard tail is a catch-all and must be ranked
//! strictly below every specific route.
//!
//! # Examples
//!
//! ```
//! use guard_bridge::router::{HandlerDescriptor, RouteTableBuilder};
//!
//! let table = RouteTableBuilder::new()
//!     .route("/users/{id}", HandlerDescriptor::modern("user_show"), 0)
//!     .route("/{path*}", HandlerDescriptor::legacy("legacy_front"), -1)
//!     .build()
//!     .expect("valid table");
//!
//! let matched = table.resolve("/users/42").unwrap();
//! assert_eq!(matched.handler().id(), "user_show");
//! assert_eq!(matched.param("id"), Some("42"));
//!
//! let fallback = table.resolve("/index.php").unwrap();
//! assert_eq!(fallback.handler().id(), "legacy_front");
//! ```

use std::collections::{HashMap, HashSet};
use std::fmt;

use serde::Deserialize;

use crate::error::ConfigError;

/// How a handler is executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandlerKind {
    /// Runs through the context isolation executor
    Legacy,
    /// Runs directly with explicit parameters
    Modern,
}

impl HandlerKind {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            HandlerKind::Legacy => "legacy",
            HandlerKind::Modern => "modern",
        }
    }
}

impl fmt::Display for HandlerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifies the handler a route dispatches to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HandlerDescriptor {
    id: String,
    kind: HandlerKind,
}

impl HandlerDescriptor {
    /// Creates a descriptor.
    pub fn new(id: impl Into<String>, kind: HandlerKind) -> Self {
        Self {
            id: id.into(),
            kind,
        }
    }

    /// Descriptor for a legacy-style handler.
    pub fn legacy(id: impl Into<String>) -> Self {
        Self::new(id, HandlerKind::Legacy)
    }

    /// Descriptor for a modern handler.
    pub fn modern(id: impl Into<String>) -> Self {
        Self::new(id, HandlerKind::Modern)
    }

    /// Returns the handler id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Returns the handler kind.
    pub fn kind(&self) -> HandlerKind {
        self.kind
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Param(String),
    Tail(Option<String>),
}

/// A parsed route pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutePattern {
    source: String,
    segments: Vec<Segment>,
}

impl RoutePattern {
    /// Parses a pattern.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::MalformedPattern` for patterns that do not start
    /// with `/`, contain empty or duplicate parameter names, contain empty
    /// inner segments, or place a wildcard anywhere but last.
    pub fn parse(source: &str) -> Result<Self, ConfigError> {
        let malformed = |reason| ConfigError::MalformedPattern {
            pattern: source.to_string(),
            reason,
        };

        let rest = source
            .strip_prefix('/')
            .ok_or_else(|| malformed("pattern must start with '/'"))?;

        let raw: Vec<&str> = if rest.is_empty() {
            Vec::new()
        } else {
            rest.strip_suffix('/').unwrap_or(rest).split('/').collect()
        };

        let mut segments = Vec::with_capacity(raw.len());
        let mut names = HashSet::new();
        for (idx, part) in raw.iter().enumerate() {
            let is_last = idx + 1 == raw.len();
            let segment = if part.is_empty() {
                return Err(malformed("empty path segment"));
            } else if *part == "*" {
                Segment::Tail(None)
            } else if let Some(inner) = part.strip_prefix('{').and_then(|p| p.strip_suffix('}')) {
                let (name, tail) = match inner.strip_suffix('*') {
                    Some(name) => (name, true),
                    None => (inner, false),
                };
                if !is_valid_param_name(name) {
                    return Err(malformed("invalid parameter name"));
                }
                if !names.insert(name.to_string()) {
                    return Err(malformed("duplicate parameter name"));
                }
                if tail {
                    Segment::Tail(Some(name.to_string()))
                } else {
                    Segment::Param(name.to_string())
                }
            } else if part.contains(['{', '}', '*']) {
                return Err(malformed("unbalanced or misplaced wildcard syntax"));
            } else {
                Segment::Literal((*part).to_string())
            };

            if matches!(segment, Segment::Tail(_)) && !is_last {
                return Err(malformed("wildcard tail must be the last segment"));
            }
            segments.push(segment);
        }

        Ok(Self {
            source: source.to_string(),
            segments,
        })
    }

    /// Returns the pattern as written.
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Returns true if the pattern ends in a wildcard tail.
    pub fn is_catch_all(&self) -> bool {
        matches!(self.segments.last(), Some(Segment::Tail(_)))
    }

    /// Shape with parameter names erased; equal shapes match equal paths.
    fn shape(&self) -> String {
        let mut shape = String::new();
        for segment in &self.segments {
            shape.push('/');
            match segment {
                Segment::Literal(lit) => shape.push_str(lit),
                Segment::Param(_) => shape.push_str("{}"),
                Segment::Tail(_) => shape.push('*'),
            }
        }
        shape
    }

    fn match_segments(&self, path: &[&str]) -> Option<HashMap<String, String>> {
        let mut params = HashMap::new();
        for (idx, segment) in self.segments.iter().enumerate() {
            match segment {
                Segment::Tail(name) => {
                    if let Some(name) = name {
                        params.insert(name.clone(), path.get(idx..).unwrap_or(&[]).join("/"));
                    }
                    return Some(params);
                }
                Segment::Literal(lit) => {
                    if path.get(idx) != Some(&lit.as_str()) {
                        return None;
                    }
                }
                Segment::Param(name) => {
                    let value = path.get(idx)?;
                    params.insert(name.clone(), (*value).to_string());
                }
            }
        }
        (path.len() == self.segments.len()).then_some(params)
    }
}

fn is_valid_param_name(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// An immutable route.
#[derive(Debug, Clone)]
pub struct Route {
    pattern: RoutePattern,
    handler: HandlerDescriptor,
    priority: i32,
}

impl Route {
    /// Returns the pattern.
    pub fn pattern(&self) -> &RoutePattern {
        &self.pattern
    }

    /// Returns the handler descriptor.
    pub fn handler(&self) -> &HandlerDescriptor {
        &self.handler
    }

    /// Returns the priority.
    pub fn priority(&self) -> i32 {
        self.priority
    }
}

/// One route entry as it appears in configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RouteConfig {
    /// Route pattern
    pub pattern: String,
    /// Handler id
    pub handler: String,
    /// Handler kind
    #[serde(default = "default_kind")]
    pub kind: HandlerKind,
    /// Priority; higher is tried first
    #[serde(default)]
    pub priority: i32,
}

fn default_kind() -> HandlerKind {
    HandlerKind::Modern
}

/// Builder collecting routes in declaration order.
#[derive(Debug, Default)]
pub struct RouteTableBuilder {
    entries: Vec<(String, HandlerDescriptor, i32)>,
    require_catch_all: bool,
}

impl RouteTableBuilder {
    /// Creates an empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares a route.
    pub fn route(mut self, pattern: impl Into<String>, handler: HandlerDescriptor, priority: i32) -> Self {
        self.entries.push((pattern.into(), handler, priority));
        self
    }

    /// Declares every route of a configuration list, in order.
    pub fn routes_from_config(mut self, routes: &[RouteConfig]) -> Self {
        for route in routes {
            self.entries.push((
                route.pattern.clone(),
                HandlerDescriptor::new(route.handler.clone(), route.kind),
                route.priority,
            ));
        }
        self
    }

    /// Makes the absence of a catch-all route a configuration error.
    pub fn require_catch_all(mut self, required: bool) -> Self {
        self.require_catch_all = required;
        self
    }

    /// Compiles and validates the table.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` for malformed patterns, catch-alls not ranked
    /// strictly below every specific route, ambiguous duplicates, or a
    /// required but missing catch-all.
    pub fn build(self) -> Result<RouteTable, ConfigError> {
        let mut routes = Vec::with_capacity(self.entries.len());
        for (pattern, handler, priority) in self.entries {
            routes.push(Route {
                pattern: RoutePattern::parse(&pattern)?,
                handler,
                priority,
            });
        }

        validate(&routes, self.require_catch_all)?;

        // Stable sort keeps declaration order among equal priorities.
        routes.sort_by(|a, b| b.priority.cmp(&a.priority));
        Ok(RouteTable { routes })
    }
}

fn validate(routes: &[Route], require_catch_all: bool) -> Result<(), ConfigError> {
    let (catch_alls, specifics): (Vec<&Route>, Vec<&Route>) =
        routes.iter().partition(|r| r.pattern.is_catch_all());

    if require_catch_all && catch_alls.is_empty() {
        return Err(ConfigError::MissingCatchAll);
    }

    for catch_all in &catch_alls {
        if let Some(specific) = specifics.iter().find(|s| s.priority <= catch_all.priority) {
            return Err(ConfigError::CatchAllPriority {
                catch_all: catch_all.pattern.as_str().to_string(),
                catch_all_priority: catch_all.priority,
                specific: specific.pattern.as_str().to_string(),
                specific_priority: specific.priority,
            });
        }
    }

    let mut seen: HashMap<(String, i32), &Route> = HashMap::new();
    for route in routes {
        let key = (route.pattern.shape(), route.priority);
        if let Some(first) = seen.get(&key) {
            return Err(ConfigError::AmbiguousRoutes {
                first: first.pattern.as_str().to_string(),
                second: route.pattern.as_str().to_string(),
                priority: route.priority,
            });
        }
        seen.insert(key, route);
    }
    Ok(())
}

/// No route matched the path.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("no route matches '{path}'")]
pub struct NotFound {
    /// The unmatched path
    pub path: String,
}

/// A successful resolution.
#[derive(Debug, Clone)]
pub struct RouteMatch<'a> {
    route: &'a Route,
    params: HashMap<String, String>,
}

impl<'a> RouteMatch<'a> {
    /// Returns the matched route.
    pub fn route(&self) -> &'a Route {
        self.route
    }

    /// Returns the handler descriptor.
    pub fn handler(&self) -> &'a HandlerDescriptor {
        &self.route.handler
    }

    /// Returns a captured parameter.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }

    /// Returns all captured parameters.
    pub fn params(&self) -> &HashMap<String, String> {
        &self.params
    }
}

/// Compiled, read-only route table.
#[derive(Debug, Clone)]
pub struct RouteTable {
    routes: Vec<Route>,
}

impl RouteTable {
    /// Builds a table from configuration entries.
    ///
    /// # Errors
    ///
    /// See [`RouteTableBuilder::build`].
    pub fn from_config(routes: &[RouteConfig], require_catch_all: bool) -> Result<Self, ConfigError> {
        RouteTableBuilder::new()
            .routes_from_config(routes)
            .require_catch_all(require_catch_all)
            .build()
    }

    /// Resolves a path to the highest-priority matching route.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` when no route matches.
    pub fn resolve(&self, path: &str) -> Result<RouteMatch<'_>, NotFound> {
        let path = path.split_once('?').map_or(path, |(p, _)| p);
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

        self.routes
            .iter()
            .find_map(|route| {
                route
                    .pattern
                    .match_segments(&segments)
                    .map(|params| RouteMatch { route, params })
            })
            .ok_or_else(|| NotFound {
                path: path.to_string(),
            })
    }

    /// Returns the routes in resolution order.
    pub fn routes(&self) -> &[Route] {
        &self.routes
    }
}
