//! Route matching for incoming HTTP requests.
//!
//! Maps request paths to services. Patterns follow the usual gateway forms:
//! - `/api/**`: anything under `/api` (including `/api` itself)
//! - `/api/*`: exactly one segment under `/api`
//! - `/api`: exact path
//!
//! The most specific match wins: exact > longer prefix > shorter prefix.
//! Equal scores keep declaration order.

use crate::error::{GatewayError, GatewayResult};

/// A parsed route path pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathPattern {
    Exact(String),
    /// `/prefix/**`
    Prefix(String),
    /// `/prefix/*`
    Segment(String),
}

impl PathPattern {
    /// Parses a pattern string.
    pub fn parse(pattern: &str) -> GatewayResult<Self> {
        if !pattern.starts_with('/') {
            return Err(GatewayError::InvalidPattern(pattern.to_string()));
        }

        let (parsed, rest) = if let Some(prefix) = pattern.strip_suffix("/**") {
            (PathPattern::Prefix(prefix.to_string()), prefix)
        } else if let Some(prefix) = pattern.strip_suffix("/*") {
            (PathPattern::Segment(prefix.to_string()), prefix)
        } else {
            (PathPattern::Exact(pattern.to_string()), pattern)
        };

        if rest.contains('*') {
            return Err(GatewayError::InvalidPattern(pattern.to_string()));
        }
        Ok(parsed)
    }

    /// The literal part of the pattern that is stripped before forwarding.
    pub fn prefix(&self) -> &str {
        match self {
            PathPattern::Exact(p) | PathPattern::Prefix(p) | PathPattern::Segment(p) => p,
        }
    }

    /// Scores a path against this pattern (higher = more specific).
    /// Returns None if the path does not match.
    fn score(&self, path: &str) -> Option<usize> {
        match self {
            PathPattern::Exact(p) => (path == p).then(|| 10000 + p.len()),
            PathPattern::Prefix(p) => prefix_matches(p, path).then(|| 1000 + 2 * p.len()),
            PathPattern::Segment(p) => {
                let tail = path.strip_prefix(p.as_str())?.strip_prefix('/')?;
                (!tail.is_empty() && !tail.contains('/')).then(|| 1000 + 2 * p.len() + 1)
            }
        }
    }
}

/// Prefix matching respecting segment boundaries.
/// /api matches /api, /api/, /api/users
/// /api does NOT match /apikeys
fn prefix_matches(prefix: &str, path: &str) -> bool {
    if prefix.is_empty() || path == prefix {
        return true;
    }
    match path.strip_prefix(prefix) {
        Some(rest) => rest.starts_with('/'),
        None => false,
    }
}

/// A configured route.
#[derive(Debug, Clone)]
pub struct Route {
    pub id: String,
    pub pattern: PathPattern,
    pub service: String,
    pub strip_prefix: bool,
}

impl Route {
    pub fn new(
        id: impl Into<String>,
        pattern: &str,
        service: impl Into<String>,
        strip_prefix: bool,
    ) -> GatewayResult<Self> {
        Ok(Self {
            id: id.into(),
            pattern: PathPattern::parse(pattern)?,
            service: service.into(),
            strip_prefix,
        })
    }
}

/// Result of routing a request path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteMatch {
    pub route_id: String,
    pub service: String,
    /// Path to send upstream.
    pub forward_path: String,
    /// Prefix removed from the path, if any.
    pub stripped_prefix: Option<String>,
}

/// Routes incoming request paths to services.
#[derive(Debug, Clone, Default)]
pub struct Router {
    routes: Vec<Route>,
}

impl Router {
    /// Creates a new Router with the given routes.
    pub fn new(routes: Vec<Route>) -> Self {
        Self { routes }
    }

    /// Finds the best route for the given path.
    ///
    /// Returns `None` if no route matches.
    pub fn find_route(&self, path: &str) -> Option<RouteMatch> {
        let mut best: Option<(usize, &Route)> = None;

        for route in &self.routes {
            let Some(score) = route.pattern.score(path) else {
                continue;
            };
            let is_better = match best {
                None => true,
                Some((best_score, _)) => score > best_score,
            };
            if is_better {
                best = Some((score, route));
            }
        }

        best.map(|(_, route)| Self::to_match(route, path))
    }

    fn to_match(route: &Route, path: &str) -> RouteMatch {
        let prefix = route.pattern.prefix();
        let strip = route.strip_prefix
            && !prefix.is_empty()
            && !matches!(route.pattern, PathPattern::Exact(_));

        let (forward_path, stripped_prefix) = if strip {
            let rest = &path[prefix.len()..];
            let forward = if rest.is_empty() { "/" } else { rest };
            (forward.to_string(), Some(prefix.to_string()))
        } else {
            (path.to_string(), None)
        };

        RouteMatch {
            route_id: route.id.clone(),
            service: route.service.clone(),
            forward_path,
            stripped_prefix,
        }
    }
}
