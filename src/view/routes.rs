//! Path patterns to live views.
//!
//! Patterns are `/`-separated; a `{name}` segment captures one path segment.
//! Static routes win over parameterised ones, then registration order decides.
//! A path with a trailing slash falls back to the same path without it.

use percent_encoding::percent_decode_str;

use super::{LiveView, Params};

/// Builds a fresh view for each session.
pub type ViewFactory = fn() -> Box<dyn LiveView>;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Param(String),
}

struct Route {
    pattern: String,
    segments: Vec<Segment>,
    factory: ViewFactory,
}

impl Route {
    fn has_params(&self) -> bool {
        self.segments.iter().any(|s| matches!(s, Segment::Param(_)))
    }

    fn matches(&self, parts: &[&str]) -> Option<Params> {
        if parts.len() != self.segments.len() {
            return None;
        }
        let mut params = Params::new();
        for (segment, part) in self.segments.iter().zip(parts) {
            match segment {
                Segment::Literal(lit) if lit == part => {}
                Segment::Literal(_) => return None,
                Segment::Param(name) => {
                    if part.is_empty() {
                        return None;
                    }
                    let value = percent_decode_str(part).decode_utf8_lossy();
                    params.insert(name.clone(), value.into_owned());
                }
            }
        }
        Some(params)
    }
}

/// A resolved route: the view to build and the captured path params.
pub struct RouteMatch<'a> {
    pub pattern: &'a str,
    pub factory: ViewFactory,
    pub params: Params,
}

#[derive(Default)]
pub struct LiveRoutes {
    routes: Vec<Route>,
}

impl LiveRoutes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(mut self, pattern: &str, factory: ViewFactory) -> Self {
        self.routes.push(Route {
            pattern: pattern.to_string(),
            segments: split(pattern)
                .map(|s| match s.strip_prefix('{').and_then(|s| s.strip_suffix('}')) {
                    Some(name) => Segment::Param(name.to_string()),
                    None => Segment::Literal(s.to_string()),
                })
                .collect(),
            factory,
        });
        self
    }

    pub fn lookup(&self, path: &str) -> Option<RouteMatch<'_>> {
        let parts: Vec<&str> = split(path).collect();
        let found = self
            .routes
            .iter()
            .filter(|r| !r.has_params())
            .chain(self.routes.iter().filter(|r| r.has_params()))
            .find_map(|r| r.matches(&parts).map(|params| (r, params)));

        match found {
            Some((route, params)) => Some(RouteMatch {
                pattern: &route.pattern,
                factory: route.factory,
                params,
            }),
            None if path.len() > 1 && path.ends_with('/') => self.lookup(&path[..path.len() - 1]),
            None => None,
        }
    }

    pub fn patterns(&self) -> impl Iterator<Item = &str> {
        self.routes.iter().map(|r| r.pattern.as_str())
    }
}

/// Segments of a path, without the leading slash. `/` has a single empty segment.
fn split(path: &str) -> impl Iterator<Item = &str> {
    path.strip_prefix('/').unwrap_or(path).split('/')
}

// ============================================================================
// Tests
// ============================================================================
