//! Path-based routing table
//!
//! Each incoming request path is matched against the table and dispatched to
//! exactly one rule. Exact matches win over prefixes; among matching prefixes
//! the longest one wins, mirroring location-block precedence in the proxy
//! configuration this replaces.

/// How a rule matches a request path
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteMatcher {
    /// Matches the path exactly
    Exact(String),
    /// Matches any path starting with the prefix
    Prefix(String),
}

impl RouteMatcher {
    pub fn matches(&self, path: &str) -> bool {
        match self {
            RouteMatcher::Exact(p) => p == path,
            RouteMatcher::Prefix(p) => path.starts_with(p.as_str()),
        }
    }
}

/// What to do with a matched request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteAction {
    /// Serve one fixed file from the static root, ignoring the request path
    File(String),
    /// Serve directly from the static root; 404 when absent, never forwarded.
    /// When `strip_prefix` is set the matched prefix is removed before the
    /// path is resolved against the root.
    Static { strip_prefix: bool },
    /// Try the full request path as a file under the static root, otherwise
    /// forward the request unchanged to the upstream
    StaticOrUpstream,
    /// Redirect to the scheme+host root, discarding the path
    Redirect { status: u16 },
}

/// A single routing rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteRule {
    pub matcher: RouteMatcher,
    pub action: RouteAction,
}

/// The full routing table
#[derive(Debug, Clone)]
pub struct RouteTable {
    rules: Vec<RouteRule>,
}

impl RouteTable {
    pub fn new(rules: Vec<RouteRule>) -> Self {
        Self { rules }
    }

    /// The table from the source deployment's proxy configuration. The `/`
    /// catch-all serves the SPA shell so that every path matches a rule.
    pub fn default_table() -> Self {
        Self::new(vec![
            RouteRule {
                matcher: RouteMatcher::Exact("/index.html".to_string()),
                action: RouteAction::File("index.html".to_string()),
            },
            RouteRule {
                matcher: RouteMatcher::Prefix("/api/".to_string()),
                action: RouteAction::StaticOrUpstream,
            },
            RouteRule {
                matcher: RouteMatcher::Prefix("/profile/".to_string()),
                action: RouteAction::Redirect { status: 301 },
            },
            RouteRule {
                matcher: RouteMatcher::Prefix("/static".to_string()),
                action: RouteAction::Static { strip_prefix: true },
            },
            RouteRule {
                matcher: RouteMatcher::Prefix("/".to_string()),
                action: RouteAction::Static {
                    strip_prefix: false,
                },
            },
        ])
    }

    pub fn rules(&self) -> &[RouteRule] {
        &self.rules
    }

    /// Find the most specific rule for a path: an exact match wins outright,
    /// otherwise the longest matching prefix.
    pub fn matched(&self, path: &str) -> Option<&RouteRule> {
        let mut best: Option<(&RouteRule, usize)> = None;

        for rule in &self.rules {
            match &rule.matcher {
                RouteMatcher::Exact(p) => {
                    if p == path {
                        return Some(rule);
                    }
                }
                RouteMatcher::Prefix(p) => {
                    if path.starts_with(p.as_str())
                        && best.map_or(true, |(_, len)| p.len() > len)
                    {
                        best = Some((rule, p.len()));
                    }
                }
            }
        }

        best.map(|(rule, _)| rule)
    }
}
