//! Dispatch table over received lines.
//!
//! Handlers are matched by prefix, suffix or substring and run in the order
//! they were registered. Every matching handler fires; a line nobody matches
//! is simply ignored.

use std::sync::RwLock;
use tracing::warn;

/// Where the pattern has to appear in the line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchMode {
    StartsWith,
    EndsWith,
    Contains,
}

/// How the pattern is compared against the line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Comparison {
    Ordinal,
    #[default]
    IgnoreAsciiCase,
}

/// Callback invoked with the full line
pub type LineHandler = Box<dyn Fn(&str) + Send + Sync>;

struct Route {
    pattern: String,
    mode: MatchMode,
    comparison: Comparison,
    handler: LineHandler,
}

impl Route {
    fn matches(&self, line: &str) -> bool {
        let line = line.as_bytes();
        let pattern = self.pattern.as_bytes();

        let eq = |a: &[u8], b: &[u8]| match self.comparison {
            Comparison::Ordinal => a == b,
            Comparison::IgnoreAsciiCase => a.eq_ignore_ascii_case(b),
        };

        if pattern.len() > line.len() {
            return false;
        }

        match self.mode {
            MatchMode::StartsWith => eq(&line[..pattern.len()], pattern),
            MatchMode::EndsWith => eq(&line[line.len() - pattern.len()..], pattern),
            MatchMode::Contains => {
                pattern.is_empty() || line.windows(pattern.len()).any(|w| eq(w, pattern))
            }
        }
    }
}

/// Registry of line handlers
#[derive(Default)]
pub struct MessageRouter {
    routes: RwLock<Vec<Route>>,
}

impl MessageRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler; it runs after every handler registered before it.
    pub fn add_handler<F>(&self, pattern: &str, mode: MatchMode, comparison: Comparison, handler: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        let route = Route {
            pattern: pattern.to_string(),
            mode,
            comparison,
            handler: Box::new(handler),
        };

        match self.routes.write() {
            Ok(mut routes) => routes.push(route),
            Err(poisoned) => poisoned.into_inner().push(route),
        }
    }

    /// Shorthand for a case-insensitive prefix handler, the common case for
    /// tagged management notifications.
    pub fn add_prefix_handler<F>(&self, prefix: &str, handler: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.add_handler(prefix, MatchMode::StartsWith, Comparison::IgnoreAsciiCase, handler);
    }

    /// Run every matching handler against `line`.
    ///
    /// Returns how many handlers fired. Handlers must not register new
    /// handlers from inside the callback.
    pub fn process(&self, line: &str) -> usize {
        let routes = match self.routes.read() {
            Ok(routes) => routes,
            Err(poisoned) => {
                warn!("Router lock poisoned, continuing with existing routes");
                poisoned.into_inner()
            }
        };

        let mut fired = 0;
        for route in routes.iter().filter(|r| r.matches(line)) {
            (route.handler)(line);
            fired += 1;
        }
        fired
    }

    pub fn len(&self) -> usize {
        self.routes.read().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
