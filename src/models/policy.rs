use serde::{Deserialize, Serialize};

// ── Scope Policy ─────────────────────────────────────────────

/// How the required scopes of a [`ScopePolicy`] combine.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ScopeMatch {
    /// Every required scope must be granted.
    #[default]
    AllOf,
    /// At least one required scope must be granted.
    AnyOf,
}

/// Scopes a protected endpoint requires, declared by the application per
/// route.
///
/// Keeps declaration order and drops duplicates. An empty policy only
/// requires a valid token.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScopePolicy {
    #[serde(default)]
    scopes: Vec<String>,
    #[serde(default)]
    mode: ScopeMatch,
}

impl ScopePolicy {
    /// Authentication only: any valid token passes.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn all_of<I, S>(scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        scopes.into_iter().fold(Self::new(), |policy, s| policy.scope(s))
    }

    /// Scopes are alternatives: any one of them is enough.
    pub fn any_of<I, S>(scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut policy = Self::all_of(scopes);
        policy.mode = ScopeMatch::AnyOf;
        policy
    }

    /// Add a required scope.
    pub fn scope(mut self, scope: impl Into<String>) -> Self {
        let scope = scope.into();
        if !scope.is_empty() && !self.scopes.contains(&scope) {
            self.scopes.push(scope);
        }
        self
    }

    pub fn scopes(&self) -> &[String] {
        &self.scopes
    }

    pub fn mode(&self) -> ScopeMatch {
        self.mode
    }

    pub fn is_empty(&self) -> bool {
        self.scopes.is_empty()
    }
}
