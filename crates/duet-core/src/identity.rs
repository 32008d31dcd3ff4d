//! Connection context and identity resolution.

use async_trait::async_trait;
use std::collections::HashMap;

/// Query parameter naming the conversation peer.
pub const PEER_PARAM: &str = "user";

/// What the transport knows about a connection when it opens.
#[derive(Debug, Clone, Default)]
pub struct ConnectionContext {
    pub connection_id: String,
    /// Credential presented by the client, if any.
    pub token: Option<String>,
    /// Parameters of the initial request.
    pub params: HashMap<String, String>,
}

impl ConnectionContext {
    #[must_use]
    pub fn new(connection_id: impl Into<String>) -> Self {
        Self {
            connection_id: connection_id.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token;
        self
    }

    #[must_use]
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_params(mut self, params: HashMap<String, String>) -> Self {
        self.params.extend(params);
        self
    }

    /// The peer username from the request parameters, if present.
    #[must_use]
    pub fn peer(&self) -> Option<&str> {
        self.params.get(PEER_PARAM).map(String::as_str)
    }
}

/// Resolves the authenticated user behind a connection.
#[async_trait]
pub trait IdentityResolver: Send + Sync {
    /// The username bound to this connection, or `None` if unauthenticated.
    async fn current_username(&self, context: &ConnectionContext) -> Option<String>;
}

/// Resolves identities from a fixed token table.
#[derive(Debug, Clone, Default)]
pub struct TokenIdentity {
    tokens: HashMap<String, String>,
}

impl TokenIdentity {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `token` to `username`.
    #[must_use]
    pub fn with_token(mut self, token: impl Into<String>, username: impl Into<String>) -> Self {
        self.tokens.insert(token.into(), username.into());
        self
    }
}

#[async_trait]
impl IdentityResolver for TokenIdentity {
    async fn current_username(&self, context: &ConnectionContext) -> Option<String> {
        let token = context.token.as_deref()?;
        self.tokens.get(token).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_token_identity() {
        let identity = TokenIdentity::new().with_token("t-amy", "amy");

        let ctx = ConnectionContext::new("c1").with_token(Some("t-amy".into()));
        assert_eq!(identity.current_username(&ctx).await.as_deref(), Some("amy"));

        let anonymous = ConnectionContext::new("c2");
        assert!(identity.current_username(&anonymous).await.is_none());

        let wrong = ConnectionContext::new("c3").with_token(Some("nope".into()));
        assert!(identity.current_username(&wrong).await.is_none());
    }

    #[test]
    fn test_peer_param() {
        let ctx = ConnectionContext::new("c1").with_param(PEER_PARAM, "bob");
        assert_eq!(ctx.peer(), Some("bob"));
        assert_eq!(ConnectionContext::new("c2").peer(), None);
    }
}
