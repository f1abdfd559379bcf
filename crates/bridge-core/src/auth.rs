use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::{
    error::AuthError,
    token_store::TokenStore,
    transport::{Connection, Connector},
};

/// Token-first, password-fallback login for one identity.
#[derive(Debug, Clone)]
pub struct SessionAuthenticator {
    identity: String,
    password: Option<String>,
}

impl SessionAuthenticator {
    pub fn new(identity: impl Into<String>, password: Option<String>) -> Self {
        Self {
            identity: identity.into(),
            password,
        }
    }

    #[must_use]
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// A stored token that the server rejects is not fatal; the password is
    /// tried next and, when it works, its token replaces the stored one. An
    /// error from here means neither method worked.
    pub async fn authenticate(
        &self,
        connector: &dyn Connector,
        store: &mut TokenStore,
    ) -> Result<Arc<dyn Connection>, AuthError> {
        if let Some(token) = store.token(&self.identity) {
            match connector.login_with_token(&self.identity, token).await {
                Ok(connection) => {
                    debug!(user = %self.identity, "Logged in using stored token");
                    return Ok(connection);
                }
                Err(e) => {
                    warn!(
                        code = e.code,
                        error = %e.message,
                        "Login by token failed, falling back to password"
                    );
                }
            }
        }

        let connection = match self.login_with_password(connector).await {
            Ok(connection) => connection,
            Err(e) => {
                error!(
                    code = e.code,
                    error = %e.message,
                    "Login failed, both token and username/password invalid"
                );
                return Err(e);
            }
        };
        debug!(user = %self.identity, "Logged in using password");

        match connection.access_token() {
            Some(token) => {
                if let Err(e) = store.store(self.identity.clone(), token) {
                    error!(error = %e, "Storing session token failed; continuing with this session");
                } else {
                    info!(file = %store.path().display(), "Stored new session token");
                }
            }
            None => warn!(user = %self.identity, "Password login returned no session token"),
        }
        Ok(connection)
    }

    /// Checks the password without touching the token store.
    pub async fn verify(&self, connector: &dyn Connector) -> Result<(), AuthError> {
        let connection = self.login_with_password(connector).await?;
        debug!(user = %connection.user_id(), "Credentials accepted");
        Ok(())
    }

    async fn login_with_password(
        &self,
        connector: &dyn Connector,
    ) -> Result<Arc<dyn Connection>, AuthError> {
        let password = self
            .password
            .as_deref()
            .ok_or_else(AuthError::missing_password)?;
        connector
            .login_with_password(&self.identity, password)
            .await
    }
}
