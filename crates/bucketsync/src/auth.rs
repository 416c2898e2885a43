//! Credential acquisition. The engine only needs an access token; how it is
//! obtained is up to the application.

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::Result;

#[derive(Debug, Clone, Deserialize)]
pub struct Credentials {
    pub access_token: String,
    pub userid: String,
}

#[async_trait]
pub trait Authorizer: Send + Sync {
    async fn authorize(&self, username: &str, password: &str) -> Result<Credentials>;
}

/// Authorizer for applications that already hold a token.
pub struct StaticTokenAuth {
    credentials: Credentials,
}

impl StaticTokenAuth {
    pub fn new(access_token: impl Into<String>, userid: impl Into<String>) -> Self {
        Self {
            credentials: Credentials {
                access_token: access_token.into(),
                userid: userid.into(),
            },
        }
    }
}

#[async_trait]
impl Authorizer for StaticTokenAuth {
    async fn authorize(&self, _username: &str, _password: &str) -> Result<Credentials> {
        Ok(self.credentials.clone())
    }
}
