//! Request signing.
//!
//! The client never knows how credentials are turned into headers. A
//! `RequestSigner` sees each finished request and returns the headers to add.
//! Any signature scheme (OAuth 1.0a, app-only bearer tokens) plugs in here.

use secrecy::{ExposeSecret, SecretString};

use crate::error::AuthError;
use crate::http::HttpRequest;

/// Produces authentication headers for a request.
pub trait RequestSigner: Send + Sync {
    fn sign(&self, request: &HttpRequest) -> Result<Vec<(String, String)>, AuthError>;
}

/// Sends requests unsigned.
#[derive(Debug, Clone, Copy, Default)]
pub struct Anonymous;

impl RequestSigner for Anonymous {
    fn sign(&self, _request: &HttpRequest) -> Result<Vec<(String, String)>, AuthError> {
        Ok(Vec::new())
    }
}

/// App-only authentication with a bearer token.
#[derive(Debug)]
pub struct BearerToken {
    token: SecretString,
}

impl BearerToken {
    pub fn new(token: impl Into<String>) -> Result<Self, AuthError> {
        let token: String = token.into();
        if token.trim().is_empty() {
            return Err(AuthError::EmptyCredential);
        }
        if token.chars().any(|c| c.is_control() || !c.is_ascii()) {
            return Err(AuthError::InvalidHeaderValue);
        }
        Ok(Self {
            token: SecretString::from(token),
        })
    }
}

impl RequestSigner for BearerToken {
    fn sign(&self, _request: &HttpRequest) -> Result<Vec<(String, String)>, AuthError> {
        Ok(vec![(
            "Authorization".to_string(),
            format!("Bearer {}", self.token.expose_secret()),
        )])
    }
}
