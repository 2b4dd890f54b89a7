//! Credential collaborator consulted when OpenVPN asks for secrets.

use std::fmt;
use zeroize::Zeroizing;

use crate::error::{OvpnError, OvpnResult};

/// A sensitive string, wiped from memory on drop and never printed
#[derive(Clone, Default)]
pub struct Secret(Zeroizing<String>);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Secret(Zeroizing::new(value.into()))
    }

    pub fn expose(&self) -> &str {
        self.0.as_str()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<String> for Secret {
    fn from(value: String) -> Self {
        Secret::new(value)
    }
}

impl From<&str> for Secret {
    fn from(value: &str) -> Self {
        Secret::new(value)
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

/// Username and password for `Auth` requests
#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: Secret,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<Secret>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

/// Supplies secrets on demand. Called from the management dispatch task, so
/// implementations should return promptly.
pub trait CredentialProvider: Send + Sync {
    /// Answer a `Need 'Auth'` request
    fn credentials(&self) -> OvpnResult<Credentials>;

    /// Answer a `Need 'Private Key'` request
    fn private_key(&self) -> OvpnResult<Secret> {
        Err(OvpnError::NotSupported("No private key passphrase available".to_string()))
    }
}

impl<F> CredentialProvider for F
where
    F: Fn() -> OvpnResult<Credentials> + Send + Sync,
{
    fn credentials(&self) -> OvpnResult<Credentials> {
        self()
    }
}

/// Fixed credentials, e.g. read once from the command line
#[derive(Debug, Clone)]
pub struct StaticCredentials {
    credentials: Credentials,
    private_key: Option<Secret>,
}

impl StaticCredentials {
    pub fn new(credentials: Credentials) -> Self {
        Self {
            credentials,
            private_key: None,
        }
    }

    pub fn with_private_key(mut self, passphrase: impl Into<Secret>) -> Self {
        self.private_key = Some(passphrase.into());
        self
    }
}

impl CredentialProvider for StaticCredentials {
    fn credentials(&self) -> OvpnResult<Credentials> {
        Ok(self.credentials.clone())
    }

    fn private_key(&self) -> OvpnResult<Secret> {
        self.private_key
            .clone()
            .ok_or_else(|| OvpnError::NotSupported("No private key passphrase configured".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secret_is_redacted() {
        let creds = Credentials::new("alice", "hunter2");
        let printed = format!("{:?}", creds);
        assert!(printed.contains("alice"));
        assert!(!printed.contains("hunter2"));
        assert_eq!(creds.password.expose(), "hunter2");
    }

    #[test]
    fn test_closure_provider() {
        let provider = || -> OvpnResult<Credentials> { Ok(Credentials::new("bob", "pw")) };
        let creds = provider.credentials().unwrap();
        assert_eq!(creds.username, "bob");
        assert!(provider.private_key().is_err());
    }

    #[test]
    fn test_static_provider_private_key() {
        let provider = StaticCredentials::new(Credentials::new("carol", "pw")).with_private_key("keypass");
        assert_eq!(provider.private_key().unwrap().expose(), "keypass");
    }
}
