/// Bearer credential availability
///
/// Token acquisition happens elsewhere; the sync engine only asks whether
/// one is available right now.
use std::sync::RwLock;

pub const TOKEN_ENV: &str = "CHATSYNC_TOKEN";

pub trait CredentialSource: Send + Sync {
    fn bearer(&self) -> Option<String>;
}

/// Token handed in by the embedding app. Can be replaced or revoked.
#[derive(Debug, Default)]
pub struct StaticCredentials {
    token: RwLock<Option<String>>,
}

impl StaticCredentials {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: RwLock::new(Some(token.into())),
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn set(&self, token: Option<String>) {
        let mut guard = self.token.write().unwrap_or_else(|e| e.into_inner());
        *guard = token;
    }
}

impl CredentialSource for StaticCredentials {
    fn bearer(&self) -> Option<String> {
        self.token
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .filter(|t| !t.is_empty())
    }
}

/// Reads `CHATSYNC_TOKEN` on every call
#[derive(Debug, Default, Clone, Copy)]
pub struct EnvCredentials;

impl CredentialSource for EnvCredentials {
    fn bearer(&self) -> Option<String> {
        std::env::var(TOKEN_ENV).ok().filter(|t| !t.is_empty())
    }
}
