use std::{fmt, fs, path::Path};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use shared::domain::UserId;
use tokio::sync::watch;

/// Bearer token of one authenticated identity.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub user_id: UserId,
    pub token: String,
}

impl Credential {
    pub fn new(user_id: UserId, token: impl Into<String>) -> Self {
        Self {
            user_id,
            token: token.into(),
        }
    }

    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.token)
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("user_id", &self.user_id)
            .field("token", &"<redacted>")
            .finish()
    }
}

/// Persisted token slot. Setting `None` models logout or token invalidation.
#[derive(Debug, Clone)]
pub struct CredentialSource {
    tx: watch::Sender<Option<Credential>>,
}

impl CredentialSource {
    pub fn new(initial: Option<Credential>) -> Self {
        let (tx, _) = watch::channel(initial);
        Self { tx }
    }

    pub fn current(&self) -> Option<Credential> {
        self.tx.borrow().clone()
    }

    pub fn set(&self, credential: Option<Credential>) {
        self.tx.send_replace(credential);
    }

    pub fn clear(&self) {
        self.set(None);
    }

    pub fn watch(&self) -> watch::Receiver<Option<Credential>> {
        self.tx.subscribe()
    }
}

pub fn load_persisted(path: &Path) -> Result<Option<Credential>> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(err)
                .with_context(|| format!("failed to read credential file '{}'", path.display()))
        }
    };
    if raw.trim().is_empty() {
        return Ok(None);
    }
    let credential: Credential = serde_json::from_str(&raw)
        .with_context(|| format!("invalid credential file '{}'", path.display()))?;
    if credential.token.trim().is_empty() {
        return Ok(None);
    }
    Ok(Some(credential))
}

pub fn persist(path: &Path, credential: &Credential) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| {
            format!("failed to create credential directory '{}'", parent.display())
        })?;
    }
    fs::write(path, serde_json::to_vec(credential)?)
        .with_context(|| format!("failed to write credential file '{}'", path.display()))
}
