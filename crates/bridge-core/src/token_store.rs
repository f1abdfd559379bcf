//! Session tokens persisted as one JSON object: `{"@bot:example.org": "token"}`.

use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

use tracing::{debug, warn};

use crate::error::PersistenceError;

pub type Tokens = BTreeMap<String, String>;

/// Reads the token file. Never fails: a missing file is simply empty, and an
/// unreadable or malformed one is reported and treated as empty.
#[must_use]
pub fn load_tokens(path: &Path) -> Tokens {
    if !path.exists() {
        debug!(file = %path.display(), "No stored session tokens");
        return Tokens::new();
    }
    match read_tokens(path) {
        Ok(tokens) => tokens,
        Err(e) => {
            warn!(
                file = %path.display(),
                error = %e,
                "Loading authentication tokens failed"
            );
            Tokens::new()
        }
    }
}

fn read_tokens(path: &Path) -> Result<Tokens, PersistenceError> {
    let data = fs::read_to_string(path).map_err(|source| PersistenceError::Io {
        path: path.to_owned(),
        source,
    })?;
    serde_json::from_str(&data).map_err(|source| PersistenceError::Json {
        path: path.to_owned(),
        source,
    })
}

/// Rewrites the whole file. The new content lands in a sibling temp file
/// first and is renamed over the old one.
pub fn save_tokens(path: &Path, tokens: &Tokens) -> Result<(), PersistenceError> {
    let io_err = |source| PersistenceError::Io {
        path: path.to_owned(),
        source,
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(io_err)?;
    }
    let data = serde_json::to_string_pretty(tokens).map_err(|source| PersistenceError::Json {
        path: path.to_owned(),
        source,
    })?;
    let tmp = temp_path(path);
    fs::write(&tmp, data).map_err(io_err)?;
    if let Err(source) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(io_err(source));
    }
    Ok(())
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

/// In-memory view of the token file, bound to its path.
#[derive(Debug, Clone)]
pub struct TokenStore {
    path: PathBuf,
    tokens: Tokens,
    #[cfg(test)]
    pub(crate) writes: usize,
}

impl TokenStore {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let tokens = load_tokens(&path);
        Self {
            path,
            tokens,
            #[cfg(test)]
            writes: 0,
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn token(&self, identity: &str) -> Option<&str> {
        self.tokens.get(identity).map(String::as_str)
    }

    /// Records the token and rewrites the file. The in-memory value is kept
    /// even when the write fails.
    pub fn store(
        &mut self,
        identity: impl Into<String>,
        token: impl Into<String>,
    ) -> Result<(), PersistenceError> {
        self.tokens.insert(identity.into(), token.into());
        #[cfg(test)]
        {
            self.writes += 1;
        }
        save_tokens(&self.path, &self.tokens)
    }
}
