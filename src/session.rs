//! Process-wide session context.
//!
//! The session is created once at startup from the persisted credential and
//! passed by reference to the components that need the bearer token. When the
//! command executor sees an `unauthorized` response it calls
//! [`SessionContext::invalidate`], which clears the credential and notifies
//! watchers exactly once; navigating away is left to whoever watches.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;

use crate::domain::UserId;

// =============================================================================
// Credential
// =============================================================================

/// Opaque identity of the signed-in user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurrentUser {
    /// User identifier.
    #[serde(rename = "_id", alias = "id")]
    pub id: UserId,
    /// Display name.
    #[serde(default, alias = "name")]
    pub display_name: Option<String>,
    /// Role label as reported by the server (never interpreted here).
    #[serde(default)]
    pub role: Option<String>,
}

impl CurrentUser {
    /// Creates an identity with only an id.
    #[must_use]
    pub fn new(id: impl Into<UserId>) -> Self {
        Self {
            id: id.into(),
            display_name: None,
            role: None,
        }
    }
}

/// Persisted credential: bearer token plus the identity it belongs to.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    /// Bearer token sent on every request.
    pub token: String,
    /// Identity the token was issued for.
    pub user: CurrentUser,
}

impl Credential {
    /// Creates a credential.
    #[must_use]
    pub fn new(token: impl Into<String>, user: CurrentUser) -> Self {
        Self {
            token: token.into(),
            user,
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("Credential")
            .field("token", &"<redacted>")
            .field("user", &self.user)
            .finish()
    }
}

/// Credential storage failure.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The credential file exists but could not be read.
    #[error("failed to read credential file {path}: {source}")]
    Read {
        /// File path.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The credential file could not be removed.
    #[error("failed to remove credential file {path}: {source}")]
    Remove {
        /// File path.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The credential file does not contain a valid credential.
    #[error("credential file {path} is not valid: {source}")]
    Decode {
        /// File path.
        path: PathBuf,
        /// Underlying JSON error.
        #[source]
        source: serde_json::Error,
    },
}

// =============================================================================
// Credential Store
// =============================================================================

/// Storage collaborator holding the persisted credential.
pub trait CredentialStore: Send + Sync {
    /// Reads the persisted credential, `None` when signed out.
    ///
    /// # Errors
    ///
    /// Returns an error when the storage exists but cannot be read or decoded.
    fn load(&self) -> Result<Option<Credential>, SessionError>;

    /// Removes the persisted credential.
    ///
    /// # Errors
    ///
    /// Returns an error when the storage cannot be cleared.
    fn clear(&self) -> Result<(), SessionError>;
}

/// Credential stored as a JSON file (`{ "token": ..., "user": { "_id": ... } }`).
#[derive(Debug, Clone)]
pub struct FileCredentialStore {
    path: PathBuf,
}

impl FileCredentialStore {
    /// Creates a store reading `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Path of the credential file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CredentialStore for FileCredentialStore {
    fn load(&self) -> Result<Option<Credential>, SessionError> {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(SessionError::Read {
                    path: self.path.clone(),
                    source,
                });
            }
        };
        if contents.trim().is_empty() {
            return Ok(None);
        }
        serde_json::from_str(&contents)
            .map(Some)
            .map_err(|source| SessionError::Decode {
                path: self.path.clone(),
                source,
            })
    }

    fn clear(&self) -> Result<(), SessionError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(SessionError::Remove {
                path: self.path.clone(),
                source,
            }),
        }
    }
}

/// In-memory credential storage.
#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    credential: Mutex<Option<Credential>>,
}

impl MemoryCredentialStore {
    /// Creates a store holding `credential`.
    #[must_use]
    pub fn new(credential: Option<Credential>) -> Self {
        Self {
            credential: Mutex::new(credential),
        }
    }

    /// Returns `true` once the credential has been cleared (or was never set).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.credential.lock().is_none()
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn load(&self) -> Result<Option<Credential>, SessionError> {
        Ok(self.credential.lock().clone())
    }

    fn clear(&self) -> Result<(), SessionError> {
        *self.credential.lock() = None;
        Ok(())
    }
}

// =============================================================================
// Session Context
// =============================================================================

/// Observable session state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    /// No credential.
    Anonymous,
    /// Signed in as the given user.
    Active(CurrentUser),
    /// The server rejected the credential; it has been cleared.
    Invalidated,
}

/// Explicit, shared session context.
pub struct SessionContext {
    store: Arc<dyn CredentialStore>,
    credential: Mutex<Option<Credential>>,
    state: watch::Sender<SessionState>,
}

impl fmt::Debug for SessionContext {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("SessionContext")
            .field("state", &*self.state.borrow())
            .finish_non_exhaustive()
    }
}

impl SessionContext {
    /// Initializes the session from the persisted credential.
    ///
    /// A credential that cannot be read is logged and treated as signed out.
    #[must_use]
    pub fn init(store: Arc<dyn CredentialStore>) -> Self {
        let credential = match store.load() {
            Ok(credential) => credential,
            Err(error) => {
                tracing::warn!(%error, "persisted credential unreadable, starting signed out");
                None
            }
        };
        let initial = credential
            .as_ref()
            .map_or(SessionState::Anonymous, |credential| {
                SessionState::Active(credential.user.clone())
            });
        if let SessionState::Active(user) = &initial {
            tracing::info!(user = %user.id, "session restored from persisted credential");
        }
        let (state, _) = watch::channel(initial);
        Self {
            store,
            credential: Mutex::new(credential),
            state,
        }
    }

    /// Session without any credential.
    #[must_use]
    pub fn anonymous() -> Self {
        Self::init(Arc::new(MemoryCredentialStore::default()))
    }

    /// Installs a freshly issued credential (after sign-in by a collaborator).
    pub fn establish(&self, credential: Credential) {
        let user = credential.user.clone();
        *self.credential.lock() = Some(credential);
        self.state.send_replace(SessionState::Active(user));
    }

    /// Bearer token of the active session.
    #[must_use]
    pub fn bearer_token(&self) -> Option<String> {
        self.credential
            .lock()
            .as_ref()
            .map(|credential| credential.token.clone())
    }

    /// Identity of the active session.
    #[must_use]
    pub fn current_user(&self) -> Option<CurrentUser> {
        self.credential
            .lock()
            .as_ref()
            .map(|credential| credential.user.clone())
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state.borrow().clone()
    }

    /// Subscribes to state changes.
    #[must_use]
    pub fn watch(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Tears the session down after an `unauthorized` response.
    ///
    /// Returns `true` only for the call that performed the teardown; repeated
    /// signals while already invalidated are ignored.
    pub fn invalidate(&self) -> bool {
        let mut credential = self.credential.lock();
        if *self.state.borrow() == SessionState::Invalidated {
            return false;
        }
        *credential = None;
        if let Err(error) = self.store.clear() {
            tracing::warn!(%error, "failed to clear persisted credential");
        }
        self.state.send_replace(SessionState::Invalidated);
        drop(credential);
        tracing::warn!("session invalidated by unauthorized response");
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn credential() -> Credential {
        Credential::new("secret-token", CurrentUser::new("u-1"))
    }

    #[rstest]
    fn test_init_restores_active_session() {
        let store = Arc::new(MemoryCredentialStore::new(Some(credential())));

        let session = SessionContext::init(store);

        assert_eq!(session.state(), SessionState::Active(CurrentUser::new("u-1")));
        assert_eq!(session.bearer_token().as_deref(), Some("secret-token"));
    }

    #[rstest]
    fn test_invalidate_clears_credential_once() {
        let store = Arc::new(MemoryCredentialStore::new(Some(credential())));
        let session = SessionContext::init(store.clone());
        let watcher = session.watch();

        assert!(session.invalidate());
        assert!(!session.invalidate());

        assert!(store.is_empty());
        assert_eq!(session.bearer_token(), None);
        assert_eq!(*watcher.borrow(), SessionState::Invalidated);
    }

    #[rstest]
    fn test_establish_after_invalidation_reactivates() {
        let session = SessionContext::anonymous();
        session.invalidate();

        session.establish(credential());

        assert!(matches!(session.state(), SessionState::Active(_)));
        assert!(session.invalidate());
    }

    #[rstest]
    fn test_credential_debug_redacts_token() {
        let rendered = format!("{:?}", credential());
        assert!(!rendered.contains("secret-token"));
        assert!(rendered.contains("<redacted>"));
    }

    #[rstest]
    fn test_file_store_round_trip_and_clear() {
        let directory = tempfile::tempdir().unwrap();
        let path = directory.path().join("credential.json");
        std::fs::write(
            &path,
            r#"{ "token": "abc", "user": { "_id": "u-5", "name": "Kim", "role": "manager" } }"#,
        )
        .unwrap();
        let store = FileCredentialStore::new(&path);

        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded.token, "abc");
        assert_eq!(loaded.user.display_name.as_deref(), Some("Kim"));

        store.clear().unwrap();
        assert!(store.load().unwrap().is_none());
        store.clear().unwrap();
    }

    #[rstest]
    fn test_file_store_reports_invalid_json() {
        let directory = tempfile::tempdir().unwrap();
        let path = directory.path().join("credential.json");
        std::fs::write(&path, "not json").unwrap();

        let result = FileCredentialStore::new(&path).load();

        assert!(matches!(result, Err(SessionError::Decode { .. })));
    }
}
