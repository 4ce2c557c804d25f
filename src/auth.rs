//! Identity provider contract consumed by the sync layer.

use std::sync::Arc;

use dashmap::DashMap;
use futures::future::BoxFuture;
use thiserror::Error;
use tokio::sync::watch;
use tracing::info;
use uuid::Uuid;

/// Signed-in user as seen by the sync layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// Stable user id.
    pub uid: String,
    /// Contact label; absent for anonymous sessions.
    pub email: Option<String>,
    /// Anonymous (guest) session.
    pub is_anonymous: bool,
}

impl Identity {
    /// Registered identity with an email address.
    pub fn registered(uid: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            uid: uid.into(),
            email: Some(email.into()),
            is_anonymous: false,
        }
    }

    /// Anonymous guest session.
    pub fn anonymous(uid: impl Into<String>) -> Self {
        Self {
            uid: uid.into(),
            email: None,
            is_anonymous: true,
        }
    }
}

/// Failures reported by identity providers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    /// No user is signed in.
    #[error("not signed in")]
    NotSignedIn,
    /// Email/password pair rejected.
    #[error("invalid credentials")]
    InvalidCredentials,
    /// An account already uses this email.
    #[error("email `{0}` is already registered")]
    EmailTaken(String),
    /// Provider could not be reached.
    #[error("identity provider unavailable: {0}")]
    Unavailable(String),
}

/// Authentication backend: current identity, sign-in flows and state changes.
pub trait IdentityProvider: Send + Sync {
    /// Currently signed-in user, if any.
    fn current_user(&self) -> Option<Identity>;
    /// Start an anonymous session.
    fn sign_in_anonymously(&self) -> BoxFuture<'static, Result<Identity, AuthError>>;
    /// Sign in a registered account.
    fn sign_in_with_password(
        &self,
        email: &str,
        password: &str,
    ) -> BoxFuture<'static, Result<Identity, AuthError>>;
    /// Register a new account and sign it in.
    fn sign_up(
        &self,
        email: &str,
        password: &str,
        display_name: &str,
    ) -> BoxFuture<'static, Result<Identity, AuthError>>;
    /// End the current session.
    fn sign_out(&self) -> BoxFuture<'static, Result<(), AuthError>>;
    /// Receive every auth-state transition.
    fn subscribe(&self) -> watch::Receiver<Option<Identity>>;
}

struct Account {
    uid: String,
    password: String,
    display_name: String,
}

/// In-process identity provider for tests and local tooling; accounts are never persisted.
#[derive(Clone)]
pub struct MemoryIdentityProvider {
    inner: Arc<MemoryIdentityInner>,
}

struct MemoryIdentityInner {
    accounts: DashMap<String, Account>,
    current: watch::Sender<Option<Identity>>,
}

impl Default for MemoryIdentityProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryIdentityProvider {
    /// Provider with nobody signed in.
    pub fn new() -> Self {
        let (current, _rx) = watch::channel(None);
        Self {
            inner: Arc::new(MemoryIdentityInner {
                accounts: DashMap::new(),
                current,
            }),
        }
    }

    /// Provider with `identity` already signed in.
    pub fn signed_in(identity: Identity) -> Self {
        let provider = Self::new();
        provider.set_current(Some(identity));
        provider
    }

    /// Replace the current identity directly.
    pub fn set_current(&self, identity: Option<Identity>) {
        self.inner.current.send_replace(identity);
    }

    /// Display name registered for `email`.
    pub fn display_name(&self, email: &str) -> Option<String> {
        self.inner
            .accounts
            .get(email)
            .map(|account| account.display_name.clone())
    }
}

impl IdentityProvider for MemoryIdentityProvider {
    fn current_user(&self) -> Option<Identity> {
        self.inner.current.borrow().clone()
    }

    fn sign_in_anonymously(&self) -> BoxFuture<'static, Result<Identity, AuthError>> {
        let inner = self.inner.clone();
        Box::pin(async move {
            let identity = Identity::anonymous(format!("anon_{}", Uuid::new_v4().simple()));
            inner.current.send_replace(Some(identity.clone()));
            info!(uid = %identity.uid, "signed in anonymously");
            Ok(identity)
        })
    }

    fn sign_in_with_password(
        &self,
        email: &str,
        password: &str,
    ) -> BoxFuture<'static, Result<Identity, AuthError>> {
        let inner = self.inner.clone();
        let email = email.trim().to_lowercase();
        let password = password.to_string();
        Box::pin(async move {
            let uid = match inner.accounts.get(&email) {
                Some(account) if account.password == password => account.uid.clone(),
                _ => return Err(AuthError::InvalidCredentials),
            };
            let identity = Identity::registered(uid, email);
            inner.current.send_replace(Some(identity.clone()));
            info!(uid = %identity.uid, "signed in");
            Ok(identity)
        })
    }

    fn sign_up(
        &self,
        email: &str,
        password: &str,
        display_name: &str,
    ) -> BoxFuture<'static, Result<Identity, AuthError>> {
        let inner = self.inner.clone();
        let email = email.trim().to_lowercase();
        let password = password.to_string();
        let display_name = display_name.to_string();
        Box::pin(async move {
            let uid = format!("user_{}", Uuid::new_v4().simple());
            match inner.accounts.entry(email.clone()) {
                dashmap::Entry::Occupied(_) => return Err(AuthError::EmailTaken(email)),
                dashmap::Entry::Vacant(slot) => {
                    slot.insert(Account {
                        uid: uid.clone(),
                        password,
                        display_name,
                    });
                }
            }
            let identity = Identity::registered(uid, email);
            inner.current.send_replace(Some(identity.clone()));
            info!(uid = %identity.uid, "registered new account");
            Ok(identity)
        })
    }

    fn sign_out(&self) -> BoxFuture<'static, Result<(), AuthError>> {
        let inner = self.inner.clone();
        Box::pin(async move {
            inner.current.send_replace(None);
            Ok(())
        })
    }

    fn subscribe(&self) -> watch::Receiver<Option<Identity>> {
        self.inner.current.subscribe()
    }
}
