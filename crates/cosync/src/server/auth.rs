//! Authentication and authorization seams.
//!
//! Token resolution and resource access are injected behind traits so the
//! HTTP API and the relay can run against anything from an accept-all
//! development setup to a static grant table in tests.

use crate::error::{SyncError, SyncResult};
use crate::presence::{assign_color, default_palette, UserIdentity};
use crate::resource::ResourceRef;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

/// Information about an authenticated user.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthenticatedUser {
    /// User ID resolved from the token.
    pub user_id: String,
    /// Display name.
    pub display_name: String,
    /// Assigned color for presence.
    pub color: String,
}

impl AuthenticatedUser {
    pub fn new(user_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        let user_id = user_id.into();
        let color = assign_color(&user_id, &default_palette());
        Self {
            user_id,
            display_name: display_name.into(),
            color,
        }
    }

    /// Identity for presence rows written on this user's behalf.
    pub fn identity(&self) -> UserIdentity {
        UserIdentity::new(self.user_id.as_str(), self.display_name.as_str())
    }
}

/// Authentication provider trait.
///
/// Implement this trait to provide custom token resolution.
#[trait_variant::make(Send)]
pub trait AuthProvider: Send + Sync {
    /// Resolve a bearer token to an authenticated user, or an error
    /// message on failure.
    async fn authenticate(&self, token: &str) -> Result<AuthenticatedUser, String>;
}

/// Auth provider that accepts any token (for development/testing). The
/// token doubles as the user ID; an empty token gets a generated guest ID.
#[derive(Debug, Default)]
pub struct AcceptAllAuthProvider;

impl AuthProvider for AcceptAllAuthProvider {
    async fn authenticate(&self, token: &str) -> Result<AuthenticatedUser, String> {
        let user_id = if token.is_empty() {
            static COUNTER: AtomicU64 = AtomicU64::new(1);
            format!("guest-{}", COUNTER.fetch_add(1, Ordering::SeqCst))
        } else {
            token.to_string()
        };
        let display_name = format!("User {}", user_id);
        Ok(AuthenticatedUser::new(user_id, display_name))
    }
}

/// In-memory token table for tests and single-tenant deployments.
#[derive(Debug, Default)]
pub struct StaticTokenAuthProvider {
    /// Map of tokens to (user ID, display name).
    users: HashMap<String, (String, String)>,
}

impl StaticTokenAuthProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a token.
    pub fn add_user(
        &mut self,
        token: impl Into<String>,
        user_id: impl Into<String>,
        display_name: impl Into<String>,
    ) {
        self.users
            .insert(token.into(), (user_id.into(), display_name.into()));
    }
}

impl AuthProvider for StaticTokenAuthProvider {
    async fn authenticate(&self, token: &str) -> Result<AuthenticatedUser, String> {
        self.users
            .get(token)
            .map(|(user_id, display_name)| AuthenticatedUser::new(user_id, display_name))
            .ok_or_else(|| "Invalid token".to_string())
    }
}

/// Per-resource write authorization.
#[trait_variant::make(Send)]
pub trait AccessPolicy: Send + Sync {
    /// Check whether `user_id` may write `resource`.
    async fn authorize(&self, user_id: &str, resource: &ResourceRef) -> SyncResult<()>;
}

/// Policy that authorizes every user for every resource.
#[derive(Debug, Default)]
pub struct AllowAllPolicy;

impl AccessPolicy for AllowAllPolicy {
    async fn authorize(&self, _user_id: &str, _resource: &ResourceRef) -> SyncResult<()> {
        Ok(())
    }
}

/// Static grant table: a user may write exactly the resources granted.
#[derive(Debug, Default)]
pub struct StaticAccessPolicy {
    grants: HashMap<String, HashSet<String>>,
}

impl StaticAccessPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Grant `user_id` write access to `resource`.
    pub fn allow(&mut self, user_id: impl Into<String>, resource: &ResourceRef) {
        self.grants
            .entry(user_id.into())
            .or_default()
            .insert(resource.channel_name());
    }
}

impl AccessPolicy for StaticAccessPolicy {
    async fn authorize(&self, user_id: &str, resource: &ResourceRef) -> SyncResult<()> {
        let allowed = self
            .grants
            .get(user_id)
            .is_some_and(|resources| resources.contains(&resource.channel_name()));
        if allowed {
            Ok(())
        } else {
            Err(SyncError::AccessDenied {
                user_id: user_id.to_string(),
                resource: resource.to_string(),
            })
        }
    }
}
