//! Users, roles, and permission checks.
//!
//! Passwords are never stored. Each user carries a digest,
//! `HMAC-SHA256(key = user name, message = password)`, hex-encoded in the
//! server configuration; authentication recomputes it and compares in
//! constant time.

use crate::error::{ServerError, ServerResult};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::HashMap;
use std::fmt;

type HmacSha256 = Hmac<Sha256>;

/// What a permission protects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Resource {
    /// Server-wide actions such as creating databases.
    Server,
    /// Opening and altering a database.
    Database,
    /// Cluster counts.
    Cluster,
    /// Record reads and writes.
    Record,
    /// Command execution.
    Command,
    /// Dictionary reads and writes.
    Dictionary,
}

/// The kind of access requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// Create.
    Create,
    /// Read.
    Read,
    /// Update.
    Update,
    /// Delete.
    Delete,
}

/// Built-in roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Everything.
    Admin,
    /// Reads and writes data; cannot create databases or alter schema.
    Writer,
    /// Reads data.
    Reader,
}

impl Role {
    /// Whether the role grants `operation` on `resource`.
    #[must_use]
    pub fn allows(self, resource: Resource, operation: Operation) -> bool {
        match self {
            Self::Admin => true,
            Self::Writer => match resource {
                Resource::Server => false,
                Resource::Database => operation == Operation::Read,
                Resource::Cluster | Resource::Record | Resource::Command | Resource::Dictionary => {
                    true
                }
            },
            Self::Reader => resource != Resource::Server && operation == Operation::Read,
        }
    }

    /// Lowercase role name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::Writer => "writer",
            Self::Reader => "reader",
        }
    }
}

/// An authenticated user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    /// User name.
    pub name: String,
    /// Granted role.
    pub role: Role,
}

impl Principal {
    /// Fails with an authorization error unless the role grants the access.
    pub fn check(&self, resource: Resource, operation: Operation) -> ServerResult<()> {
        if self.role.allows(resource, operation) {
            Ok(())
        } else {
            Err(ServerError::NotAuthorized(format!(
                "user '{}' ({}) may not {:?} {:?}",
                self.name,
                self.role.as_str(),
                operation,
                resource
            )))
        }
    }
}

/// A configured user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserConfig {
    /// User name.
    pub name: String,
    /// Hex-encoded password digest; see [`password_digest`].
    pub digest: String,
    /// Granted role.
    pub role: Role,
}

impl UserConfig {
    /// A user whose digest is computed from a clear-text password.
    pub fn with_password(name: impl Into<String>, password: &str, role: Role) -> Self {
        let name = name.into();
        let digest = hex::encode(password_digest(&name, password));
        Self { name, digest, role }
    }
}

/// `HMAC-SHA256(key = user, message = password)`.
#[must_use]
pub fn password_digest(user: &str, password: &str) -> Vec<u8> {
    let mut mac = keyed(user);
    mac.update(password.as_bytes());
    mac.finalize().into_bytes().to_vec()
}

fn keyed(user: &str) -> HmacSha256 {
    // HMAC accepts keys of any length; an empty user name still yields a valid key.
    match HmacSha256::new_from_slice(user.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => <HmacSha256 as hmac::digest::KeyInit>::new(&Default::default()),
    }
}

struct UserEntry {
    digest: Vec<u8>,
    role: Role,
}

/// Credential store built from the configured users.
pub struct Security {
    users: HashMap<String, UserEntry>,
}

impl Security {
    /// Builds the store; fails on a digest that is not valid hex.
    pub fn new(users: &[UserConfig]) -> ServerResult<Self> {
        let mut entries = HashMap::with_capacity(users.len());
        for user in users {
            let digest = hex::decode(&user.digest).map_err(|err| {
                ServerError::Config(format!("digest of user '{}': {err}", user.name))
            })?;
            entries.insert(
                user.name.clone(),
                UserEntry {
                    digest,
                    role: user.role,
                },
            );
        }
        Ok(Self { users: entries })
    }

    /// Checks credentials.
    pub fn authenticate(&self, user: &str, password: &str) -> ServerResult<Principal> {
        let denied = || ServerError::AuthenticationFailed(format!("invalid credentials for '{user}'"));
        let entry = self.users.get(user).ok_or_else(denied)?;
        let mut mac = keyed(user);
        mac.update(password.as_bytes());
        mac.verify_slice(&entry.digest).map_err(|_| denied())?;
        Ok(Principal {
            name: user.to_string(),
            role: entry.role,
        })
    }

    /// Number of configured users.
    #[must_use]
    pub fn user_count(&self) -> usize {
        self.users.len()
    }
}

impl fmt::Debug for Security {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.users.keys().collect();
        names.sort();
        f.debug_struct("Security").field("users", &names).finish()
    }
}

/// The accounts a fresh server starts with: `admin`, `writer`, and `reader`,
/// each with its own name as password.
#[must_use]
pub fn default_users() -> Vec<UserConfig> {
    vec![
        UserConfig::with_password("admin", "admin", Role::Admin),
        UserConfig::with_password("writer", "writer", Role::Writer),
        UserConfig::with_password("reader", "reader", Role::Reader),
    ]
}
