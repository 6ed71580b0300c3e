// Copyright 2015-2024 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// https://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// https://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Password authentication of update requests
//!
//! Users live in a TOML file, one table per user:
//!
//! ```toml
//! [alice]
//! password = "secret"
//! hashed = false
//! domains = ["home.example.com"]
//! ```
//!
//! Plaintext passwords are replaced by their argon2 hash when the file is loaded, and the file
//! is written back so they do not stay on disk.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::io;
use std::path::Path;
use std::sync::Arc;

use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::error::{ConfigErrorKind, ConfigResult};
use crate::fqdn::Fqdn;

/// How requests of unknown users or for foreign domains are reported
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthPolicy {
    /// Unknown users and domains are errors, distinct from a wrong password
    #[default]
    Strict,
    /// Unknown users and domains are treated like a wrong password
    Lenient,
}

/// One user as stored in the authentication file
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct UserEntry {
    /// Plaintext password, or its PHC hash string once `hashed` is set
    #[serde(alias = "Password")]
    pub password: String,
    /// Whether `password` is already hashed
    #[serde(default, alias = "Hashed")]
    pub hashed: bool,
    /// Domains the user may update
    #[serde(default, alias = "Domains")]
    pub domains: Vec<String>,
}

/// The contents of the authentication file
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(transparent)]
pub struct AuthFile {
    users: BTreeMap<String, UserEntry>,
}

impl AuthFile {
    /// Reads the file at `path`, hashing and writing back any plaintext password.
    ///
    /// A missing file is created empty.
    pub fn load(path: &Path) -> ConfigResult<Self> {
        let data = match fs::read_to_string(path) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                warn!("authentication file {path:?} does not exist, creating an empty one");
                let file = Self::default();
                file.write(path)?;
                return Ok(file);
            }
            Err(e) => return Err(e.into()),
        };

        let mut file = Self::from_toml(&data)?;
        info!("loaded authentication file {path:?}");

        if file.hash_passwords()? {
            // the hashes are in memory either way, a failed write only leaves plaintext on disk
            if let Err(e) = file.write(path) {
                error!("could not write hashed passwords to {path:?}: {e}");
            }
        }

        Ok(file)
    }

    /// Parses the TOML contents of an authentication file
    pub fn from_toml(data: &str) -> ConfigResult<Self> {
        Ok(toml::from_str(data)?)
    }

    /// The TOML representation, as written to disk
    pub fn to_toml(&self) -> ConfigResult<String> {
        Ok(toml::to_string(self)?)
    }

    fn write(&self, path: &Path) -> ConfigResult<()> {
        fs::write(path, self.to_toml()?)?;
        Ok(())
    }

    /// Adds or replaces a user
    pub fn insert(&mut self, name: impl Into<String>, entry: UserEntry) {
        self.users.insert(name.into(), entry);
    }

    /// All users by name
    pub fn users(&self) -> &BTreeMap<String, UserEntry> {
        &self.users
    }

    /// Replaces every plaintext password with its hash, returns true if any was replaced
    pub fn hash_passwords(&mut self) -> ConfigResult<bool> {
        let mut changed = false;

        for (name, entry) in self.users.iter_mut().filter(|(_, e)| !e.hashed) {
            debug!("hashing password of user {name}");
            entry.password = hash_password(&entry.password).map_err(|e| {
                ConfigErrorKind::PasswordHash {
                    user: name.clone(),
                    message: e.to_string(),
                }
            })?;
            entry.hashed = true;
            changed = true;
        }

        Ok(changed)
    }
}

/// Hashes `password` with argon2 and a random salt into a PHC string
pub fn hash_password(password: &str) -> Result<String, argon2::password_hash::Error> {
    let salt = SaltString::generate(&mut OsRng);
    Ok(Argon2::default()
        .hash_password(password.as_bytes(), &salt)?
        .to_string())
}

/// The credentials presented with an update
#[derive(Clone, PartialEq, Eq)]
pub struct PasswordRequest {
    /// Name of the user
    pub user: String,
    /// Plaintext password
    pub password: String,
    /// Domain the user wants to update, in any case
    pub domain: String,
}

impl std::fmt::Debug for PasswordRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PasswordRequest")
            .field("user", &self.user)
            .field("domain", &self.domain)
            .finish_non_exhaustive()
    }
}

/// Authentication could not be decided
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum AuthError {
    /// No such user
    #[error("user does not exist: {0}")]
    UnknownUser(String),
    /// The user may not update this domain
    #[error("user {user} does not have access to {domain}")]
    DomainNotAllowed {
        /// Name of the user
        user: String,
        /// The requested domain
        domain: String,
    },
    /// The stored hash of the user is unusable
    #[error("invalid password hash for user {user}: {message}")]
    Hash {
        /// Name of the user
        user: String,
        /// Description from the hasher
        message: String,
    },
    /// The verification task failed
    #[error("password verification failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

struct Credentials {
    hash: Arc<str>,
    domains: HashSet<Fqdn>,
}

/// Checks passwords and domain permissions of users
pub struct Authenticator {
    users: HashMap<String, Credentials>,
    policy: AuthPolicy,
}

impl Authenticator {
    /// Builds the user table, hashing any plaintext password of `file` first
    pub fn new(mut file: AuthFile, policy: AuthPolicy) -> ConfigResult<Self> {
        file.hash_passwords()?;

        let mut users = HashMap::with_capacity(file.users.len());
        for (name, entry) in file.users {
            let domains = entry
                .domains
                .iter()
                .map(|d| Fqdn::new(d))
                .collect::<Result<HashSet<_>, _>>()?;

            users.insert(
                name,
                Credentials {
                    hash: entry.password.into(),
                    domains,
                },
            );
        }

        info!("loaded {} users, policy: {policy:?}", users.len());
        Ok(Self { users, policy })
    }

    /// The policy this authenticator was built with
    pub fn policy(&self) -> AuthPolicy {
        self.policy
    }

    /// Number of known users
    pub fn len(&self) -> usize {
        self.users.len()
    }

    /// True if no user is configured
    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    /// Returns `Ok(true)` if the password matches and the user may update the domain.
    ///
    /// A wrong password is `Ok(false)`. Unknown users and domains are errors with
    /// [`AuthPolicy::Strict`] and `Ok(false)` with [`AuthPolicy::Lenient`].
    pub async fn authenticate(&self, request: &PasswordRequest) -> Result<bool, AuthError> {
        let Some(credentials) = self.users.get(&request.user) else {
            debug!("authentication of unknown user {}", request.user);
            return self.reject(AuthError::UnknownUser(request.user.clone()));
        };

        let allowed = Fqdn::new(&request.domain)
            .map(|d| credentials.domains.contains(&d))
            .unwrap_or(false);
        if !allowed {
            debug!("user {} may not update {}", request.user, request.domain);
            return self.reject(AuthError::DomainNotAllowed {
                user: request.user.clone(),
                domain: request.domain.clone(),
            });
        }

        let hash = Arc::clone(&credentials.hash);
        let password = request.password.clone();
        let verified = tokio::task::spawn_blocking(move || {
            let parsed = PasswordHash::new(&hash)?;
            Ok::<_, argon2::password_hash::Error>(
                Argon2::default()
                    .verify_password(password.as_bytes(), &parsed)
                    .is_ok(),
            )
        })
        .await?;

        verified.map_err(|e| {
            error!("invalid password hash for user {}: {e}", request.user);
            AuthError::Hash {
                user: request.user.clone(),
                message: e.to_string(),
            }
        })
    }

    fn reject(&self, err: AuthError) -> Result<bool, AuthError> {
        match self.policy {
            AuthPolicy::Strict => Err(err),
            AuthPolicy::Lenient => Ok(false),
        }
    }
}
