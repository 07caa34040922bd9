//! Single-admin authentication and in-memory sessions.

use anyhow::Result;
use rand::Rng;
use rand_distr::Alphanumeric;
use std::collections::HashSet;
use std::sync::{Mutex, PoisonError};
use tracing::{debug, warn};

use crate::config::AuthSettings;

const ARGON2_PREFIX: &str = "$argon2";
const SESSION_TOKEN_LENGTH: usize = 64;

#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct SessionToken(pub String);

impl SessionToken {
    pub fn generate() -> SessionToken {
        let rng = rand::rng();
        let random_string: String = rng
            .sample_iter(&Alphanumeric)
            .take(SESSION_TOKEN_LENGTH)
            .map(char::from)
            .collect();
        SessionToken(random_string)
    }
}

pub mod starsync_argon2 {
    use anyhow::{anyhow, Result};
    use argon2::{
        password_hash::{
            rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString,
        },
        Argon2,
    };

    /// Hashes `plain` into a PHC string with a fresh salt.
    pub fn hash(plain: &[u8]) -> Result<String> {
        let salt = SaltString::generate(&mut OsRng);
        let hash_string = Argon2::default()
            .hash_password(plain, &salt)
            .map_err(|err| anyhow!("{}", err))?
            .to_string();
        Ok(hash_string)
    }

    pub fn verify<T: AsRef<str>>(plain_pw: &[u8], target_hash: T) -> Result<bool> {
        let argon2 = Argon2::default();
        let password_hash =
            PasswordHash::new(target_hash.as_ref()).map_err(|err| anyhow!("{}", err))?;
        Ok(argon2.verify_password(plain_pw, &password_hash).is_ok())
    }
}

/// The configured admin password, either an argon2 PHC string or plaintext.
#[derive(Clone)]
enum StoredPassword {
    Argon2(String),
    Plain(String),
}

impl StoredPassword {
    fn parse(raw: &str) -> Self {
        if raw.starts_with(ARGON2_PREFIX) {
            StoredPassword::Argon2(raw.to_string())
        } else {
            StoredPassword::Plain(raw.to_string())
        }
    }

    fn verify(&self, candidate: &str) -> Result<bool> {
        match self {
            StoredPassword::Argon2(hash) => starsync_argon2::verify(candidate.as_bytes(), hash),
            StoredPassword::Plain(plain) => Ok(plain == candidate),
        }
    }
}

/// Checks admin credentials and keeps the set of live session tokens.
/// Sessions do not survive a restart.
pub struct Authenticator {
    username: String,
    password: StoredPassword,
    sessions: Mutex<HashSet<SessionToken>>,
}

impl Authenticator {
    pub fn new(username: impl Into<String>, password: &str) -> Self {
        Self {
            username: username.into(),
            password: StoredPassword::parse(password),
            sessions: Mutex::new(HashSet::new()),
        }
    }

    pub fn from_settings(settings: &AuthSettings) -> Self {
        Self::new(settings.username.clone(), &settings.password)
    }

    fn verify(&self, username: &str, password: &str) -> bool {
        if username != self.username {
            debug!("Login attempt for unknown user {}", username);
            return false;
        }
        match self.password.verify(password) {
            Ok(valid) => valid,
            Err(err) => {
                warn!("Stored admin password hash is unusable: {:#}", err);
                false
            }
        }
    }

    /// Opens a new session when the credentials match.
    pub fn login(&self, username: &str, password: &str) -> Option<SessionToken> {
        if !self.verify(username, password) {
            return None;
        }
        let token = SessionToken::generate();
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(token.clone());
        Some(token)
    }

    pub fn is_valid(&self, token: &str) -> bool {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&SessionToken(token.to_string()))
    }

    /// Returns false when the token was not a live session.
    pub fn logout(&self, token: &str) -> bool {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&SessionToken(token.to_string()))
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}
