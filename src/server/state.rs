use axum::extract::FromRef;
use axum_extra::extract::cookie::Key;
use sha2::{Digest, Sha512};
use std::sync::Arc;
use std::time::Instant;

use crate::activity_log::ActivityLog;
use crate::auth::Authenticator;
use crate::plex::PlexApi;
use crate::scheduler::SchedulerHandle;
use crate::settings::SettingsStore;

use super::ServerConfig;

pub type GuardedSettingsStore = Arc<SettingsStore>;
pub type GuardedPlex = Arc<dyn PlexApi>;
pub type GuardedAuthenticator = Arc<Authenticator>;

#[derive(Clone)]
pub struct ServerState {
    pub config: ServerConfig,
    pub start_time: Instant,
    pub hash: String,
    pub settings: GuardedSettingsStore,
    pub plex: GuardedPlex,
    pub scheduler: SchedulerHandle,
    pub activity: ActivityLog,
    pub authenticator: GuardedAuthenticator,
    pub cookie_key: Key,
}

/// Derives the 64-byte cookie signing key from an arbitrary secret.
pub fn cookie_key_from_secret(secret: &str) -> Key {
    let digest = Sha512::digest(secret.as_bytes());
    Key::from(digest.as_slice())
}

impl FromRef<ServerState> for GuardedSettingsStore {
    fn from_ref(input: &ServerState) -> Self {
        input.settings.clone()
    }
}

impl FromRef<ServerState> for GuardedPlex {
    fn from_ref(input: &ServerState) -> Self {
        input.plex.clone()
    }
}

impl FromRef<ServerState> for SchedulerHandle {
    fn from_ref(input: &ServerState) -> Self {
        input.scheduler.clone()
    }
}

impl FromRef<ServerState> for ActivityLog {
    fn from_ref(input: &ServerState) -> Self {
        input.activity.clone()
    }
}

impl FromRef<ServerState> for GuardedAuthenticator {
    fn from_ref(input: &ServerState) -> Self {
        input.authenticator.clone()
    }
}

impl FromRef<ServerState> for ServerConfig {
    fn from_ref(input: &ServerState) -> Self {
        input.config.clone()
    }
}

impl FromRef<ServerState> for Key {
    fn from_ref(input: &ServerState) -> Self {
        input.cookie_key.clone()
    }
}
