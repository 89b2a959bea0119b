//! In-memory credential store

use std::collections::HashMap;

use tracing::debug;
use ttls_proto::{EapUser, UserStore};

use crate::config::{Config, ConfigError};

const WILDCARD: &[u8] = b"*";

/// Credential store built from the configured user list
///
/// Outer (Phase 1) entries may use `"*"` to match any identity; tunneled
/// entries match exactly.
#[derive(Debug, Default, Clone)]
pub struct MemoryUserStore {
    outer: HashMap<Vec<u8>, EapUser>,
    inner: HashMap<Vec<u8>, EapUser>,
}

impl MemoryUserStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        let mut store = Self::new();
        for user in &config.users {
            store.add_user(&user.username, user.to_eap_user()?, user.outer);
        }
        Ok(store)
    }

    pub fn add_user(&mut self, username: impl AsRef<[u8]>, user: EapUser, outer: bool) {
        let table = if outer { &mut self.outer } else { &mut self.inner };
        table.insert(username.as_ref().to_vec(), user);
    }

    pub fn len(&self) -> usize {
        self.outer.len() + self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl UserStore for MemoryUserStore {
    fn get_user(&self, identity: &[u8], phase2: bool) -> Option<EapUser> {
        if phase2 {
            return self.inner.get(identity).cloned();
        }

        let user = self
            .outer
            .get(identity)
            .or_else(|| self.outer.get(WILDCARD))
            .cloned();
        if user.is_none() {
            debug!(
                "No outer user entry for '{}'",
                String::from_utf8_lossy(identity)
            );
        }
        user
    }
}
