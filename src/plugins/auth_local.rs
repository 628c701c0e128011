// src/plugins/auth_local.rs

//! Authentication plugin dispatched by `[handyrep].authentication_method`.
//! Grounded on the *shape* of `original_source/handyrep/plugins/ldap_auth.py`
//! (`run(username, userpass, funcname)` dispatching to a boolean
//! authenticate check) — the backend here is a local argon2 password file
//! rather than LDAP, since no LDAP client crate is part of this corpus's
//! dependency stack; this is the stand-in the non-goals leave room for.

use std::collections::HashMap;

use argon2::password_hash::{PasswordHash, PasswordVerifier};
use argon2::Argon2;
use async_trait::async_trait;

use crate::core::plugin::{Plugin, PluginResult};

pub struct LocalAuthPlugin {
    /// username -> PHC-format argon2 hash string.
    users: HashMap<String, String>,
}

impl LocalAuthPlugin {
    pub fn new(users: HashMap<String, String>) -> Self {
        Self { users }
    }

    fn authenticate_bool(&self, username: &str, password: &str) -> bool {
        let Some(hash) = self.users.get(username) else {
            return false;
        };
        let Ok(parsed) = PasswordHash::new(hash) else {
            return false;
        };
        Argon2::default().verify_password(password.as_bytes(), &parsed).is_ok()
    }
}

#[async_trait]
impl Plugin for LocalAuthPlugin {
    fn name(&self) -> &str {
        "auth_local"
    }

    /// `args = [username, password]`.
    async fn run(&self, args: &[String]) -> PluginResult {
        let (Some(username), Some(password)) = (args.first(), args.get(1)) else {
            return PluginResult::fail("auth_local.run requires a username and password");
        };
        if self.authenticate_bool(username, password) {
            PluginResult::ok(format!("'{username}' authenticated"))
        } else {
            PluginResult::fail("authentication failed")
        }
    }

    async fn test(&self) -> PluginResult {
        if self.users.is_empty() {
            return PluginResult::fail("auth_local has no configured users");
        }
        PluginResult::ok("auth_local setup is correct")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use argon2::password_hash::{PasswordHasher, SaltString};
    use argon2::Argon2;

    #[test]
    fn rejects_unknown_user() {
        let plugin = LocalAuthPlugin::new(HashMap::new());
        assert!(!plugin.authenticate_bool("nobody", "whatever"));
    }

    #[test]
    fn accepts_correct_password() {
        let salt = SaltString::generate(&mut rand::rngs::OsRng);
        let hash = Argon2::default()
            .hash_password(b"correct horse battery staple", &salt)
            .unwrap()
            .to_string();
        let mut users = HashMap::new();
        users.insert("operator".to_string(), hash);
        let plugin = LocalAuthPlugin::new(users);
        assert!(plugin.authenticate_bool("operator", "correct horse battery staple"));
        assert!(!plugin.authenticate_bool("operator", "wrong password"));
    }
}
