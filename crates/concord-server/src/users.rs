//! User identities
//!
//! A user is whoever holds a key pair: the durable id is the identity
//! fingerprint, so the same keys resolve to the same user across logins.
//! Verifying the login proof itself (OAuth, SSO, whatever the deployment
//! uses) happens in front of this manager; durable persistence is equally
//! a front-end concern. This registry is the in-memory seam both plug
//! into.

use concord_crypto::PublicIdentity;
use dashmap::DashMap;

/// A durable user identity
#[derive(Debug, Clone)]
pub struct User {
    /// Fingerprint-derived stable id
    pub id: String,
    /// Display name from the most recent login
    pub name: String,
    /// Optional email from the most recent login
    pub email: Option<String>,
    /// The public identity peers seal to
    pub identity: PublicIdentity,
}

/// In-memory user registry
#[derive(Debug, Default)]
pub struct UserManager {
    users: DashMap<String, User>,
}

impl UserManager {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve a successful login to a user, creating it on first sight
    ///
    /// Later logins with the same identity refresh the profile fields.
    pub fn authenticate(
        &self,
        name: &str,
        email: Option<String>,
        identity: PublicIdentity,
    ) -> User {
        let id = identity.fingerprint().to_string();
        let user = User {
            id: id.clone(),
            name: name.to_string(),
            email,
            identity,
        };
        self.users.insert(id, user.clone());
        user
    }

    /// Look a user up by id
    pub fn get(&self, id: &str) -> Option<User> {
        self.users.get(id).map(|u| u.clone())
    }

    /// Number of known users
    pub fn user_count(&self) -> usize {
        self.users.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use concord_crypto::KeyPair;

    #[test]
    fn test_same_identity_resolves_to_same_user() {
        let users = UserManager::new();
        let keys = KeyPair::generate();

        let first = users.authenticate("alice", None, keys.public());
        let second = users.authenticate("alice a.", Some("a@example.com".into()), keys.public());

        assert_eq!(first.id, second.id);
        assert_eq!(users.user_count(), 1);
        // Profile refreshed by the later login
        assert_eq!(users.get(&first.id).unwrap().name, "alice a.");
    }

    #[test]
    fn test_distinct_identities_are_distinct_users() {
        let users = UserManager::new();
        let a = users.authenticate("alice", None, KeyPair::generate().public());
        let b = users.authenticate("bob", None, KeyPair::generate().public());
        assert_ne!(a.id, b.id);
        assert_eq!(users.user_count(), 2);
    }
}
