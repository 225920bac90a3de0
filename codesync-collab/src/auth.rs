//! Identity lookup for connecting users.
//!
//! Authentication itself happens elsewhere; the server only maps the
//! optional `authToken` of `init` to a user id and a display name.

use std::collections::HashMap;

use async_trait::async_trait;
use uuid::Uuid;

/// A verified user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: String,
    pub display_name: String,
}

/// Resolves the identity behind an auth token.
///
/// Never fails: an absent or unknown token yields an anonymous identity
/// derived from the connection's member id.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn identify(&self, auth_token: Option<&str>, member_id: Uuid) -> Identity;
}

/// Everyone is anonymous.
#[derive(Debug, Default, Clone, Copy)]
pub struct AnonymousAuthenticator;

impl AnonymousAuthenticator {
    pub fn identity_for(member_id: Uuid) -> Identity {
        let simple = member_id.simple().to_string();
        Identity {
            user_id: member_id.to_string(),
            display_name: format!("Anonymous-{}", &simple[..8]),
        }
    }
}

#[async_trait]
impl Authenticator for AnonymousAuthenticator {
    async fn identify(&self, _auth_token: Option<&str>, member_id: Uuid) -> Identity {
        Self::identity_for(member_id)
    }
}

/// Fixed token → identity table.
#[derive(Debug, Default, Clone)]
pub struct StaticAuthenticator {
    users: HashMap<String, Identity>,
}

impl StaticAuthenticator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_user(
        mut self,
        auth_token: impl Into<String>,
        user_id: impl Into<String>,
        display_name: impl Into<String>,
    ) -> Self {
        self.users.insert(
            auth_token.into(),
            Identity {
                user_id: user_id.into(),
                display_name: display_name.into(),
            },
        );
        self
    }
}

#[async_trait]
impl Authenticator for StaticAuthenticator {
    async fn identify(&self, auth_token: Option<&str>, member_id: Uuid) -> Identity {
        match auth_token.and_then(|t| self.users.get(t)) {
            Some(identity) => identity.clone(),
            None => {
                if auth_token.is_some() {
                    log::debug!("Unknown auth token, connecting {member_id} anonymously");
                }
                AnonymousAuthenticator::identity_for(member_id)
            }
        }
    }
}
