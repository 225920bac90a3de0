//! Session registry: collaboration token → room.
//!
//! A room is created when an invitation is issued and lives for a fixed
//! TTL from issuance. Members come and go with their connections; a room
//! whose last member left stays joinable until it expires, and is evicted
//! once it is both expired and empty.
//!
//! The registry is an explicitly constructed value (usually behind an
//! `Arc`), sharded by token through [`DashMap`].

use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

/// Random bytes per token (43 characters once encoded).
const TOKEN_BYTES: usize = 32;

/// Presence status of a member.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemberStatus {
    #[default]
    Active,
    Idle,
    Away,
    Offline,
}

/// A participant of a room for the lifetime of one connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Member {
    #[serde(rename = "user_id")]
    pub id: Uuid,
    #[serde(rename = "username")]
    pub name: String,
    pub joined_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    #[serde(default)]
    pub status: MemberStatus,
    /// User id reported by the authenticator.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account: Option<String>,
}

impl Member {
    pub fn new(id: Uuid, name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id,
            name: name.into(),
            joined_at: now,
            last_activity: now,
            status: MemberStatus::Active,
            account: None,
        }
    }
}

/// One collaboration session.
#[derive(Debug, Clone)]
pub struct Room {
    pub token: String,
    /// Repository this room edits. Never changes once set.
    pub resource_id: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: Instant,
    pub members: Vec<Member>,
}

impl Room {
    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

/// Registry limits.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Lifetime of a token from issuance. Never refreshed.
    pub token_ttl: Duration,
    /// `add_connection` refuses new members beyond this.
    pub max_members_per_room: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            token_ttl: Duration::from_secs(3600),
            max_members_per_room: 100,
        }
    }
}

/// Token → room map shared by every connection task.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    rooms: DashMap<String, Room>,
    config: RegistryConfig,
}

impl SessionRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            rooms: DashMap::new(),
            config,
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Issue a new unguessable token for `resource_id`.
    ///
    /// Expired empty rooms are evicted first.
    pub fn generate_token(&self, resource_id: impl Into<String>) -> String {
        self.sweep_expired();

        let resource_id = resource_id.into();
        let token = loop {
            let candidate = random_token();
            if !self.rooms.contains_key(&candidate) {
                break candidate;
            }
        };

        let room = Room {
            token: token.clone(),
            resource_id: resource_id.clone(),
            created_at: Utc::now(),
            expires_at: Instant::now() + self.config.token_ttl,
            members: Vec::new(),
        };
        self.rooms.insert(token.clone(), room);
        log::info!(
            "Issued collaboration token for {resource_id} (ttl {}s)",
            self.config.token_ttl.as_secs()
        );
        token
    }

    /// True iff an unexpired room exists for `token`.
    pub fn verify_token(&self, token: &str) -> bool {
        self.rooms.get(token).is_some_and(|room| !room.is_expired())
    }

    /// Add (or refresh) a member.
    ///
    /// Returns false if the token is unknown or expired, or if the room is
    /// full. Re-adding an existing member updates its name and activity
    /// instead of duplicating it.
    pub fn add_connection(&self, token: &str, member_id: Uuid, display_name: &str) -> bool {
        let Some(mut room) = self.rooms.get_mut(token) else {
            return false;
        };
        if room.is_expired() {
            return false;
        }

        if let Some(member) = room.members.iter_mut().find(|m| m.id == member_id) {
            member.name = display_name.to_string();
            member.last_activity = Utc::now();
            return true;
        }

        if room.members.len() >= self.config.max_members_per_room {
            log::warn!(
                "Room for {} is full ({} members)",
                room.resource_id,
                room.members.len()
            );
            return false;
        }

        room.members.push(Member::new(member_id, display_name));
        true
    }

    /// Attach the authenticated user id to a member.
    pub fn set_account(&self, token: &str, member_id: Uuid, account: &str) -> bool {
        let Some(mut room) = self.rooms.get_mut(token) else {
            return false;
        };
        match room.members.iter_mut().find(|m| m.id == member_id) {
            Some(member) => {
                member.account = Some(account.to_string());
                true
            }
            None => false,
        }
    }

    /// Remove a member. The room itself is kept until it expires.
    pub fn remove_connection(&self, token: &str, member_id: Uuid) -> Option<Member> {
        let mut room = self.rooms.get_mut(token)?;
        let index = room.members.iter().position(|m| m.id == member_id)?;
        Some(room.members.remove(index))
    }

    /// Current members in join order. Empty for unknown tokens.
    pub fn get_connections(&self, token: &str) -> Vec<Member> {
        self.rooms
            .get(token)
            .map(|room| room.members.clone())
            .unwrap_or_default()
    }

    /// Repository of a valid token.
    pub fn get_resource_id(&self, token: &str) -> Option<String> {
        self.rooms
            .get(token)
            .filter(|room| !room.is_expired())
            .map(|room| room.resource_id.clone())
    }

    /// Set a member's status and bump its activity time.
    pub fn update_status(&self, token: &str, member_id: Uuid, status: MemberStatus) -> Option<Member> {
        let mut room = self.rooms.get_mut(token)?;
        let member = room.members.iter_mut().find(|m| m.id == member_id)?;
        member.status = status;
        member.last_activity = Utc::now();
        Some(member.clone())
    }

    /// Record activity for a member.
    pub fn touch(&self, token: &str, member_id: Uuid) -> bool {
        let Some(mut room) = self.rooms.get_mut(token) else {
            return false;
        };
        match room.members.iter_mut().find(|m| m.id == member_id) {
            Some(member) => {
                member.last_activity = Utc::now();
                true
            }
            None => false,
        }
    }

    /// Invalidate a token immediately, members or not.
    pub fn revoke_token(&self, token: &str) -> bool {
        self.rooms.remove(token).is_some()
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    /// Evict rooms that are expired and have no members. Returns how many
    /// were removed.
    pub fn sweep_expired(&self) -> usize {
        let before = self.rooms.len();
        self.rooms
            .retain(|_, room| !(room.is_expired() && room.members.is_empty()));
        let removed = before.saturating_sub(self.rooms.len());
        if removed > 0 {
            log::debug!("Evicted {removed} expired room(s)");
        }
        removed
    }

    /// Run [`sweep_expired`](Self::sweep_expired) every `interval` until
    /// `shutdown` flips to true.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        registry.sweep_expired();
                    }
                    _ = crate::server::stopped(&mut shutdown) => break,
                }
            }
            log::debug!("Token sweeper stopped");
        })
    }
}

fn random_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry_with_ttl(secs: u64) -> SessionRegistry {
        SessionRegistry::new(RegistryConfig {
            token_ttl: Duration::from_secs(secs),
            ..RegistryConfig::default()
        })
    }

    #[tokio::test]
    async fn test_tokens_are_url_safe_and_unique() {
        let registry = SessionRegistry::default();
        let a = registry.generate_token("repo");
        let b = registry.generate_token("repo");
        assert_ne!(a, b);
        assert_eq!(a.len(), 43);
        assert!(a
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
        assert!(registry.verify_token(&a));
        assert!(!registry.verify_token("not-a-token"));
        assert_eq!(registry.get_resource_id(&a).as_deref(), Some("repo"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_token_expires_after_ttl() {
        let registry = registry_with_ttl(60);
        let token = registry.generate_token("repo");
        assert!(registry.verify_token(&token));

        tokio::time::advance(Duration::from_secs(59)).await;
        assert!(registry.verify_token(&token));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(!registry.verify_token(&token));
        assert_eq!(registry.get_resource_id(&token), None);
        assert!(!registry.add_connection(&token, Uuid::new_v4(), "late"));
    }

    #[tokio::test]
    async fn test_add_connection_is_idempotent() {
        let registry = SessionRegistry::default();
        let token = registry.generate_token("repo");
        let id = Uuid::new_v4();

        assert!(registry.add_connection(&token, id, "Ada"));
        assert!(registry.add_connection(&token, id, "Ada L."));
        let members = registry.get_connections(&token);
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].name, "Ada L.");

        assert!(!registry.add_connection("bogus", id, "Ada"));
    }

    #[tokio::test]
    async fn test_remove_keeps_room() {
        let registry = SessionRegistry::default();
        let token = registry.generate_token("repo");
        let id = Uuid::new_v4();
        registry.add_connection(&token, id, "Ada");

        let removed = registry.remove_connection(&token, id).unwrap();
        assert_eq!(removed.name, "Ada");
        assert!(registry.get_connections(&token).is_empty());
        assert!(registry.verify_token(&token));
        assert_eq!(registry.remove_connection(&token, id), None);
    }

    #[tokio::test]
    async fn test_member_cap() {
        let registry = SessionRegistry::new(RegistryConfig {
            max_members_per_room: 2,
            ..RegistryConfig::default()
        });
        let token = registry.generate_token("repo");
        assert!(registry.add_connection(&token, Uuid::new_v4(), "a"));
        assert!(registry.add_connection(&token, Uuid::new_v4(), "b"));
        assert!(!registry.add_connection(&token, Uuid::new_v4(), "c"));
    }

    #[tokio::test]
    async fn test_update_status_and_touch() {
        let registry = SessionRegistry::default();
        let token = registry.generate_token("repo");
        let id = Uuid::new_v4();
        registry.add_connection(&token, id, "Ada");

        let member = registry.update_status(&token, id, MemberStatus::Away).unwrap();
        assert_eq!(member.status, MemberStatus::Away);
        assert_eq!(registry.get_connections(&token)[0].status, MemberStatus::Away);
        assert!(registry.touch(&token, id));
        assert!(!registry.touch(&token, Uuid::new_v4()));
        assert!(registry.update_status(&token, Uuid::new_v4(), MemberStatus::Idle).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_only_removes_expired_empty_rooms() {
        let registry = registry_with_ttl(10);
        let empty = registry.generate_token("a");
        let occupied = registry.generate_token("b");
        registry.add_connection(&occupied, Uuid::new_v4(), "Ada");

        assert_eq!(registry.sweep_expired(), 0);
        tokio::time::advance(Duration::from_secs(11)).await;

        assert_eq!(registry.sweep_expired(), 1);
        assert_eq!(registry.room_count(), 1);
        assert!(!registry.verify_token(&empty));
        // Still listed for the member that is connected, but not joinable.
        assert_eq!(registry.get_connections(&occupied).len(), 1);
        assert!(!registry.verify_token(&occupied));
    }

    #[tokio::test(start_paused = true)]
    async fn test_generate_token_evicts_lazily() {
        let registry = registry_with_ttl(5);
        registry.generate_token("old");
        tokio::time::advance(Duration::from_secs(6)).await;
        registry.generate_token("new");
        assert_eq!(registry.room_count(), 1);
    }

    #[tokio::test]
    async fn test_revoke() {
        let registry = SessionRegistry::default();
        let token = registry.generate_token("repo");
        assert!(registry.revoke_token(&token));
        assert!(!registry.verify_token(&token));
        assert!(!registry.revoke_token(&token));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_task_stops_on_shutdown() {
        let registry = Arc::new(registry_with_ttl(1));
        registry.generate_token("repo");
        let (tx, rx) = watch::channel(false);
        let handle = registry.spawn_sweeper(Duration::from_secs(5), rx);

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(registry.room_count(), 0);

        tx.send_replace(true);
        handle.await.unwrap();
    }

    #[test]
    fn test_member_json_shape() {
        let member = Member::new(Uuid::nil(), "Ada");
        let value = serde_json::to_value(&member).unwrap();
        assert_eq!(value["username"], "Ada");
        assert_eq!(value["status"], "active");
        assert!(value.get("user_id").is_some());
        assert!(value.get("joined_at").is_some());
        assert!(value.get("account").is_none());
    }

    #[test]
    fn test_set_account() {
        let registry = SessionRegistry::new(RegistryConfig::default());
        let token = registry.generate_token("repo");
        let id = Uuid::new_v4();
        assert!(!registry.set_account(&token, id, "u1"));
        registry.add_connection(&token, id, "Ada");
        assert!(registry.set_account(&token, id, "u1"));
        let members = registry.get_connections(&token);
        assert_eq!(members[0].account.as_deref(), Some("u1"));
        assert_eq!(serde_json::to_value(&members[0]).unwrap()["account"], "u1");
    }
}
