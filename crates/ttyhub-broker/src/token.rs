//! Single-use, short-lived attach tokens.

use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::{BrokerError, BrokerResult};
use crate::models::Geometry;

#[derive(Debug, Clone)]
pub struct AttachTokenRecord {
    pub session_id: String,
    pub user_id: String,
    pub expires_at: Instant,
    /// Viewer geometry to apply when the connection attaches.
    pub geometry: Option<Geometry>,
}

pub struct AttachTokenStore {
    tokens: DashMap<String, AttachTokenRecord>,
    ttl: Duration,
}

impl AttachTokenStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            tokens: DashMap::new(),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn mint(&self, session_id: &str, user_id: &str, geometry: Option<Geometry>) -> String {
        let token = format!("{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple());
        self.tokens.insert(
            token.clone(),
            AttachTokenRecord {
                session_id: session_id.to_string(),
                user_id: user_id.to_string(),
                expires_at: Instant::now() + self.ttl,
                geometry,
            },
        );
        token
    }

    /// Redeem a token. The record is removed before the expiry check, so a
    /// token can never be used twice even if the first use failed.
    pub fn consume(&self, token: &str) -> BrokerResult<AttachTokenRecord> {
        let (_, record) = self.tokens.remove(token).ok_or(BrokerError::InvalidToken)?;
        if Instant::now() >= record.expires_at {
            return Err(BrokerError::InvalidToken);
        }
        Ok(record)
    }

    /// Drop expired records. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.tokens.len();
        self.tokens.retain(|_, record| record.expires_at > now);
        before.saturating_sub(self.tokens.len())
    }

    pub fn revoke_session(&self, session_id: &str) -> usize {
        let before = self.tokens.len();
        self.tokens.retain(|_, record| record.session_id != session_id);
        before.saturating_sub(self.tokens.len())
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}
