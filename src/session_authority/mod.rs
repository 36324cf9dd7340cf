//! SessionAuthority - operator credentials and sessions
//!
//! ## Responsibilities
//!
//! - Salted-hash credential verification (SHA-256, hex compare)
//! - Session issuance, sliding 24h expiry, pruning
//! - Password change (regenerates salt, invalidates every session)
//!
//! The credential record persists through the SettingsVault; the session
//! map lives only in memory and is owned solely by this module.

use crate::error::Result;
use crate::settings_vault::{CredentialRecord, SettingsVault, DEFAULT_PASSWORD};
use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Idle lifetime of a session before verify rejects it
const SESSION_TTL_HOURS: i64 = 24;

struct SessionEntry {
    issued_at: DateTime<Utc>,
    last_seen_at: DateTime<Utc>,
}

/// Credential and session owner
pub struct SessionAuthority {
    vault: Arc<SettingsVault>,
    sessions: RwLock<HashMap<String, SessionEntry>>,
}

impl SessionAuthority {
    /// Load the credential record, seeding the default password on first run
    pub async fn new(vault: Arc<SettingsVault>) -> Result<Self> {
        let credential = vault.credential().await;
        if credential.password_hash.is_empty() {
            let salt = random_hex::<16>();
            let seeded = CredentialRecord {
                password_hash: hash_password(DEFAULT_PASSWORD, &salt),
                salt,
                setup_complete: false,
            };
            vault.store_credential(seeded).await?;
            tracing::info!("Credential record seeded with default password");
        }

        Ok(Self {
            vault,
            sessions: RwLock::new(HashMap::new()),
        })
    }

    /// Verify the password and issue a session token. Returns None on any
    /// mismatch without revealing which check failed.
    pub async fn login(&self, password: &str) -> Option<String> {
        let credential = self.vault.credential().await;
        let attempt = hash_password(password, &credential.salt);
        if attempt != credential.password_hash {
            tracing::warn!("Login rejected");
            return None;
        }

        let token = random_hex::<32>();
        let now = Utc::now();
        let mut sessions = self.sessions.write().await;
        sessions.insert(
            token.clone(),
            SessionEntry {
                issued_at: now,
                last_seen_at: now,
            },
        );

        tracing::info!(active_sessions = sessions.len(), "Session issued");
        Some(token)
    }

    /// Check a token: prune expired sessions, then refresh the hit.
    /// Every successful verification extends the session (sliding expiry).
    pub async fn verify(&self, token: &str) -> bool {
        let now = Utc::now();
        let ttl = Duration::hours(SESSION_TTL_HOURS);

        let mut sessions = self.sessions.write().await;
        sessions.retain(|_, entry| {
            let live = now - entry.last_seen_at < ttl;
            if !live {
                tracing::debug!(
                    lived_hours = (now - entry.issued_at).num_hours(),
                    "Session expired"
                );
            }
            live
        });

        match sessions.get_mut(token) {
            Some(entry) => {
                entry.last_seen_at = now;
                true
            }
            None => false,
        }
    }

    /// Drop a session. Idempotent.
    pub async fn logout(&self, token: &str) {
        let mut sessions = self.sessions.write().await;
        if sessions.remove(token).is_some() {
            tracing::info!(active_sessions = sessions.len(), "Session closed");
        }
    }

    /// Change the password. Requires the old one to match; on success the
    /// salt is regenerated, every active session is invalidated, and the
    /// setup_complete flag is latched.
    pub async fn change_password(&self, old: &str, new: &str) -> Result<bool> {
        let credential = self.vault.credential().await;
        if hash_password(old, &credential.salt) != credential.password_hash {
            tracing::warn!("Password change rejected (old password mismatch)");
            return Ok(false);
        }

        let salt = random_hex::<16>();
        let updated = CredentialRecord {
            password_hash: hash_password(new, &salt),
            salt,
            setup_complete: true,
        };
        self.vault.store_credential(updated).await?;

        let mut sessions = self.sessions.write().await;
        let dropped = sessions.len();
        sessions.clear();

        tracing::info!(sessions_invalidated = dropped, "Password changed");
        Ok(true)
    }

    /// Number of live sessions (pruning not applied)
    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    #[cfg(test)]
    async fn backdate(&self, token: &str, hours: i64) {
        let mut sessions = self.sessions.write().await;
        if let Some(entry) = sessions.get_mut(token) {
            entry.last_seen_at = entry.last_seen_at - Duration::hours(hours);
            entry.issued_at = entry.issued_at - Duration::hours(hours);
        }
    }
}

/// SHA-256 over password+salt, lowercase hex
fn hash_password(password: &str, salt: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(password.as_bytes());
    hasher.update(salt.as_bytes());
    hex::encode(hasher.finalize())
}

/// N random bytes as 2N lowercase hex chars
fn random_hex<const N: usize>() -> String {
    let mut bytes = [0u8; N];
    rand::thread_rng().fill(&mut bytes[..]);
    hex::encode(bytes)
}
