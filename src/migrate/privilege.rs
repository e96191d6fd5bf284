use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tracing::{info, warn};

use super::progress::{Progress, ProgressTx};
use crate::providers::TargetClient;

/// Temporarily makes mapped users administrators so issues and notes can be
/// created as them with their original timestamps.
pub struct PrivilegeBracket {
    target: Arc<dyn TargetClient>,
    progress: ProgressTx,
}

impl PrivilegeBracket {
    pub fn new(target: Arc<dyn TargetClient>, progress: ProgressTx) -> Self {
        Self { target, progress }
    }

    /// Elevate `users`, run `body`, then de-elevate whoever was elevated here,
    /// whether `body` returned or panicked. Returns the body's value and the
    /// per-user diagnostics; elevation problems never keep the body from running.
    pub async fn run<T, F>(&self, users: &[u64], body: F) -> (T, Vec<String>)
    where
        F: Future<Output = T>,
    {
        let mut errors = Vec::new();
        let granted = self.grant(users, &mut errors).await;
        let _ = self.progress.send(Progress::PrivilegesGranted(granted.len()));

        let outcome = AssertUnwindSafe(body).catch_unwind().await;

        let revoked = self.revoke(&granted, &mut errors).await;
        let _ = self.progress.send(Progress::PrivilegesRevoked(revoked));

        match outcome {
            Ok(value) => (value, errors),
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }

    /// Returns the users actually elevated. Users already admin are left alone
    /// and will not be touched on teardown.
    async fn grant(&self, users: &[u64], errors: &mut Vec<String>) -> Vec<u64> {
        if users.is_empty() {
            return Vec::new();
        }
        let known = match self.target.list_users().await {
            Ok(known) => known,
            Err(e) => {
                warn!("failed to list {} users: {e:#}", self.target.name());
                errors.push(format!(
                    "users: could not list {} users, nobody elevated: {e:#}",
                    self.target.name()
                ));
                return Vec::new();
            }
        };

        let mut granted = Vec::new();
        for &user_id in users {
            let Some(user) = known.iter().find(|u| u.id == user_id) else {
                errors.push(format!("user {user_id}: not found on {}", self.target.name()));
                continue;
            };
            if user.is_admin == Some(true) {
                continue;
            }
            match self.target.set_admin(user_id, true).await {
                Ok(()) => {
                    info!(user = %user.username, "granted admin for migration");
                    granted.push(user_id);
                }
                Err(e) => {
                    warn!(user = %user.username, "failed to grant admin: {e:#}");
                    errors.push(format!("user {} ({user_id}): grant failed: {e:#}", user.username));
                }
            }
        }
        granted
    }

    async fn revoke(&self, granted: &[u64], errors: &mut Vec<String>) -> usize {
        let mut revoked = 0;
        for &user_id in granted {
            match self.target.set_admin(user_id, false).await {
                Ok(()) => {
                    info!(user = user_id, "revoked admin");
                    revoked += 1;
                }
                Err(e) => {
                    warn!(user = user_id, "failed to revoke admin: {e:#}");
                    errors.push(format!("user {user_id}: revoke failed: {e:#}"));
                }
            }
        }
        revoked
    }
}
