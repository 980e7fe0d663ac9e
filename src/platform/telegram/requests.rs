use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use chrono::{DateTime, Utc};

/// Expected outcomes of consuming a link request.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LinkError {
    #[error("request is not found")]
    NotFound,
    #[error("request expired")]
    Expired,
    #[error("user does not match original requester")]
    UserMismatch,
    #[error("request is not verified yet")]
    NotYetVerified,
}

/// Result of a successfully consumed link request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkedIdentity {
    /// Bot-platform user id that confirmed the request
    pub telegram_id: String,
    pub site: String,
}

/// A pending proof-of-ownership challenge, keyed by its token in the store.
#[derive(Debug, Clone)]
pub struct LinkRequest {
    pub user: String,
    pub site: String,
    pub expires_at: DateTime<Utc>,
    /// Set once the challenge is answered from the bot side.
    linked: Option<String>,
}

impl LinkRequest {
    pub fn is_confirmed(&self) -> bool {
        self.linked.is_some()
    }

    pub fn linked_identity(&self) -> Option<&str> {
        self.linked.as_deref()
    }

    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

enum Verdict {
    Expired,
    Mismatch,
    Pending,
    Ready,
}

fn judge(request: &LinkRequest, user: &str, now: DateTime<Utc>) -> Verdict {
    if request.is_expired(now) {
        Verdict::Expired
    } else if request.user != user {
        Verdict::Mismatch
    } else if !request.is_confirmed() {
        Verdict::Pending
    } else {
        Verdict::Ready
    }
}

/// Concurrency-safe map of link tokens to their requests.
#[derive(Debug, Default)]
pub struct LinkRequests {
    data: RwLock<HashMap<String, LinkRequest>>,
}

impl LinkRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite the request for `token`.
    pub fn add(&self, token: &str, user: &str, site: &str, expires_at: DateTime<Utc>) {
        let request = LinkRequest {
            user: user.to_string(),
            site: site.to_string(),
            expires_at,
            linked: None,
        };
        self.write().insert(token.to_string(), request);
    }

    /// Check the request for `token` on behalf of `user` and consume it when
    /// it has been confirmed. Expired requests are dropped on sight.
    pub fn check_and_consume(&self, token: &str, user: &str) -> Result<LinkedIdentity, LinkError> {
        let now = Utc::now();
        {
            let data = self.read();
            let request = data.get(token).ok_or(LinkError::NotFound)?;
            match judge(request, user, now) {
                Verdict::Mismatch => return Err(LinkError::UserMismatch),
                Verdict::Pending => return Err(LinkError::NotYetVerified),
                Verdict::Expired | Verdict::Ready => {}
            }
        }

        // Re-judge under the write lock: a concurrent caller may have
        // consumed the request in between.
        let mut data = self.write();
        let request = data.get(token).ok_or(LinkError::NotFound)?;
        match judge(request, user, now) {
            Verdict::Expired => {
                data.remove(token);
                Err(LinkError::Expired)
            }
            Verdict::Mismatch => Err(LinkError::UserMismatch),
            Verdict::Pending => Err(LinkError::NotYetVerified),
            Verdict::Ready => {
                let request = data.remove(token).ok_or(LinkError::NotFound)?;
                Ok(LinkedIdentity {
                    telegram_id: request.linked.unwrap_or_default(),
                    site: request.site,
                })
            }
        }
    }

    /// Mark the request for `token` as answered by `telegram_id`.
    /// Returns the request's site when it was found and still valid.
    pub fn confirm(&self, token: &str, telegram_id: &str, now: DateTime<Utc>) -> Option<String> {
        let mut data = self.write();
        let expired = data.get(token)?.is_expired(now);
        if expired {
            data.remove(token);
            return None;
        }
        let request = data.get_mut(token)?;
        request.linked = Some(telegram_id.to_string());
        Some(request.site.clone())
    }

    /// Drop every request that expired before `now`. Returns how many went.
    pub fn sweep_expired(&self, now: DateTime<Utc>) -> usize {
        let mut data = self.write();
        let before = data.len();
        data.retain(|_, request| request.expires_at >= now);
        before - data.len()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, token: &str) -> bool {
        self.read().contains_key(token)
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, LinkRequest>> {
        self.data.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, LinkRequest>> {
        self.data.write().unwrap_or_else(PoisonError::into_inner)
    }
}
