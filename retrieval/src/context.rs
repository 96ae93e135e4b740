//! Per-request session, cancellation and deadline.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, RetrievalError};

/// Identifies a personal memory session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(String);

impl SessionId {
    /// A fresh random session id.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for SessionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Calling context passed to every engine operation.
///
/// Carries the session that scopes personal memory, a cancellation token
/// and an optional deadline. Work running under [`RequestContext::run`] is
/// dropped as soon as either fires.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    session: Option<SessionId>,
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl RequestContext {
    /// A context with no session, no deadline and a fresh token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Shorthand for `RequestContext::new().with_session(session)`.
    pub fn for_session(session: impl Into<SessionId>) -> Self {
        Self::new().with_session(session)
    }

    pub fn with_session(mut self, session: impl Into<SessionId>) -> Self {
        self.session = Some(session.into());
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Use a token owned by the caller.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// The session, or `InvalidConfiguration` if none was given.
    pub fn session(&self) -> Result<&SessionId> {
        self.session.as_ref().ok_or_else(|| {
            RetrievalError::InvalidConfiguration(
                "a session id is required for personal memory operations".to_string(),
            )
        })
    }

    /// Fail fast if the request is already cancelled or past its deadline.
    pub fn check(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(RetrievalError::Cancelled);
        }
        if let Some(deadline) = self.deadline
            && Instant::now() >= deadline
        {
            return Err(RetrievalError::Timeout("deadline exceeded".to_string()));
        }
        Ok(())
    }

    /// Drive `work` until it finishes, the token is cancelled or the
    /// deadline passes. On cancellation or timeout the future is dropped.
    pub async fn run<T, F>(&self, work: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.check()?;
        let bounded = async {
            match self.deadline {
                Some(deadline) => tokio::time::timeout_at(deadline, work)
                    .await
                    .map_err(|_| RetrievalError::Timeout("deadline exceeded".to_string()))?,
                None => work.await,
            }
        };
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(RetrievalError::Cancelled),
            result = bounded => result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_missing_session_is_configuration_error() {
        let err = RequestContext::new().session().unwrap_err();
        assert!(matches!(err, RetrievalError::InvalidConfiguration(_)));

        let ctx = RequestContext::for_session("alice");
        assert_eq!(ctx.session().unwrap().as_str(), "alice");
    }

    #[test]
    fn test_generated_sessions_differ() {
        assert_ne!(SessionId::generate(), SessionId::generate());
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_becomes_timeout() {
        let ctx = RequestContext::new().with_timeout(Duration::from_secs(1));
        let err = ctx
            .run(async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, RetrievalError::Timeout(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_drops_work() {
        let token = CancellationToken::new();
        let ctx = RequestContext::new().with_cancellation(token.clone());

        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            token.cancel();
        });
        let err = ctx
            .run(async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            })
            .await
            .unwrap_err();

        assert!(matches!(err, RetrievalError::Cancelled));
        canceller.await.unwrap();
        assert!(matches!(ctx.check(), Err(RetrievalError::Cancelled)));
    }

    #[tokio::test]
    async fn test_completed_work_passes_through() {
        let ctx = RequestContext::new().with_timeout(Duration::from_secs(5));
        assert_eq!(ctx.run(async { Ok(7) }).await.unwrap(), 7);
    }
}
