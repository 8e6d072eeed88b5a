//! Metadata client: the Metadata Store as seen by catalog components
//!
//! Wraps a [`LeaderLocator`] and retries transient failures
//! (`NotPrimary`, `Timeout`) against whichever member leads at the time.
//! A `NotPrimary` naming a leader in another process is returned at once
//! so the caller can go there.
//! Mutations are idempotent at apply time, so a retried write never
//! produces a second effect.

use crate::catalog::{CatalogState, Mutation};
use crate::common::{retry_with_backoff_while, Error, ReplicationConfig, Result};
use crate::replication::LeaderLocator;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Clone)]
pub struct MetadataClient {
    locator: Arc<dyn LeaderLocator>,
    config: ReplicationConfig,
}

impl MetadataClient {
    pub fn new(locator: Arc<dyn LeaderLocator>, config: ReplicationConfig) -> Self {
        Self { locator, config }
    }

    /// Append with majority write concern.
    pub async fn append(&self, mutation: Mutation) -> Result<u64> {
        self.append_with_cancel(mutation, &CancellationToken::new())
            .await
    }

    pub async fn append_with_cancel(
        &self,
        mutation: Mutation,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        let kind = mutation.kind();
        let index = retry_with_backoff_while(
            || {
                let mutation = mutation.clone();
                async move {
                    if cancel.is_cancelled() {
                        return Err(Error::Cancelled);
                    }
                    self.locator.primary()?.append(mutation, cancel).await
                }
            },
            self.config.retry_attempts,
            self.config.retry_delay(),
            |e| self.should_retry(e),
        )
        .await?;
        debug!(kind, index, "mutation committed");
        Ok(index)
    }

    /// Majority-confirmed read of the whole catalog.
    pub async fn read(&self) -> Result<Arc<CatalogState>> {
        retry_with_backoff_while(
            || async move { self.locator.primary()?.read().await },
            self.config.retry_attempts,
            self.config.retry_delay(),
            |e| self.should_retry(e),
        )
        .await
    }

    fn should_retry(&self, error: &Error) -> bool {
        match error {
            Error::NotPrimary(Some(leader)) => self.locator.hosts(leader),
            e => e.is_retryable(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replication::ReplicatedLog;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct RemoteLeader {
        calls: AtomicUsize,
        local: bool,
    }

    impl LeaderLocator for RemoteLeader {
        fn primary(&self) -> Result<Arc<dyn ReplicatedLog>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(Error::NotPrimary(Some("cfg-2".into())))
        }

        fn hosts(&self, _member: &str) -> bool {
            self.local
        }
    }

    fn client(local: bool) -> (MetadataClient, Arc<RemoteLeader>) {
        let locator = Arc::new(RemoteLeader {
            calls: AtomicUsize::new(0),
            local,
        });
        let mut config = ReplicationConfig::local();
        config.retry_attempts = 4;
        config.retry_delay_ms = 1;
        (MetadataClient::new(locator.clone(), config), locator)
    }

    #[tokio::test]
    async fn test_remote_leader_is_not_retried() {
        let (client, locator) = client(false);
        let err = client.read().await.unwrap_err();
        assert_eq!(err.leader_hint(), Some("cfg-2"));
        assert_eq!(locator.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_local_leader_is_retried() {
        let (client, locator) = client(true);
        assert!(client.append(Mutation::Noop).await.is_err());
        assert_eq!(locator.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_cancelled_before_admission() {
        let (client, locator) = client(true);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = client
            .append_with_cancel(Mutation::Noop, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert_eq!(locator.calls.load(Ordering::SeqCst), 0);
    }
}
