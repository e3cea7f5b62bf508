use async_trait::async_trait;
use tracing::{debug, warn};

use crate::resilience::WorkError;

#[async_trait]
pub trait ResourceProvider: Send + Sync {
    type Resource: Send + Sync;

    async fn acquire(&self) -> Result<Self::Resource, WorkError>;

    async fn release(&self, _resource: Self::Resource) -> Result<(), WorkError> {
        Ok(())
    }
}

/// Owns an acquired resource until [`close`](Self::close) hands it back to
/// its provider.
///
/// `close` releases at most once no matter how often it is called. Release
/// errors are logged and swallowed so cleanup never masks the session's own
/// outcome.
pub struct ScopedResource<'p, P: ResourceProvider> {
    provider: &'p P,
    resource: Option<P::Resource>,
}

impl<'p, P: ResourceProvider> ScopedResource<'p, P> {
    pub fn new(provider: &'p P, resource: P::Resource) -> Self {
        Self {
            provider,
            resource: Some(resource),
        }
    }

    pub fn get(&self) -> Option<&P::Resource> {
        self.resource.as_ref()
    }

    pub fn is_open(&self) -> bool {
        self.resource.is_some()
    }

    /// Releases the resource. Returns `true` only on the call that actually
    /// ran the release.
    pub async fn close(&mut self) -> bool {
        let Some(resource) = self.resource.take() else {
            return false;
        };
        match self.provider.release(resource).await {
            Ok(()) => debug!("resource released"),
            Err(error) => warn!(error = %error, "resource release failed"),
        }
        true
    }
}

impl<P: ResourceProvider> Drop for ScopedResource<'_, P> {
    fn drop(&mut self) {
        if self.resource.is_some() {
            // Release is async and cannot run here.
            warn!("scoped resource dropped without close; release skipped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingProvider {
        released: AtomicUsize,
        fail_release: bool,
    }

    #[async_trait]
    impl ResourceProvider for CountingProvider {
        type Resource = u32;

        async fn acquire(&self) -> Result<u32, WorkError> {
            Ok(7)
        }

        async fn release(&self, _resource: u32) -> Result<(), WorkError> {
            self.released.fetch_add(1, Ordering::SeqCst);
            if self.fail_release {
                Err(WorkError::Resource("socket already closed".into()))
            } else {
                Ok(())
            }
        }
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let provider = CountingProvider::default();
        let resource = provider.acquire().await.unwrap();
        let mut scoped = ScopedResource::new(&provider, resource);
        assert_eq!(scoped.get(), Some(&7));
        assert!(scoped.close().await);
        assert!(!scoped.close().await);
        assert!(!scoped.is_open());
        assert_eq!(provider.released.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn release_errors_are_swallowed() {
        let provider = CountingProvider {
            fail_release: true,
            ..Default::default()
        };
        let mut scoped = ScopedResource::new(&provider, 1);
        assert!(scoped.close().await);
        assert_eq!(provider.released.load(Ordering::SeqCst), 1);
    }
}
