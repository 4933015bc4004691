//! Boot image resolution.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::{debug, info};

use flotilla_cloud::ComputeApi;
use flotilla_core::boot::{NODE_OS_IMAGE_OWNER, NODE_OS_RELEASE};

use crate::context::CloudContext;
use crate::error::{ProvisionError, ProvisionResult};

/// Resolved image ids keyed by `(account, zone)`.
///
/// Clones share storage, so one cache can be handed to several resolvers
/// (or kept by a test to inspect).
#[derive(Debug, Clone, Default)]
pub struct ImageCache {
    entries: Arc<Mutex<HashMap<(String, String), String>>>,
}

impl ImageCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, account: &str, zone: &str) -> Option<String> {
        self.lock()
            .get(&(account.to_string(), zone.to_string()))
            .cloned()
    }

    pub fn insert(&self, account: &str, zone: &str, image_id: String) {
        self.lock()
            .insert((account.to_string(), zone.to_string()), image_id);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<(String, String), String>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Finds the node OS image to boot.
pub struct ImageResolver {
    compute: Arc<dyn ComputeApi>,
    cache: ImageCache,
    override_image: Option<String>,
}

impl ImageResolver {
    pub fn new(compute: Arc<dyn ComputeApi>, cache: ImageCache, override_image: Option<String>) -> Self {
        Self {
            compute,
            cache,
            override_image,
        }
    }

    /// Return the override when configured; otherwise the single image
    /// published by the node OS vendor for the pinned release.
    ///
    /// Zero or several candidates is a consistency violation.
    pub async fn resolve(&self, ctx: &CloudContext) -> ProvisionResult<String> {
        if let Some(id) = &self.override_image {
            debug!(image = %id, "using configured boot image");
            return Ok(id.clone());
        }

        let zone = &ctx.cluster.zone;
        if let Some(id) = self.cache.get(&ctx.account_id, zone) {
            debug!(image = %id, zone = %zone, "boot image cache hit");
            return Ok(id);
        }

        let candidates: Vec<_> = self
            .compute
            .describe_images(NODE_OS_IMAGE_OWNER)
            .await?
            .into_iter()
            .filter(|img| {
                img.description
                    .as_deref()
                    .is_some_and(|d| d.contains(NODE_OS_RELEASE))
            })
            .collect();

        match candidates.as_slice() {
            [image] => {
                info!(image = %image.id, zone = %zone, "boot image discovered");
                self.cache.insert(&ctx.account_id, zone, image.id.clone());
                Ok(image.id.clone())
            }
            _ => Err(ProvisionError::ConsistencyViolation(format!(
                "expected exactly one '{NODE_OS_RELEASE}' image from owner {NODE_OS_IMAGE_OWNER}, found {}",
                candidates.len()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use flotilla_cloud::{SandboxCloud, SandboxKnobs};
    use flotilla_core::ImageInfo;

    async fn ctx(cloud: &SandboxCloud) -> CloudContext {
        CloudContext::resolve(cloud, "imgs", None).await.unwrap()
    }

    #[tokio::test]
    async fn discovery_is_cached_per_account_and_zone() {
        let cloud = Arc::new(SandboxCloud::new(SandboxKnobs::default()));
        let cache = ImageCache::new();
        let resolver = ImageResolver::new(cloud.clone(), cache.clone(), None);
        let ctx = ctx(&cloud).await;

        let first = resolver.resolve(&ctx).await.unwrap();
        let second = resolver.resolve(&ctx).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(cloud.calls("describe_images"), 1);
        assert_eq!(cache.get("123456789012", "us-west-2a"), Some(first));
    }

    #[tokio::test]
    async fn override_skips_discovery() {
        let cloud = Arc::new(SandboxCloud::new(SandboxKnobs::default()));
        let resolver = ImageResolver::new(cloud.clone(), ImageCache::new(), Some("ami-pinned".into()));
        let ctx = ctx(&cloud).await;
        assert_eq!(resolver.resolve(&ctx).await.unwrap(), "ami-pinned");
        assert_eq!(cloud.calls("describe_images"), 0);
    }

    #[tokio::test]
    async fn ambiguous_images_are_a_consistency_violation() {
        let mut knobs = SandboxKnobs::default();
        let mut twin = knobs.images[0].clone();
        twin.id = "ami-twin".into();
        knobs.images.push(twin);
        let cloud = Arc::new(SandboxCloud::new(knobs));
        let resolver = ImageResolver::new(cloud.clone(), ImageCache::new(), None);
        let err = resolver.resolve(&ctx(&cloud).await).await.unwrap_err();
        assert!(matches!(err, ProvisionError::ConsistencyViolation(_)));
    }

    #[tokio::test]
    async fn missing_release_is_a_consistency_violation() {
        let cloud = Arc::new(SandboxCloud::new(SandboxKnobs {
            images: vec![ImageInfo {
                id: "ami-old".into(),
                owner: NODE_OS_IMAGE_OWNER.into(),
                description: Some("stable 899.0.0".into()),
            }],
            ..SandboxKnobs::default()
        }));
        let resolver = ImageResolver::new(cloud.clone(), ImageCache::new(), None);
        let err = resolver.resolve(&ctx(&cloud).await).await.unwrap_err();
        assert!(matches!(err, ProvisionError::ConsistencyViolation(_)));
    }
}
