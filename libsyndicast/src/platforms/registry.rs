//! Platform → adapter lookup

use std::sync::Arc;

use super::facebook::FacebookAdapter;
use super::instagram::InstagramAdapter;
use super::stub::StubAdapter;
use super::x::XAdapter;
use super::PlatformAdapter;
use crate::config::PlatformsConfig;
use crate::error::Result;
use crate::types::Platform;

#[derive(Clone)]
enum Slot {
    Stub(Arc<StubAdapter>),
    Integrated(Arc<dyn PlatformAdapter>),
}

impl Slot {
    fn stub(platform: Platform) -> Self {
        Slot::Stub(Arc::new(StubAdapter::new(platform)))
    }

    fn adapter(&self) -> Arc<dyn PlatformAdapter> {
        match self {
            Slot::Stub(stub) => Arc::clone(stub) as Arc<dyn PlatformAdapter>,
            Slot::Integrated(adapter) => Arc::clone(adapter),
        }
    }
}

/// Holds one adapter per [`Platform`].
///
/// Each variant owns a field, so [`AdapterRegistry::get`] is total and a new
/// platform does not compile until it is given a slot. Platforms without an
/// integration are served by [`StubAdapter`].
#[derive(Clone)]
pub struct AdapterRegistry {
    instagram: Slot,
    facebook: Slot,
    x: Slot,
    linkedin: Slot,
    tiktok: Slot,
    youtube: Slot,
}

impl AdapterRegistry {
    /// Registry with every platform stubbed out
    pub fn stubs() -> Self {
        Self {
            instagram: Slot::stub(Platform::Instagram),
            facebook: Slot::stub(Platform::Facebook),
            x: Slot::stub(Platform::X),
            linkedin: Slot::stub(Platform::LinkedIn),
            tiktok: Slot::stub(Platform::TikTok),
            youtube: Slot::stub(Platform::YouTube),
        }
    }

    /// Real adapters for the supported platforms, stubs for the rest
    pub fn from_config(config: &PlatformsConfig) -> Result<Self> {
        let registry = Self::stubs()
            .with_adapter(Arc::new(InstagramAdapter::new(config.for_platform(Platform::Instagram))?))
            .with_adapter(Arc::new(FacebookAdapter::new(config.for_platform(Platform::Facebook))?))
            .with_adapter(Arc::new(XAdapter::new(config.for_platform(Platform::X))?));

        tracing::debug!(
            implemented = ?registry.implemented(),
            "Platform adapters registered"
        );
        Ok(registry)
    }

    fn slot(&self, platform: Platform) -> &Slot {
        match platform {
            Platform::Instagram => &self.instagram,
            Platform::Facebook => &self.facebook,
            Platform::X => &self.x,
            Platform::LinkedIn => &self.linkedin,
            Platform::TikTok => &self.tiktok,
            Platform::YouTube => &self.youtube,
        }
    }

    fn slot_mut(&mut self, platform: Platform) -> &mut Slot {
        match platform {
            Platform::Instagram => &mut self.instagram,
            Platform::Facebook => &mut self.facebook,
            Platform::X => &mut self.x,
            Platform::LinkedIn => &mut self.linkedin,
            Platform::TikTok => &mut self.tiktok,
            Platform::YouTube => &mut self.youtube,
        }
    }

    /// Replace the adapter registered for the adapter's platform
    pub fn with_adapter(mut self, adapter: Arc<dyn PlatformAdapter>) -> Self {
        let platform = adapter.platform();
        *self.slot_mut(platform) = Slot::Integrated(adapter);
        self
    }

    pub fn get(&self, platform: Platform) -> Arc<dyn PlatformAdapter> {
        self.slot(platform).adapter()
    }

    /// Platforms served by a registered adapter rather than a stub
    pub fn implemented(&self) -> Vec<Platform> {
        Platform::ALL
            .iter()
            .copied()
            .filter(|&p| matches!(self.slot(p), Slot::Integrated(_)))
            .collect()
    }
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        Self::stubs()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platforms::mock::MockAdapter;
    use crate::platforms::PublishRequest;

    #[test]
    fn test_every_platform_resolves() {
        let registry = AdapterRegistry::from_config(&PlatformsConfig::default()).unwrap();
        for platform in Platform::ALL {
            assert_eq!(registry.get(platform).platform(), platform);
        }
        assert!(registry.get(Platform::Instagram).supports_inbox());
        assert!(!registry.get(Platform::TikTok).supports_inbox());
        assert_eq!(
            registry.implemented(),
            vec![Platform::Instagram, Platform::Facebook, Platform::X]
        );
    }

    #[test]
    fn test_implemented_follows_registered_adapters() {
        assert!(AdapterRegistry::stubs().implemented().is_empty());

        let registry = AdapterRegistry::stubs().with_adapter(Arc::new(MockAdapter::success(Platform::TikTok)));
        assert_eq!(registry.implemented(), vec![Platform::TikTok]);
    }

    #[tokio::test]
    async fn test_with_adapter_overrides() {
        let registry = AdapterRegistry::stubs().with_adapter(Arc::new(MockAdapter::success(Platform::LinkedIn)));
        let result = registry
            .get(Platform::LinkedIn)
            .publish("token", &PublishRequest::text("hello"))
            .await;
        assert!(result.is_ok());

        let stubbed = registry
            .get(Platform::YouTube)
            .publish("token", &PublishRequest::text("hello"))
            .await;
        assert!(stubbed.is_err());
    }
}
