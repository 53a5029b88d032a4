//! Optional cosmetic override services.
//!
//! Each service is an independently installed plugin. It may be missing, or
//! present in a version whose API is incompatible, so every use goes through
//! [`Cosmetics::available`] which probes the version first.

use crate::CosmeticHandle;
use crate::error::Result;
use crate::object::GameObject;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter, Result as FmtResult};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CosmeticSlot {
    /// Vertical skeleton offset (heels).
    SkeletonOffset,
    /// Per-bone body scale.
    BodyScale,
    /// Full appearance/equipment state.
    Pose,
}
impl Display for CosmeticSlot {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.write_str(match self {
            CosmeticSlot::SkeletonOffset => "skeleton-offset",
            CosmeticSlot::BodyScale => "body-scale",
            CosmeticSlot::Pose => "pose",
        })
    }
}

/// How much of a pose payload to apply.
///
/// Re-applying full pose data on every minor update is visibly disruptive,
/// so updates that only touched mod files re-assert the equipment only.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PoseScope {
    Full,
    EquipmentOnly,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct ApiVersion {
    pub major: u32,
    pub minor: u32,
}
impl ApiVersion {
    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }

    /// Same major version, and at least the required minor version.
    pub fn satisfies(&self, required: &ApiVersion) -> bool {
        self.major == required.major && self.minor >= required.minor
    }
}

#[async_trait]
pub trait CosmeticService: Send + Sync {
    fn slot(&self) -> CosmeticSlot;

    /// API version of the installed service, `None` if it isn't installed.
    async fn version(&self) -> Option<ApiVersion>;

    /// Current override data of the object, `None` if it has none.
    async fn get(&self, object: &GameObject) -> Result<Option<String>>;

    /// Apply override data. Services other than [`CosmeticSlot::Pose`]
    /// ignore `scope`.
    async fn set(&self, object: &GameObject, data: &str, scope: PoseScope) -> Result<()>;

    async fn revert(&self, object: &GameObject) -> Result<()>;
}

/// The set of cosmetic services known to the process, with the API version
/// each one has to satisfy before it is used.
#[derive(Clone, Default)]
pub struct Cosmetics {
    services: BTreeMap<CosmeticSlot, (CosmeticHandle, ApiVersion)>,
}
impl Cosmetics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, service: CosmeticHandle, required: ApiVersion) -> Self {
        self.services.insert(service.slot(), (service, required));
        self
    }

    /// The service for `slot`, if one is registered and its version probe
    /// passes right now.
    pub async fn available(&self, slot: CosmeticSlot) -> Option<CosmeticHandle> {
        let (service, required) = self.services.get(&slot)?;
        match service.version().await {
            Some(version) if version.satisfies(required) => Some(service.clone()),
            Some(version) => {
                tracing::debug!(%slot, ?version, ?required, "Cosmetic service version incompatible");
                None
            },
            None => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(ApiVersion::new(2, 0), ApiVersion::new(2, 0), true)]
    #[case(ApiVersion::new(2, 3), ApiVersion::new(2, 1), true)]
    #[case(ApiVersion::new(2, 0), ApiVersion::new(2, 1), false)]
    #[case(ApiVersion::new(3, 5), ApiVersion::new(2, 1), false)]
    fn test_version_satisfies(#[case] installed: ApiVersion, #[case] required: ApiVersion, #[case] expected: bool) {
        assert_eq!(installed.satisfies(&required), expected);
    }

    #[tokio::test]
    async fn test_nothing_registered() {
        let cosmetics = Cosmetics::new();
        assert!(cosmetics.available(CosmeticSlot::Pose).await.is_none());
    }
}
