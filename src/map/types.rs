//! Handle types for map entities.

/// Identifier of a [`Keyframe`](super::Keyframe) within a [`Map`](super::Map).
///
/// Ids are assigned sequentially and never reused, so ordering by id is
/// insertion order. Handles of removed keyframes simply stop resolving.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KeyframeId(pub u64);

impl KeyframeId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for KeyframeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "KF{}", self.0)
    }
}

/// Identifier of a [`FeaturePoint`](super::FeaturePoint) within a [`Map`](super::Map).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FeaturePointId(pub u64);

impl FeaturePointId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for FeaturePointId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "FP{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_order_by_value() {
        assert!(KeyframeId::new(1) < KeyframeId::new(2));
        assert_eq!(FeaturePointId::new(7), FeaturePointId(7));
    }

    #[test]
    fn test_display() {
        assert_eq!(KeyframeId::new(3).to_string(), "KF3");
        assert_eq!(FeaturePointId::new(123).to_string(), "FP123");
    }
}
