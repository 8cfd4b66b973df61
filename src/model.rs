//! Model identities, their registry images and serving variants

use crate::error::NimError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Logical model served by a NIM container.
///
/// The canonical name doubles as the container name, so it must stay stable
/// across process restarts for orphan detection to work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ModelIdentity {
    #[serde(rename = "FLUX_DEV")]
    FluxDev,
    #[serde(rename = "FLUX_CANNY")]
    FluxCanny,
    #[serde(rename = "FLUX_DEPTH")]
    FluxDepth,
    #[serde(rename = "FLUX_SCHNELL")]
    FluxSchnell,
}

impl ModelIdentity {
    pub const ALL: [ModelIdentity; 4] = [
        ModelIdentity::FluxDev,
        ModelIdentity::FluxCanny,
        ModelIdentity::FluxDepth,
        ModelIdentity::FluxSchnell,
    ];

    /// Canonical name, also used as the container name
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelIdentity::FluxDev => "FLUX_DEV",
            ModelIdentity::FluxCanny => "FLUX_CANNY",
            ModelIdentity::FluxDepth => "FLUX_DEPTH",
            ModelIdentity::FluxSchnell => "FLUX_SCHNELL",
        }
    }

    /// Container image that realizes this model
    pub fn image(&self) -> &'static str {
        match self {
            ModelIdentity::FluxDev | ModelIdentity::FluxCanny | ModelIdentity::FluxDepth => {
                "nvcr.io/nim/black-forest-labs/flux.1-dev:1.1.0"
            }
            ModelIdentity::FluxSchnell => "nvcr.io/nim/black-forest-labs/flux.1-schnell:1.0.0",
        }
    }

    /// Serving variant passed to the container as `NIM_MODEL_VARIANT`
    pub fn variant(&self) -> Variant {
        match self {
            ModelIdentity::FluxCanny => Variant::Canny,
            ModelIdentity::FluxDepth => Variant::Depth,
            ModelIdentity::FluxDev | ModelIdentity::FluxSchnell => Variant::Base,
        }
    }

    /// Distilled models accept few steps and no guidance scale
    pub fn is_distilled(&self) -> bool {
        matches!(self, ModelIdentity::FluxSchnell)
    }
}

impl fmt::Display for ModelIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModelIdentity {
    type Err = NimError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ModelIdentity::ALL
            .into_iter()
            .find(|m| m.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| NimError::UnknownModel(s.to_string()))
    }
}

/// Serving mode selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Variant {
    Base,
    Canny,
    Depth,
}

impl Variant {
    pub fn as_str(&self) -> &'static str {
        match self {
            Variant::Base => "base",
            Variant::Canny => "canny",
            Variant::Depth => "depth",
        }
    }

    /// Guided variants need a conditioning image
    pub fn requires_image(&self) -> bool {
        !matches!(self, Variant::Base)
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where the container may offload weights when GPU memory is short
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OffloadingPolicy {
    None,
    #[serde(alias = "System RAM")]
    SystemRam,
    Disk,
    #[default]
    Default,
}

impl OffloadingPolicy {
    /// Value for `NIM_OFFLOADING_POLICY`
    pub fn env_value(&self) -> &'static str {
        match self {
            OffloadingPolicy::None => "none",
            OffloadingPolicy::SystemRam => "system_ram",
            OffloadingPolicy::Disk => "disk",
            OffloadingPolicy::Default => "default",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_variant_mapping() {
        assert_eq!(ModelIdentity::FluxDev.variant(), Variant::Base);
        assert_eq!(ModelIdentity::FluxCanny.variant(), Variant::Canny);
        assert_eq!(ModelIdentity::FluxDepth.variant(), Variant::Depth);
        assert_eq!(ModelIdentity::FluxSchnell.variant(), Variant::Base);
    }

    #[test]
    fn test_name_round_trip() {
        for model in ModelIdentity::ALL {
            assert_eq!(model.as_str().parse::<ModelIdentity>().unwrap(), model);
        }
        assert_eq!(
            "flux_canny".parse::<ModelIdentity>().unwrap(),
            ModelIdentity::FluxCanny
        );
    }

    #[test]
    fn test_unknown_model_rejected() {
        let err = "FLUX_PRO".parse::<ModelIdentity>().unwrap_err();
        assert!(matches!(err, NimError::UnknownModel(name) if name == "FLUX_PRO"));
    }

    #[test]
    fn test_guided_variants_share_dev_image() {
        assert_eq!(ModelIdentity::FluxCanny.image(), ModelIdentity::FluxDev.image());
        assert_eq!(ModelIdentity::FluxDepth.image(), ModelIdentity::FluxDev.image());
        assert_ne!(ModelIdentity::FluxSchnell.image(), ModelIdentity::FluxDev.image());
    }

    #[test]
    fn test_offloading_env_values() {
        assert_eq!(OffloadingPolicy::SystemRam.env_value(), "system_ram");
        assert_eq!(OffloadingPolicy::default().env_value(), "default");
    }

    #[test]
    fn test_serde_uses_canonical_names() {
        let json = serde_json::to_string(&ModelIdentity::FluxSchnell).unwrap();
        assert_eq!(json, "\"FLUX_SCHNELL\"");
        let policy: OffloadingPolicy = serde_json::from_str("\"system_ram\"").unwrap();
        assert_eq!(policy, OffloadingPolicy::SystemRam);
    }
}
