//! Supported CLIP checkpoints

use std::fmt;
use std::str::FromStr;

use burn_cgd_core::CgdError;
use serde::{Deserialize, Serialize};

/// CLIP model variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ClipVariant {
    #[default]
    VitB32,
    VitB16,
    Rn50,
    Rn101,
    Rn50x4,
    Rn50x16,
}

impl ClipVariant {
    pub const ALL: [ClipVariant; 6] = [
        ClipVariant::VitB32,
        ClipVariant::VitB16,
        ClipVariant::Rn50,
        ClipVariant::Rn101,
        ClipVariant::Rn50x4,
        ClipVariant::Rn50x16,
    ];

    /// Checkpoint name as published
    pub fn name(&self) -> &'static str {
        match self {
            ClipVariant::VitB32 => "ViT-B/32",
            ClipVariant::VitB16 => "ViT-B/16",
            ClipVariant::Rn50 => "RN50",
            ClipVariant::Rn101 => "RN101",
            ClipVariant::Rn50x4 => "RN50x4",
            ClipVariant::Rn50x16 => "RN50x16",
        }
    }

    /// Side length of the image tower's input
    pub fn input_resolution(&self) -> usize {
        match self {
            ClipVariant::VitB32 | ClipVariant::VitB16 | ClipVariant::Rn50 | ClipVariant::Rn101 => {
                224
            }
            ClipVariant::Rn50x4 => 288,
            ClipVariant::Rn50x16 => 384,
        }
    }

    /// Width of the joint embedding space
    pub fn embed_dim(&self) -> usize {
        match self {
            ClipVariant::VitB32 | ClipVariant::VitB16 | ClipVariant::Rn101 => 512,
            ClipVariant::Rn50 => 1024,
            ClipVariant::Rn50x4 => 640,
            ClipVariant::Rn50x16 => 768,
        }
    }
}

impl FromStr for ClipVariant {
    type Err = CgdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|v| v.name().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| {
                let names: Vec<&str> = Self::ALL.iter().map(|v| v.name()).collect();
                CgdError::config(format!(
                    "unknown CLIP model '{s}', expected one of: {}",
                    names.join(", ")
                ))
            })
    }
}

impl fmt::Display for ClipVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl TryFrom<String> for ClipVariant {
    type Error = CgdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ClipVariant> for String {
    fn from(value: ClipVariant) -> Self {
        value.name().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_names() {
        for variant in ClipVariant::ALL {
            assert_eq!(variant.name().parse::<ClipVariant>().unwrap(), variant);
        }
        assert_eq!("vit-b/32".parse::<ClipVariant>().unwrap(), ClipVariant::VitB32);
        assert!("ViT-L/14".parse::<ClipVariant>().is_err());
    }

    #[test]
    fn test_resolutions() {
        assert_eq!(ClipVariant::VitB32.input_resolution(), 224);
        assert_eq!(ClipVariant::Rn50x4.input_resolution(), 288);
        assert_eq!(ClipVariant::Rn50x16.input_resolution(), 384);
        assert_eq!(ClipVariant::Rn50.embed_dim(), 1024);
    }
}
