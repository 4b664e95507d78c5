//! Marketing version and build number bumping

use crate::error::{ReleaseError, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BumpType {
    #[default]
    None,
    Patch,
    Minor,
    Major,
}

impl std::str::FromStr for BumpType {
    type Err = ReleaseError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(Self::None),
            "patch" => Ok(Self::Patch),
            "minor" => Ok(Self::Minor),
            "major" => Ok(Self::Major),
            other => Err(ReleaseError::Validation(format!(
                "Unknown bump type '{other}' (expected none, patch, minor or major)"
            ))),
        }
    }
}

/// `major.minor.patch`; missing trailing components read as 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MarketingVersion {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
}

impl MarketingVersion {
    pub fn parse(value: &str) -> Result<Self> {
        let parts: Vec<&str> = value.trim().split('.').collect();
        if parts.is_empty() || parts.len() > 3 || parts.iter().any(|p| p.is_empty()) {
            return Err(ReleaseError::Validation(format!(
                "Marketing version must look like 1, 1.2 or 1.2.3: '{value}'"
            )));
        }

        let mut numbers = [0u64; 3];
        for (slot, part) in numbers.iter_mut().zip(&parts) {
            *slot = part.parse().map_err(|_| {
                ReleaseError::Validation(format!(
                    "Marketing version component '{part}' is not a number in '{value}'"
                ))
            })?;
        }

        Ok(Self {
            major: numbers[0],
            minor: numbers[1],
            patch: numbers[2],
        })
    }

    pub fn bump(self, bump: BumpType) -> Result<Self> {
        Ok(match bump {
            BumpType::None => self,
            BumpType::Patch => Self {
                patch: increment(self.patch, "patch")?,
                ..self
            },
            BumpType::Minor => Self {
                minor: increment(self.minor, "minor")?,
                patch: 0,
                ..self
            },
            BumpType::Major => Self {
                major: increment(self.major, "major")?,
                minor: 0,
                patch: 0,
            },
        })
    }
}

fn increment(value: u64, component: &str) -> Result<u64> {
    value.checked_add(1).ok_or_else(|| {
        ReleaseError::Validation(format!("{component} component {value} cannot be incremented"))
    })
}

impl std::fmt::Display for MarketingVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Bump a marketing version string.
pub fn bump(version: &str, bump: BumpType) -> Result<String> {
    Ok(MarketingVersion::parse(version)?.bump(bump)?.to_string())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BuildNumber(pub u64);

impl BuildNumber {
    pub fn parse(value: &str) -> Result<Self> {
        value.trim().parse().map(Self).map_err(|_| {
            ReleaseError::Validation(format!("Build number must be a whole number: '{value}'"))
        })
    }

    pub fn next(self) -> Result<Self> {
        increment(self.0, "build number").map(Self)
    }
}

impl std::fmt::Display for BuildNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionInfo {
    pub marketing: MarketingVersion,
    pub build: BuildNumber,
}

impl VersionInfo {
    /// The build number always advances by exactly one, whatever the bump.
    pub fn next(self, bump: BumpType) -> Result<Self> {
        Ok(Self {
            marketing: self.marketing.bump(bump)?,
            build: self.build.next()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bumps_semantic_components() {
        assert_eq!(bump("1.2.3", BumpType::Major).unwrap(), "2.0.0");
        assert_eq!(bump("1.2.3", BumpType::Minor).unwrap(), "1.3.0");
        assert_eq!(bump("1.2.3", BumpType::Patch).unwrap(), "1.2.4");
        assert_eq!(bump("1.2.3", BumpType::None).unwrap(), "1.2.3");
    }

    #[test]
    fn short_versions_are_padded() {
        assert_eq!(bump("1.2", BumpType::Patch).unwrap(), "1.2.1");
        assert_eq!(bump("3", BumpType::Minor).unwrap(), "3.1.0");
    }

    #[test]
    fn rejects_garbage() {
        assert!(MarketingVersion::parse("1.x").is_err());
        assert!(MarketingVersion::parse("1..2").is_err());
        assert!(MarketingVersion::parse("1.2.3.4").is_err());
        assert!(BuildNumber::parse("12a").is_err());
    }

    #[test]
    fn build_number_always_increments_by_one() {
        let current = VersionInfo {
            marketing: MarketingVersion::parse("1.2.3").unwrap(),
            build: BuildNumber(41),
        };
        for bump in [BumpType::None, BumpType::Patch, BumpType::Minor, BumpType::Major] {
            assert_eq!(current.next(bump).unwrap().build, BuildNumber(42));
        }
    }

    #[test]
    fn increment_at_the_limit_is_rejected() {
        let at_limit = VersionInfo {
            marketing: MarketingVersion::parse("1.2.3").unwrap(),
            build: BuildNumber(u64::MAX),
        };
        assert!(matches!(
            at_limit.next(BumpType::Patch),
            Err(ReleaseError::Validation(_))
        ));

        let patch_limit = format!("1.2.{}", u64::MAX);
        assert!(bump(&patch_limit, BumpType::Patch).is_err());
        assert_eq!(bump(&patch_limit, BumpType::Minor).unwrap(), "1.3.0");
    }
}
