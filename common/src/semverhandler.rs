use crate::{Error, Result};
use semver::Version;

#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct Semver {
    pub version: Version,
    pub use_v: bool,
}
// brokers report things like "5.1.0", "v5.0.3" or "5.8.0-g1234abcd"
impl Semver {
    pub fn parse(str: &str) -> Result<Self> {
        let use_v = str.starts_with("v");
        let version = if use_v {
            let mut chars = str.chars();
            chars.next();
            Version::parse(chars.as_str()).map_err(Error::Semver)?
        } else {
            Version::parse(str).map_err(Error::Semver)?
        };
        Ok(Self { version, use_v })
    }

    pub fn opt_parse(str: &str) -> Option<Self> {
        Self::parse(str).ok()
    }

    /// Compare on major.minor.patch only, pre-release tags are build flavours here
    pub fn is_at_least(&self, major: u64, minor: u64, patch: u64) -> bool {
        (self.version.major, self.version.minor, self.version.patch) >= (major, minor, patch)
    }
}

impl std::fmt::Display for Semver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.use_v {
            write!(f, "v{}", self.version)
        } else {
            write!(f, "{}", self.version)
        }
    }
}
