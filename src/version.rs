//! Kubernetes and machine image version resolution.
//!
//! A [`VersionSelector`] describes which Kubernetes versions a flavor wants to
//! test, either as an explicit list or as a pattern evaluated against a
//! version catalog. The [`VersionResolver`] turns selectors into concrete
//! [`ExpirableVersion`]s and resolves `"latest"` machine image sentinels.
//!
//! # Patterns
//!
//! | Pattern | Result |
//! |---------|--------|
//! | `latest` | The single highest non-expired version |
//! | `*` | Every non-expired version, in catalog order |
//! | `<N> minors before latest` | Every non-expired `major.(minor-N).*` version |
//! | anything else | A semver range such as `~1.15`, `>=1.14, <1.16` or `1.14.x \|\| 1.16.x` |
//!
//! Explicit version lists are returned as given (expired entries included)
//! once every entry is known to parse as a version.
//!
//! # Example
//!
//! ```
//! use testmatrix::version::{ExpirableVersion, VersionResolver, VersionSelector};
//!
//! let catalog = vec![
//!     ExpirableVersion::new("1.13.5"),
//!     ExpirableVersion::new("1.14.3"),
//!     ExpirableVersion::new("1.14.4"),
//!     ExpirableVersion::new("1.15.0"),
//! ];
//!
//! let resolver = VersionResolver::new(true);
//! let versions = resolver
//!     .kubernetes_versions(&catalog, &VersionSelector::pattern("*"))
//!     .unwrap();
//!
//! let names: Vec<_> = versions.iter().map(|v| v.version.as_str()).collect();
//! assert_eq!(names, ["1.13.5", "1.14.4", "1.15.0"]);
//! ```

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use semver::{Prerelease, Version, VersionReq};
use serde::{Deserialize, Serialize};

/// Pattern selecting the highest available version.
pub const PATTERN_LATEST: &str = "latest";

/// Pattern selecting every available version.
pub const PATTERN_ALL: &str = "*";

static MINORS_BEFORE_LATEST: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d+)\s+minors?\s+before\s+latest$").expect("static regex is valid")
});

/// Result type for version resolution.
pub type ResolutionResult<T> = Result<T, ResolutionError>;

/// Errors raised when a version or pattern cannot be satisfied.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolutionError {
    /// A version string is not a valid semantic version.
    #[error("invalid version: {version}: {reason}")]
    InvalidVersion { version: String, reason: String },

    /// A pattern is neither a known keyword nor a valid version range.
    #[error("invalid version constraint {pattern:?}: {reason}")]
    InvalidConstraint { pattern: String, reason: String },

    /// Neither explicit versions nor a pattern were given.
    #[error("no kubernetes versions or patterns are defined")]
    NoSelector,

    /// The pattern matched nothing in the catalog.
    #[error("no kubernetes version matches pattern {0:?}")]
    NoMatch(String),

    /// A "minors before latest" pattern reaches below minor version 0.
    #[error("cannot go back {offset} minor versions from {latest}")]
    MinorUnderflow { latest: String, offset: u64 },

    /// The machine image is not part of the catalog.
    #[error("machine image {0:?} is not part of the catalog")]
    UnknownImage(String),

    /// No version of the machine image is usable.
    #[error("no usable version of machine image {image:?} for architecture {architecture}")]
    NoImageVersion { image: String, architecture: String },
}

/// A version that may carry an expiration date.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpirableVersion {
    /// Semantic version string, e.g. `1.15.2`.
    pub version: String,

    /// Instant after which the version is no longer offered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiration_date: Option<DateTime<Utc>>,
}

impl ExpirableVersion {
    /// Creates a version that never expires.
    pub fn new(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            expiration_date: None,
        }
    }

    /// Creates a version that expires at the given instant.
    pub fn expiring(version: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            version: version.into(),
            expiration_date: Some(at),
        }
    }

    /// Returns true if the version expired at or before `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expiration_date, Some(at) if at <= now)
    }

    /// Parses the version string.
    pub fn parse(&self) -> ResolutionResult<Version> {
        parse_version(&self.version)
    }
}

/// A machine image version and the architectures it is built for.
///
/// An empty architecture set means the image runs on any architecture.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineImageVersion {
    pub version: String,

    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub architectures: BTreeSet<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiration_date: Option<DateTime<Utc>>,
}

impl MachineImageVersion {
    /// Creates an image version built for the given architectures.
    pub fn new<I, S>(version: impl Into<String>, architectures: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            version: version.into(),
            architectures: architectures.into_iter().map(Into::into).collect(),
            expiration_date: None,
        }
    }

    /// Sets the expiration date.
    pub fn with_expiration(mut self, at: DateTime<Utc>) -> Self {
        self.expiration_date = Some(at);
        self
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expiration_date, Some(at) if at <= now)
    }

    /// Returns true if the image can run on `architecture`.
    pub fn supports(&self, architecture: &str) -> bool {
        self.architectures.is_empty() || self.architectures.contains(architecture)
    }
}

/// Selects Kubernetes versions, either explicitly or by pattern.
///
/// A non-empty explicit list takes precedence over a pattern.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionSelector {
    /// Pattern evaluated against the catalog.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,

    /// Explicit list of versions to test.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub versions: Option<Vec<ExpirableVersion>>,

    /// Overrides the global "keep only the newest patch per minor" setting.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter_patch_versions: Option<bool>,
}

impl VersionSelector {
    /// Creates a selector for a pattern.
    pub fn pattern(pattern: impl Into<String>) -> Self {
        Self {
            pattern: Some(pattern.into()),
            ..Self::default()
        }
    }

    /// Creates a selector for an explicit list of versions.
    pub fn versions<I, S>(versions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            versions: Some(versions.into_iter().map(ExpirableVersion::new).collect()),
            ..Self::default()
        }
    }

    /// Sets the per-selector patch filter override.
    pub fn with_filter_patch_versions(mut self, filter: bool) -> Self {
        self.filter_patch_versions = Some(filter);
        self
    }
}

/// Resolves version selectors against catalogs at a fixed instant.
///
/// The resolver carries the global patch filter default and the instant used
/// to decide whether a catalog entry has expired.
#[derive(Debug, Clone, Copy)]
pub struct VersionResolver {
    filter_patch_versions: bool,
    now: DateTime<Utc>,
}

impl VersionResolver {
    /// Creates a resolver evaluating expiration against the current time.
    pub fn new(filter_patch_versions: bool) -> Self {
        Self {
            filter_patch_versions,
            now: Utc::now(),
        }
    }

    /// Evaluates expiration against `now` instead of the creation time.
    pub fn at(mut self, now: DateTime<Utc>) -> Self {
        self.now = now;
        self
    }

    /// Resolves a selector against a catalog of Kubernetes versions.
    ///
    /// # Errors
    ///
    /// Returns an error if an explicit version or a catalog entry does not
    /// parse, the pattern is invalid, or nothing matches.
    pub fn kubernetes_versions(
        &self,
        catalog: &[ExpirableVersion],
        selector: &VersionSelector,
    ) -> ResolutionResult<Vec<ExpirableVersion>> {
        if let Some(versions) = selector.versions.as_ref().filter(|v| !v.is_empty()) {
            for version in versions {
                version.parse()?;
            }
            return Ok(versions.clone());
        }

        let pattern = selector
            .pattern
            .as_deref()
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .ok_or(ResolutionError::NoSelector)?;

        let candidates = self.candidates(catalog)?;
        let resolved: Vec<ExpirableVersion> = match pattern {
            PATTERN_LATEST => latest(&candidates)
                .map(|(_, v)| (*v).clone())
                .into_iter()
                .collect(),
            PATTERN_ALL => candidates.iter().map(|(_, v)| (*v).clone()).collect(),
            _ => {
                let constraint = match minors_before_latest(pattern) {
                    Some(offset) => minors_before_latest_constraint(&candidates, offset, pattern)?,
                    None => Constraint::parse(pattern)?,
                };
                candidates
                    .iter()
                    .filter(|(parsed, _)| constraint.matches(parsed))
                    .map(|(_, v)| (*v).clone())
                    .collect()
            }
        };

        let resolved = if selector
            .filter_patch_versions
            .unwrap_or(self.filter_patch_versions)
        {
            filter_patch_versions(&resolved)?
        } else {
            resolved
        };

        if resolved.is_empty() {
            return Err(ResolutionError::NoMatch(pattern.to_string()));
        }
        Ok(resolved)
    }

    /// Resolves a machine image version, replacing the `"latest"` sentinel
    /// with the highest non-expired version usable on `architecture`.
    ///
    /// Concrete versions are returned unchanged, carrying the expiration
    /// date of the matching catalog entry if there is one.
    pub fn machine_image_version(
        &self,
        images: &BTreeMap<String, Vec<MachineImageVersion>>,
        name: &str,
        version: &str,
        architecture: &str,
    ) -> ResolutionResult<ExpirableVersion> {
        if version != PATTERN_LATEST {
            let expiration_date = images
                .get(name)
                .and_then(|versions| versions.iter().find(|v| v.version == version))
                .and_then(|v| v.expiration_date);
            return Ok(ExpirableVersion {
                version: version.to_string(),
                expiration_date,
            });
        }

        let versions = images
            .get(name)
            .ok_or_else(|| ResolutionError::UnknownImage(name.to_string()))?;

        let mut best: Option<(Version, &MachineImageVersion)> = None;
        for candidate in versions
            .iter()
            .filter(|v| !v.is_expired(self.now) && v.supports(architecture))
        {
            let parsed = parse_version(&candidate.version)?;
            if best
                .as_ref()
                .is_none_or(|(b, _)| cmp_precedence(&parsed, b) == Ordering::Greater)
            {
                best = Some((parsed, candidate));
            }
        }

        best.map(|(_, v)| ExpirableVersion {
            version: v.version.clone(),
            expiration_date: v.expiration_date,
        })
        .ok_or_else(|| ResolutionError::NoImageVersion {
            image: name.to_string(),
            architecture: architecture.to_string(),
        })
    }

    /// Returns `(previous pre-patch, previous patch)` of the minor version
    /// before `current`.
    ///
    /// The previous patch is the highest non-expired `~major.(minor-1)`
    /// version and the pre-patch the second highest. Without any match both
    /// are `current`; with a single match both are that match.
    pub fn previous_kubernetes_versions(
        &self,
        catalog: &[ExpirableVersion],
        current: &ExpirableVersion,
    ) -> ResolutionResult<(ExpirableVersion, ExpirableVersion)> {
        let parsed = current.parse()?;
        if parsed.minor == 0 {
            return Ok((current.clone(), current.clone()));
        }

        let constraint = Constraint::parse(&format!("~{}.{}", parsed.major, parsed.minor - 1))?;
        let mut matches: Vec<_> = self
            .candidates(catalog)?
            .into_iter()
            .filter(|(v, _)| constraint.matches(v))
            .collect();
        matches.sort_by(|a, b| cmp_precedence(&b.0, &a.0));

        Ok(match matches.as_slice() {
            [] => (current.clone(), current.clone()),
            [(_, only)] => ((*only).clone(), (*only).clone()),
            [(_, highest), (_, second), ..] => ((*second).clone(), (*highest).clone()),
        })
    }

    fn candidates<'a>(
        &self,
        catalog: &'a [ExpirableVersion],
    ) -> ResolutionResult<Vec<(Version, &'a ExpirableVersion)>> {
        catalog
            .iter()
            .filter(|v| !v.is_expired(self.now))
            .map(|v| Ok((v.parse()?, v)))
            .collect()
    }
}

/// Keeps only the newest patch version of every `major.minor`.
///
/// Each surviving entry takes the position at which its `major.minor` first
/// appeared in the input.
pub fn filter_patch_versions(
    versions: &[ExpirableVersion],
) -> ResolutionResult<Vec<ExpirableVersion>> {
    let mut newest: Vec<(Version, &ExpirableVersion)> = Vec::new();
    let mut index: HashMap<(u64, u64), usize> = HashMap::new();

    for version in versions {
        let parsed = version.parse()?;
        match index.get(&(parsed.major, parsed.minor)) {
            Some(&i) => {
                if cmp_precedence(&newest[i].0, &parsed) == Ordering::Less {
                    newest[i] = (parsed, version);
                }
            }
            None => {
                index.insert((parsed.major, parsed.minor), newest.len());
                newest.push((parsed, version));
            }
        }
    }

    Ok(newest.into_iter().map(|(_, v)| v.clone()).collect())
}

/// Parses a version string leniently.
///
/// A leading `v` is ignored and versions with fewer than three numeric
/// components are padded with zeros, so `v1.15` reads as `1.15.0`.
pub fn parse_version(raw: &str) -> ResolutionResult<Version> {
    let trimmed = raw.trim();
    let trimmed = trimmed.strip_prefix('v').unwrap_or(trimmed);

    let err = match Version::parse(trimmed) {
        Ok(v) => return Ok(v),
        Err(e) => e,
    };

    let (core, rest) = match trimmed.find(['-', '+']) {
        Some(i) => trimmed.split_at(i),
        None => (trimmed, ""),
    };
    let parts: Vec<&str> = core.split('.').collect();
    if parts.len() < 3
        && parts
            .iter()
            .all(|p| !p.is_empty() && p.bytes().all(|b| b.is_ascii_digit()))
    {
        let padded = format!("{core}{}{rest}", ".0".repeat(3 - parts.len()));
        if let Ok(v) = Version::parse(&padded) {
            return Ok(v);
        }
    }

    Err(ResolutionError::InvalidVersion {
        version: raw.to_string(),
        reason: err.to_string(),
    })
}

/// Compares two versions by semver precedence.
///
/// Pre-releases sort below their release and build metadata is ignored.
pub fn cmp_precedence(a: &Version, b: &Version) -> Ordering {
    precedence(a).cmp(&precedence(b))
}

fn precedence(v: &Version) -> (u64, u64, u64, &Prerelease) {
    (v.major, v.minor, v.patch, &v.pre)
}

/// First highest entry by precedence.
fn latest<'a, 'b>(
    candidates: &'b [(Version, &'a ExpirableVersion)],
) -> Option<&'b (Version, &'a ExpirableVersion)> {
    candidates.iter().reduce(|best, c| {
        if cmp_precedence(&c.0, &best.0) == Ordering::Greater {
            c
        } else {
            best
        }
    })
}

fn minors_before_latest(pattern: &str) -> Option<u64> {
    MINORS_BEFORE_LATEST
        .captures(pattern)
        .and_then(|caps| caps[1].parse().ok())
}

fn minors_before_latest_constraint(
    candidates: &[(Version, &ExpirableVersion)],
    offset: u64,
    pattern: &str,
) -> ResolutionResult<Constraint> {
    let (latest, _) =
        latest(candidates).ok_or_else(|| ResolutionError::NoMatch(pattern.to_string()))?;

    let minor = i128::from(latest.minor) - i128::from(offset);
    if minor < 0 {
        return Err(ResolutionError::MinorUnderflow {
            latest: latest.to_string(),
            offset,
        });
    }
    Constraint::parse(&format!("{}.{}.*", latest.major, minor))
}

/// A version range made of `||`-separated alternatives.
///
/// Comparators without an operator match exactly, so `1.0.0` only matches
/// `1.0.0` rather than every compatible version.
#[derive(Debug)]
struct Constraint {
    alternatives: Vec<VersionReq>,
}

impl Constraint {
    fn parse(pattern: &str) -> ResolutionResult<Self> {
        let alternatives = pattern
            .split("||")
            .map(|alternative| {
                let normalized = alternative
                    .split(',')
                    .map(|c| normalize_comparator(c.trim()))
                    .collect::<Vec<_>>()
                    .join(", ");
                VersionReq::parse(&normalized).map_err(|e| ResolutionError::InvalidConstraint {
                    pattern: pattern.to_string(),
                    reason: e.to_string(),
                })
            })
            .collect::<ResolutionResult<Vec<_>>>()?;
        Ok(Self { alternatives })
    }

    fn matches(&self, version: &Version) -> bool {
        self.alternatives.iter().any(|req| req.matches(version))
    }
}

fn normalize_comparator(comparator: &str) -> String {
    let comparator = comparator.strip_prefix('v').unwrap_or(comparator);
    let is_bare = comparator.starts_with(|c: char| c.is_ascii_digit());
    let has_wildcard = comparator.contains(['*', 'x', 'X']);
    if is_bare && !has_wildcard {
        format!("={comparator}")
    } else {
        comparator.to_string()
    }
}
