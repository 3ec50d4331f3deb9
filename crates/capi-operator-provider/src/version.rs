//! Semantic version handling for provider releases
//!
//! Release tags carry a `v` prefix (`v1.4.3`); comparison strips it and
//! uses semver ordering, where a pre-release sorts below its release.

use capi_operator_common::Error;
use semver::Version;

/// Parse a release tag or bare version.
pub fn parse_version(value: &str) -> Result<Version, Error> {
    let trimmed = value.strip_prefix('v').unwrap_or(value);
    Version::parse(trimmed)
        .map_err(|_| Error::validation(format!("could not parse \"{}\" as version", value)))
}

/// Whether moving from `installed` to `target` lowers the major or minor.
///
/// Patch-level decreases are allowed.
pub fn is_downgrade(installed: &Version, target: &Version) -> bool {
    target.major < installed.major
        || (target.major == installed.major && target.minor < installed.minor)
}

/// Highest version in a list of tags.
///
/// Tags that are not strict semver are ignored. Pre-releases are only
/// considered when no release exists at all.
pub fn latest_version<S: AsRef<str>>(tags: &[S]) -> Option<String> {
    let parsed: Vec<(Version, &str)> = tags
        .iter()
        .filter_map(|t| parse_version(t.as_ref()).ok().map(|v| (v, t.as_ref())))
        .collect();

    let releases = parsed.iter().filter(|(v, _)| v.pre.is_empty());
    let best = match releases.max_by(|a, b| a.0.cmp(&b.0)) {
        Some(best) => Some(best),
        None => parsed.iter().max_by(|a, b| a.0.cmp(&b.0)),
    };
    best.map(|(_, tag)| tag.to_string())
}

/// Whether two tags name the same version (`v1.2.3` == `1.2.3`)
pub fn same_version(a: &str, b: &str) -> bool {
    match (parse_version(a), parse_version(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}
