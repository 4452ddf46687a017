//! PostgreSQL version extraction from image references.

use semver::Version;

/// Parse the PostgreSQL version out of an image tag.
///
/// Accepts `repo/postgresql:16`, `postgres:16.2`, `postgres:16.2-bookworm`
/// and digest-pinned references. Returns `None` for untagged or
/// non-numeric tags such as `latest`.
pub fn image_version(image: &str) -> Option<Version> {
    let without_digest = image.split('@').next()?;
    let (repo, tag) = without_digest.rsplit_once(':')?;
    // `host:port/repo` without a tag.
    if tag.contains('/') || repo.is_empty() {
        return None;
    }

    let (core, suffix) = match tag.split_once('-') {
        Some((core, suffix)) => (core, Some(suffix)),
        None => (tag, None),
    };
    let mut parts: Vec<&str> = core.split('.').collect();
    if parts.is_empty() || parts.len() > 3 {
        return None;
    }
    while parts.len() < 3 {
        parts.push("0");
    }
    let mut normalized = parts.join(".");
    if let Some(suffix) = suffix {
        normalized.push('-');
        normalized.push_str(suffix);
    }
    Version::parse(&normalized).ok()
}

pub fn major_version(image: &str) -> Option<u64> {
    image_version(image).map(|v| v.major)
}

/// Whether moving from `current` to `desired` stays within one major
/// version. Unknown versions are assumed compatible.
pub fn same_major(current: &str, desired: &str) -> bool {
    match (major_version(current), major_version(desired)) {
        (Some(a), Some(b)) => a == b,
        _ => true,
    }
}
