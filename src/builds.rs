//! The build identifier model.
//!
//! Every published artifact is identified by a structured basename such as
//! `clang-r219899-t2014-10-15_20-42-53-b808.tgz` or
//! `apple-clang-11.0.0-GM2.tar.gz`. This module parses those names into a
//! [`Build`], serializes them back, and defines the total ordering used to
//! keep a builder's stream sorted by recency.

use std::cmp::Ordering;
use std::fmt;
use std::slice;
use std::sync::OnceLock;

use regex::Regex;

/// A build's revision component.
///
/// Plain CI builds carry a single monotonic number (`-r219899`, or
/// `-d334015-<sha>` for distance-based revisions); release-style builds
/// carry a dotted version tuple (`9.0.1`). Ordering is element-wise, with
/// `Numbered(n)` treated as the one-element tuple `[n]`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Revision {
    Numbered(u64),
    Dotted(Vec<u64>),
}

impl Revision {
    fn components(&self) -> &[u64] {
        match self {
            Revision::Numbered(n) => slice::from_ref(n),
            Revision::Dotted(v) => v,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Revision::Numbered(n) => Some(*n),
            Revision::Dotted(_) => None,
        }
    }
}

impl PartialOrd for Revision {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Revision {
    fn cmp(&self, other: &Self) -> Ordering {
        self.components().cmp(other.components())
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Revision::Numbered(n) => write!(f, "{n}"),
            Revision::Dotted(v) => {
                let dotted: Vec<String> = v.iter().map(|c| c.to_string()).collect();
                write!(f, "{}", dotted.join("."))
            }
        }
    }
}

/// A build's trailing build-number component: `-b808` for plain builds,
/// a capitalized tag such as `Beta` or `GM2` for release-style builds.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum BuildNumber {
    Num(u64),
    Tag(String),
}

impl fmt::Display for BuildNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BuildNumber::Num(n) => write!(f, "{n}"),
            BuildNumber::Tag(s) => write!(f, "{s}"),
        }
    }
}

/// One published, immutable compiler artifact.
///
/// Constructed by parsing a basename from a repository listing, or from a
/// user-typed partial name when resolving a fetch target. Immutable after
/// construction. `source_url` is an opaque fetch handle and never part of
/// the serialized name.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Build {
    pub name: String,
    pub revision_prefix: Option<char>,
    pub revision: Option<Revision>,
    pub sha: Option<String>,
    pub timestamp: Option<String>,
    pub build_number: Option<BuildNumber>,
    pub suffix: Option<String>,
    pub source_url: Option<String>,
}

fn release_name_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^([A-Za-z][A-Za-z-]*?)-([0-9]+)(?:\.([0-9]+)(?:\.([0-9]+))?)?-([A-Z][A-Za-z0-9]+)(?:\.(.+))?$")
            .unwrap()
    })
}

fn build_number_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(.*)-b([0-9]+)$").unwrap())
}

fn timestamp_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(.*)-t([0-9-]{8,10}_[0-9-]{6,8})$").unwrap())
}

fn distance_revision_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(.*)-d([0-9]+)-(.*)$").unwrap())
}

fn plain_revision_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(.*)-r([0-9]+)$").unwrap())
}

impl Build {
    /// Parses a basename (or a path whose final component is a basename)
    /// into a `Build`. Never fails: components that match nothing stay in
    /// `name` and `revision` is left unset.
    pub fn from_basename(s: &str, source_url: Option<String>) -> Build {
        let basename = s.rsplit('/').next().unwrap_or(s);

        // Release-style names win outright: the dotted version tuple is
        // self-describing and carries no revision prefix character.
        if let Some(caps) = release_name_regex().captures(basename) {
            let mut version = vec![caps[2].parse().unwrap_or(0)];
            if let Some(minor) = caps.get(3) {
                version.push(minor.as_str().parse().unwrap_or(0));
                if let Some(micro) = caps.get(4) {
                    version.push(micro.as_str().parse().unwrap_or(0));
                }
            }
            return Build {
                name: caps[1].to_string(),
                revision_prefix: None,
                revision: Some(Revision::Dotted(version)),
                sha: None,
                timestamp: None,
                build_number: Some(BuildNumber::Tag(caps[5].to_string())),
                suffix: caps.get(6).map(|m| m.as_str().to_string()),
                source_url,
            };
        }

        let mut rest = basename.to_string();
        let mut revision_prefix = None;
        let mut revision = None;
        let mut sha = None;
        let mut timestamp = None;
        let mut build_number = None;

        let suffix = match rest.find('.') {
            Some(i) => {
                let suffix = rest[i + 1..].to_string();
                rest.truncate(i);
                Some(suffix)
            }
            None => None,
        };

        if let Some(caps) = build_number_regex().captures(&rest) {
            if let Ok(n) = caps[2].parse() {
                build_number = Some(BuildNumber::Num(n));
                rest = caps[1].to_string();
            }
        }

        if let Some(caps) = timestamp_regex().captures(&rest) {
            timestamp = Some(caps[2].to_string());
            rest = caps[1].to_string();
        }

        if let Some(caps) = distance_revision_regex().captures(&rest) {
            if let Ok(n) = caps[2].parse() {
                revision = Some(Revision::Numbered(n));
                sha = Some(caps[3].to_string());
                revision_prefix = Some('d');
                rest = caps[1].to_string();
            }
        }

        if let Some(caps) = plain_revision_regex().captures(&rest) {
            if let Ok(n) = caps[2].parse() {
                revision = Some(Revision::Numbered(n));
                revision_prefix = Some('r');
                rest = caps[1].to_string();
            }
        }

        Build {
            name: rest,
            revision_prefix,
            revision,
            sha,
            timestamp,
            build_number,
            suffix,
            source_url,
        }
    }

    /// Reconstructs the canonical basename. Exact inverse of
    /// [`Build::from_basename`] for every parse-produced value.
    pub fn to_basename(&self, include_suffix: bool) -> String {
        let mut basename = self.name.clone();
        match &self.revision {
            Some(dotted @ Revision::Dotted(_)) => {
                basename.push('-');
                basename.push_str(&dotted.to_string());
            }
            Some(Revision::Numbered(n)) => {
                basename.push('-');
                basename.push(self.revision_prefix.unwrap_or('r'));
                basename.push_str(&n.to_string());
            }
            None => {}
        }
        if let Some(sha) = &self.sha {
            basename.push('-');
            basename.push_str(sha);
        }
        if let Some(timestamp) = &self.timestamp {
            basename.push_str("-t");
            basename.push_str(timestamp);
        }
        match &self.build_number {
            Some(BuildNumber::Tag(tag)) => {
                basename.push('-');
                basename.push_str(tag);
            }
            Some(BuildNumber::Num(n)) => {
                basename.push_str("-b");
                basename.push_str(&n.to_string());
            }
            None => {}
        }
        if include_suffix {
            if let Some(suffix) = &self.suffix {
                basename.push('.');
                basename.push_str(suffix);
            }
        }
        basename
    }

    /// The ordering key: newer builds sort greater. `sha` and `source_url`
    /// do not participate.
    fn sort_key(
        &self,
    ) -> (
        Option<&Revision>,
        Option<&str>,
        Option<&BuildNumber>,
        Option<&str>,
        &str,
    ) {
        (
            self.revision.as_ref(),
            self.timestamp.as_deref(),
            self.build_number.as_ref(),
            self.suffix.as_deref(),
            &self.name,
        )
    }
}

impl PartialOrd for Build {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Build {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sort_key().cmp(&other.sort_key())
    }
}
