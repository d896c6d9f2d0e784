// src/version/mod.rs

//! Version model and constraint satisfaction
//!
//! Versions are ordered sequences of numeric and alphabetic segments parsed
//! from tokens like `1.2.3`, `2.0b2`, or `develop`. A handful of named
//! references (`develop`, `main`, ...) stand for source-control tips and sort
//! above every numeric release. Constraints are inclusive ranges with either
//! bound open, or enumerated lists; intersection is associative and
//! commutative so requirements from multiple parents merge order-independently.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// Named source-control references, newest-first. Anything in this list
/// sorts above every numeric release; among themselves, earlier is newer.
const INFINITY_NAMES: &[&str] = &["develop", "main", "master", "head", "trunk"];

/// One parsed version component
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Segment {
    Num(u64),
    Alpha(String),
}

impl Segment {
    fn cmp_segment(&self, other: &Segment) -> Ordering {
        match (self, other) {
            (Segment::Num(a), Segment::Num(b)) => a.cmp(b),
            (Segment::Alpha(a), Segment::Alpha(b)) => a.cmp(b),
            // Numeric components are releases; alphabetic ones are suffixes
            // like `1.2a`, which sort below the numbered patch they precede.
            (Segment::Num(_), Segment::Alpha(_)) => Ordering::Greater,
            (Segment::Alpha(_), Segment::Num(_)) => Ordering::Less,
        }
    }
}

/// An ordered, comparable package version
#[derive(Debug, Clone, Eq)]
pub struct Version {
    original: String,
    segments: Vec<Segment>,
    /// Index into INFINITY_NAMES when this is a named source-control tip
    infinity_rank: Option<usize>,
}

impl Version {
    /// Parse a version token
    ///
    /// Segments split on `.`, `-`, `_` and at digit/letter boundaries:
    /// `2.0b2` parses as `[2, 0, "b", 2]`. Named references like `develop`
    /// are recognized and sort above all numeric versions.
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Err(Error::ParseError("Empty version token".to_string()));
        }

        if let Some(rank) = INFINITY_NAMES.iter().position(|n| *n == s) {
            return Ok(Self {
                original: s.to_string(),
                segments: Vec::new(),
                infinity_rank: Some(rank),
            });
        }

        let mut segments = Vec::new();
        for part in s.split(['.', '-', '_']) {
            if part.is_empty() {
                return Err(Error::ParseError(format!(
                    "Empty segment in version '{}'",
                    s
                )));
            }
            let mut chars = part.chars().peekable();
            while let Some(&c) = chars.peek() {
                if c.is_ascii_digit() {
                    let mut num = String::new();
                    while let Some(&d) = chars.peek() {
                        if !d.is_ascii_digit() {
                            break;
                        }
                        num.push(d);
                        chars.next();
                    }
                    let value = num.parse::<u64>().map_err(|e| {
                        Error::ParseError(format!("Bad numeric segment in '{}': {}", s, e))
                    })?;
                    segments.push(Segment::Num(value));
                } else if c.is_ascii_alphabetic() {
                    let mut alpha = String::new();
                    while let Some(&a) = chars.peek() {
                        if !a.is_ascii_alphabetic() {
                            break;
                        }
                        alpha.push(a);
                        chars.next();
                    }
                    segments.push(Segment::Alpha(alpha));
                } else {
                    return Err(Error::ParseError(format!(
                        "Invalid character '{}' in version '{}'",
                        c, s
                    )));
                }
            }
        }

        Ok(Self {
            original: s.to_string(),
            segments,
            infinity_rank: None,
        })
    }

    /// True for named source-control references like `develop`
    pub fn is_scm_ref(&self) -> bool {
        self.infinity_rank.is_some()
    }

    /// The token this version was parsed from
    pub fn as_str(&self) -> &str {
        &self.original
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl std::hash::Hash for Version {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        // Equality ignores the original token, so hash the parsed form only
        self.segments.hash(state);
        self.infinity_rank.hash(state);
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self.infinity_rank, other.infinity_rank) {
            // Earlier in INFINITY_NAMES means newer
            (Some(a), Some(b)) => b.cmp(&a),
            (Some(_), None) => Ordering::Greater,
            (None, Some(_)) => Ordering::Less,
            (None, None) => {
                let n = self.segments.len().max(other.segments.len());
                for i in 0..n {
                    match (self.segments.get(i), other.segments.get(i)) {
                        (Some(a), Some(b)) => match a.cmp_segment(b) {
                            Ordering::Equal => continue,
                            ord => return ord,
                        },
                        // Missing trailing segments sort lowest: 1.2 < 1.2.1
                        (None, Some(_)) => return Ordering::Less,
                        (Some(_), None) => return Ordering::Greater,
                        (None, None) => unreachable!(),
                    }
                }
                Ordering::Equal
            }
        }
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.original)
    }
}

impl FromStr for Version {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl Serialize for Version {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.original)
    }
}

impl<'de> Deserialize<'de> for Version {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Version::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// An inclusive version range; either bound may be open
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VersionRange {
    pub lo: Option<Version>,
    pub hi: Option<Version>,
}

impl VersionRange {
    pub fn new(lo: Option<Version>, hi: Option<Version>) -> Self {
        Self { lo, hi }
    }

    /// The degenerate range holding exactly one version
    pub fn exact(v: Version) -> Self {
        Self {
            lo: Some(v.clone()),
            hi: Some(v),
        }
    }

    pub fn is_exact(&self) -> bool {
        matches!((&self.lo, &self.hi), (Some(a), Some(b)) if a == b)
    }

    pub fn contains(&self, v: &Version) -> bool {
        if let Some(lo) = &self.lo
            && v < lo
        {
            return false;
        }
        if let Some(hi) = &self.hi
            && v > hi
        {
            return false;
        }
        true
    }

    /// Intersect two ranges; None means the intersection is empty
    pub fn intersect(&self, other: &VersionRange) -> Option<VersionRange> {
        // An open bound is unbounded, so it never tightens the result.
        // This is NOT the none-extreme min/max: those propagate None.
        let lo = match (&self.lo, &other.lo) {
            (None, x) | (x, None) => x.clone(),
            (Some(a), Some(b)) => Some(if a >= b { a.clone() } else { b.clone() }),
        };
        let hi = match (&self.hi, &other.hi) {
            (None, x) | (x, None) => x.clone(),
            (Some(a), Some(b)) => Some(if a <= b { a.clone() } else { b.clone() }),
        };
        if let (Some(l), Some(h)) = (&lo, &hi)
            && l > h
        {
            return None;
        }
        Some(VersionRange { lo, hi })
    }
}

impl fmt::Display for VersionRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.lo, &self.hi) {
            (Some(a), Some(b)) if a == b => write!(f, "{}", a),
            (Some(a), Some(b)) => write!(f, "{}:{}", a, b),
            (Some(a), None) => write!(f, "{}:", a),
            (None, Some(b)) => write!(f, ":{}", b),
            (None, None) => write!(f, ":"),
        }
    }
}

/// A version constraint: anything, one range, or an enumerated list
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VersionConstraint {
    /// Any version is acceptable
    Any,
    /// A single inclusive range
    Range(VersionRange),
    /// An enumerated set of ranges and exact versions
    List(Vec<VersionRange>),
}

impl VersionConstraint {
    pub fn exact(v: Version) -> Self {
        Self::Range(VersionRange::exact(v))
    }

    /// Parse constraint text: `1.4`, `1.2:`, `:1.5`, `2.1:2.9`, `1.0,1.2:1.4`
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() || s == ":" {
            return Ok(Self::Any);
        }

        let mut ranges = Vec::new();
        for part in s.split(',') {
            let part = part.trim();
            if part.is_empty() {
                return Err(Error::ParseError(format!(
                    "Empty element in version list '{}'",
                    s
                )));
            }
            ranges.push(Self::parse_range(part)?);
        }

        if ranges.len() == 1 {
            Ok(Self::Range(ranges.pop().expect("one range")))
        } else {
            let mut list = Self::List(ranges);
            list.canonicalize();
            Ok(list)
        }
    }

    fn parse_range(part: &str) -> Result<VersionRange> {
        if let Some((lo, hi)) = part.split_once(':') {
            let lo = if lo.is_empty() {
                None
            } else {
                Some(Version::parse(lo)?)
            };
            let hi = if hi.is_empty() {
                None
            } else {
                Some(Version::parse(hi)?)
            };
            Ok(VersionRange::new(lo, hi))
        } else {
            Ok(VersionRange::exact(Version::parse(part)?))
        }
    }

    /// Sort list elements deterministically: open lows first, then by bound
    fn canonicalize(&mut self) {
        if let Self::List(ranges) = self {
            ranges.sort_by(|a, b| {
                none_low::cmp(a.lo.as_ref(), b.lo.as_ref())
                    .then_with(|| none_high::cmp(a.hi.as_ref(), b.hi.as_ref()))
            });
            ranges.dedup();
        }
    }

    /// Does a concrete version satisfy this constraint?
    pub fn satisfies(&self, v: &Version) -> bool {
        match self {
            Self::Any => true,
            Self::Range(r) => r.contains(v),
            Self::List(ranges) => ranges.iter().any(|r| r.contains(v)),
        }
    }

    /// Intersect two constraints; `None` means no version can satisfy both.
    ///
    /// Associative and commutative, so merging requirements from multiple
    /// parents is order-independent.
    pub fn intersect(&self, other: &VersionConstraint) -> Option<VersionConstraint> {
        match (self, other) {
            (Self::Any, x) | (x, Self::Any) => Some(x.clone()),
            (Self::Range(a), Self::Range(b)) => a.intersect(b).map(Self::Range),
            (Self::Range(r), Self::List(list)) | (Self::List(list), Self::Range(r)) => {
                let kept: Vec<VersionRange> =
                    list.iter().filter_map(|x| x.intersect(r)).collect();
                Self::from_ranges(kept)
            }
            (Self::List(a), Self::List(b)) => {
                let mut kept = Vec::new();
                for x in a {
                    for y in b {
                        if let Some(r) = x.intersect(y) {
                            kept.push(r);
                        }
                    }
                }
                Self::from_ranges(kept)
            }
        }
    }

    fn from_ranges(mut ranges: Vec<VersionRange>) -> Option<VersionConstraint> {
        match ranges.len() {
            0 => None,
            1 => Some(Self::Range(ranges.pop().expect("one range"))),
            _ => {
                let mut list = Self::List(ranges);
                list.canonicalize();
                Some(list)
            }
        }
    }

    /// The single version this constraint pins, if it pins one
    pub fn as_exact(&self) -> Option<&Version> {
        match self {
            Self::Range(r) if r.is_exact() => r.lo.as_ref(),
            _ => None,
        }
    }

    pub fn is_any(&self) -> bool {
        matches!(self, Self::Any)
    }
}

impl Default for VersionConstraint {
    fn default() -> Self {
        VersionConstraint::Any
    }
}

impl fmt::Display for VersionConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Any => write!(f, ":"),
            Self::Range(r) => write!(f, "{}", r),
            Self::List(ranges) => {
                let parts: Vec<String> = ranges.iter().map(|r| r.to_string()).collect();
                write!(f, "{}", parts.join(","))
            }
        }
    }
}

/// Comparison over possibly-absent values where `None` sorts lowest.
///
/// `min`/`max` return `None` whenever either operand is `None`: the sentinel
/// propagates instead of being elided. Callers that want the elision
/// semantics must unwrap first.
pub mod none_low {
    use std::cmp::Ordering;

    pub fn cmp<T: Ord>(a: Option<&T>, b: Option<&T>) -> Ordering {
        match (a, b) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Less,
            (Some(_), None) => Ordering::Greater,
            (Some(x), Some(y)) => x.cmp(y),
        }
    }

    pub fn lt<T: Ord>(a: Option<&T>, b: Option<&T>) -> bool {
        cmp(a, b) == Ordering::Less
    }

    pub fn min<'a, T: Ord>(a: Option<&'a T>, b: Option<&'a T>) -> Option<&'a T> {
        match (a, b) {
            (Some(x), Some(y)) => Some(if x <= y { x } else { y }),
            _ => None,
        }
    }

    pub fn max<'a, T: Ord>(a: Option<&'a T>, b: Option<&'a T>) -> Option<&'a T> {
        match (a, b) {
            (Some(x), Some(y)) => Some(if x >= y { x } else { y }),
            _ => None,
        }
    }
}

/// Comparison over possibly-absent values where `None` sorts highest.
///
/// Same propagation rule as [`none_low`]: `min`/`max` return `None` whenever
/// either operand is `None`.
pub mod none_high {
    use std::cmp::Ordering;

    pub fn cmp<T: Ord>(a: Option<&T>, b: Option<&T>) -> Ordering {
        match (a, b) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Greater,
            (Some(_), None) => Ordering::Less,
            (Some(x), Some(y)) => x.cmp(y),
        }
    }

    pub fn lt<T: Ord>(a: Option<&T>, b: Option<&T>) -> bool {
        cmp(a, b) == Ordering::Less
    }

    pub fn min<'a, T: Ord>(a: Option<&'a T>, b: Option<&'a T>) -> Option<&'a T> {
        match (a, b) {
            (Some(x), Some(y)) => Some(if x <= y { x } else { y }),
            _ => None,
        }
    }

    pub fn max<'a, T: Ord>(a: Option<&'a T>, b: Option<&'a T>) -> Option<&'a T> {
        match (a, b) {
            (Some(x), Some(y)) => Some(if x >= y { x } else { y }),
            _ => None,
        }
    }
}
