// src/spec/parser.rs

//! Text form of abstract specs
//!
//! Grammar, whitespace-separated:
//!
//! ```text
//! spec      := package clause*
//! package   := name [ '@' versions ]
//! clause    := '@' versions          additional version constraint
//!            | '+' variant           boolean variant on
//!            | '~' variant           boolean variant off
//!            | name '=' values       valued variant (comma = multi)
//!            | 'arch=' target        architecture constraint
//!            | '%' name ['@' versions]   compiler constraint
//!            | '^' spec              dependency constraint (attaches to root)
//! ```
//!
//! Examples: `hdf5@1.10: +mpi ~fortran io=posix %gcc@12: ^zlib@1.2.13:`.
//! Malformed text fails fast with [`Error::ParseError`]; nothing partial
//! reaches the concretizer.

use crate::error::{Error, Result};
use crate::spec::{
    AbstractSpec, CompilerConstraint, DependencyEdge, VariantConstraint, VariantValue,
};
use crate::version::VersionConstraint;

/// Parse one abstract spec from text
pub fn parse_spec(text: &str) -> Result<AbstractSpec> {
    let mut tokens = text.split_whitespace();
    let first = tokens
        .next()
        .ok_or_else(|| Error::ParseError("Empty spec".to_string()))?;
    if first.starts_with('^') {
        return Err(Error::ParseError(format!(
            "Spec cannot start with a dependency clause: '{}'",
            first
        )));
    }

    let mut root = parse_package_token(first)?;
    let mut current: Option<AbstractSpec> = None;

    for token in tokens {
        if let Some(rest) = token.strip_prefix('^') {
            // A dependency clause closes the previous one; all clauses
            // attach to the root, not to the preceding dependency.
            if let Some(done) = current.take() {
                root.deps.push(DependencyEdge::new(done));
            }
            current = Some(parse_package_token(rest)?);
            continue;
        }

        let target = current.as_mut().unwrap_or(&mut root);
        apply_clause(target, token)?;
    }

    if let Some(done) = current.take() {
        root.deps.push(DependencyEdge::new(done));
    }

    Ok(root)
}

/// Parse `name[@versions]` at the head of a spec or dependency clause
fn parse_package_token(token: &str) -> Result<AbstractSpec> {
    let (name, versions) = match token.split_once('@') {
        Some((name, versions)) => (name, Some(versions)),
        None => (token, None),
    };
    validate_name(name)?;

    let mut spec = AbstractSpec::named(name);
    if let Some(versions) = versions {
        if versions.is_empty() {
            return Err(Error::ParseError(format!(
                "Missing version constraint after '@' in '{}'",
                token
            )));
        }
        spec.versions = VersionConstraint::parse(versions)?;
    }
    Ok(spec)
}

fn apply_clause(spec: &mut AbstractSpec, token: &str) -> Result<()> {
    if let Some(versions) = token.strip_prefix('@') {
        let parsed = VersionConstraint::parse(versions)?;
        spec.versions = spec.versions.intersect(&parsed).ok_or_else(|| {
            Error::ParseError(format!(
                "Version constraints on '{}' are contradictory: {} and {}",
                spec.name, spec.versions, parsed
            ))
        })?;
        return Ok(());
    }

    if let Some(name) = token.strip_prefix('+') {
        validate_name(name)?;
        spec.variants.push(VariantConstraint::on(name));
        return Ok(());
    }

    if let Some(name) = token.strip_prefix('~') {
        validate_name(name)?;
        spec.variants.push(VariantConstraint::off(name));
        return Ok(());
    }

    if let Some(rest) = token.strip_prefix('%') {
        if spec.compiler.is_some() {
            return Err(Error::ParseError(format!(
                "Duplicate compiler constraint on '{}'",
                spec.name
            )));
        }
        let (name, versions) = match rest.split_once('@') {
            Some((name, versions)) => (name, VersionConstraint::parse(versions)?),
            None => (rest, VersionConstraint::Any),
        };
        validate_name(name)?;
        spec.compiler = Some(CompilerConstraint::new(name, versions));
        return Ok(());
    }

    if let Some((name, value)) = token.split_once('=') {
        if value.is_empty() {
            return Err(Error::ParseError(format!(
                "Missing value in '{}'",
                token
            )));
        }
        if name == "arch" {
            if spec.arch.is_some() {
                return Err(Error::ParseError(format!(
                    "Duplicate arch constraint on '{}'",
                    spec.name
                )));
            }
            spec.arch = Some(value.to_string());
        } else {
            validate_name(name)?;
            let parsed = if value.contains(',') {
                VariantValue::multi(value.split(',').filter(|v| !v.is_empty()))
            } else {
                VariantValue::Single(value.to_string())
            };
            spec.variants.push(VariantConstraint::new(name, parsed));
        }
        return Ok(());
    }

    Err(Error::ParseError(format!(
        "Unexpected token '{}' in spec for '{}'",
        token, spec.name
    )))
}

fn validate_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
        && name.chars().next().is_some_and(|c| c.is_ascii_alphanumeric());
    if valid {
        Ok(())
    } else {
        Err(Error::ParseError(format!("Invalid name: '{}'", name)))
    }
}
