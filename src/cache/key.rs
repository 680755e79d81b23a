//! Deterministic, length-bounded cache keys.

use itertools::Itertools;
use lazy_static::lazy_static;
use regex::Regex;
use sha1::{Digest, Sha1};

use crate::schema::Json;

/// Keys longer than this are replaced by their SHA-1 hex digest
pub const MAX_KEY_LENGTH: usize = 64;

pub const LOCK_PREFIX: &str = "petrel.lock";

lazy_static! {
    static ref UNSAFE_CHARS: Regex = Regex::new(r"[^A-Za-z0-9_]").unwrap();
}

/// Kind of query a key caches
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyKind {
    One,
    List,
    Count,
}

impl KeyKind {
    pub fn tag(&self) -> &'static str {
        match self {
            KeyKind::One => "o",
            KeyKind::List => "l",
            KeyKind::Count => "c",
        }
    }
}

fn is_falsy(part: &Json) -> bool {
    match part {
        Json::Null => true,
        Json::Bool(b) => !b,
        Json::Number(n) => n.as_f64() == Some(0.0),
        Json::String(s) => s.is_empty() || s == "0",
        Json::Array(items) => items.is_empty(),
        Json::Object(map) => map.is_empty(),
    }
}

/// Render key parts into a transport-safe fragment: falsy parts are dropped,
/// composite parts JSON-encoded, operator characters spelled out and anything
/// else outside `[A-Za-z0-9_]` removed.
///
/// `!` and `=` are spelled out (`not`, `eq`) along with `<` and `>`. Stripping
/// them would give `>` and `>=` (or `=` and `!=`) the same key.
pub fn canonicalize(parts: &[Json]) -> String {
    let joined = parts
        .iter()
        .filter(|part| !is_falsy(part))
        .map(|part| match part {
            Json::String(s) => s.clone(),
            other => other.to_string(),
        })
        .join("_");

    let spelled = joined
        .replace([':', ','], "_")
        .replace('<', "lt")
        .replace('>', "gt")
        .replace('!', "not")
        .replace('=', "eq");
    UNSAFE_CHARS.replace_all(&spelled, "").into_owned()
}

/// Hash keys that exceed [`MAX_KEY_LENGTH`]
pub fn bound(key: String) -> String {
    if key.len() > MAX_KEY_LENGTH {
        hex::encode(Sha1::digest(key.as_bytes()))
    } else {
        key
    }
}

/// `{connection}.{table}.v{version}.{kind}.{parts}`, hashed when too long
pub fn build_key(
    connection: &str,
    table: &str,
    version: u32,
    kind: KeyKind,
    parts: &[Json],
) -> String {
    bound(format!(
        "{connection}.{table}.v{version}.{}.{}",
        kind.tag(),
        canonicalize(parts)
    ))
}

/// Key of a pessimistic lock; kept apart from query keys by its prefix
pub fn lock_key(parts: &[Json]) -> String {
    bound(format!("{LOCK_PREFIX}.{}", canonicalize(parts)))
}
