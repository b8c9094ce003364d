//! Scalar functions registered on every connection
//!
//! SQLite ships none of the string similarity functions the comparison
//! levels call, so they are provided here on top of `strsim`. Arguments of
//! any type are compared as text; a NULL argument yields NULL.

use regex::Regex;
use rusqlite::functions::{Context, FunctionFlags};
use rusqlite::types::ValueRef;
use rusqlite::{Connection, Result};
use sha2::{Digest, Sha256};
use std::collections::HashSet;

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

const EARTH_RADIUS_KM: f64 = 6371.0;

pub fn register_all(conn: &Connection) -> Result<()> {
    let flags = FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC;
    conn.create_scalar_function("levenshtein", 2, flags, levenshtein)?;
    conn.create_scalar_function("damerau_levenshtein", 2, flags, damerau_levenshtein)?;
    conn.create_scalar_function("jaro", 2, flags, jaro)?;
    conn.create_scalar_function("jaro_winkler", 2, flags, jaro_winkler)?;
    conn.create_scalar_function("jaccard", 2, flags, jaccard)?;
    conn.create_scalar_function("regexp_extract", 3, flags, regexp_extract)?;
    conn.create_scalar_function("seeded_uniform", 3, flags, seeded_uniform)?;
    conn.create_scalar_function("great_circle_km", 4, flags, great_circle_km)?;
    Ok(())
}

fn text_arg(ctx: &Context<'_>, idx: usize) -> Option<String> {
    match ctx.get_raw(idx) {
        ValueRef::Null => None,
        ValueRef::Integer(i) => Some(i.to_string()),
        ValueRef::Real(f) => Some(f.to_string()),
        ValueRef::Text(t) | ValueRef::Blob(t) => Some(String::from_utf8_lossy(t).into_owned()),
    }
}

fn text_pair(ctx: &Context<'_>) -> Option<(String, String)> {
    Some((text_arg(ctx, 0)?, text_arg(ctx, 1)?))
}

fn levenshtein(ctx: &Context<'_>) -> Result<Option<i64>> {
    Ok(text_pair(ctx).map(|(a, b)| strsim::levenshtein(&a, &b) as i64))
}

fn damerau_levenshtein(ctx: &Context<'_>) -> Result<Option<i64>> {
    Ok(text_pair(ctx).map(|(a, b)| strsim::damerau_levenshtein(&a, &b) as i64))
}

fn jaro(ctx: &Context<'_>) -> Result<Option<f64>> {
    Ok(text_pair(ctx).map(|(a, b)| strsim::jaro(&a, &b)))
}

fn jaro_winkler(ctx: &Context<'_>) -> Result<Option<f64>> {
    Ok(text_pair(ctx).map(|(a, b)| strsim::jaro_winkler(&a, &b)))
}

/// Jaccard similarity of the two character sets
fn jaccard(ctx: &Context<'_>) -> Result<Option<f64>> {
    Ok(text_pair(ctx).map(|(a, b)| {
        let a: HashSet<char> = a.chars().collect();
        let b: HashSet<char> = b.chars().collect();
        let union = a.union(&b).count();
        if union == 0 {
            1.0
        } else {
            a.intersection(&b).count() as f64 / union as f64
        }
    }))
}

/// `regexp_extract(value, pattern, group)`: the group of the first match, or
/// an empty string when nothing matches
fn regexp_extract(ctx: &Context<'_>) -> Result<Option<String>> {
    let re: std::sync::Arc<Regex> = ctx.get_or_create_aux(1, |vr| -> std::result::Result<_, BoxError> {
        Ok(Regex::new(vr.as_str()?)?)
    })?;
    let Some(value) = text_arg(ctx, 0) else {
        return Ok(None);
    };
    let group: i64 = ctx.get(2)?;
    let extracted = re
        .captures(&value)
        .and_then(|caps| caps.get(group.max(0) as usize))
        .map(|m| m.as_str().to_string())
        .unwrap_or_default();
    Ok(Some(extracted))
}

/// Uniform [0, 1) value determined by the seed and the row identity
pub fn uniform_from(seed: &str, dataset: &str, id: &str) -> f64 {
    let mut hasher = Sha256::new();
    hasher.update(seed.as_bytes());
    hasher.update([0u8]);
    hasher.update(dataset.as_bytes());
    hasher.update([0u8]);
    hasher.update(id.as_bytes());
    let digest = hasher.finalize();
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(bytes) >> 11) as f64 / (1u64 << 53) as f64
}

/// `seeded_uniform(seed, source_dataset, unique_id)`. The seed is read as
/// text so that seeds beyond the i64 range survive.
fn seeded_uniform(ctx: &Context<'_>) -> Result<f64> {
    let seed = text_arg(ctx, 0).unwrap_or_default();
    let dataset = text_arg(ctx, 1).unwrap_or_default();
    let id = text_arg(ctx, 2).unwrap_or_default();
    Ok(uniform_from(&seed, &dataset, &id))
}

/// Haversine distance between two points in degrees
pub fn haversine_km(lat_l: f64, lat_r: f64, lon_l: f64, lon_r: f64) -> f64 {
    let (phi_l, phi_r) = (lat_l.to_radians(), lat_r.to_radians());
    let d_phi = (lat_r - lat_l).to_radians();
    let d_lambda = (lon_r - lon_l).to_radians();
    let a = (d_phi / 2.0).sin().powi(2) + phi_l.cos() * phi_r.cos() * (d_lambda / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * a.sqrt().min(1.0).asin()
}

/// `great_circle_km(lat_l, lat_r, lon_l, lon_r)`
fn great_circle_km(ctx: &Context<'_>) -> Result<Option<f64>> {
    let mut args = [0.0; 4];
    for (i, arg) in args.iter_mut().enumerate() {
        match ctx.get::<Option<f64>>(i)? {
            Some(v) => *arg = v,
            None => return Ok(None),
        }
    }
    Ok(Some(haversine_km(args[0], args[1], args[2], args[3])))
}
