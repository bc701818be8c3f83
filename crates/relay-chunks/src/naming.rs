//! Chunk filename convention: `<base>.part<NNN>`
//!
//! `<NNN>` is a zero-padded decimal index at least `PART_INDEX_WIDTH` digits
//! wide, starting at `FIRST_PART_INDEX`. Producer and grouper both go through
//! this module so the two sides cannot disagree on the convention.

use relay_core::is_safe_chunk_name;

/// Token between the origin name and the part index
pub const PART_SEPARATOR: &str = ".part";

/// Minimum number of index digits
pub const PART_INDEX_WIDTH: usize = 3;

/// Index of the first chunk of every origin file
pub const FIRST_PART_INDEX: u32 = 0;

/// A chunk filename split into origin name and part index
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkName<'a> {
    pub base: &'a str,
    pub index: u32,
}

/// Format the filename of chunk `index` of origin `base`.
pub fn chunk_name(base: &str, index: u32) -> String {
    format!("{base}{PART_SEPARATOR}{index:0width$}", width = PART_INDEX_WIDTH)
}

/// Split `name` at the rightmost `.part` followed only by digits.
///
/// Returns `None` for names that are not chunk names; such files are whole
/// origin files on their own.
pub fn parse_chunk_name(name: &str) -> Option<ChunkName<'_>> {
    let pos = name.rfind(PART_SEPARATOR)?;
    let base = &name[..pos];
    let digits = &name[pos + PART_SEPARATOR.len()..];

    if digits.len() < PART_INDEX_WIDTH || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if !is_safe_chunk_name(base) {
        return None;
    }
    let index = digits.parse::<u32>().ok()?;
    Some(ChunkName { base, index })
}
