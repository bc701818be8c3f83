//! Partition manifest entries by origin file and order each group by part index
//!
//! Several unrelated origin files can share one manifest; their lines may be
//! interleaved. Member order comes from the numeric part index in the
//! filename, never from manifest line order or lexical filename order.

use relay_chunks::{parse_chunk_name, FIRST_PART_INDEX};
use relay_core::{ChunkEntry, RelayError, RelayResult};
use std::collections::BTreeMap;

/// Cap on the part indexes listed when a group has gaps
pub const MISSING_REPORT_LIMIT: usize = 16;

/// One chunk of an origin file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupMember {
    pub index: u32,
    pub entry: ChunkEntry,
}

/// The chunks that together reconstruct one origin file. Derived, never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OriginGroup {
    base_name: String,
    members: Vec<GroupMember>,
    split: bool,
}

impl OriginGroup {
    pub fn base_name(&self) -> &str {
        &self.base_name
    }

    /// Members in ascending part-index order
    pub fn members(&self) -> &[GroupMember] {
        &self.members
    }

    /// False for a manifest entry that names a whole file (no `.partNNN`)
    pub fn is_split(&self) -> bool {
        self.split
    }

    /// How many part indexes are absent between `FIRST_PART_INDEX` and the
    /// highest index seen
    pub fn missing_count(&self) -> u64 {
        let span = match self.members.last() {
            Some(last) => u64::from(last.index) - u64::from(FIRST_PART_INDEX) + 1,
            None => 0,
        };
        span.saturating_sub(self.members.len() as u64)
    }

    /// The first absent part indexes, at most `MISSING_REPORT_LIMIT` of them
    pub fn missing_indexes(&self) -> Vec<u32> {
        let mut missing = Vec::new();
        let mut next = FIRST_PART_INDEX;
        for m in &self.members {
            missing.extend((next..m.index).take(MISSING_REPORT_LIMIT - missing.len()));
            if missing.len() == MISSING_REPORT_LIMIT {
                break;
            }
            next = match m.index.checked_add(1) {
                Some(n) => n,
                None => break,
            };
        }
        missing
    }

    pub fn is_complete(&self) -> bool {
        self.missing_count() == 0
    }

    /// `IncompleteGroup` if there is a gap in the part sequence.
    pub fn check_complete(&self) -> RelayResult<()> {
        match self.missing_count() {
            0 => Ok(()),
            count => Err(RelayError::IncompleteGroup {
                base: self.base_name.clone(),
                count,
                missing: self.missing_indexes(),
            }),
        }
    }
}

/// Group `entries` by origin name.
///
/// Duplicate part indexes and a base name used both as a whole file and as
/// split parts are manifest inconsistencies and fail the whole call. Gaps do
/// not: they are reported per group through [`OriginGroup::check_complete`].
pub fn group(entries: &[ChunkEntry]) -> RelayResult<BTreeMap<String, OriginGroup>> {
    let mut groups: BTreeMap<String, OriginGroup> = BTreeMap::new();

    for entry in entries {
        let (base, index, split) = match parse_chunk_name(entry.filename()) {
            Some(name) => (name.base, name.index, true),
            None => (entry.filename(), FIRST_PART_INDEX, false),
        };

        let group = groups
            .entry(base.to_string())
            .or_insert_with(|| OriginGroup {
                base_name: base.to_string(),
                members: Vec::new(),
                split,
            });
        if group.split != split {
            return Err(RelayError::ConflictingOrigin {
                base: base.to_string(),
            });
        }
        group.members.push(GroupMember {
            index,
            entry: entry.clone(),
        });
    }

    for group in groups.values_mut() {
        group.members.sort_by_key(|m| m.index);
        if let Some(dup) = group.members.windows(2).find(|w| w[0].index == w[1].index) {
            return Err(RelayError::DuplicateChunkIndex {
                base: group.base_name.clone(),
                index: dup[0].index,
            });
        }
    }

    Ok(groups)
}
