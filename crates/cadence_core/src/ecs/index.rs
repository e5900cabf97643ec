//! # Archetype Index
//!
//! Reverse index from component kind to the archetypes containing it.
//!
//! A query touches only the index rows of its include and exclude kinds.
//! Every entry carries the archetype's kind count and smallest/largest kind
//! id, which rejects most non-matching archetypes before they are counted.

use super::archetype::ArchetypeId;
use super::component::{ComponentId, ComponentSequence};

/// One archetype listed under one kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IndexEntry {
    /// The archetype.
    pub archetype: ArchetypeId,
    /// Number of kinds in its sequence.
    pub kind_count: usize,
    /// Smallest kind id in its sequence.
    pub min_kind: ComponentId,
    /// Largest kind id in its sequence.
    pub max_kind: ComponentId,
}

/// Component kind -> archetypes, rebuilt when the store is dirty.
#[derive(Clone, Debug, Default)]
pub struct ArchetypeIndex {
    /// Entries of kind `id` at index `id`, in discovery order.
    by_kind: Vec<Vec<IndexEntry>>,
    archetype_count: usize,
}

impl ArchetypeIndex {
    /// Builds the index from every archetype sequence, in discovery order.
    #[must_use]
    pub fn build<'a>(kind_count: usize, sequences: impl IntoIterator<Item = (ArchetypeId, &'a ComponentSequence)>) -> Self {
        let mut by_kind = vec![Vec::new(); kind_count + 1];
        let mut archetype_count = 0;

        for (archetype, sequence) in sequences {
            archetype_count = archetype_count.max(archetype.index() + 1);
            let (Some(min_kind), Some(max_kind)) = (sequence.min(), sequence.max()) else {
                continue;
            };
            let entry = IndexEntry {
                archetype,
                kind_count: sequence.len(),
                min_kind,
                max_kind,
            };
            for kind in sequence.iter() {
                if let Some(slot) = by_kind.get_mut(kind.index()) {
                    slot.push(entry);
                }
            }
        }

        Self {
            by_kind,
            archetype_count,
        }
    }

    /// Archetypes whose sequence contains every `include` kind and no
    /// `exclude` kind, in discovery order.
    ///
    /// An empty include set matches nothing.
    #[must_use]
    pub fn find(&self, include: &[ComponentId], exclude: &[ComponentId]) -> Vec<ArchetypeId> {
        let include = ComponentSequence::new(include.iter().copied());
        let (Some(min), Some(max)) = (include.min(), include.max()) else {
            return Vec::new();
        };
        // A kind nobody registered can't be in any archetype.
        if include.iter().any(|kind| self.entries(kind).is_none()) {
            return Vec::new();
        }

        let mut hits = vec![0usize; self.archetype_count];
        let mut excluded = vec![false; self.archetype_count];

        for kind in include.iter() {
            for entry in self.entries(kind).unwrap_or_default() {
                if entry.kind_count >= include.len() && entry.min_kind <= min && entry.max_kind >= max {
                    hits[entry.archetype.index()] += 1;
                }
            }
        }
        for kind in exclude {
            for entry in self.entries(*kind).unwrap_or_default() {
                excluded[entry.archetype.index()] = true;
            }
        }

        // Entries under any single include kind are in discovery order.
        self.entries(min)
            .unwrap_or_default()
            .iter()
            .map(|entry| entry.archetype)
            .filter(|archetype| hits[archetype.index()] == include.len() && !excluded[archetype.index()])
            .collect()
    }

    /// Entries listed under `kind`.
    #[must_use]
    pub fn entries(&self, kind: ComponentId) -> Option<&[IndexEntry]> {
        if kind.is_invalid() {
            return None;
        }
        self.by_kind.get(kind.index()).map(Vec::as_slice)
    }

    /// Number of archetypes covered.
    #[inline]
    #[must_use]
    pub fn archetype_count(&self) -> usize {
        self.archetype_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seq(raw: &[u16]) -> ComponentSequence {
        ComponentSequence::new(raw.iter().copied().map(ComponentId::new))
    }

    fn kinds(raw: &[u16]) -> Vec<ComponentId> {
        raw.iter().copied().map(ComponentId::new).collect()
    }

    fn index(sequences: &[ComponentSequence]) -> ArchetypeIndex {
        let kind_count = 4;
        ArchetypeIndex::build(
            kind_count,
            sequences
                .iter()
                .enumerate()
                .map(|(i, s)| (ArchetypeId(u32::try_from(i).unwrap()), s)),
        )
    }

    #[test]
    fn test_include_exclude_in_discovery_order() {
        let sequences = [seq(&[1, 2]), seq(&[1]), seq(&[1, 2, 3]), seq(&[2, 3])];
        let index = index(&sequences);

        assert_eq!(index.find(&kinds(&[1]), &[]), vec![ArchetypeId(0), ArchetypeId(1), ArchetypeId(2)]);
        assert_eq!(index.find(&kinds(&[2, 1]), &[]), vec![ArchetypeId(0), ArchetypeId(2)]);
        assert_eq!(index.find(&kinds(&[1]), &kinds(&[3])), vec![ArchetypeId(0), ArchetypeId(1)]);
        assert_eq!(index.find(&kinds(&[3]), &kinds(&[1])), vec![ArchetypeId(3)]);
    }

    #[test]
    fn test_empty_and_unknown_include() {
        let sequences = [seq(&[1, 2])];
        let index = index(&sequences);
        assert!(index.find(&[], &kinds(&[1])).is_empty());
        assert!(index.find(&kinds(&[9]), &[]).is_empty());
        assert!(index.find(&kinds(&[4]), &[]).is_empty());
    }

    #[test]
    fn test_duplicate_include_counts_once() {
        let sequences = [seq(&[1, 2])];
        let index = index(&sequences);
        assert_eq!(index.find(&kinds(&[2, 2, 1]), &[]), vec![ArchetypeId(0)]);
    }
}
