use smallvec::SmallVec;
use crate::gpu::handle::{Buffer, Texture};
use crate::gpu::types::{
    ResourceState, SubresourceRange, REMAINING_ARRAY_LAYERS, REMAINING_MIP_LEVELS,
};

/// A subresource range with the `REMAINING_*` sentinels expanded and the
/// counts clamped to the texture's extents. Never empty.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ResolvedRange {
    pub base_mip_level: u32,
    pub mip_level_count: u32,
    pub base_array_layer: u32,
    pub array_layer_count: u32,
}

impl ResolvedRange {
    pub fn mip_levels(&self) -> std::ops::Range<u32> {
        self.base_mip_level..self.base_mip_level + self.mip_level_count
    }

    pub fn array_layers(&self) -> std::ops::Range<u32> {
        self.base_array_layer..self.base_array_layer + self.array_layer_count
    }

    pub fn subresource_count(&self) -> u32 {
        self.mip_level_count * self.array_layer_count
    }
}

impl From<ResolvedRange> for SubresourceRange {
    fn from(range: ResolvedRange) -> Self {
        SubresourceRange::new(
            range.base_mip_level,
            range.mip_level_count,
            range.base_array_layer,
            range.array_layer_count,
        )
    }
}

/// Per-subresource state of one texture, stored row-major by array layer
/// then mip level. The table stays unallocated until the first write; reads
/// before that report `Undefined`.
#[derive(Clone, Debug)]
pub struct SubresourceStates {
    mip_levels: u32,
    array_layers: u32,
    states: Vec<ResourceState>,
}

impl SubresourceStates {
    pub fn new(mip_levels: u32, array_layers: u32) -> Self {
        Self {
            mip_levels: mip_levels.max(1),
            array_layers: array_layers.max(1),
            states: Vec::new(),
        }
    }

    pub fn mip_levels(&self) -> u32 {
        self.mip_levels
    }

    pub fn array_layers(&self) -> u32 {
        self.array_layers
    }

    pub fn is_allocated(&self) -> bool {
        !self.states.is_empty()
    }

    fn index(&self, layer: u32, level: u32) -> usize {
        (layer * self.mip_levels + level) as usize
    }

    pub fn get(&self, layer: u32, level: u32) -> ResourceState {
        if layer >= self.array_layers || level >= self.mip_levels {
            return ResourceState::Undefined;
        }
        self.states
            .get(self.index(layer, level))
            .copied()
            .unwrap_or_default()
    }

    pub fn resolve(&self, range: SubresourceRange) -> Option<ResolvedRange> {
        if range.base_mip_level >= self.mip_levels || range.base_array_layer >= self.array_layers {
            return None;
        }

        let remaining_levels = self.mip_levels - range.base_mip_level;
        let remaining_layers = self.array_layers - range.base_array_layer;

        let mip_level_count = if range.mip_level_count == REMAINING_MIP_LEVELS {
            remaining_levels
        } else {
            range.mip_level_count.min(remaining_levels)
        };
        let array_layer_count = if range.array_layer_count == REMAINING_ARRAY_LAYERS {
            remaining_layers
        } else {
            range.array_layer_count.min(remaining_layers)
        };

        if mip_level_count == 0 || array_layer_count == 0 {
            return None;
        }

        Some(ResolvedRange {
            base_mip_level: range.base_mip_level,
            mip_level_count,
            base_array_layer: range.base_array_layer,
            array_layer_count,
        })
    }

    pub fn set(&mut self, range: ResolvedRange, state: ResourceState) {
        if !self.is_allocated() {
            self.states = vec![ResourceState::Undefined; (self.mip_levels * self.array_layers) as usize];
        }
        for layer in range.array_layers() {
            let row = self.index(layer, range.base_mip_level);
            self.states[row..row + range.mip_level_count as usize].fill(state);
        }
    }

    pub fn set_all(&mut self, state: ResourceState) {
        let all = ResolvedRange {
            base_mip_level: 0,
            mip_level_count: self.mip_levels,
            base_array_layer: 0,
            array_layer_count: self.array_layers,
        };
        self.set(all, state);
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransitionTarget {
    Buffer(Buffer),
    Texture {
        texture: Texture,
        range: ResolvedRange,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PendingTransition {
    pub target: TransitionTarget,
    pub old_state: ResourceState,
    pub new_state: ResourceState,
}

/// Transitions recorded into one command list but not yet emitted as a
/// barrier batch.
#[derive(Clone, Debug, Default)]
pub struct PendingTransitions {
    entries: SmallVec<[PendingTransition; 8]>,
}

impl PendingTransitions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn as_slice(&self) -> &[PendingTransition] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Removes and returns every pending entry in request order.
    pub fn take(&mut self) -> SmallVec<[PendingTransition; 8]> {
        std::mem::take(&mut self.entries)
    }

    /// Queues a whole-buffer transition unless the buffer is already in
    /// `new_state`. Updates `current` immediately.
    pub fn request_buffer(
        &mut self,
        buffer: Buffer,
        current: &mut ResourceState,
        new_state: ResourceState,
    ) -> bool {
        if *current == new_state {
            return false;
        }
        self.entries.push(PendingTransition {
            target: TransitionTarget::Buffer(buffer),
            old_state: *current,
            new_state,
        });
        *current = new_state;
        true
    }

    /// Queues the transitions needed to move `range` of a texture into
    /// `new_state` and records the new state for the whole range.
    ///
    /// Subresources already in `new_state` produce nothing. The rest are
    /// grouped into rectangles of identical old state: consecutive mip levels
    /// with the same state form a run, and a run that continues a rectangle
    /// from the previous layer extends it instead of adding an entry.
    /// Returns how many entries were appended.
    pub fn request_texture(
        &mut self,
        texture: Texture,
        states: &mut SubresourceStates,
        range: SubresourceRange,
        new_state: ResourceState,
    ) -> usize {
        let Some(resolved) = states.resolve(range) else {
            return 0;
        };

        let first_new = self.entries.len();

        for layer in resolved.array_layers() {
            let end = resolved.base_mip_level + resolved.mip_level_count;
            let mut level = resolved.base_mip_level;

            while level < end {
                let old_state = states.get(layer, level);
                if old_state == new_state {
                    level += 1;
                    continue;
                }

                let run_start = level;
                while level < end && states.get(layer, level) == old_state {
                    level += 1;
                }
                let run_count = level - run_start;

                let continued = self.entries[first_new..].iter_mut().find(|entry| {
                    entry.old_state == old_state
                        && matches!(
                            entry.target,
                            TransitionTarget::Texture { range: r, .. }
                                if r.base_mip_level == run_start
                                    && r.mip_level_count == run_count
                                    && r.base_array_layer + r.array_layer_count == layer
                        )
                });

                match continued {
                    Some(PendingTransition {
                        target: TransitionTarget::Texture { range, .. },
                        ..
                    }) => range.array_layer_count += 1,
                    _ => self.entries.push(PendingTransition {
                        target: TransitionTarget::Texture {
                            texture,
                            range: ResolvedRange {
                                base_mip_level: run_start,
                                mip_level_count: run_count,
                                base_array_layer: layer,
                                array_layer_count: 1,
                            },
                        },
                        old_state,
                        new_state,
                    }),
                }
            }
        }

        states.set(resolved, new_state);
        self.entries.len() - first_new
    }
}

/// Collapses a flushed batch so every subresource appears in at most one
/// entry, going from its first old state to its last new state. Entries
/// emitted together in one native barrier call are unordered, so chained
/// entries must not reach the device. Chains that end where they started
/// are dropped.
pub fn coalesce(batch: &[PendingTransition]) -> SmallVec<[PendingTransition; 8]> {
    let mut out = SmallVec::new();
    let mut seen_buffers: SmallVec<[Buffer; 8]> = SmallVec::new();
    let mut seen_textures: SmallVec<[Texture; 8]> = SmallVec::new();

    for (i, first) in batch.iter().enumerate() {
        match first.target {
            TransitionTarget::Buffer(buffer) => {
                if seen_buffers.contains(&buffer) {
                    continue;
                }
                seen_buffers.push(buffer);
                let new_state = batch[i..]
                    .iter()
                    .filter(|t| t.target == first.target)
                    .last()
                    .map_or(first.new_state, |t| t.new_state);
                if new_state != first.old_state {
                    out.push(PendingTransition { new_state, ..*first });
                }
            }
            TransitionTarget::Texture { texture, .. } => {
                if seen_textures.contains(&texture) {
                    continue;
                }
                seen_textures.push(texture);
                let entries = batch[i..]
                    .iter()
                    .filter(|t| matches!(t.target, TransitionTarget::Texture { texture: other, .. } if other == texture))
                    .collect::<SmallVec<[&PendingTransition; 8]>>();
                coalesce_texture(texture, &entries, &mut out);
            }
        }
    }
    out
}

fn coalesce_texture(
    texture: Texture,
    entries: &[&PendingTransition],
    out: &mut SmallVec<[PendingTransition; 8]>,
) {
    let ranges = entries
        .iter()
        .filter_map(|t| match t.target {
            TransitionTarget::Texture { range, .. } => Some(range),
            TransitionTarget::Buffer(_) => None,
        })
        .collect::<SmallVec<[ResolvedRange; 8]>>();
    let (Some(first), Some(last)) = (entries.first(), entries.last()) else {
        return;
    };

    if ranges.iter().all(|range| *range == ranges[0]) {
        if first.old_state != last.new_state {
            out.push(PendingTransition { new_state: last.new_state, ..**first });
        }
        return;
    }

    // Overlapping but unequal ranges: resolve per subresource.
    let mip_end = ranges.iter().map(|r| r.base_mip_level + r.mip_level_count).max().unwrap_or(0);
    let layer_end = ranges.iter().map(|r| r.base_array_layer + r.array_layer_count).max().unwrap_or(0);
    let mut cells: Vec<Option<(ResourceState, ResourceState)>> =
        vec![None; (mip_end * layer_end) as usize];
    for (entry, range) in entries.iter().zip(&ranges) {
        for layer in range.array_layers() {
            for mip in range.mip_levels() {
                let cell = &mut cells[(layer * mip_end + mip) as usize];
                *cell = match *cell {
                    None => Some((entry.old_state, entry.new_state)),
                    Some((old, _)) => Some((old, entry.new_state)),
                };
            }
        }
    }

    let start = out.len();
    for layer in 0..layer_end {
        let row = &cells[(layer * mip_end) as usize..((layer + 1) * mip_end) as usize];
        let mut mip = 0;
        while mip < mip_end {
            let Some((old_state, new_state)) = row[mip as usize] else {
                mip += 1;
                continue;
            };
            let run_start = mip;
            while mip < mip_end && row[mip as usize] == Some((old_state, new_state)) {
                mip += 1;
            }
            if old_state == new_state {
                continue;
            }

            // Grow an entry from the previous layer with the same mips and states.
            let grown = out[start..].iter_mut().any(|entry| match &mut entry.target {
                TransitionTarget::Texture { range, .. }
                    if entry.old_state == old_state
                        && entry.new_state == new_state
                        && range.base_mip_level == run_start
                        && range.mip_level_count == mip - run_start
                        && range.base_array_layer + range.array_layer_count == layer =>
                {
                    range.array_layer_count += 1;
                    true
                }
                _ => false,
            });
            if !grown {
                out.push(PendingTransition {
                    target: TransitionTarget::Texture {
                        texture,
                        range: ResolvedRange {
                            base_mip_level: run_start,
                            mip_level_count: mip - run_start,
                            base_array_layer: layer,
                            array_layer_count: 1,
                        },
                    },
                    old_state,
                    new_state,
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slotmap::SlotMap;

    fn texture_handle() -> Texture {
        let mut map: SlotMap<Texture, ()> = SlotMap::with_key();
        map.insert(())
    }

    fn buffer_handle() -> Buffer {
        let mut map: SlotMap<Buffer, ()> = SlotMap::with_key();
        map.insert(())
    }

    #[test]
    fn fresh_states_are_undefined_and_unallocated() {
        let states = SubresourceStates::new(3, 4);
        for layer in 0..4 {
            for level in 0..3 {
                assert_eq!(states.get(layer, level), ResourceState::Undefined);
            }
        }
        assert!(!states.is_allocated());
    }

    #[test]
    fn sentinels_resolve_relative_to_base() {
        let states = SubresourceStates::new(5, 6);
        let range = states
            .resolve(SubresourceRange::new(2, REMAINING_MIP_LEVELS, 4, REMAINING_ARRAY_LAYERS))
            .unwrap();
        assert_eq!(range.mip_level_count, 3);
        assert_eq!(range.array_layer_count, 2);
    }

    #[test]
    fn oversized_counts_are_clamped() {
        let states = SubresourceStates::new(2, 2);
        let range = states.resolve(SubresourceRange::new(1, 10, 0, 10)).unwrap();
        assert_eq!(range.mip_level_count, 1);
        assert_eq!(range.array_layer_count, 2);
        assert!(states.resolve(SubresourceRange::new(2, 1, 0, 1)).is_none());
        assert!(states.resolve(SubresourceRange::new(0, 0, 0, 1)).is_none());
    }

    #[test]
    fn whole_texture_transition_updates_every_subresource() {
        let texture = texture_handle();
        let mut states = SubresourceStates::new(3, 2);
        let mut pending = PendingTransitions::new();

        pending.request_texture(texture, &mut states, SubresourceRange::new(1, 1, 1, 1), ResourceState::TransferDst);
        pending.clear();

        let added = pending.request_texture(texture, &mut states, SubresourceRange::ALL, ResourceState::GeneralRead);
        for layer in 0..2 {
            for level in 0..3 {
                assert_eq!(states.get(layer, level), ResourceState::GeneralRead);
            }
        }
        // Undefined above and below the TransferDst hole on layer 1 cannot
        // share a rectangle with layer 0's full column.
        assert_eq!(added, 4);
    }

    #[test]
    fn repeated_transition_is_a_no_op() {
        let texture = texture_handle();
        let mut states = SubresourceStates::new(1, 1);
        let mut pending = PendingTransitions::new();

        assert_eq!(pending.request_texture(texture, &mut states, SubresourceRange::ALL, ResourceState::ColorTarget), 1);
        assert_eq!(pending.request_texture(texture, &mut states, SubresourceRange::ALL, ResourceState::ColorTarget), 0);
        assert_eq!(pending.len(), 1);
    }

    #[test]
    fn buffer_transitions_skip_current_state() {
        let buffer = buffer_handle();
        let mut state = ResourceState::Undefined;
        let mut pending = PendingTransitions::new();

        assert!(pending.request_buffer(buffer, &mut state, ResourceState::TransferDst));
        assert!(!pending.request_buffer(buffer, &mut state, ResourceState::TransferDst));
        assert!(pending.request_buffer(buffer, &mut state, ResourceState::GeneralRead));

        let entries = pending.take();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].old_state, ResourceState::TransferDst);
        assert_eq!(state, ResourceState::GeneralRead);
        assert!(pending.is_empty());
    }

    #[test]
    fn layers_with_same_old_state_merge_into_one_entry() {
        let texture = texture_handle();
        let mut states = SubresourceStates::new(1, 4);
        let mut pending = PendingTransitions::new();

        pending.request_texture(texture, &mut states, SubresourceRange::layers(0, 2), ResourceState::ColorTarget);
        pending.clear();

        pending.request_texture(texture, &mut states, SubresourceRange::ALL, ResourceState::GeneralRead);
        let entries = pending.as_slice();
        assert_eq!(entries.len(), 2);

        assert_eq!(entries[0].old_state, ResourceState::ColorTarget);
        assert_eq!(
            entries[0].target,
            TransitionTarget::Texture {
                texture,
                range: ResolvedRange {
                    base_mip_level: 0,
                    mip_level_count: 1,
                    base_array_layer: 0,
                    array_layer_count: 2,
                },
            }
        );
        assert_eq!(entries[1].old_state, ResourceState::Undefined);
        assert_eq!(
            entries[1].target,
            TransitionTarget::Texture {
                texture,
                range: ResolvedRange {
                    base_mip_level: 0,
                    mip_level_count: 1,
                    base_array_layer: 2,
                    array_layer_count: 2,
                },
            }
        );
    }

    #[test]
    fn mip_runs_split_on_state_changes() {
        let texture = texture_handle();
        let mut states = SubresourceStates::new(4, 1);
        let mut pending = PendingTransitions::new();

        pending.request_texture(texture, &mut states, SubresourceRange::mips(1, 2), ResourceState::TransferDst);
        pending.clear();

        pending.request_texture(texture, &mut states, SubresourceRange::ALL, ResourceState::TransferDst);
        let entries = pending.as_slice();
        // Levels 0 and 3 are Undefined but not adjacent.
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().all(|e| e.old_state == ResourceState::Undefined));
    }

    #[test]
    fn merging_does_not_reach_into_earlier_requests() {
        let texture = texture_handle();
        let mut states = SubresourceStates::new(1, 2);
        let mut pending = PendingTransitions::new();

        pending.request_texture(texture, &mut states, SubresourceRange::layers(0, 1), ResourceState::TransferDst);
        pending.request_texture(texture, &mut states, SubresourceRange::layers(1, 1), ResourceState::TransferDst);
        assert_eq!(pending.len(), 2);
    }

    fn texture_transition(texture: Texture, range: ResolvedRange, old_state: ResourceState, new_state: ResourceState) -> PendingTransition {
        PendingTransition {
            target: TransitionTarget::Texture { texture, range },
            old_state,
            new_state,
        }
    }

    fn full(mips: u32, layers: u32) -> ResolvedRange {
        ResolvedRange {
            base_mip_level: 0,
            mip_level_count: mips,
            base_array_layer: 0,
            array_layer_count: layers,
        }
    }

    #[test]
    fn coalesce_merges_chains_on_one_range() {
        let texture = texture_handle();
        let batch = [
            texture_transition(texture, full(1, 1), ResourceState::Undefined, ResourceState::TransferDst),
            texture_transition(texture, full(1, 1), ResourceState::TransferDst, ResourceState::GeneralRead),
        ];
        assert_eq!(
            coalesce(&batch).as_slice(),
            &[texture_transition(texture, full(1, 1), ResourceState::Undefined, ResourceState::GeneralRead)],
        );
    }

    #[test]
    fn coalesce_drops_round_trips() {
        let buffer = buffer_handle();
        let batch = [
            PendingTransition {
                target: TransitionTarget::Buffer(buffer),
                old_state: ResourceState::GeneralRead,
                new_state: ResourceState::TransferDst,
            },
            PendingTransition {
                target: TransitionTarget::Buffer(buffer),
                old_state: ResourceState::TransferDst,
                new_state: ResourceState::GeneralRead,
            },
        ];
        assert!(coalesce(&batch).is_empty());
    }

    #[test]
    fn coalesce_splits_partial_overlaps() {
        let texture = texture_handle();
        let mip0 = ResolvedRange { mip_level_count: 1, ..full(3, 2) };
        let batch = [
            texture_transition(texture, full(3, 2), ResourceState::Undefined, ResourceState::TransferDst),
            texture_transition(texture, mip0, ResourceState::TransferDst, ResourceState::TransferSrc),
        ];
        let rest = ResolvedRange { base_mip_level: 1, mip_level_count: 2, ..full(3, 2) };
        assert_eq!(
            coalesce(&batch).as_slice(),
            &[
                texture_transition(texture, mip0, ResourceState::Undefined, ResourceState::TransferSrc),
                texture_transition(texture, rest, ResourceState::Undefined, ResourceState::TransferDst),
            ],
        );
    }

    #[test]
    fn coalesce_keeps_distinct_resources_apart() {
        let mut textures: SlotMap<Texture, ()> = SlotMap::with_key();
        let a = textures.insert(());
        let b = textures.insert(());
        let batch = [
            texture_transition(a, full(1, 1), ResourceState::Undefined, ResourceState::ColorTarget),
            texture_transition(b, full(1, 1), ResourceState::Undefined, ResourceState::TransferDst),
        ];
        assert_eq!(coalesce(&batch).as_slice(), &batch);
    }
}
