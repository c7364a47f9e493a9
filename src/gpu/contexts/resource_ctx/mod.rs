pub mod state_tracker;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use slotmap::SlotMap;
use crate::gpu::contexts::resource_ctx::state_tracker::{PendingTransitions, SubresourceStates};
use crate::gpu::handle::{
    BindingLayout, Buffer, DescriptorTable, Fence, Pipeline, Sampler, Shader, Texture,
};
use crate::gpu::types::{
    BufferBarrier, BufferDesc, ResourceState, SubresourceRange, TextureBarrier, TextureDesc,
    TextureInfo,
};

/// Native object types a backend stores behind each handle kind.
pub trait ResourceKinds {
    type Buffer;
    type Texture;
    type Sampler;
    type Shader;
    type Pipeline;
    type BindingLayout;
    type DescriptorTable;
    type Fence;
}

pub struct BufferEntry<B> {
    pub desc: BufferDesc,
    pub state: ResourceState,
    pub raw: B,
}

pub struct TextureEntry<T> {
    pub desc: TextureDesc,
    pub states: SubresourceStates,
    pub raw: T,
}

impl<T> TextureEntry<T> {
    pub fn new(desc: TextureDesc, raw: T) -> Self {
        let states = SubresourceStates::new(desc.mip_levels, desc.array_layers);
        Self { desc, states, raw }
    }

    pub fn info(&self) -> TextureInfo {
        TextureInfo {
            width: self.desc.width,
            height: self.desc.height,
            depth: self.desc.depth,
            layer_count: self.states.array_layers(),
            level_count: self.states.mip_levels(),
            format: self.desc.format,
        }
    }
}

/// Responsibilities:
/// - Own every live resource of a context behind a generational handle
/// - Track the last requested state of every buffer and texture subresource
pub struct ResourceStorage<K: ResourceKinds> {
    pub buffers: SlotMap<Buffer, BufferEntry<K::Buffer>>,
    pub textures: SlotMap<Texture, TextureEntry<K::Texture>>,
    pub samplers: SlotMap<Sampler, K::Sampler>,
    pub shaders: SlotMap<Shader, K::Shader>,
    pub pipelines: SlotMap<Pipeline, K::Pipeline>,
    pub binding_layouts: SlotMap<BindingLayout, K::BindingLayout>,
    pub descriptor_tables: SlotMap<DescriptorTable, K::DescriptorTable>,
    pub fences: SlotMap<Fence, K::Fence>,
}

impl<K: ResourceKinds> Default for ResourceStorage<K> {
    fn default() -> Self {
        Self {
            buffers: SlotMap::with_key(),
            textures: SlotMap::with_key(),
            samplers: SlotMap::with_key(),
            shaders: SlotMap::with_key(),
            pipelines: SlotMap::with_key(),
            binding_layouts: SlotMap::with_key(),
            descriptor_tables: SlotMap::with_key(),
            fences: SlotMap::with_key(),
        }
    }
}

impl<K: ResourceKinds> ResourceStorage<K> {
    pub fn buffer_state(&self, buffer: Buffer) -> ResourceState {
        self.buffers
            .get(buffer)
            .map_or(ResourceState::Undefined, |entry| entry.state)
    }

    pub fn texture_state(&self, texture: Texture, layer: u32, level: u32) -> ResourceState {
        self.textures
            .get(texture)
            .map_or(ResourceState::Undefined, |entry| entry.states.get(layer, level))
    }

    pub fn texture_info(&self, texture: Texture) -> Option<TextureInfo> {
        self.textures.get(texture).map(TextureEntry::info)
    }

    pub fn buffer_size(&self, buffer: Buffer) -> u64 {
        self.buffers.get(buffer).map_or(0, |entry| entry.desc.size_bytes)
    }

    pub fn request_buffer_transition(
        &mut self,
        pending: &mut PendingTransitions,
        buffer: Buffer,
        new_state: ResourceState,
    ) -> bool {
        let Some(entry) = self.buffers.get_mut(buffer) else {
            log::warn!("Transition requested for stale buffer handle {:?}", buffer);
            return false;
        };
        pending.request_buffer(buffer, &mut entry.state, new_state)
    }

    pub fn request_texture_transition(
        &mut self,
        pending: &mut PendingTransitions,
        texture: Texture,
        range: SubresourceRange,
        new_state: ResourceState,
    ) -> usize {
        let Some(entry) = self.textures.get_mut(texture) else {
            log::warn!("Transition requested for stale texture handle {:?}", texture);
            return 0;
        };
        pending.request_texture(texture, &mut entry.states, range, new_state)
    }

    /// Records the states set by caller-issued barriers so later tracked
    /// transitions start from what the device actually sees.
    pub fn apply_barriers(
        &mut self,
        buffer_barriers: &[BufferBarrier],
        texture_barriers: &[TextureBarrier],
    ) {
        for barrier in buffer_barriers {
            if let Some(entry) = self.buffers.get_mut(barrier.buffer) {
                entry.state = barrier.new_state;
            }
        }
        for barrier in texture_barriers {
            if let Some(entry) = self.textures.get_mut(barrier.texture) {
                if let Some(range) = entry.states.resolve(barrier.range) {
                    entry.states.set(range, barrier.new_state);
                }
            }
        }
    }
}

/// Storage shared between a context and the command lists it hands out.
pub type SharedStorage<K> = Arc<Mutex<ResourceStorage<K>>>;

pub fn new_shared_storage<K: ResourceKinds>() -> SharedStorage<K> {
    Arc::new(Mutex::new(ResourceStorage::default()))
}

/// Locks the storage. A panic while the lock was held leaves the tables
/// consistent (every mutation is a single insert, remove or state write), so
/// poisoning is ignored.
pub fn lock<K: ResourceKinds>(storage: &SharedStorage<K>) -> MutexGuard<'_, ResourceStorage<K>> {
    storage.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Plain;

    impl ResourceKinds for Plain {
        type Buffer = ();
        type Texture = ();
        type Sampler = ();
        type Shader = ();
        type Pipeline = ();
        type BindingLayout = ();
        type DescriptorTable = ();
        type Fence = ();
    }

    #[test]
    fn explicit_barriers_update_tracked_state() {
        let mut storage = ResourceStorage::<Plain>::default();
        let texture = storage.textures.insert(TextureEntry::new(
            TextureDesc {
                width: 4,
                height: 4,
                mip_levels: 2,
                array_layers: 2,
                ..Default::default()
            },
            (),
        ));

        storage.apply_barriers(
            &[],
            &[TextureBarrier {
                texture,
                range: SubresourceRange::layers(1, 1),
                old_state: ResourceState::Undefined,
                new_state: ResourceState::GeneralWrite,
            }],
        );

        assert_eq!(storage.texture_state(texture, 0, 0), ResourceState::Undefined);
        assert_eq!(storage.texture_state(texture, 1, 0), ResourceState::GeneralWrite);
        assert_eq!(storage.texture_state(texture, 1, 1), ResourceState::GeneralWrite);
    }

    #[test]
    fn stale_handles_are_ignored() {
        let mut storage = ResourceStorage::<Plain>::default();
        let buffer = storage.buffers.insert(BufferEntry {
            desc: BufferDesc::default(),
            state: ResourceState::Undefined,
            raw: (),
        });
        storage.buffers.remove(buffer);

        let mut pending = PendingTransitions::new();
        assert!(!storage.request_buffer_transition(&mut pending, buffer, ResourceState::TransferDst));
        assert!(pending.is_empty());
        assert_eq!(storage.buffer_size(buffer), 0);
    }
}
