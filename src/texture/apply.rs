//! The per-frame hook body: puts replacement textures into the material the game is about to draw
//! with.

use std::{
    ffi::c_void,
    sync::atomic::{AtomicPtr, Ordering},
};

use super::{context::PipelineContext, hash::TextureId};
use crate::device::{
    MaterialHandle, MaterialParameterSetter, RenderContext, Slot, TextureHandle,
};

/// Finds a replacement for a game texture: first in the swap table, then in the store by name,
/// then in the store by the content hash the bridge has for the name.
///
/// The swap table is not updated with anything found by the fallbacks.
pub fn find_replacement(context: &PipelineContext, name_hash: TextureId) -> Option<TextureHandle> {
    if let Some(texture) = context.swap_table.lookup(name_hash) {
        return Some(texture);
    }

    if let Some(texture) = context.store.texture(name_hash) {
        return Some(texture);
    }

    let content_hash = context.bridge.content_hash(name_hash)?;
    context.store.texture(content_hash)
}

/// One slot's binding. The game keeps the address of `storage`, so it is boxed and never moved or
/// reallocated while the applier exists.
struct SlotBinding {
    storage: Box<AtomicPtr<c_void>>,

    /// The texture `storage` points to. We hold one reference to it.
    bound: Option<TextureHandle>,
}

impl SlotBinding {
    fn new() -> SlotBinding {
        SlotBinding {
            storage: Box::new(AtomicPtr::new(std::ptr::null_mut())),
            bound: None,
        }
    }

    fn storage_address(&self) -> *mut *mut c_void {
        self.storage.as_ptr()
    }

    fn is_bound_to(&self, texture: &TextureHandle) -> bool {
        self.bound
            .as_ref()
            .map_or(false, |bound| bound.same_object(texture))
    }

    /// Points the storage at `texture` and passes it to the material. Returns `false` if the
    /// material rejected it, in which case the previous binding is restored.
    fn bind(
        &mut self,
        setter: &dyn MaterialParameterSetter,
        material: MaterialHandle,
        slot: Slot,
        texture: TextureHandle,
    ) -> bool {
        if self.is_bound_to(&texture) {
            return setter.set_texture_parameter(
                material,
                slot.parameter_name(),
                self.storage_address(),
            );
        }

        texture.add_ref();
        let previous = self.storage.swap(texture.as_raw(), Ordering::SeqCst);

        if !setter.set_texture_parameter(material, slot.parameter_name(), self.storage_address()) {
            self.storage.store(previous, Ordering::SeqCst);
            texture.release();
            return false;
        }

        if let Some(old) = self.bound.replace(texture) {
            old.release();
        }

        true
    }

    fn unbind(&mut self) {
        if let Some(old) = self.bound.take() {
            self.storage.store(std::ptr::null_mut(), Ordering::SeqCst);
            old.release();
        }
    }
}

/// Counters for the diagnostics readout.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ApplyStats {
    pub frames: u64,
    pub swaps: u64,
}

/// Applies replacements to the diffuse, normal and specular slots. Lives on the render thread.
pub struct SwapApplier {
    slots: [SlotBinding; 3],
    stats: ApplyStats,
}

impl SwapApplier {
    pub fn new() -> SwapApplier {
        SwapApplier {
            slots: [SlotBinding::new(), SlotBinding::new(), SlotBinding::new()],
            stats: ApplyStats::default(),
        }
    }

    /// Runs the swap for the current frame. Returns the number of slots that were given a
    /// replacement. Nothing here blocks for longer than a store bucket or swap table lookup, and
    /// nothing fails: a slot without a replacement keeps the game's own texture.
    pub fn apply(
        &mut self,
        context: &PipelineContext,
        render: &dyn RenderContext,
        setter: &dyn MaterialParameterSetter,
    ) -> usize {
        self.stats.frames += 1;

        let Some(material) = render.material().filter(|material| !material.is_null()) else {
            return 0;
        };

        let mut swapped = 0;

        for slot in Slot::ALL {
            let Some(state) = render.slot(slot) else {
                continue;
            };

            if state.name_hash == 0 {
                continue;
            }

            let Some(replacement) = find_replacement(context, state.name_hash) else {
                continue;
            };

            if self.slots[slot.index()].bind(setter, material, slot, replacement) {
                swapped += 1;
            } else {
                log::trace!("Material rejected replacement for {:?}", slot);
            }
        }

        self.stats.swaps += swapped as u64;
        swapped
    }

    pub fn stats(&self) -> ApplyStats {
        self.stats
    }

    /// Drops every slot's reference.
    pub fn release(&mut self) {
        for slot in &mut self.slots {
            slot.unbind();
        }
    }
}

impl Default for SwapApplier {
    fn default() -> Self {
        SwapApplier::new()
    }
}
