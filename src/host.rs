//! Reading the game's render state straight out of its memory.

use std::ffi::c_void;

use crate::{
    device::{MaterialHandle, RenderContext, Slot, SlotState},
    settings::HostLayout,
};

/// Reads a pointer-sized value. Returns `None` for null.
///
/// # Safety
/// `address` must be readable.
unsafe fn read_ptr(address: usize) -> Option<usize> {
    let value = (address as *const usize).read_unaligned();
    (value != 0).then_some(value)
}

unsafe fn read_u32(address: usize) -> u32 {
    (address as *const u32).read_unaligned()
}

/// The render context as laid out in the game executable. Only valid on the render thread, while
/// the material hook is running.
pub struct MemoryRenderContext<'layout> {
    layout: &'layout HostLayout,
}

impl<'layout> MemoryRenderContext<'layout> {
    /// # Safety
    /// Every address in `layout` must be readable for as long as the context is used, and every
    /// non-null pointer found through them must point to the structure the layout says it does.
    pub unsafe fn new(layout: &'layout HostLayout) -> MemoryRenderContext<'layout> {
        MemoryRenderContext { layout }
    }

    fn wrapper(&self, slot: Slot) -> Option<usize> {
        unsafe { read_ptr(self.layout.wrappers[slot.index()]) }
    }
}

impl RenderContext for MemoryRenderContext<'_> {
    fn material(&self) -> Option<MaterialHandle> {
        // Nothing is drawn with a material that has no diffuse texture.
        self.wrapper(Slot::Diffuse)?;

        let context = unsafe { read_ptr(self.layout.render_context) }?;
        let material = unsafe { read_ptr(context + self.layout.material_offset) }?;

        Some(MaterialHandle(material as *mut c_void))
    }

    fn slot(&self, slot: Slot) -> Option<SlotState> {
        let wrapper = self.wrapper(slot)?;

        let bound = unsafe { read_ptr(wrapper) }
            .and_then(|inner| unsafe { read_ptr(inner + self.layout.texture_offset) })
            .unwrap_or(0);

        Some(SlotState {
            bound: bound as *mut c_void,
            name_hash: unsafe { read_u32(wrapper + self.layout.name_hash_offset) },
        })
    }
}

/// Sets material parameters through the material's own vtable.
#[cfg(all(windows, target_arch = "x86"))]
pub mod material {
    use std::ffi::{c_char, c_void, CStr};

    use crate::device::{MaterialHandle, MaterialParameterSetter};

    const GET_PARAMETER_SLOT: usize = 0x28 / 4;
    const SET_VALUE_SLOT: usize = 0x50 / 4;

    type GetParameterFn = unsafe extern "system" fn(
        this: *mut c_void,
        parent: *const c_void,
        name: *const c_char,
    ) -> *const c_void;

    type SetValueFn = unsafe extern "system" fn(
        this: *mut c_void,
        parameter: *const c_void,
        data: *const c_void,
        size: u32,
    ) -> i32;

    pub struct VtableMaterialSetter;

    impl MaterialParameterSetter for VtableMaterialSetter {
        fn set_texture_parameter(
            &self,
            material: MaterialHandle,
            name: &CStr,
            storage: *mut *mut c_void,
        ) -> bool {
            if material.is_null() {
                return false;
            }

            unsafe {
                let vtable = *(material.0 as *const *const usize);

                let get_parameter: GetParameterFn =
                    std::mem::transmute(*vtable.add(GET_PARAMETER_SLOT));
                let parameter = get_parameter(material.0, std::ptr::null(), name.as_ptr());

                if parameter.is_null() {
                    return false;
                }

                let set_value: SetValueFn = std::mem::transmute(*vtable.add(SET_VALUE_SLOT));

                // The material reads the texture through `storage` later, so it gets the address
                // of the slot's storage rather than the texture pointer itself.
                set_value(
                    material.0,
                    parameter,
                    storage as *const c_void,
                    std::mem::size_of::<*mut c_void>() as u32,
                );
            }

            true
        }
    }
}

/// Process-wide entry points for the host's plugin loader.
#[cfg(all(windows, target_arch = "x86"))]
pub mod shell {
    use std::{path::Path, sync::Arc};

    use once_cell::sync::Lazy;
    use parking_lot::RwLock;

    use super::{material::VtableMaterialSetter, MemoryRenderContext};
    use crate::{
        device::Device,
        hook::HookInstaller,
        plugin::{HookEntries, TextureReplacer},
        settings::Options,
    };

    static ACTIVE: Lazy<RwLock<Option<Arc<TextureReplacer>>>> = Lazy::new(|| RwLock::new(None));

    fn active() -> Option<Arc<TextureReplacer>> {
        ACTIVE.read().clone()
    }

    extern "C" fn load_hook_entry() {
        let Some(replacer) = active() else {
            return;
        };

        replacer.reload_paths();

        if let Some(original) = replacer.original_load() {
            original();
        }
    }

    extern "C" fn frame_hook_entry() {
        let Some(replacer) = active() else {
            return;
        };

        // We're inside the game's material setup, so its render state is live.
        let render = unsafe { MemoryRenderContext::new(&replacer.options().host) };
        replacer.on_frame(&render, &VtableMaterialSetter);

        if let Some(original) = replacer.original_frame() {
            original();
        }
    }

    /// Reads the settings from the game directory, sets up logging and enables texture
    /// replacement. Failing leaves the game untouched.
    pub fn activate(game_dir: &Path, installer: Arc<dyn HookInstaller>) -> eyre::Result<()> {
        let options = Options::load_from_game_dir(game_dir);
        crate::logging::init(&options.log_file)?;

        log::info!("Game directory is {}", game_dir.display());

        let entries = HookEntries {
            load: load_hook_entry,
            frame: frame_hook_entry,
        };

        let replacer = TextureReplacer::enable(options, installer, entries)?;
        *ACTIVE.write() = Some(Arc::new(replacer));

        Ok(())
    }

    /// Hands the game's device to the loader once it exists.
    pub fn attach_device(device: Arc<dyn Device>) -> usize {
        active().map_or(0, |replacer| replacer.attach_device(device))
    }

    /// Turns texture replacement off. Pass `true` when the process is exiting.
    pub fn deactivate(process_exiting: bool) {
        let Some(replacer) = ACTIVE.write().take() else {
            return;
        };

        if process_exiting {
            replacer.set_shutting_down();
        }

        replacer.disable();
    }
}
