//! Mock collaborators for tests.

use std::{
    cell::RefCell,
    collections::HashSet,
    ffi::{c_void, CStr, CString},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU32, AtomicUsize, Ordering},
        Arc,
    },
};

use parking_lot::Mutex;

use crate::{
    device::{
        DecodeError, Device, MaterialHandle, MaterialParameterSetter, PixelFormat, RawTexture,
        RenderContext, Slot, SlotState, SurfaceDesc, TextureHandle,
    },
    hook::{HookError, HookInstaller},
};

/// A texture with a real reference count and an in-memory top level.
pub struct MockTexture {
    pub tag: u32,
    refs: AtomicU32,
    desc: SurfaceDesc,
    bits: Vec<u8>,
}

impl MockTexture {
    pub fn new(tag: u32, bits: Vec<u8>) -> MockTexture {
        MockTexture {
            tag,
            refs: AtomicU32::new(1),
            desc: SurfaceDesc {
                format: PixelFormat::A8R8G8B8,
                width: (bits.len() / 4) as u32,
                height: 1,
            },
            bits,
        }
    }

    /// A texture handle plus direct access to the mock behind it.
    pub fn pair(tag: u32) -> (TextureHandle, Arc<MockTexture>) {
        MockTexture::pair_with_bits(tag, tag.to_le_bytes().to_vec())
    }

    pub fn pair_with_bits(tag: u32, bits: Vec<u8>) -> (TextureHandle, Arc<MockTexture>) {
        let mock = Arc::new(MockTexture::new(tag, bits));
        (TextureHandle::from_arc(mock.clone()), mock)
    }

    pub fn handle(tag: u32) -> TextureHandle {
        MockTexture::pair(tag).0
    }

    pub fn ref_count(&self) -> u32 {
        self.refs.load(Ordering::SeqCst)
    }
}

impl RawTexture for MockTexture {
    fn add_ref(&self) -> u32 {
        self.refs.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn release(&self) -> u32 {
        let previous = self.refs.fetch_sub(1, Ordering::SeqCst);
        previous.saturating_sub(1)
    }

    fn as_raw(&self) -> *mut c_void {
        self as *const MockTexture as *mut c_void
    }

    fn with_top_level(
        &self,
        visit: &mut dyn FnMut(&SurfaceDesc, &[u8]),
    ) -> Result<(), DecodeError> {
        visit(&self.desc, &self.bits);
        Ok(())
    }
}

/// A device whose decode calls build `MockTexture`s.
///
/// File decodes read the file and use its bytes as pixel data unless the device is `instant`, in
/// which case any path succeeds without touching the disk.
pub struct MockDevice {
    refs: AtomicU32,
    instant: bool,
    failing: Mutex<HashSet<PathBuf>>,
    decoded: Mutex<Vec<Arc<MockTexture>>>,
    active: AtomicUsize,
    overlaps: AtomicUsize,
    next_tag: AtomicU32,
}

impl MockDevice {
    pub fn new() -> MockDevice {
        MockDevice {
            refs: AtomicU32::new(1),
            instant: false,
            failing: Mutex::new(HashSet::new()),
            decoded: Mutex::new(Vec::new()),
            active: AtomicUsize::new(0),
            overlaps: AtomicUsize::new(0),
            next_tag: AtomicU32::new(1),
        }
    }

    pub fn instant() -> MockDevice {
        MockDevice {
            instant: true,
            ..MockDevice::new()
        }
    }

    pub fn fail_on(&self, path: impl Into<PathBuf>) {
        self.failing.lock().insert(path.into());
    }

    pub fn ref_count(&self) -> u32 {
        self.refs.load(Ordering::SeqCst)
    }

    /// Every texture decoded so far.
    pub fn decoded(&self) -> Vec<Arc<MockTexture>> {
        self.decoded.lock().clone()
    }

    /// Number of times a decode started while another was still running.
    pub fn overlapping_decodes(&self) -> usize {
        self.overlaps.load(Ordering::SeqCst)
    }

    fn decode(&self, bits: Vec<u8>) -> TextureHandle {
        if self.active.fetch_add(1, Ordering::SeqCst) != 0 {
            self.overlaps.fetch_add(1, Ordering::SeqCst);
        }

        // Give other workers a chance to collide with us if the decode lock is missing.
        std::thread::yield_now();

        let tag = self.next_tag.fetch_add(1, Ordering::SeqCst);
        let mock = Arc::new(MockTexture::new(tag, bits));
        self.decoded.lock().push(mock.clone());

        self.active.fetch_sub(1, Ordering::SeqCst);
        TextureHandle::from_arc(mock)
    }

    fn decode_path(&self, path: &Path) -> Result<TextureHandle, DecodeError> {
        if self.failing.lock().contains(path) {
            return Err(DecodeError::Rejected(path.display().to_string()));
        }

        let bits = if self.instant {
            Vec::new()
        } else {
            std::fs::read(path).map_err(|_| DecodeError::Rejected(path.display().to_string()))?
        };

        Ok(self.decode(bits))
    }
}

impl Default for MockDevice {
    fn default() -> Self {
        MockDevice::new()
    }
}

impl Device for MockDevice {
    fn add_ref(&self) -> u32 {
        self.refs.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn release(&self) -> u32 {
        self.refs.fetch_sub(1, Ordering::SeqCst).saturating_sub(1)
    }

    fn decode_image_file(&self, path: &Path) -> Result<TextureHandle, DecodeError> {
        self.decode_path(path)
    }

    fn decode_image_from_memory(&self, bytes: &[u8]) -> Result<TextureHandle, DecodeError> {
        if bytes.is_empty() {
            return Err(DecodeError::Rejected("empty buffer".to_string()));
        }

        Ok(self.decode(bytes.to_vec()))
    }

    fn decode_volume_image_file(&self, path: &Path) -> Result<TextureHandle, DecodeError> {
        self.decode_path(path)
    }
}

/// A render context whose slots are set directly by the test.
#[derive(Default)]
pub struct MockRenderContext {
    pub material: Option<MaterialHandle>,
    pub slots: [Option<SlotState>; 3],
}

impl MockRenderContext {
    pub fn with_material() -> MockRenderContext {
        MockRenderContext {
            material: Some(MaterialHandle(0x1000 as *mut c_void)),
            slots: [None; 3],
        }
    }

    pub fn set_slot(&mut self, slot: Slot, name_hash: u32) {
        self.slots[slot.index()] = Some(SlotState {
            bound: std::ptr::null_mut(),
            name_hash,
        });
    }
}

impl RenderContext for MockRenderContext {
    fn material(&self) -> Option<MaterialHandle> {
        self.material
    }

    fn slot(&self, slot: Slot) -> Option<SlotState> {
        self.slots[slot.index()]
    }
}

/// One call made to `RecordingSetter`.
#[derive(Clone, Debug)]
pub struct SetterCall {
    pub name: CString,
    pub storage: *mut *mut c_void,

    /// What `storage` pointed to at the time of the call.
    pub value: *mut c_void,
}

/// Records parameter writes and fails for any names it was told to reject.
#[derive(Default)]
pub struct RecordingSetter {
    pub calls: RefCell<Vec<SetterCall>>,
    pub rejected: RefCell<HashSet<CString>>,
}

impl RecordingSetter {
    pub fn reject(&self, name: &CStr) {
        self.rejected.borrow_mut().insert(name.to_owned());
    }

    pub fn calls_for(&self, name: &CStr) -> Vec<SetterCall> {
        self.calls
            .borrow()
            .iter()
            .filter(|call| call.name.as_c_str() == name)
            .cloned()
            .collect()
    }
}

impl MaterialParameterSetter for RecordingSetter {
    fn set_texture_parameter(
        &self,
        _material: MaterialHandle,
        name: &CStr,
        storage: *mut *mut c_void,
    ) -> bool {
        // The applier hands us storage it owns for the lifetime of the slot.
        let value = unsafe { *storage };

        self.calls.borrow_mut().push(SetterCall {
            name: name.to_owned(),
            storage,
            value,
        });

        !self.rejected.borrow().contains(name)
    }
}

/// A hooking library that only remembers what it was asked to do. Trampolines are the target
/// address itself, so they must never be called.
#[derive(Default)]
pub struct MockHookInstaller {
    hooked: Mutex<HashSet<usize>>,
    failing: Mutex<HashSet<usize>>,
}

impl MockHookInstaller {
    pub fn fail_on(&self, target: usize) {
        self.failing.lock().insert(target);
    }

    pub fn is_hooked(&self, target: usize) -> bool {
        self.hooked.lock().contains(&target)
    }

    pub fn hooked_count(&self) -> usize {
        self.hooked.lock().len()
    }
}

impl HookInstaller for MockHookInstaller {
    unsafe fn install(&self, target: usize, _replacement: usize) -> Result<usize, HookError> {
        if self.failing.lock().contains(&target) {
            return Err(HookError::Install {
                address: target,
                reason: "refused by test".to_string(),
            });
        }

        self.hooked.lock().insert(target);
        Ok(target)
    }

    fn remove(&self, target: usize) -> Result<(), HookError> {
        if self.hooked.lock().remove(&target) {
            Ok(())
        } else {
            Err(HookError::NotInstalled(target))
        }
    }
}
