//! Interfaces to the rendering device and the texture objects it creates.
//!
//! Everything the plugin needs from Direct3D goes through the traits in this module, so that the
//! pipeline can be driven by the real device inside the game or by mocks in tests.

use std::{ffi::c_void, fmt, path::Path, sync::Arc};

use thiserror::Error;

/// Pixel formats that the content hash needs to know the size of.
///
/// Only the formats that the legacy hash table distinguishes are listed. Anything else is
/// reported as `Other` with its raw `D3DFORMAT` value.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PixelFormat {
    R8G8B8,
    A8R8G8B8,
    X8R8G8B8,
    R5G6B5,
    X1R5G5B5,
    A1R5G5B5,
    A4R4G4B4,
    R3G3B2,
    A8,
    A8R3G3B2,
    X4R4G4B4,
    A2B10G10R10,
    A8B8G8R8,
    X8B8G8R8,
    G16R16,
    A2R10G10B10,
    A16B16G16R16,
    A8P8,
    P8,
    L8,
    A8L8,
    A4L4,
    L16,
    Dxt1,
    Dxt2,
    Dxt3,
    Dxt4,
    Dxt5,
    Other(u32),
}

const fn four_cc(code: &[u8; 4]) -> u32 {
    (code[0] as u32) | (code[1] as u32) << 8 | (code[2] as u32) << 16 | (code[3] as u32) << 24
}

impl PixelFormat {
    /// Converts a raw `D3DFORMAT` value.
    pub fn from_d3d(raw: u32) -> PixelFormat {
        const DXT1: u32 = four_cc(b"DXT1");
        const DXT2: u32 = four_cc(b"DXT2");
        const DXT3: u32 = four_cc(b"DXT3");
        const DXT4: u32 = four_cc(b"DXT4");
        const DXT5: u32 = four_cc(b"DXT5");

        match raw {
            20 => PixelFormat::R8G8B8,
            21 => PixelFormat::A8R8G8B8,
            22 => PixelFormat::X8R8G8B8,
            23 => PixelFormat::R5G6B5,
            24 => PixelFormat::X1R5G5B5,
            25 => PixelFormat::A1R5G5B5,
            26 => PixelFormat::A4R4G4B4,
            27 => PixelFormat::R3G3B2,
            28 => PixelFormat::A8,
            29 => PixelFormat::A8R3G3B2,
            30 => PixelFormat::X4R4G4B4,
            31 => PixelFormat::A2B10G10R10,
            32 => PixelFormat::A8B8G8R8,
            33 => PixelFormat::X8B8G8R8,
            34 => PixelFormat::G16R16,
            35 => PixelFormat::A2R10G10B10,
            36 => PixelFormat::A16B16G16R16,
            40 => PixelFormat::A8P8,
            41 => PixelFormat::P8,
            50 => PixelFormat::L8,
            51 => PixelFormat::A8L8,
            52 => PixelFormat::A4L4,
            81 => PixelFormat::L16,
            DXT1 => PixelFormat::Dxt1,
            DXT2 => PixelFormat::Dxt2,
            DXT3 => PixelFormat::Dxt3,
            DXT4 => PixelFormat::Dxt4,
            DXT5 => PixelFormat::Dxt5,
            other => PixelFormat::Other(other),
        }
    }

    /// Bits per pixel as the legacy hash tools count them. Block-compressed formats use their
    /// compressed rate, and unknown formats are assumed to be 32 bits wide.
    pub fn bits_per_pixel(self) -> u32 {
        use PixelFormat::*;

        match self {
            R8G8B8 => 24,
            A8R8G8B8 | X8R8G8B8 | A2B10G10R10 | A8B8G8R8 | X8B8G8R8 | G16R16 | A2R10G10B10 => 32,
            R5G6B5 | X1R5G5B5 | A1R5G5B5 | A4R4G4B4 | A8R3G3B2 | X4R4G4B4 | A8P8 | A8L8 | L16 => 16,
            R3G3B2 | A8 | P8 | L8 | A4L4 => 8,
            A16B16G16R16 => 64,
            Dxt1 => 4,
            Dxt2 | Dxt3 | Dxt4 | Dxt5 => 8,
            Other(_) => 32,
        }
    }
}

/// Description of a texture's top mip level.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct SurfaceDesc {
    pub format: PixelFormat,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("no device is available")]
    NoDevice,

    #[error("decoder rejected '{0}'")]
    Rejected(String),

    #[error("unable to lock the top level of the texture")]
    LockFailed,
}

/// A reference-counted texture object owned by the device.
///
/// Implementations wrap a COM-style object: `add_ref` and `release` return the new count, and a
/// count of zero means the object has been destroyed.
pub trait RawTexture: Send + Sync {
    fn add_ref(&self) -> u32;

    fn release(&self) -> u32;

    /// The pointer that the game stores in its material slots.
    fn as_raw(&self) -> *mut c_void;

    /// Locks the top mip level read-only and passes its description and bytes to `visit`.
    fn with_top_level(&self, visit: &mut dyn FnMut(&SurfaceDesc, &[u8])) -> Result<(), DecodeError>;
}

/// Shared handle to a texture.
///
/// Cloning the handle does not touch the object's own reference count. Ownership as the game sees
/// it is tracked explicitly with `add_ref`/`release`.
#[derive(Clone)]
pub struct TextureHandle(Arc<dyn RawTexture>);

impl TextureHandle {
    pub fn new(texture: impl RawTexture + 'static) -> TextureHandle {
        TextureHandle(Arc::new(texture))
    }

    pub fn from_arc(texture: Arc<dyn RawTexture>) -> TextureHandle {
        TextureHandle(texture)
    }

    pub fn add_ref(&self) -> u32 {
        self.0.add_ref()
    }

    pub fn release(&self) -> u32 {
        self.0.release()
    }

    pub fn as_raw(&self) -> *mut c_void {
        self.0.as_raw()
    }

    pub fn with_top_level(
        &self,
        visit: &mut dyn FnMut(&SurfaceDesc, &[u8]),
    ) -> Result<(), DecodeError> {
        self.0.with_top_level(visit)
    }

    /// Returns `true` if both handles refer to the same device object.
    pub fn same_object(&self, other: &TextureHandle) -> bool {
        self.as_raw() == other.as_raw()
    }

    /// Checks that the object is still alive with an `AddRef`/`Release` pair. A count of zero
    /// after the release means something else already destroyed it.
    pub fn is_alive(&self) -> bool {
        self.add_ref();
        self.release() != 0
    }
}

impl fmt::Debug for TextureHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TextureHandle({:p})", self.as_raw())
    }
}

/// The rendering device, used only for its image decoding calls.
///
/// None of the decode calls are assumed to be thread safe. Callers serialize them.
pub trait Device: Send + Sync {
    fn add_ref(&self) -> u32;

    fn release(&self) -> u32;

    fn decode_image_file(&self, path: &Path) -> Result<TextureHandle, DecodeError>;

    fn decode_image_from_memory(&self, bytes: &[u8]) -> Result<TextureHandle, DecodeError>;

    fn decode_volume_image_file(&self, path: &Path) -> Result<TextureHandle, DecodeError>;
}

/// Opaque pointer to one of the game's material objects.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct MaterialHandle(pub *mut c_void);

impl MaterialHandle {
    pub fn is_null(self) -> bool {
        self.0.is_null()
    }
}

/// The three texture slots that the swap hook manages.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Slot {
    Diffuse,
    Normal,
    Specular,
}

impl Slot {
    pub const ALL: [Slot; 3] = [Slot::Diffuse, Slot::Normal, Slot::Specular];

    /// The name of the shader parameter that the slot's texture is bound to.
    pub fn parameter_name(self) -> &'static std::ffi::CStr {
        match self {
            Slot::Diffuse => c"DiffuseMap",
            Slot::Normal => c"NormalMapTexture",
            Slot::Specular => c"SPECULARMAPTEXTURE",
        }
    }

    pub fn index(self) -> usize {
        match self {
            Slot::Diffuse => 0,
            Slot::Normal => 1,
            Slot::Specular => 2,
        }
    }
}

/// What the game has bound in a slot right now.
#[derive(Clone, Copy, Debug)]
pub struct SlotState {
    /// The texture the game bound itself. May be null.
    pub bound: *mut c_void,

    /// Name hash of the texture the slot is meant to show.
    pub name_hash: u32,
}

/// Read access to the game's rendering state. Only valid on the render thread while a frame is
/// being drawn.
pub trait RenderContext {
    fn material(&self) -> Option<MaterialHandle>;

    fn slot(&self, slot: Slot) -> Option<SlotState>;
}

/// Sets a texture parameter on a material.
///
/// `storage` is the address of a pointer variable. The game keeps that address and reads through
/// it later, so the variable must stay where it is for as long as the material might use it.
pub trait MaterialParameterSetter {
    fn set_texture_parameter(
        &self,
        material: MaterialHandle,
        name: &std::ffi::CStr,
        storage: *mut *mut c_void,
    ) -> bool;
}
