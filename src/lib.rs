//! Replaces the textures of a Direct3D 9 racing game while it runs.
//!
//! Replacement images come from texture pack folders, loose `.dds` files and TexMod package
//! archives. They are decoded on background threads and swapped into the game's materials from a
//! hook on the render thread.

pub mod device;
pub mod hook;
pub mod host;
pub mod logging;
pub mod plugin;
pub mod settings;
pub mod texture;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use plugin::{HookEntries, Stats, TextureReplacer};
