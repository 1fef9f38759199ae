//! Texture replacement: finding replacement images, loading them in the background and swapping
//! them in for the game's own textures as they are drawn.

pub mod apply;
pub mod archive;
pub mod bridge;
pub mod context;
pub mod hash;
pub mod pipeline;
pub mod sources;
pub mod store;
pub mod swap_table;

pub use apply::{find_replacement, ApplyStats, SwapApplier};
pub use bridge::IdentifierBridge;
pub use context::PipelineContext;
pub use hash::{content_hash, file_name_hash, name_hash, TextureId};
pub use pipeline::{LoadPipeline, LoadRequest};
pub use sources::{KnownTextures, PathRegistration, TextureKind};
pub use store::TextureStore;
pub use swap_table::{BuildStats, SwapTable};
