//! Manages the saving and loading of settings.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};

use eyre::{Context, Result};

/// Name of the settings file, relative to the game directory.
pub const SETTINGS_FILE: &str = "NextGenGraphics/texswap.json";

/// Name of the settings file used by older versions, which only held a few switches.
pub const OLD_SETTINGS_FILE: &str = "NextGenGraphics/texswap_settings.json";

/// When texture loading should hold up the game.
#[derive(serde::Serialize, serde::Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum LoadStrategy {
    /// Load on worker threads while the game keeps running.
    #[default]
    Background,

    /// Wait for every queued texture to load before letting the game continue.
    Blocking,
}

/// Where things are in the game executable.
#[derive(serde::Serialize, serde::Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct HostLayout {
    /// Function that runs when the game (re)loads its graphics settings.
    pub load_hook: usize,

    /// Point in the material setup code where textures are swapped.
    pub frame_hook: usize,

    /// Address of the pointer to the render context.
    pub render_context: usize,

    /// Addresses of the pointers to the diffuse, normal and specular texture wrappers.
    pub wrappers: [usize; 3],

    pub material_offset: usize,
    pub name_hash_offset: usize,
    pub texture_offset: usize,
}

impl Default for HostLayout {
    fn default() -> Self {
        HostLayout {
            load_hook: 0x6C3A30,
            frame_hook: 0x6C6C8D,
            render_context: 0x982C80,
            wrappers: [0x982CB4, 0x982CB8, 0x982CC0],
            material_offset: 0x48,
            name_hash_offset: 0x24,
            texture_offset: 0x18,
        }
    }
}

#[derive(serde::Serialize, serde::Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct Options {
    pub texture_packs_dir: PathBuf,
    pub loose_textures_dir: PathBuf,
    pub archives_dir: PathBuf,
    pub bridge_cache_file: Option<PathBuf>,
    pub known_textures_file: PathBuf,
    pub log_file: PathBuf,

    /// Overrides the worker count picked from the number of CPUs. Still kept within the usual
    /// limits.
    pub worker_threads: Option<usize>,

    pub load_strategy: LoadStrategy,
    pub host: HostLayout,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            texture_packs_dir: "NextGenGraphics/TexturePacks".into(),
            loose_textures_dir: "NextGenGraphics/Textures".into(),
            archives_dir: "NextGenGraphics/TexMod".into(),
            bridge_cache_file: Some("Resources/MW_CRC32Cache.json".into()),
            known_textures_file: "NextGenGraphics/KnownTextures.txt".into(),
            log_file: "NextGenGraphics/texswap.log".into(),
            worker_threads: None,
            load_strategy: LoadStrategy::Background,
            host: HostLayout::default(),
        }
    }
}

impl Options {
    fn load_path(path: &Path) -> Result<Options> {
        let file = std::fs::File::open(path)
            .wrap_err_with(|| format!("failed to open {}", path.display()))?;

        serde_json::from_reader(std::io::BufReader::new(file))
            .wrap_err_with(|| format!("failed to parse {}", path.display()))
    }

    /// Loads the settings at `path`. Anything that goes wrong gives the default settings.
    pub fn load(path: &Path) -> Options {
        if !path.exists() {
            log::info!("No settings at {}; using defaults", path.display());
            return Options::default();
        }

        Options::load_path(path).unwrap_or_else(|err| {
            log::error!("Failed to load settings from JSON: {:?}", err);
            log::info!("Using default values instead.");
            Options::default()
        })
    }

    /// Loads the settings, moving over the switches from an old settings file if there are no
    /// new settings yet.
    pub fn load_or_migrate(path: &Path, old_path: &Path) -> Options {
        if path.exists() || !old_path.exists() {
            return Options::load(path);
        }

        let options = match Options::load_from_old_file(old_path) {
            Ok(options) => options,
            Err(err) => {
                log::error!("Failed to migrate old settings: {:?}", err);
                return Options::default();
            }
        };

        log::info!("Migrated settings from {}", old_path.display());

        if let Err(err) = options.save(path) {
            log::error!("Unable to save migrated settings: {:?}", err);
        }

        options
    }

    /// Reads a settings file in the old format, which was a flat map of switches.
    fn load_from_old_file(path: &Path) -> Result<Options> {
        let text = std::fs::read_to_string(path)?;
        let switches: HashMap<String, bool> = serde_json::from_str(&text)?;

        let mut options = Options::default();

        let blocking = switches
            .get("async_loading")
            .map(|&async_loading| !async_loading)
            .or_else(|| switches.get("blocking_load").copied())
            .unwrap_or(false);

        if blocking {
            options.load_strategy = LoadStrategy::Blocking;
        }

        if switches.get("use_crc32_cache") == Some(&false) {
            options.bridge_cache_file = None;
        }

        Ok(options)
    }

    /// Loads (or migrates) the settings kept in the game directory `game_dir` and resolves every
    /// relative path in them against it.
    pub fn load_from_game_dir(game_dir: &Path) -> Options {
        let mut options = Options::load_or_migrate(
            &game_dir.join(SETTINGS_FILE),
            &game_dir.join(OLD_SETTINGS_FILE),
        );

        options.resolve_paths(game_dir);
        options
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        Ok(serde_json::to_writer_pretty(
            std::fs::File::create(path)?,
            self,
        )?)
    }

    /// Makes every relative path absolute by putting `base` in front of it.
    pub fn resolve_paths(&mut self, base: &Path) {
        for path in [
            &mut self.texture_packs_dir,
            &mut self.loose_textures_dir,
            &mut self.archives_dir,
            &mut self.known_textures_file,
            &mut self.log_file,
        ] {
            if path.is_relative() {
                *path = base.join(&*path);
            }
        }

        if let Some(cache) = self.bridge_cache_file.as_mut().filter(|path| path.is_relative()) {
            *cache = base.join(&*cache);
        }
    }
}
