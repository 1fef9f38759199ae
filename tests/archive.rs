use std::{
    io::{Cursor, Write},
    path::Path,
    sync::Arc,
    time::Duration,
};

use texswap::{
    device::Slot,
    settings::{LoadStrategy, Options},
    testing::{MockDevice, MockHookInstaller, MockRenderContext, RecordingSetter},
    texture::{archive, name_hash, IdentifierBridge},
    HookEntries, TextureReplacer,
};
use zip::{write::SimpleFileOptions, CompressionMethod};

/// Writes a package the way TexMod does: a zip archive with every byte XORed with the package
/// key.
fn write_package(path: &Path, entries: &[(&str, &[u8])]) {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    for (name, bytes) in entries {
        writer.start_file(*name, options).unwrap();
        writer.write_all(bytes).unwrap();
    }

    let mut data = writer.finish().unwrap().into_inner();
    archive::xor_file_in_place(&mut data);

    std::fs::write(path, data).unwrap();
}

fn image() -> Vec<u8> {
    b"DDS pretend pixel data ".repeat(40)
}

#[test]
fn package_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("pack.tpf");
    let image = image();

    write_package(
        &path,
        &[
            ("texmod.def", b"DEADBEEF|tex1.dds\n"),
            ("tex1.dds", &image),
        ],
    );

    let bridge = IdentifierBridge::new();
    let mut entries = vec![];
    let summary = archive::extract(&path, &bridge, |entry| entries.push(entry)).unwrap();

    assert_eq!(summary.manifest_lines, Some(1));
    assert_eq!(summary.delivered, 1);

    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].content_hash, name_hash("tex1"));
    assert_eq!(entries[0].bytes, image);

    assert_eq!(bridge.name_hashes(name_hash("tex1")), vec![0xDEAD_BEEF]);
    assert_eq!(bridge.content_hash(0xDEAD_BEEF), Some(name_hash("tex1")));
}

#[test]
fn a_file_that_is_not_a_package_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("broken.tpf");
    std::fs::write(&path, b"definitely not a package").unwrap();

    let result = archive::extract(&path, &IdentifierBridge::new(), |_| {
        panic!("nothing should be extracted")
    });

    assert!(result.is_err());
}

extern "C" fn entry() {}

#[test]
fn packaged_textures_are_swapped_in() {
    let dir = tempfile::tempdir().unwrap();
    let archives = dir.path().join("archives");
    std::fs::create_dir_all(&archives).unwrap();

    write_package(
        &archives.join("pack.tpf"),
        &[
            ("texmod.def", b"DEADBEEF|tex1.dds\n"),
            ("tex1.dds", &image()),
        ],
    );

    std::fs::write(dir.path().join("known.txt"), "0xDEADBEEF\n").unwrap();

    let options = Options {
        texture_packs_dir: dir.path().join("packs"),
        loose_textures_dir: dir.path().join("loose"),
        archives_dir: archives,
        bridge_cache_file: None,
        known_textures_file: dir.path().join("known.txt"),
        log_file: dir.path().join("texswap.log"),
        worker_threads: Some(2),
        load_strategy: LoadStrategy::Blocking,
        ..Options::default()
    };

    let installer = Arc::new(MockHookInstaller::default());
    let replacer = TextureReplacer::enable(
        options,
        installer.clone(),
        HookEntries {
            load: entry,
            frame: entry,
        },
    )
    .unwrap();

    let device = Arc::new(MockDevice::new());
    assert_eq!(replacer.attach_device(device.clone()), 1);
    assert!(replacer.wait_until_loaded(Duration::from_secs(10)));

    let context = replacer.context();
    assert!(context.archives.is_complete());
    assert!(context.store.texture(name_hash("tex1")).is_some());
    assert!(context.swap_table.lookup(0xDEAD_BEEF).is_some());

    let mut render = MockRenderContext::with_material();
    render.set_slot(Slot::Diffuse, 0xDEAD_BEEF);
    render.set_slot(Slot::Normal, 0x0BAD_F00D);

    let setter = RecordingSetter::default();
    assert_eq!(replacer.on_frame(&render, &setter), 1);
    assert_eq!(replacer.on_frame(&render, &setter), 1);

    let calls = setter.calls_for(Slot::Diffuse.parameter_name());
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].storage, calls[1].storage);
    assert!(setter.calls_for(Slot::Normal.parameter_name()).is_empty());

    let stats = replacer.stats();
    assert_eq!(stats.frames, 2);
    assert_eq!(stats.swaps, 2);
    assert_eq!(stats.loaded, 1);
    assert_eq!(stats.swap_table_entries, 1);

    let loaded = device.decoded().pop().unwrap();
    replacer.disable();

    assert_eq!(loaded.ref_count(), 0);
    assert_eq!(device.ref_count(), 1);
    assert_eq!(installer.hooked_count(), 0);
}
