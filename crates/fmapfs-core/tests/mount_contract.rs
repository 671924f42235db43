#![forbid(unsafe_code)]

use fmapfs_core::{FileType, FmapFs, FsOps, MountError};
use fmapfs_error::FmapfsError;
use fmapfs_ondisk::{Area, AreaFlags, FMAP_NAME_LEN, Fmap, FmapHeader, FmapParseError, parse_fmap};
use fmapfs_types::NodeId;
use std::collections::BTreeSet;
use std::io::Write;
use std::sync::Arc;
use std::thread;

const IMAGE_LEN: usize = 0x4000;
const FMAP_AT: usize = 0x2000;
const GBB_AT: usize = 0x1000;
const VPD_AT: usize = 0x3000;
const HWID_REL: usize = 0x80;
const HWID_CAP: usize = 0x40;

fn name_field(name: &str) -> [u8; FMAP_NAME_LEN] {
    let mut field = [0_u8; FMAP_NAME_LEN];
    field[..name.len()].copy_from_slice(name.as_bytes());
    field
}

fn area(name: &str, offset: u32, size: u32) -> Area {
    Area {
        offset,
        size,
        name: name_field(name),
        flags: AreaFlags(AreaFlags::STATIC),
    }
}

fn fmap_table() -> Fmap {
    let areas = vec![
        area("RW_VPD", 0x3000, 0x100),
        area("GBB", 0x1000, 0x1000),
        area("BOOT", 0x0, 0x1000),
        area("FMAP", 0x2000, 0x100),
    ];
    Fmap {
        header: FmapHeader {
            location: FMAP_AT,
            signature: *b"__FMAP__",
            ver_major: 1,
            ver_minor: 0,
            base: 0xFF00_0000,
            image_size: 0x4000,
            name: name_field("FMAP"),
            nareas: 4,
        },
        areas,
    }
}

fn put_u32(buf: &mut [u8], at: usize, value: u32) {
    buf[at..at + 4].copy_from_slice(&value.to_le_bytes());
}

fn sample_image() -> Vec<u8> {
    let mut image = vec![0_u8; IMAGE_LEN];
    for (i, byte) in image[VPD_AT..VPD_AT + 0x100].iter_mut().enumerate() {
        *byte = (i % 256) as u8;
    }

    let gbb = &mut image[GBB_AT..GBB_AT + 0x1000];
    gbb[..4].copy_from_slice(b"$GBB");
    gbb[4..6].copy_from_slice(&1_u16.to_le_bytes());
    gbb[6..8].copy_from_slice(&2_u16.to_le_bytes());
    put_u32(gbb, 0x08, 128);
    put_u32(gbb, 0x0C, 0);
    put_u32(gbb, 0x10, HWID_REL as u32);
    put_u32(gbb, 0x14, HWID_CAP as u32);
    put_u32(gbb, 0x18, 0x100);
    put_u32(gbb, 0x1C, 0x400);
    put_u32(gbb, 0x20, 0x500);
    put_u32(gbb, 0x24, 0x0);
    put_u32(gbb, 0x28, 0x600);
    put_u32(gbb, 0x2C, 0x400);
    let hwid = b"ELM A1B-C2D-A3A";
    gbb[HWID_REL..HWID_REL + hwid.len()].copy_from_slice(hwid);

    let table = fmap_table().encode();
    image[FMAP_AT..FMAP_AT + table.len()].copy_from_slice(&table);
    image
}

fn mount() -> FmapFs {
    FmapFs::from_bytes(sample_image()).expect("sample image mounts")
}

#[test]
fn header_and_area_table_reencode_identically() {
    let image = sample_image();
    let fmap = parse_fmap(&image).expect("parse");
    let encoded = fmap.encode();
    assert_eq!(encoded, image[FMAP_AT..FMAP_AT + encoded.len()]);
}

#[test]
fn name_and_version_render_as_text() {
    let fs = mount();
    assert_eq!(fs.read_path("/name").expect("name"), b"FMAP\n");
    assert_eq!(fs.read_path("/version").expect("version"), b"1.0\n");
}

#[test]
fn version_write_updates_header_bytes() {
    let fs = mount();
    fs.write_path("/version", 0, b"1.1").expect("write version");
    assert_eq!(fs.read_path("/version").expect("version"), b"1.1\n");
    let bytes = fs.store().snapshot();
    assert_eq!(bytes[FMAP_AT + 8..FMAP_AT + 10], [1, 1]);

    let current = fs.read_path("/version").expect("version");
    fs.write_path("/version", 0, &current).expect("rewrite");
    assert_eq!(fs.read_path("/version").expect("version"), current);
    assert_eq!(fs.store().snapshot(), bytes);
}

#[test]
fn malformed_version_changes_nothing() {
    let fs = mount();
    let before = fs.store().snapshot();
    for bad in [&b"1"[..], b"x.1", b"1.256", b"-1.0"] {
        assert!(matches!(
            fs.write_path("/version", 0, bad),
            Err(FmapfsError::InvalidArgument(_))
        ));
    }
    assert_eq!(fs.store().snapshot(), before);
}

#[test]
fn name_write_pads_field() {
    let fs = mount();
    fs.write_path("/name", 0, b"FM\n").expect("rename");
    assert_eq!(fs.read_path("/name").expect("name"), b"FM\n");
    let bytes = fs.store().snapshot();
    assert_eq!(bytes[FMAP_AT + 0x16..FMAP_AT + 0x16 + 4], *b"FM\0\0");

    let long = [b'N'; FMAP_NAME_LEN + 1];
    assert!(matches!(
        fs.write_path("/name", 0, &long),
        Err(FmapfsError::InvalidArgument(_))
    ));
    assert_eq!(fs.read_path("/name").expect("name"), b"FM\n");
}

#[test]
fn area_listing_matches_table() {
    let fs = mount();
    let areas = fs.lookup_path("/areas").expect("areas");
    let entries = fs.readdir(areas.ino, 0).expect("readdir");
    let listed: BTreeSet<String> = entries.iter().map(|e| e.name.clone()).collect();
    let expected: BTreeSet<String> = fmap_table().areas.iter().map(Area::name_str).collect();
    assert_eq!(listed, expected);
    assert!(entries.iter().all(|e| e.kind == FileType::Directory));
}

#[test]
fn area_raw_sizes_are_area_sizes() {
    let fs = mount();
    for area in &fmap_table().areas {
        let path = format!("/areas/{}/raw", area.name_str());
        assert_eq!(fs.lookup_path(&path).expect("raw").size, u64::from(area.size));
    }
}

#[test]
fn zero_byte_write_changes_nothing() {
    let fs = mount();
    let before = fs.read_path("/areas/RW_VPD/raw").expect("read");
    assert_eq!(fs.write_path("/areas/RW_VPD/raw", 0, &[]).expect("empty write"), 0);
    assert_eq!(fs.lookup_path("/areas/RW_VPD/raw").expect("raw").size, 256);
    assert_eq!(fs.read_path("/areas/RW_VPD/raw").expect("read"), before);
}

#[test]
fn exact_size_write_replaces_content() {
    let fs = mount();
    let payload = vec![0xA5_u8; 256];
    assert_eq!(fs.write_path("/areas/RW_VPD/raw", 0, &payload).expect("write"), 256);
    assert_eq!(fs.read_path("/areas/RW_VPD/raw").expect("read"), payload);
}

#[test]
fn oversized_write_commits_prefix_and_fails() {
    let fs = mount();
    let payload: Vec<u8> = (0..257_u32).map(|i| (255 - i % 256) as u8).collect();
    let err = fs
        .write_path("/areas/RW_VPD/raw", 0, &payload)
        .expect_err("size+1 write");
    assert!(matches!(err, FmapfsError::FileTooBig { .. }));
    assert_eq!(err.to_errno(), libc::EFBIG);
    assert_eq!(fs.read_path("/areas/RW_VPD/raw").expect("read"), payload[..256]);
    assert_eq!(fs.lookup_path("/areas/RW_VPD/raw").expect("raw").size, 256);

    let before = fs.store().snapshot();
    assert!(fs.write_path("/areas/RW_VPD/raw", 256, b"x").is_err());
    assert_eq!(fs.store().snapshot(), before);
}

#[test]
fn overlapping_views_alias() {
    let fs = mount();
    fs.write_path("/areas/RW_VPD/raw", 4, b"SEEN").expect("write");
    let whole = fs.read_path("/raw").expect("read whole");
    assert_eq!(whole[VPD_AT + 4..VPD_AT + 8], *b"SEEN");

    fs.write_path("/raw", (FMAP_AT + 8) as u64, &[2, 3]).expect("raw header edit");
    assert_eq!(fs.read_path("/version").expect("version"), b"2.3\n");
}

#[test]
fn gbb_hwid_read_and_write() {
    let fs = mount();
    let hwid = "/areas/GBB/gbb-data/hwid";
    assert_eq!(fs.read_path(hwid).expect("hwid"), b"ELM A1B-C2D-A3A\n");

    let update = b"ELM-ZZCR C3B-A4D-D1A-D5F\n";
    assert_eq!(fs.write_path(hwid, 0, update).expect("write hwid"), 25);
    assert_eq!(fs.read_path(hwid).expect("hwid"), update);

    let raw = fs.read_path("/areas/GBB/raw").expect("gbb raw");
    let needle = &update[..update.len() - 1];
    assert!(raw.windows(needle.len()).any(|w| w == needle));
    let field = &raw[HWID_REL..HWID_REL + HWID_CAP];
    assert!(field[needle.len()..].iter().all(|b| *b == 0));
}

#[test]
fn gbb_hwid_rejects_over_capacity() {
    let fs = mount();
    let long = vec![b'H'; HWID_CAP + 1];
    assert!(matches!(
        fs.write_path("/areas/GBB/gbb-data/hwid", 0, &long),
        Err(FmapfsError::InvalidArgument(_))
    ));
    assert_eq!(
        fs.read_path("/areas/GBB/gbb-data/hwid").expect("hwid"),
        b"ELM A1B-C2D-A3A\n"
    );
}

#[test]
fn gbb_fields_and_flags_are_exposed() {
    let fs = mount();
    assert_eq!(
        fs.lookup_path("/areas/GBB/gbb-data/root-key").expect("key").size,
        0x400
    );
    assert_eq!(fs.lookup_path("/areas/GBB/gbb-data/bmpfv").expect("bmpfv").size, 0);
    assert_eq!(
        fs.lookup_path("/areas/GBB/gbb-data/hwid-digest").expect("digest").size,
        32
    );
    let flag = "/areas/GBB/gbb-data/flags/force-dev-mode";
    assert_eq!(fs.read_path(flag).expect("flag"), b"0\n");
    fs.write_path(flag, 0, b"1\n").expect("set");
    assert_eq!(fs.read_path(flag).expect("flag"), b"1\n");
    let bytes = fs.store().snapshot();
    assert_eq!(bytes[GBB_AT + 0x0C..GBB_AT + 0x10], 8_u32.to_le_bytes());
}

#[test]
fn unsupported_gbb_version_keeps_area_raw() {
    let mut image = sample_image();
    image[GBB_AT + 4..GBB_AT + 6].copy_from_slice(&2_u16.to_le_bytes());
    let fs = FmapFs::from_bytes(image).expect("mount still succeeds");
    assert!(fs.lookup_path("/areas/GBB/raw").is_ok());
    assert!(matches!(
        fs.lookup_path("/areas/GBB/gbb-data"),
        Err(FmapfsError::NotFound(_))
    ));
}

#[test]
fn duplicate_area_names_last_wins() {
    let mut image = sample_image();
    let mut fmap = fmap_table();
    fmap.areas[0] = area("BOOT", 0x3000, 0x10);
    let table = fmap.encode();
    image[FMAP_AT..FMAP_AT + table.len()].copy_from_slice(&table);

    let fs = FmapFs::from_bytes(image).expect("mount");
    assert_eq!(fs.lookup_path("/areas/BOOT/raw").expect("raw").size, 0x1000);
    let areas = fs.lookup_path("/areas").expect("areas");
    assert_eq!(fs.readdir(areas.ino, 0).expect("readdir").len(), 3);
    assert!(fs.lookup_path("/areas/RW_VPD").is_err());
}

#[test]
fn unparseable_images_fail_to_mount() {
    assert!(matches!(
        FmapFs::from_bytes(vec![0xFF_u8; IMAGE_LEN]),
        Err(MountError::Parse(FmapParseError::NoSignature { .. }))
    ));

    let mut truncated = sample_image();
    truncated.truncate(FMAP_AT + 56 + 42);
    assert!(matches!(
        FmapFs::from_bytes(truncated),
        Err(MountError::Parse(
            FmapParseError::Truncated { .. } | FmapParseError::ImageTooSmall { .. }
        ))
    ));

    let mut oversized = sample_image();
    let mut fmap = fmap_table();
    fmap.areas[3] = area("FMAP", 0x3F00, 0x200);
    let table = fmap.encode();
    oversized[FMAP_AT..FMAP_AT + table.len()].copy_from_slice(&table);
    assert!(matches!(
        FmapFs::from_bytes(oversized),
        Err(MountError::Parse(FmapParseError::AreaOutOfBounds { index: 3, .. }))
    ));
}

#[test]
fn missing_image_path_fails_to_mount() {
    let dir = tempfile::tempdir().expect("tempdir");
    let err = FmapFs::open(dir.path().join("absent.bin")).expect_err("missing image");
    assert!(matches!(err, MountError::Image(FmapfsError::Io(_))));
}

#[test]
fn flush_persists_to_image_file() {
    let mut file = tempfile::NamedTempFile::new().expect("tempfile");
    file.write_all(&sample_image()).expect("seed");
    file.flush().expect("flush seed");

    let fs = FmapFs::open(file.path()).expect("mount file");
    fs.write_path("/version", 0, b"1.1\n").expect("write");
    fs.flush().expect("persist");
    assert!(!fs.store().is_dirty());

    let on_disk = std::fs::read(file.path()).expect("reread");
    assert_eq!(on_disk[FMAP_AT + 8..FMAP_AT + 10], [1, 1]);
    assert_eq!(on_disk.len(), IMAGE_LEN);
}

#[test]
fn concurrent_overflowing_writers_never_tear() {
    let fs = Arc::new(mount());
    let ino = fs.lookup_path("/areas/RW_VPD/raw").expect("raw").ino;
    let handles: Vec<_> = (0..8_u8)
        .map(|tag| {
            let fs = Arc::clone(&fs);
            thread::spawn(move || {
                for _ in 0..200 {
                    let payload = vec![tag; 300];
                    assert!(fs.write(ino, 0, &payload).is_err());
                    let seen = fs.read(ino, 0, 256).expect("read");
                    assert!(seen.iter().all(|b| *b == seen[0]), "torn write observed");
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("writer thread");
    }
    assert_eq!(fs.getattr(ino).expect("attr").size, 256);
}

#[test]
fn root_is_node_one() {
    let fs = mount();
    assert_eq!(fs.lookup_path("/").expect("root").ino, NodeId::ROOT);
}
