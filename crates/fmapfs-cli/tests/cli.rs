#![forbid(unsafe_code)]

use fmapfs_ondisk::{Area, AreaFlags, FMAP_NAME_LEN, Fmap, FmapHeader};
use std::path::Path;
use std::process::{Command, Output};

fn name_field(name: &str) -> [u8; FMAP_NAME_LEN] {
    let mut field = [0_u8; FMAP_NAME_LEN];
    field[..name.len()].copy_from_slice(name.as_bytes());
    field
}

fn write_image(path: &Path) {
    let mut image = vec![0_u8; 0x2000];
    let fmap = Fmap {
        header: FmapHeader {
            location: 0x1000,
            signature: *b"__FMAP__",
            ver_major: 1,
            ver_minor: 1,
            base: 0,
            image_size: 0x2000,
            name: name_field("FLASH"),
            nareas: 2,
        },
        areas: vec![
            Area {
                offset: 0,
                size: 0x1000,
                name: name_field("RO_SECTION"),
                flags: AreaFlags(AreaFlags::STATIC | AreaFlags::RO),
            },
            Area {
                offset: 0x1000,
                size: 0x100,
                name: name_field("FMAP"),
                flags: AreaFlags(0),
            },
        ],
    };
    let table = fmap.encode();
    image[0x1000..0x1000 + table.len()].copy_from_slice(&table);
    std::fs::write(path, image).expect("write image");
}

fn fmapfs(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_fmapfs"))
        .args(args)
        .env_remove("FMAPFS_LOG")
        .output()
        .expect("run fmapfs")
}

#[test]
fn inspect_json_lists_areas_in_table_order() {
    let dir = tempfile::tempdir().expect("tempdir");
    let image = dir.path().join("bios.bin");
    write_image(&image);

    let out = fmapfs(&["inspect", image.to_str().expect("utf-8 path"), "--json"]);
    assert!(out.status.success(), "stderr: {}", String::from_utf8_lossy(&out.stderr));
    let json: serde_json::Value = serde_json::from_slice(&out.stdout).expect("json output");
    assert_eq!(json["name"], "FLASH");
    assert_eq!(json["version"], "1.1");
    assert_eq!(json["location"], 0x1000);
    let areas = json["areas"].as_array().expect("areas array");
    assert_eq!(areas.len(), 2);
    assert_eq!(areas[0]["name"], "RO_SECTION");
    assert_eq!(areas[0]["flags"], serde_json::json!(["static", "ro"]));
    assert_eq!(areas[1]["name"], "FMAP");
}

#[test]
fn inspect_text_mentions_every_area() {
    let dir = tempfile::tempdir().expect("tempdir");
    let image = dir.path().join("bios.bin");
    write_image(&image);

    let out = fmapfs(&["inspect", image.to_str().expect("utf-8 path")]);
    assert!(out.status.success());
    let text = String::from_utf8_lossy(&out.stdout);
    assert!(text.contains("fmap: FLASH v1.1"));
    assert!(text.contains("RO_SECTION"));
    assert!(text.contains("areas: 2"));
}

#[test]
fn image_without_fmap_exits_with_status_two() {
    let dir = tempfile::tempdir().expect("tempdir");
    let image = dir.path().join("blank.bin");
    std::fs::write(&image, vec![0xFF_u8; 4096]).expect("write blank");

    let out = fmapfs(&["inspect", image.to_str().expect("utf-8 path")]);
    assert_eq!(out.status.code(), Some(2));
    assert!(String::from_utf8_lossy(&out.stderr).starts_with("error:"));
}

#[test]
fn missing_image_exits_with_status_two() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mnt = dir.path().join("mnt");
    std::fs::create_dir(&mnt).expect("mkdir");
    let missing = dir.path().join("missing.bin");

    let out = fmapfs(&[
        missing.to_str().expect("utf-8 path"),
        mnt.to_str().expect("utf-8 path"),
    ]);
    assert_eq!(out.status.code(), Some(2));
}

#[test]
fn usage_errors_exit_with_status_one() {
    assert_eq!(fmapfs(&[]).status.code(), Some(1));
    assert_eq!(fmapfs(&["-o", "bogus", "a", "b"]).status.code(), Some(1));
    assert!(fmapfs(&["--help"]).status.success());
}
