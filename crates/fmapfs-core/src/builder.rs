#![forbid(unsafe_code)]
//! Builds the virtual tree for a parsed FMAP.
//!
//! ```text
//! /raw                      whole image
//! /name                     FMAP name, text
//! /version                  "major.minor", text
//! /areas/<AREA>/raw         area bytes
//! /areas/<AREA>/<decoder>/  decoder subtrees
//! ```

use crate::decode::{AreaContext, DecoderRegistry};
use crate::tree::{Tree, TreeBuilder};
use crate::view::{CStringView, RawView, VersionView};
use fmapfs_block::BackingStore;
use fmapfs_error::Result;
use fmapfs_ondisk::{Area, Fmap};
use fmapfs_types::{ByteRange, NodeId};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Area names usable as a single path component.
fn is_valid_component(name: &str) -> bool {
    !(name.is_empty() || name == "." || name == ".." || name.contains('/'))
}

/// The areas that get a directory, in on-disk order.
///
/// Unusable names are dropped. When several areas share a name, the last
/// one in the table wins.
fn visible_areas(areas: &[Area]) -> Vec<(usize, String)> {
    let named: Vec<(usize, String)> = areas
        .iter()
        .enumerate()
        .map(|(index, area)| (index, area.name_str()))
        .filter(|(index, name)| {
            let ok = is_valid_component(name);
            if !ok {
                warn!(index, name = %name, "skipping area with unusable name");
            }
            ok
        })
        .collect();

    let mut last: HashMap<&str, usize> = HashMap::new();
    for (index, name) in &named {
        if let Some(shadowed) = last.insert(name.as_str(), *index) {
            warn!(name = %name, shadowed, winner = index, "duplicate area name");
        }
    }
    named
        .iter()
        .filter(|(index, name)| last.get(name.as_str()) == Some(index))
        .cloned()
        .collect()
}

/// Build the tree for `fmap` over `store`, consulting `decoders` per area.
pub fn build_tree(fmap: &Fmap, store: &BackingStore, decoders: &DecoderRegistry) -> Result<Tree> {
    let mut builder = TreeBuilder::new();
    let root = NodeId::ROOT;

    builder.add_file(
        root,
        "raw",
        Arc::new(RawView::new(store.clone(), ByteRange::new(0, store.len()))),
    )?;
    builder.add_file(
        root,
        "name",
        Arc::new(CStringView::new(
            store.clone(),
            fmap.header.name_range(),
            "name",
        )),
    )?;
    let (major_at, minor_at) = fmap.header.version_offsets();
    builder.add_file(
        root,
        "version",
        Arc::new(VersionView::new(store.clone(), major_at, minor_at)),
    )?;

    let areas_dir = builder.add_dir(root, "areas")?;
    for (index, name) in visible_areas(&fmap.areas) {
        let area = &fmap.areas[index];
        let range = area.range();
        let dir = builder.add_dir(areas_dir, &name)?;
        builder.add_file(dir, "raw", Arc::new(RawView::new(store.clone(), range)))?;

        let bytes = store.read_range(range)?;
        let ctx = AreaContext {
            name: &name,
            range,
            bytes: &bytes,
            store,
        };
        for (subtree_name, subtree) in decoders.decode_area(&ctx) {
            builder.graft(dir, subtree_name, subtree)?;
        }
        debug!(index, name = %name, range = %range, flags = ?area.flags.names(), "area added");
    }

    Ok(builder.finish())
}
