//! Directory entry management: lookup, creation, update and deletion of
//! file entries, and cluster allocation for growing files.

use super::bpb::DIR_ENTRY_SIZE;
use super::dir_entry::{
    derive_short_name, is_valid_long_name, FatAttributes, FileEntry, FileEntryLocation,
    LfnEntry, LocationAwareFileEntry,
};
use super::dir_iter::{
    DirectoryIterationMode, FatDirectoryIterator, IteratorState, NavigationStatus,
};
use super::volume::Volume;
use crate::fs::vfs::path::Path;
use alloc::string::ToString;
use alloc::vec;
use alloc::vec::Vec;

/// Outcome of volume-level entry operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeAccessStatus {
    Okay,
    NotFound,
    /// An intermediate path component is not a directory.
    BadPath,
    DevError,
}

/// Synthesized entry representing the root directory.
pub fn root_entry(volume: &Volume) -> LocationAwareFileEntry {
    let root_cluster = volume.root_directory_cluster();
    let mut file = FileEntry::default();
    file.attributes = FatAttributes::DIRECTORY.bits();
    file.set_cluster(root_cluster);
    LocationAwareFileEntry {
        file_name: alloc::string::String::new(),
        file,
        location: FileEntryLocation {
            cluster: root_cluster,
            entry_index: 0,
        },
        first_lfn: None,
    }
}

/// Find the entry at `path` (relative to the volume root). The empty path
/// and `.` resolve to the synthesized root entry.
pub fn search(volume: &Volume, path: &Path) -> Result<LocationAwareFileEntry, VolumeAccessStatus> {
    let components: Vec<&str> = path.components().collect();
    if components.is_empty() || (components.len() == 1 && (components[0] == "." || components[0] == "..")) {
        return Ok(root_entry(volume));
    }
    let result = FatDirectoryIterator::navigate_to(
        *volume,
        volume.root_directory_cluster(),
        &components,
    );
    match result.status {
        NavigationStatus::Found => Ok(result.entry),
        NavigationStatus::NotFound => Err(VolumeAccessStatus::NotFound),
        NavigationStatus::BadPath => Err(VolumeAccessStatus::BadPath),
        NavigationStatus::DevError => Err(VolumeAccessStatus::DevError),
    }
}

/// Write one raw 32-byte slot at `location`.
fn write_slot(volume: &Volume, location: FileEntryLocation, raw: &[u8; DIR_ENTRY_SIZE]) -> bool {
    let mut buf = vec![0u8; volume.cluster_size() as usize];
    if volume.data_cluster_read(location.cluster, &mut buf).is_err() {
        return false;
    }
    let offset = location.entry_index as usize * DIR_ENTRY_SIZE;
    buf[offset..offset + DIR_ENTRY_SIZE].copy_from_slice(raw);
    volume.data_cluster_write(location.cluster, &buf).is_ok()
}

/// Write the entry's current in-memory state back to its on-disk location.
pub fn update(volume: &Volume, entry: &LocationAwareFileEntry) -> bool {
    let mut raw = [0u8; DIR_ENTRY_SIZE];
    entry.file.write_bytes(&mut raw);
    write_slot(volume, entry.location, &raw)
}

/// Allocate the next free cluster and link it to `file`'s chain behind
/// `last_cluster` (0 for an empty file, which also updates the entry's
/// first-cluster field). On a FAT update failure every change made by this
/// call is reverted before `None` is returned.
pub fn allocate_cluster(
    volume: &Volume,
    file: &mut LocationAwareFileEntry,
    last_cluster: u32,
) -> Option<u32> {
    let free_cluster = match volume.find_free_cluster() {
        Ok(Some(cluster)) => cluster,
        _ => {
            log::warn!("fat: no free cluster on device {}", volume.device);
            return None;
        }
    };

    if last_cluster == 0 {
        // Empty file: the entry's first cluster and the FAT change
        // together, or not at all. The root directory never takes this
        // path since its first cluster is fixed by the boot record.
        file.file.set_cluster(free_cluster);
        if !update(volume, file) {
            file.file.set_cluster(0);
            return None;
        }
        if volume.fat_write(free_cluster, volume.eoc_marker()).is_err() {
            file.file.set_cluster(0);
            update(volume, file);
            return None;
        }
    } else {
        if volume.fat_write(last_cluster, free_cluster).is_err() {
            return None;
        }
        if volume.fat_write(free_cluster, volume.eoc_marker()).is_err() {
            let _ = volume.fat_write(last_cluster, volume.eoc_marker());
            return None;
        }
    }
    Some(free_cluster)
}

/// Find `range` contiguous empty slots in the directory whose chain starts
/// at `dir`'s first cluster, extending the chain when the existing slots do
/// not suffice.
pub fn find_empty_entries(
    volume: &Volume,
    dir: &mut LocationAwareFileEntry,
    range: u16,
) -> Result<Vec<LocationAwareFileEntry>, VolumeAccessStatus> {
    let mut out: Vec<LocationAwareFileEntry> = Vec::new();
    let mut found: u16 = 0;

    let mut it = FatDirectoryIterator::new(
        *volume,
        dir.file.cluster(),
        DirectoryIterationMode::ListAll,
    );
    let mut last_cluster = it.current_cluster();
    while it.has_next() && found < range {
        let entry = it.current().clone();
        last_cluster = it.current_cluster();
        if !entry.file.is_empty_end() && !entry.file.is_empty_middle() {
            // A used slot breaks the contiguous run.
            found = 0;
            out.clear();
        } else {
            found += 1;
            out.push(entry);
        }
        it.step();
    }
    if it.state() == IteratorState::DeviceError || it.state() == IteratorState::CorruptLfnEntry {
        return Err(VolumeAccessStatus::DevError);
    }

    if found < range {
        // Grow the directory chain until the remaining slots fit.
        let entries_per_cluster = volume.cluster_size() as usize / DIR_ENTRY_SIZE;
        let mut missing = (range - found) as usize;
        let mut first_new_cluster = 0;
        let mut current = last_cluster;
        while missing > 0 {
            let next = match allocate_cluster(volume, dir, current) {
                Some(next) => next,
                None => return Err(VolumeAccessStatus::DevError),
            };
            // Fresh directory clusters must read as all empty-end slots.
            let zeroes = vec![0u8; volume.cluster_size() as usize];
            if volume.data_cluster_write(next, &zeroes).is_err() {
                return Err(VolumeAccessStatus::DevError);
            }
            if first_new_cluster == 0 {
                first_new_cluster = next;
            }
            current = next;
            missing = missing.saturating_sub(entries_per_cluster);
        }

        let mut after = FatDirectoryIterator::new(
            *volume,
            first_new_cluster,
            DirectoryIterationMode::ListAll,
        );
        while after.has_next() && found < range {
            out.push(after.current().clone());
            found += 1;
            after.step();
        }
        if found < range {
            return Err(VolumeAccessStatus::DevError);
        }
    }
    Ok(out)
}

/// Errors of entry creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateError {
    Exists,
    BadName,
    DevError,
}

/// Create a file or directory named `name` inside `dir`.
///
/// The long name takes `ceil(len / 13)` LFN entries followed by one
/// short-name entry, written into a contiguous run of empty slots. A new
/// directory receives its first cluster with `.` and `..` entries.
pub fn create_entry(
    volume: &Volume,
    dir: &mut LocationAwareFileEntry,
    name: &str,
    attributes: FatAttributes,
) -> Result<(), CreateError> {
    if !is_valid_long_name(name) {
        return Err(CreateError::BadName);
    }

    // Short names carry a numeric tail to dodge collisions.
    let mut short_name = None;
    'tail: for tail in 1..=9u8 {
        let candidate = derive_short_name(name, tail);
        let mut it = FatDirectoryIterator::new(
            *volume,
            dir.file.cluster(),
            DirectoryIterationMode::ListDirectory,
        );
        while it.has_next() {
            if it.current().file.short_name == candidate {
                continue 'tail;
            }
            it.step();
        }
        short_name = Some(candidate);
        break;
    }
    let Some(short_name) = short_name else {
        log::warn!("fat: no free short-name tail for \"{}\"", name);
        return Err(CreateError::BadName);
    };

    let mut file = FileEntry::default();
    file.short_name = short_name;
    file.attributes = attributes.bits();

    let lfn_run = LfnEntry::encode_name(name, file.short_name_checksum());
    let slots = find_empty_entries(volume, dir, (lfn_run.len() + 1) as u16)
        .map_err(|_| CreateError::DevError)?;

    for (lfn, slot) in lfn_run.iter().zip(slots.iter()) {
        let mut raw = [0u8; DIR_ENTRY_SIZE];
        lfn.write_bytes(&mut raw);
        if !write_slot(volume, slot.location, &raw) {
            return Err(CreateError::DevError);
        }
    }
    let short_slot = &slots[lfn_run.len()];
    let mut short_entry = LocationAwareFileEntry {
        file_name: name.to_string(),
        file,
        location: short_slot.location,
        first_lfn: Some(slots[0].location),
    };
    if !update(volume, &short_entry) {
        return Err(CreateError::DevError);
    }

    if attributes.contains(FatAttributes::DIRECTORY) {
        let Some(cluster) = allocate_cluster(volume, &mut short_entry, 0) else {
            return Err(CreateError::DevError);
        };
        let mut buf = vec![0u8; volume.cluster_size() as usize];
        let mut dot = FileEntry::default();
        dot.short_name.copy_from_slice(b".          ");
        dot.attributes = FatAttributes::DIRECTORY.bits();
        dot.set_cluster(cluster);
        dot.write_bytes(&mut buf[0..DIR_ENTRY_SIZE]);
        let mut dotdot = FileEntry::default();
        dotdot.short_name.copy_from_slice(b"..         ");
        dotdot.attributes = FatAttributes::DIRECTORY.bits();
        let parent = dir.file.cluster();
        // A parent of the root directory is recorded as cluster 0.
        if parent & super::volume::ROOT_CHUNK == 0 && parent != volume.root_directory_cluster() {
            dotdot.set_cluster(parent);
        }
        dotdot.write_bytes(&mut buf[DIR_ENTRY_SIZE..2 * DIR_ENTRY_SIZE]);
        if volume.data_cluster_write(cluster, &buf).is_err() {
            return Err(CreateError::DevError);
        }
    }
    Ok(())
}

/// Delete `entry`: its LFN run and short entry are marked unused and its
/// cluster chain is freed in the FAT.
pub fn delete_entry(volume: &Volume, entry: &LocationAwareFileEntry) -> bool {
    // Mark every slot of the run (LFN entries, then the short entry).
    let start = entry.first_lfn.unwrap_or(entry.location);
    let mut cluster = start.cluster;
    let mut index = start.entry_index as usize;
    let entries_per_cluster = volume.cluster_size() as usize / DIR_ENTRY_SIZE;
    let mut buf = vec![0u8; volume.cluster_size() as usize];
    'mark: loop {
        if volume.data_cluster_read(cluster, &mut buf).is_err() {
            return false;
        }
        while index < entries_per_cluster {
            buf[index * DIR_ENTRY_SIZE] = FileEntry::MARK_EMPTY_MIDDLE;
            let done = cluster == entry.location.cluster
                && index == entry.location.entry_index as usize;
            if done {
                if volume.data_cluster_write(cluster, &buf).is_err() {
                    return false;
                }
                break 'mark;
            }
            index += 1;
        }
        if volume.data_cluster_write(cluster, &buf).is_err() {
            return false;
        }
        cluster = match volume.fat_read(cluster) {
            Ok(next) if !volume.is_chain_end(next) => next,
            _ => return false,
        };
        index = 0;
    }

    // Free the content chain.
    let first = entry.file.cluster();
    if first != 0 && first & super::volume::ROOT_CHUNK == 0 {
        let chain = match volume.chain_of(first) {
            Ok(chain) => chain,
            Err(_) => return false,
        };
        for cluster in chain {
            if volume.fat_write(cluster, 0).is_err() {
                return false;
            }
        }
    }
    true
}
