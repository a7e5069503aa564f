//! Creating FAT filesystems.
//!
//! Writes the boot record (and FsInfo on FAT32), clears the FATs, reserves
//! clusters 0 and 1, and prepares the root directory. The FAT size uses the
//! specification's estimation formula, which may slightly overshoot; the
//! cluster-count classification is validated after the geometry is fixed.

use super::bpb::{Bpb, FatType, FsInfo};
use crate::block;
use crate::fs::vfs::status::FormatStatus;
use alloc::vec;

/// Format `device`, choosing the FAT variant from the device size.
pub fn format(device: u16) -> FormatStatus {
    let (sector_size, sectors) = match (block::sector_size_of(device), block::sector_count_of(device)) {
        (Ok(size), Ok(count)) => (size, count),
        _ => return FormatStatus::DevError,
    };
    let bytes = sectors * sector_size as u64;
    let (fat_type, sectors_per_cluster) = if bytes < 16 * 1024 * 1024 {
        (FatType::Fat12, 1)
    } else if bytes < 260 * 1024 * 1024 {
        (FatType::Fat16, 4)
    } else {
        (FatType::Fat32, 8)
    };
    format_with(device, fat_type, sectors_per_cluster)
}

/// Format `device` as `fat_type` with the given cluster geometry.
pub fn format_with(device: u16, fat_type: FatType, sectors_per_cluster: u8) -> FormatStatus {
    let (sector_size, total_sectors) =
        match (block::sector_size_of(device), block::sector_count_of(device)) {
            (Ok(size), Ok(count)) => (size as u32, count as u32),
            _ => return FormatStatus::DevError,
        };
    if !sectors_per_cluster.is_power_of_two() {
        return FormatStatus::FormatError;
    }

    let reserved = match fat_type {
        FatType::Fat32 => 32u16,
        _ => 1,
    };
    let root_entries: u16 = match fat_type {
        FatType::Fat32 => 0,
        _ => 512,
    };
    let fat_count = 2u8;
    let root_dir_sectors =
        crate::util::div_round_up(root_entries as u64 * 32, sector_size as u64) as u32;

    // FAT size estimation per the specification.
    let tmp1 = total_sectors - reserved as u32 - root_dir_sectors;
    let mut tmp2 = 256 * sectors_per_cluster as u32 + fat_count as u32;
    if fat_type == FatType::Fat32 {
        tmp2 /= 2;
    }
    let fat_size = (tmp1 + tmp2 - 1) / tmp2;

    let bpb = Bpb {
        bytes_per_sector: sector_size as u16,
        sectors_per_cluster,
        reserved_sector_count: reserved,
        fat_count,
        root_entry_count: root_entries,
        total_sectors_16: if total_sectors < 0x10000 && fat_type != FatType::Fat32 {
            total_sectors as u16
        } else {
            0
        },
        media_descriptor: 0xF8,
        fat_size_16: if fat_type == FatType::Fat32 { 0 } else { fat_size as u16 },
        sectors_per_track: 63,
        head_count: 255,
        hidden_sector_count: 0,
        total_sectors_32: if total_sectors < 0x10000 && fat_type != FatType::Fat32 {
            0
        } else {
            total_sectors
        },
        fat_size_32: if fat_type == FatType::Fat32 { fat_size } else { 0 },
        root_cluster: if fat_type == FatType::Fat32 { 2 } else { 0 },
        fs_info_sector: if fat_type == FatType::Fat32 { 1 } else { 0 },
    };

    // The geometry must classify as the requested variant, otherwise a
    // mount would read the volume with the wrong FAT width.
    if bpb.fat_type() != fat_type {
        log::warn!(
            "fat: device {} geometry ({} clusters) does not fit {:?}",
            device,
            bpb.cluster_count(),
            fat_type
        );
        return FormatStatus::FormatError;
    }

    let mut sector = vec![0u8; sector_size as usize];
    bpb.write_bytes(&mut sector);
    if block::write(device, &sector, 0).is_err() {
        return FormatStatus::DevError;
    }

    // Clear every FAT copy.
    let zero = vec![0u8; sector_size as usize];
    for copy in 0..fat_count as u32 {
        let start = reserved as u32 + copy * fat_size;
        for s in 0..fat_size {
            if block::write(device, &zero, (start + s) as u64).is_err() {
                return FormatStatus::DevError;
            }
        }
    }

    // Clear the FAT12/16 root region.
    for s in 0..root_dir_sectors {
        let sector_index = reserved as u32 + fat_count as u32 * fat_size + s;
        if block::write(device, &zero, sector_index as u64).is_err() {
            return FormatStatus::DevError;
        }
    }

    let volume = super::volume::Volume::new(device, bpb, 0);

    // Reserve the first two FAT slots: media descriptor and end marker.
    let media_entry = match fat_type {
        FatType::Fat12 => 0xF00 | bpb.media_descriptor as u32,
        FatType::Fat16 => 0xFF00 | bpb.media_descriptor as u32,
        FatType::Fat32 => 0x0FFF_FF00 | bpb.media_descriptor as u32,
    };
    if volume.fat_write(0, media_entry).is_err()
        || volume.fat_write(1, volume.eoc_marker()).is_err()
    {
        return FormatStatus::DevError;
    }

    if fat_type == FatType::Fat32 {
        // Root directory cluster and the FsInfo sector.
        if volume.fat_write(2, volume.eoc_marker()).is_err() {
            return FormatStatus::DevError;
        }
        let cluster_zero = vec![0u8; bpb.cluster_size() as usize];
        if volume.data_cluster_write(2, &cluster_zero).is_err() {
            return FormatStatus::DevError;
        }
        let info = FsInfo {
            free_count: bpb.cluster_count() - 1,
            next_free: 3,
        };
        let mut info_sector = vec![0u8; sector_size as usize];
        info.write_bytes(&mut info_sector);
        if block::write(device, &info_sector, bpb.fs_info_sector as u64).is_err() {
            return FormatStatus::DevError;
        }
    }

    log::info!(
        "fat: device {} formatted as {:?}, {} clusters of {} bytes",
        device,
        fat_type,
        bpb.cluster_count(),
        bpb.cluster_size()
    );
    FormatStatus::Formatted
}
