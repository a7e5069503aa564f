//! The FAT12/16/32 filesystem driver.
//!
//! Mounting reads and classifies the boot record; every mounted device gets
//! a dedicated kernel mutex that serializes multi-sector updates (directory
//! extension, cluster allocation, node writes). The driver keeps one
//! [`Volume`] per mounted device and serves the VFS driver interface.

pub mod bpb;
pub mod dir_entry;
pub mod dir_iter;
pub mod entries;
pub mod format;
pub mod node;
pub mod volume;

use crate::block;
use crate::fs::vfs::node::{IoMode, NodeAttributes, NodeInfo, NodeOps};
use crate::fs::vfs::path::Path;
use crate::fs::vfs::status::{FormatStatus, IoStatus, MountStatus};
use crate::fs::vfs::stream::{DirectoryStreamOps, StreamItem};
use crate::fs::vfs::FilesystemDriver;
use crate::task::mutex;
use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::string::ToString;
use bpb::Bpb;
use dir_entry::{is_valid_long_name, FatAttributes, FileEntry, LocationAwareFileEntry};
use dir_iter::{DirectoryIterationMode, FatDirectoryIterator, IteratorState};
use entries::VolumeAccessStatus;
use node::FatNode;
use volume::Volume;

pub struct FatDriver {
    volumes: BTreeMap<u16, Volume>,
}

impl FatDriver {
    pub fn new() -> Self {
        Self {
            volumes: BTreeMap::new(),
        }
    }

    fn volume(&self, device: u16) -> Option<Volume> {
        self.volumes.get(&device).copied()
    }

    fn node_attributes(entry: &FileEntry) -> NodeAttributes {
        let mut attrs = NodeAttributes::empty();
        if entry.has_attribute(FatAttributes::READ_ONLY) {
            attrs |= NodeAttributes::READONLY;
        }
        if entry.has_attribute(FatAttributes::HIDDEN) {
            attrs |= NodeAttributes::HIDDEN;
        }
        if entry.has_attribute(FatAttributes::SYSTEM) {
            attrs |= NodeAttributes::SYSTEM;
        }
        if entry.has_attribute(FatAttributes::DIRECTORY) {
            attrs |= NodeAttributes::DIRECTORY;
        } else {
            attrs |= NodeAttributes::FILE;
        }
        attrs
    }

    fn fat_attributes(attrs: NodeAttributes) -> FatAttributes {
        let mut fat = FatAttributes::empty();
        if attrs.contains(NodeAttributes::READONLY) {
            fat |= FatAttributes::READ_ONLY;
        }
        if attrs.contains(NodeAttributes::HIDDEN) {
            fat |= FatAttributes::HIDDEN;
        }
        if attrs.contains(NodeAttributes::SYSTEM) {
            fat |= FatAttributes::SYSTEM;
        }
        if attrs.contains(NodeAttributes::DIRECTORY) {
            fat |= FatAttributes::DIRECTORY;
        } else {
            fat |= FatAttributes::ARCHIVE;
        }
        fat
    }

    fn map_access(status: VolumeAccessStatus) -> IoStatus {
        match status {
            VolumeAccessStatus::Okay => IoStatus::Found,
            VolumeAccessStatus::NotFound => IoStatus::NotFound,
            VolumeAccessStatus::BadPath => IoStatus::NotFound,
            VolumeAccessStatus::DevError => IoStatus::DevError,
        }
    }

    /// Whether a directory holds any entry besides `.` and `..`.
    fn directory_in_use(volume: &Volume, entry: &LocationAwareFileEntry) -> Result<bool, IoStatus> {
        let mut it = FatDirectoryIterator::new(
            *volume,
            entry.file.cluster(),
            DirectoryIterationMode::ListDirectory,
        );
        while it.has_next() {
            let name = it.current().file_name.as_str();
            if name != "." && name != ".." {
                return Ok(true);
            }
            it.step();
        }
        if it.state() == IteratorState::EndOfDirectory {
            Ok(false)
        } else {
            Err(IoStatus::DevError)
        }
    }
}

impl Default for FatDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl FilesystemDriver for FatDriver {
    fn name(&self) -> &'static str {
        "FAT"
    }

    fn format(&mut self, device: u16) -> FormatStatus {
        if self.volumes.contains_key(&device) {
            // Formatting under a live mount would tear the volume state
            // out from under open nodes.
            return FormatStatus::FormatError;
        }
        format::format(device)
    }

    fn mount(&mut self, device: u16) -> MountStatus {
        if self.volumes.contains_key(&device) {
            return MountStatus::AlreadyMounted;
        }
        let sector_size = match block::sector_size_of(device) {
            Ok(size) => size,
            Err(_) => return MountStatus::DevError,
        };
        let mut sector = alloc::vec![0u8; sector_size];
        if block::read(device, &mut sector, 0).is_err() {
            log::warn!("fat: device {} boot sector unreadable", device);
            return MountStatus::DevError;
        }
        let Some(bpb) = Bpb::from_bytes(&sector) else {
            return MountStatus::NotSupported;
        };
        if bpb.bytes_per_sector as usize != sector_size {
            return MountStatus::NotSupported;
        }
        let device_mutex =
            mutex::create_mutex(alloc::format!("fat-dev{}", device)).unwrap_or(0);
        let volume = Volume::new(device, bpb, device_mutex);
        log::info!(
            "fat: device {} mounted as {:?} ({} clusters)",
            device,
            volume.fat_type,
            bpb.cluster_count()
        );
        self.volumes.insert(device, volume);
        MountStatus::Mounted
    }

    fn unmount(&mut self, device: u16) -> MountStatus {
        match self.volumes.remove(&device) {
            Some(volume) => {
                if volume.device_mutex != 0 {
                    mutex::release_mutex_object(volume.device_mutex);
                }
                MountStatus::Unmounted
            }
            None => MountStatus::NotMounted,
        }
    }

    fn is_valid_file_path(&self, path: &Path) -> bool {
        path.components()
            .all(|c| c == "." || c == ".." || is_valid_long_name(c))
    }

    fn create(&mut self, device: u16, path: &Path, attributes: NodeAttributes) -> IoStatus {
        let Some(volume) = self.volume(device) else {
            return IoStatus::DevUnknown;
        };
        let name = path.file_name().to_string();
        if !is_valid_long_name(&name) {
            return IoStatus::BadName;
        }

        match entries::search(&volume, path) {
            Ok(_) => return IoStatus::Exists,
            Err(VolumeAccessStatus::NotFound) => {}
            Err(status) => return Self::map_access(status),
        }

        let parent = path.parent();
        let mut dir = match entries::search(&volume, &parent) {
            Ok(dir) => dir,
            Err(status) => return Self::map_access(status),
        };
        if !dir.file.has_attribute(FatAttributes::DIRECTORY) {
            return IoStatus::BadPath;
        }

        volume.lock_device();
        let result = entries::create_entry(&volume, &mut dir, &name, Self::fat_attributes(attributes));
        volume.unlock_device();
        match result {
            Ok(()) => IoStatus::Created,
            Err(entries::CreateError::Exists) => IoStatus::Exists,
            Err(entries::CreateError::BadName) => IoStatus::BadName,
            Err(entries::CreateError::DevError) => IoStatus::DevError,
        }
    }

    fn open(
        &mut self,
        device: u16,
        path: &Path,
        io_mode: IoMode,
    ) -> Result<Box<dyn NodeOps>, IoStatus> {
        let volume = self.volume(device).ok_or(IoStatus::DevUnknown)?;
        let entry = entries::search(&volume, path).map_err(|status| match status {
            VolumeAccessStatus::NotFound | VolumeAccessStatus::BadPath => IoStatus::NotFound,
            _ => IoStatus::DevError,
        })?;
        Ok(Box::new(FatNode::open(volume, io_mode, entry)))
    }

    fn find_node(&mut self, device: u16, path: &Path) -> Result<NodeInfo, IoStatus> {
        let volume = self.volume(device).ok_or(IoStatus::DevUnknown)?;
        let entry = entries::search(&volume, path).map_err(|status| match status {
            VolumeAccessStatus::NotFound | VolumeAccessStatus::BadPath => IoStatus::NotFound,
            _ => IoStatus::DevError,
        })?;
        Ok(NodeInfo {
            path: entry.file_name.clone(),
            size: if entry.file.has_attribute(FatAttributes::DIRECTORY) {
                0
            } else {
                entry.file.file_size as u64
            },
            attributes: Self::node_attributes(&entry.file),
        })
    }

    fn delete_node(&mut self, device: u16, path: &Path) -> IoStatus {
        let Some(volume) = self.volume(device) else {
            return IoStatus::DevUnknown;
        };
        if path.components().next().is_none() {
            // The root directory cannot be deleted.
            return IoStatus::AccessDenied;
        }
        let entry = match entries::search(&volume, path) {
            Ok(entry) => entry,
            Err(status) => return Self::map_access(status),
        };
        if entry.file.has_attribute(FatAttributes::DIRECTORY) {
            match Self::directory_in_use(&volume, &entry) {
                Ok(true) => return IoStatus::AccessDenied,
                Ok(false) => {}
                Err(status) => return status,
            }
        }
        volume.lock_device();
        let ok = entries::delete_entry(&volume, &entry);
        volume.unlock_device();
        if ok {
            IoStatus::Deleted
        } else {
            log::warn!("fat: delete of {} failed on device {}", path, device);
            IoStatus::DevError
        }
    }

    fn open_directory_stream(
        &mut self,
        device: u16,
        path: &Path,
    ) -> Result<Box<dyn DirectoryStreamOps>, IoStatus> {
        let volume = self.volume(device).ok_or(IoStatus::DevUnknown)?;
        let entry = entries::search(&volume, path).map_err(|status| match status {
            VolumeAccessStatus::NotFound => IoStatus::NotFound,
            VolumeAccessStatus::BadPath => IoStatus::BadPath,
            _ => IoStatus::DevError,
        })?;
        if !entry.file.has_attribute(FatAttributes::DIRECTORY) {
            return Err(IoStatus::BadPath);
        }
        let it = FatDirectoryIterator::new(
            volume,
            entry.file.cluster(),
            DirectoryIterationMode::ListDirectory,
        );
        Ok(Box::new(FatDirectoryStream { it }))
    }
}

/// Directory stream over a FAT directory iterator.
struct FatDirectoryStream {
    it: FatDirectoryIterator,
}

impl DirectoryStreamOps for FatDirectoryStream {
    fn next(&mut self) -> StreamItem {
        match self.it.state() {
            IteratorState::EndOfDirectory => return StreamItem::EndOfData,
            IteratorState::CorruptLfnEntry | IteratorState::DeviceError => {
                return StreamItem::IoError
            }
            IteratorState::Iterating => {}
        }
        let entry = self.it.current().clone();
        let info = NodeInfo {
            path: entry.file_name.clone(),
            size: if entry.file.has_attribute(FatAttributes::DIRECTORY) {
                0
            } else {
                entry.file.file_size as u64
            },
            attributes: FatDriver::node_attributes(&entry.file),
        };
        self.it.step();
        StreamItem::Entry(info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::ram_disk::RamDisk;
    use crate::block::register_device;
    use crate::fs::vfs::node::SeekMode;
    use crate::fs::vfs::status::NodeIoStatus;
    use alloc::vec::Vec;

    fn formatted_fat16() -> (FatDriver, u16) {
        let disk = RamDisk::new(512, 65536); // 32 MiB
        let device = register_device("fat16it".to_string(), Box::new(disk)).unwrap();
        let mut driver = FatDriver::new();
        assert_eq!(driver.format(device), FormatStatus::Formatted);
        assert_eq!(driver.mount(device), MountStatus::Mounted);
        (driver, device)
    }

    #[test]
    fn test_mount_classifies_volume() {
        let (mut driver, device) = formatted_fat16();
        assert_eq!(driver.mount(device), MountStatus::AlreadyMounted);
        assert_eq!(driver.unmount(device), MountStatus::Unmounted);
        assert_eq!(driver.unmount(device), MountStatus::NotMounted);
    }

    #[test]
    fn test_mount_refuses_unformatted_device() {
        let disk = RamDisk::new(512, 128);
        let device = register_device("blank".to_string(), Box::new(disk)).unwrap();
        let mut driver = FatDriver::new();
        assert_eq!(driver.mount(device), MountStatus::NotSupported);
    }

    #[test]
    fn test_create_find_delete_round_trip() {
        let (mut driver, device) = formatted_fat16();
        let path = Path::new("notes.txt");

        assert_eq!(
            driver.create(device, &path, NodeAttributes::FILE),
            IoStatus::Created
        );
        let info = driver.find_node(device, &path).unwrap();
        assert_eq!(info.path, "notes.txt");
        assert_eq!(info.attributes, NodeAttributes::FILE);
        assert_eq!(info.size, 0);

        assert_eq!(
            driver.create(device, &path, NodeAttributes::FILE),
            IoStatus::Exists
        );
        assert_eq!(driver.delete_node(device, &path), IoStatus::Deleted);
        assert_eq!(
            driver.find_node(device, &path).unwrap_err(),
            IoStatus::NotFound
        );
    }

    #[test]
    fn test_write_close_read_round_trip() {
        let (mut driver, device) = formatted_fat16();
        let path = Path::new("payload.bin");
        driver.create(device, &path, NodeAttributes::FILE);

        let data: Vec<u8> = (0..10_000).map(|i| (i % 241) as u8).collect();
        let mut writer = driver.open(device, &path, IoMode::Write).unwrap();
        let result = writer.write(&data);
        assert_eq!(result.status, NodeIoStatus::Okay);
        assert_eq!(result.byte_count, data.len());
        drop(writer);

        let mut reader = driver.open(device, &path, IoMode::Read).unwrap();
        let mut back = alloc::vec![0u8; data.len()];
        let result = reader.read(&mut back);
        assert_eq!(result.byte_count, data.len());
        assert_eq!(back, data);
    }

    #[test]
    fn test_seek_read_scenario() {
        let (mut driver, device) = formatted_fat16();
        let path = Path::new("seek.bin");
        driver.create(device, &path, NodeAttributes::FILE);

        let data: Vec<u8> = (0..1024u32).map(|i| (i % 256) as u8).collect();
        driver.open(device, &path, IoMode::Write).unwrap().write(&data);

        let mut node = driver.open(device, &path, IoMode::Read).unwrap();
        let result = node.seek(SeekMode::Begin, 512);
        assert_eq!(result.status, NodeIoStatus::Okay);
        assert_eq!(result.byte_count, 512);
        let mut back = alloc::vec![0u8; 256];
        node.read(&mut back);
        assert_eq!(&back[..], &data[512..768]);
    }

    #[test]
    fn test_directory_stream_on_subdirectory() {
        let (mut driver, device) = formatted_fat16();
        driver.create(device, &Path::new("docs"), NodeAttributes::DIRECTORY);
        driver.create(device, &Path::new("docs/readme.md"), NodeAttributes::FILE);

        let mut stream = driver
            .open_directory_stream(device, &Path::new("docs"))
            .unwrap();
        let mut names = Vec::new();
        loop {
            match stream.next() {
                StreamItem::Entry(info) => names.push(info.path),
                StreamItem::EndOfData => break,
                StreamItem::IoError => panic!("stream error"),
            }
        }
        assert!(names.contains(&".".to_string()));
        assert!(names.contains(&"..".to_string()));
        assert!(names.contains(&"readme.md".to_string()));
    }

    #[test]
    fn test_delete_refuses_nonempty_directory() {
        let (mut driver, device) = formatted_fat16();
        driver.create(device, &Path::new("full"), NodeAttributes::DIRECTORY);
        driver.create(device, &Path::new("full/file"), NodeAttributes::FILE);

        assert_eq!(
            driver.delete_node(device, &Path::new("full")),
            IoStatus::AccessDenied
        );
        driver.delete_node(device, &Path::new("full/file"));
        assert_eq!(driver.delete_node(device, &Path::new("full")), IoStatus::Deleted);
    }

    #[test]
    fn test_path_validation() {
        let driver = FatDriver::new();
        assert!(driver.is_valid_file_path(&Path::new("/docs/long file name.txt")));
        assert!(driver.is_valid_file_path(&Path::new("../up")));
        assert!(!driver.is_valid_file_path(&Path::new("/bad\"name")));
        assert!(!driver.is_valid_file_path(&Path::new("/bad*glob")));
    }

    #[test]
    fn test_fat32_lfn_create_and_enumerate() {
        // Scenario: freshly formatted FAT32 volume with 4 KiB clusters; an
        // 18-character name takes 2 LFN entries + 1 short entry and lists
        // as exactly one node.
        let disk = RamDisk::new(512, 550_000);
        let device = register_device("fat32it".to_string(), Box::new(disk)).unwrap();
        let mut driver = FatDriver::new();
        assert_eq!(
            format::format_with(device, bpb::FatType::Fat32, 8),
            FormatStatus::Formatted
        );
        assert_eq!(driver.mount(device), MountStatus::Mounted);

        let path = Path::new("long file name.txt");
        assert_eq!(
            driver.create(device, &path, NodeAttributes::FILE),
            IoStatus::Created
        );

        // The run occupies three contiguous slots in the root cluster.
        let volume = driver.volume(device).unwrap();
        let entry = entries::search(&volume, &path).unwrap();
        let first_lfn = entry.first_lfn.unwrap();
        assert_eq!(entry.location.entry_index - first_lfn.entry_index, 2);
        assert_eq!(first_lfn.cluster, entry.location.cluster);

        let mut stream = driver.open_directory_stream(device, &Path::new("")).unwrap();
        let mut listed = Vec::new();
        loop {
            match stream.next() {
                StreamItem::Entry(info) => listed.push(info),
                StreamItem::EndOfData => break,
                StreamItem::IoError => panic!("stream error"),
            }
        }
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].path, "long file name.txt");
        assert_eq!(listed[0].attributes, NodeAttributes::FILE);
    }

    #[test]
    fn test_fat12_volume_end_to_end() {
        let disk = RamDisk::new(512, 2048); // 1 MiB: FAT12
        let device = register_device("fat12it".to_string(), Box::new(disk)).unwrap();
        let mut driver = FatDriver::new();
        assert_eq!(driver.format(device), FormatStatus::Formatted);
        assert_eq!(driver.mount(device), MountStatus::Mounted);

        let path = Path::new("boot.cfg");
        driver.create(device, &path, NodeAttributes::FILE);
        let mut writer = driver.open(device, &path, IoMode::Write).unwrap();
        writer.write(b"timeout=5");
        drop(writer);

        let mut reader = driver.open(device, &path, IoMode::Read).unwrap();
        let mut back = [0u8; 9];
        assert_eq!(reader.read(&mut back).byte_count, 9);
        assert_eq!(&back, b"timeout=5");
    }
}
