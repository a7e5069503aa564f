//! Virtual filesystem core.
//!
//! Two handle tables (open nodes, directory streams) with independent
//! nonzero `u16` handle counters, a mount table with longest-prefix
//! matching, and the pluggable driver interface filesystem implementations
//! register with.
//!
//! Concurrency rule: for any absolute path at most one open node may exist
//! if any of them is in `Write` or `Append` mode. `delete` on a path with
//! an open handle is refused.

pub mod node;
pub mod path;
pub mod status;
pub mod stream;

use crate::util::handle::HandleTable;
use alloc::boxed::Box;
use alloc::string::ToString;
use alloc::vec::Vec;
use node::{IoMode, Node, NodeAttributes, NodeInfo, NodeOps};
use path::Path;
use spin::Mutex;
use status::{FormatStatus, IoStatus, MountStatus, NodeIoResult};
use stream::{DirectoryStream, DirectoryStreamOps, StreamItem};

/// A filesystem driver serves a family of formatted storage devices.
pub trait FilesystemDriver: Send {
    /// Name of the filesystem specification (e.g. "FAT").
    fn name(&self) -> &'static str;

    /// Put a fresh, empty filesystem on the device. Existing data is lost.
    fn format(&mut self, device: u16) -> FormatStatus;

    /// Make a storage device known to the driver.
    fn mount(&mut self, device: u16) -> MountStatus;

    /// Remove a storage device from the driver's mount table.
    fn unmount(&mut self, device: u16) -> MountStatus;

    /// Whether the path is free of characters this filesystem rejects.
    fn is_valid_file_path(&self, path: &Path) -> bool;

    /// Create a file or directory at `path` (relative to the mount point).
    fn create(&mut self, device: u16, path: &Path, attributes: NodeAttributes) -> IoStatus;

    /// Open the node at `path`; the driver returns its node operations.
    fn open(
        &mut self,
        device: u16,
        path: &Path,
        io_mode: IoMode,
    ) -> Result<Box<dyn NodeOps>, IoStatus>;

    /// Look a node up without opening it.
    fn find_node(&mut self, device: u16, path: &Path) -> Result<NodeInfo, IoStatus>;

    /// Delete the node at `path`.
    fn delete_node(&mut self, device: u16, path: &Path) -> IoStatus;

    /// Open a stream over the entries of the directory at `path`.
    fn open_directory_stream(
        &mut self,
        device: u16,
        path: &Path,
    ) -> Result<Box<dyn DirectoryStreamOps>, IoStatus>;
}

/// A mounted device: mount point, storage device and the serving driver.
pub struct Mount {
    pub mount_point: Path,
    pub device: u16,
    pub driver: usize,
}

/// The VFS: driver registry, mount table and both handle tables.
pub struct Vfs {
    drivers: Vec<Box<dyn FilesystemDriver>>,
    mounts: Vec<Mount>,
    nodes: HandleTable<Node>,
    streams: HandleTable<DirectoryStream>,
}

impl Vfs {
    pub const fn new() -> Self {
        Self {
            drivers: Vec::new(),
            mounts: Vec::new(),
            nodes: HandleTable::new(),
            streams: HandleTable::new(),
        }
    }

    /// Register a filesystem driver, returning its index.
    pub fn install_driver(&mut self, driver: Box<dyn FilesystemDriver>) -> usize {
        log::info!("vfs: driver \"{}\" installed", driver.name());
        self.drivers.push(driver);
        self.drivers.len() - 1
    }

    /// Format `device` with the driver at `driver_index`.
    pub fn format(&mut self, driver_index: usize, device: u16) -> FormatStatus {
        match self.drivers.get_mut(driver_index) {
            Some(driver) => driver.format(device),
            None => FormatStatus::FormatError,
        }
    }

    /// Mount `device` at `mount_point` using the driver at `driver_index`.
    ///
    /// Mount points may not nest and a device is mounted at most once.
    pub fn mount(&mut self, mount_point: Path, device: u16, driver_index: usize) -> MountStatus {
        let mount_point = mount_point.normalize();
        if !mount_point.is_absolute() {
            return MountStatus::MountError;
        }
        for mount in &self.mounts {
            if mount.device == device {
                return MountStatus::AlreadyMounted;
            }
            if mount.mount_point == mount_point {
                return MountStatus::MountError;
            }
            // Everything lives under the root mount; between any other two
            // mounts, nesting is refused.
            let nested = !mount.mount_point.is_root()
                && !mount_point.is_root()
                && (mount.mount_point.strip_prefix(&mount_point).is_some()
                    || mount_point.strip_prefix(&mount.mount_point).is_some());
            if nested {
                log::warn!(
                    "vfs: mount point {} nests with existing {}",
                    mount_point,
                    mount.mount_point
                );
                return MountStatus::MountError;
            }
        }
        let Some(driver) = self.drivers.get_mut(driver_index) else {
            return MountStatus::MountError;
        };
        let status = driver.mount(device);
        if status == MountStatus::Mounted {
            log::info!("vfs: device {} mounted at {}", device, mount_point);
            self.mounts.push(Mount {
                mount_point,
                device,
                driver: driver_index,
            });
        }
        status
    }

    /// Unmount the device at `mount_point`. Refused while nodes or streams
    /// under the mount are open.
    pub fn unmount(&mut self, mount_point: &Path) -> MountStatus {
        let mount_point = mount_point.normalize();
        let Some(index) = self
            .mounts
            .iter()
            .position(|m| m.mount_point == mount_point)
        else {
            return MountStatus::NotMounted;
        };
        let busy = self
            .nodes
            .iter()
            .any(|(_, n)| n.path.strip_prefix(&mount_point).is_some());
        if busy {
            return MountStatus::MountError;
        }
        let mount = &self.mounts[index];
        let device = mount.device;
        let driver = mount.driver;
        let status = self.drivers[driver].unmount(device);
        if status == MountStatus::Unmounted {
            self.mounts.remove(index);
        }
        status
    }

    /// The mount serving `path`: longest matching mount point wins.
    fn resolve_mount(&self, path: &Path) -> Option<(usize, Path)> {
        let mut best: Option<(usize, usize)> = None;
        for (i, mount) in self.mounts.iter().enumerate() {
            if path.strip_prefix(&mount.mount_point).is_some() {
                let len = mount.mount_point.as_str().len();
                if best.map(|(_, l)| len > l).unwrap_or(true) {
                    best = Some((i, len));
                }
            }
        }
        best.map(|(i, _)| {
            let suffix = path.strip_prefix(&self.mounts[i].mount_point).unwrap();
            (i, suffix)
        })
    }

    /// Whether `path` is valid for the driver mounted at its prefix.
    pub fn is_valid_file_path(&self, path: &Path) -> bool {
        if !path.is_absolute() {
            return false;
        }
        match self.resolve_mount(&path.normalize()) {
            Some((mount, suffix)) => self.drivers[self.mounts[mount].driver]
                .is_valid_file_path(&suffix),
            None => false,
        }
    }

    /// Look up node information without creating a handle.
    pub fn get_node_info(&mut self, path: &Path) -> Result<NodeInfo, IoStatus> {
        if !path.is_absolute() {
            return Err(IoStatus::BadPath);
        }
        let path = path.normalize();
        let (mount, suffix) = self.resolve_mount(&path).ok_or(IoStatus::DevUnknown)?;
        let (device, driver) = (self.mounts[mount].device, self.mounts[mount].driver);
        let mut info = self.drivers[driver].find_node(device, &suffix)?;
        // Drivers report the bare node name; hand the full path back.
        info.path = path.as_str().to_string();
        Ok(info)
    }

    /// Create a file or directory.
    pub fn create(&mut self, path: &Path, attributes: NodeAttributes) -> IoStatus {
        if !attributes.is_well_formed() {
            return IoStatus::BadAttribute;
        }
        if !path.is_absolute() {
            return IoStatus::BadPath;
        }
        let path = path.normalize();
        let Some((mount, suffix)) = self.resolve_mount(&path) else {
            return IoStatus::DevUnknown;
        };
        let (device, driver) = (self.mounts[mount].device, self.mounts[mount].driver);
        self.drivers[driver].create(device, &suffix, attributes)
    }

    /// Open a node. Enforces the at-most-one-writer rule.
    pub fn open(&mut self, path: &Path, io_mode: IoMode) -> Result<u16, IoStatus> {
        if !path.is_absolute() {
            return Err(IoStatus::BadPath);
        }
        let path = path.normalize();

        let mut open_on_path = 0;
        let mut writer_open = false;
        for (_, node) in self.nodes.iter() {
            if node.path == path {
                open_on_path += 1;
                writer_open |= node.io_mode.is_writing();
            }
        }
        if writer_open || (io_mode.is_writing() && open_on_path > 0) {
            return Err(IoStatus::AccessDenied);
        }

        let (mount, suffix) = self.resolve_mount(&path).ok_or(IoStatus::DevUnknown)?;
        let (device, driver) = (self.mounts[mount].device, self.mounts[mount].driver);
        let ops = self.drivers[driver].open(device, &suffix, io_mode)?;
        let handle = self
            .nodes
            .insert_with(|handle| Node::new(handle, path.clone(), io_mode, ops))
            .ok_or(IoStatus::OutOfHandles)?;
        Ok(handle)
    }

    /// Close a node: runs the driver teardown and empties exactly one
    /// table slot.
    pub fn close_node(&mut self, handle: u16) -> bool {
        match self.nodes.get_mut(handle) {
            Some(node) => {
                node.mark_closed();
                self.nodes.remove(handle).is_some()
            }
            None => false,
        }
    }

    /// Delete the node at `path`. Refused while any handle on the path is
    /// open.
    pub fn delete(&mut self, path: &Path) -> IoStatus {
        if !path.is_absolute() {
            return IoStatus::BadPath;
        }
        let path = path.normalize();
        if self.nodes.iter().any(|(_, n)| n.path == path) {
            return IoStatus::AccessDenied;
        }
        let Some((mount, suffix)) = self.resolve_mount(&path) else {
            return IoStatus::DevUnknown;
        };
        let (device, driver) = (self.mounts[mount].device, self.mounts[mount].driver);
        self.drivers[driver].delete_node(device, &suffix)
    }

    /// Open a stream over a directory's entries.
    pub fn open_directory_stream(&mut self, path: &Path) -> Result<u16, IoStatus> {
        if !path.is_absolute() {
            return Err(IoStatus::BadPath);
        }
        let path = path.normalize();
        let (mount, suffix) = self.resolve_mount(&path).ok_or(IoStatus::DevUnknown)?;
        let (device, driver) = (self.mounts[mount].device, self.mounts[mount].driver);
        let ops = self.drivers[driver].open_directory_stream(device, &suffix)?;
        self.streams
            .insert_with(|handle| DirectoryStream::new(handle, ops))
            .ok_or(IoStatus::OutOfHandles)
    }

    pub fn stream_next(&mut self, handle: u16) -> Option<StreamItem> {
        self.streams.get_mut(handle).map(|s| s.next())
    }

    pub fn close_stream(&mut self, handle: u16) -> bool {
        self.streams.remove(handle).is_some()
    }

    pub fn has_node(&self, handle: u16) -> bool {
        self.nodes.contains(handle)
    }

    pub fn has_stream(&self, handle: u16) -> bool {
        self.streams.contains(handle)
    }

    pub fn open_node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Run `f` on the open node `handle`.
    pub fn with_node<R>(&mut self, handle: u16, f: impl FnOnce(&mut Node) -> R) -> Option<R> {
        self.nodes.get_mut(handle).map(f)
    }

    pub fn node_read(&mut self, handle: u16, buf: &mut [u8]) -> Option<NodeIoResult> {
        self.with_node(handle, |n| n.read(buf))
    }

    pub fn node_write(&mut self, handle: u16, buf: &[u8]) -> Option<NodeIoResult> {
        self.with_node(handle, |n| n.write(buf))
    }
}

impl Default for Vfs {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Global instance
// ---------------------------------------------------------------------------

static VFS: Mutex<Vfs> = Mutex::new(Vfs::new());

/// Run `f` against the global VFS under the scheduler lock.
pub fn with_vfs<R>(f: impl FnOnce(&mut Vfs) -> R) -> R {
    crate::task::scheduler::lock();
    let result = f(&mut VFS.lock());
    crate::task::scheduler::unlock();
    result
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use alloc::collections::BTreeMap;
    use alloc::string::String;
    use alloc::vec::Vec;
    use status::NodeIoStatus;

    /// A trivial in-memory filesystem used to exercise the VFS core.
    pub(crate) struct MemFsDriver {
        mounted: Vec<u16>,
        files: BTreeMap<(u16, String), Vec<u8>>,
    }

    impl MemFsDriver {
        pub fn new() -> Self {
            Self {
                mounted: Vec::new(),
                files: BTreeMap::new(),
            }
        }
    }

    struct MemNode {
        content: Vec<u8>,
        cursor: usize,
    }

    impl NodeOps for MemNode {
        fn size(&self) -> u64 {
            self.content.len() as u64
        }
        fn has_more(&self) -> bool {
            self.cursor < self.content.len()
        }
        fn read(&mut self, buf: &mut [u8]) -> NodeIoResult {
            let n = core::cmp::min(buf.len(), self.content.len() - self.cursor);
            buf[..n].copy_from_slice(&self.content[self.cursor..self.cursor + n]);
            self.cursor += n;
            NodeIoResult::okay(n)
        }
        fn write(&mut self, buf: &[u8]) -> NodeIoResult {
            self.content.extend_from_slice(buf);
            NodeIoResult::okay(buf.len())
        }
        fn seek(&mut self, _mode: node::SeekMode, offset: i64) -> NodeIoResult {
            self.cursor = offset as usize;
            NodeIoResult::okay(self.cursor)
        }
        fn has_attribute(&self, attr: NodeAttributes) -> bool {
            attr == NodeAttributes::FILE
        }
        fn set_attribute(&mut self, _attr: NodeAttributes, _value: bool) -> bool {
            false
        }
    }

    struct MemStream {
        names: Vec<String>,
    }

    impl DirectoryStreamOps for MemStream {
        fn next(&mut self) -> StreamItem {
            if self.names.is_empty() {
                StreamItem::EndOfData
            } else {
                let name = self.names.remove(0);
                StreamItem::Entry(NodeInfo {
                    path: name,
                    size: 0,
                    attributes: NodeAttributes::FILE,
                })
            }
        }
    }

    impl FilesystemDriver for MemFsDriver {
        fn name(&self) -> &'static str {
            "memfs"
        }
        fn format(&mut self, device: u16) -> FormatStatus {
            self.files.retain(|(dev, _), _| *dev != device);
            FormatStatus::Formatted
        }
        fn mount(&mut self, device: u16) -> MountStatus {
            if self.mounted.contains(&device) {
                return MountStatus::AlreadyMounted;
            }
            self.mounted.push(device);
            MountStatus::Mounted
        }
        fn unmount(&mut self, device: u16) -> MountStatus {
            match self.mounted.iter().position(|&d| d == device) {
                Some(pos) => {
                    self.mounted.remove(pos);
                    MountStatus::Unmounted
                }
                None => MountStatus::NotMounted,
            }
        }
        fn is_valid_file_path(&self, path: &Path) -> bool {
            !path.as_str().contains('\\')
        }
        fn create(&mut self, device: u16, path: &Path, _attributes: NodeAttributes) -> IoStatus {
            let key = (device, path.as_str().to_string());
            if self.files.contains_key(&key) {
                return IoStatus::Exists;
            }
            self.files.insert(key, Vec::new());
            IoStatus::Created
        }
        fn open(
            &mut self,
            device: u16,
            path: &Path,
            _io_mode: IoMode,
        ) -> Result<Box<dyn NodeOps>, IoStatus> {
            let key = (device, path.as_str().to_string());
            let content = self.files.get(&key).ok_or(IoStatus::NotFound)?.clone();
            Ok(Box::new(MemNode { content, cursor: 0 }))
        }
        fn find_node(&mut self, device: u16, path: &Path) -> Result<NodeInfo, IoStatus> {
            let key = (device, path.as_str().to_string());
            let content = self.files.get(&key).ok_or(IoStatus::NotFound)?;
            Ok(NodeInfo {
                path: path.file_name().to_string(),
                size: content.len() as u64,
                attributes: NodeAttributes::FILE,
            })
        }
        fn delete_node(&mut self, device: u16, path: &Path) -> IoStatus {
            let key = (device, path.as_str().to_string());
            if self.files.remove(&key).is_some() {
                IoStatus::Deleted
            } else {
                IoStatus::NotFound
            }
        }
        fn open_directory_stream(
            &mut self,
            device: u16,
            _path: &Path,
        ) -> Result<Box<dyn DirectoryStreamOps>, IoStatus> {
            let names = self
                .files
                .keys()
                .filter(|(dev, _)| *dev == device)
                .map(|(_, name)| name.clone())
                .collect();
            Ok(Box::new(MemStream { names }))
        }
    }

    fn vfs_with_mount() -> Vfs {
        let mut vfs = Vfs::new();
        let driver = vfs.install_driver(Box::new(MemFsDriver::new()));
        assert_eq!(vfs.mount(Path::root(), 1, driver), MountStatus::Mounted);
        vfs
    }

    #[test]
    fn test_open_concurrency_rule() {
        let mut vfs = vfs_with_mount();
        let path = Path::new("/x");
        assert_eq!(vfs.create(&path, NodeAttributes::FILE), IoStatus::Created);

        let writer = vfs.open(&path, IoMode::Write).unwrap();
        // Second writer and a reader are both refused.
        assert_eq!(vfs.open(&path, IoMode::Write), Err(IoStatus::AccessDenied));
        assert_eq!(vfs.open(&path, IoMode::Read), Err(IoStatus::AccessDenied));

        assert!(vfs.close_node(writer));
        // After closing, a reader gets through...
        let reader = vfs.open(&path, IoMode::Read).unwrap();
        // ...and more readers are fine, but a writer is not.
        let reader2 = vfs.open(&path, IoMode::Read).unwrap();
        assert_eq!(vfs.open(&path, IoMode::Append), Err(IoStatus::AccessDenied));
        vfs.close_node(reader);
        vfs.close_node(reader2);
    }

    #[test]
    fn test_close_removes_exactly_one_entry() {
        let mut vfs = vfs_with_mount();
        vfs.create(&Path::new("/a"), NodeAttributes::FILE);
        let h = vfs.open(&Path::new("/a"), IoMode::Read).unwrap();
        assert_eq!(vfs.open_node_count(), 1);
        assert!(vfs.close_node(h));
        assert_eq!(vfs.open_node_count(), 0);
        assert!(!vfs.has_node(h));
        // Closing again fails: the slot is gone.
        assert!(!vfs.close_node(h));
    }

    #[test]
    fn test_delete_with_open_handle_denied() {
        let mut vfs = vfs_with_mount();
        vfs.create(&Path::new("/busy"), NodeAttributes::FILE);
        let h = vfs.open(&Path::new("/busy"), IoMode::Read).unwrap();
        assert_eq!(vfs.delete(&Path::new("/busy")), IoStatus::AccessDenied);
        vfs.close_node(h);
        assert_eq!(vfs.delete(&Path::new("/busy")), IoStatus::Deleted);
        assert_eq!(vfs.delete(&Path::new("/busy")), IoStatus::NotFound);
    }

    #[test]
    fn test_bad_attribute_rejected() {
        let mut vfs = vfs_with_mount();
        let both = NodeAttributes::FILE | NodeAttributes::DIRECTORY;
        assert_eq!(vfs.create(&Path::new("/x"), both), IoStatus::BadAttribute);
        assert_eq!(
            vfs.create(&Path::new("/x"), NodeAttributes::HIDDEN),
            IoStatus::BadAttribute
        );
    }

    #[test]
    fn test_longest_mount_prefix_wins() {
        let mut vfs = Vfs::new();
        let d0 = vfs.install_driver(Box::new(MemFsDriver::new()));
        let d1 = vfs.install_driver(Box::new(MemFsDriver::new()));
        assert_eq!(vfs.mount(Path::root(), 1, d0), MountStatus::Mounted);
        assert_eq!(vfs.mount(Path::new("/mnt/data"), 2, d1), MountStatus::Mounted);

        // Creating under /mnt/data lands on device 2: visible via the root
        // mount only if resolution picked the wrong mount.
        assert_eq!(
            vfs.create(&Path::new("/mnt/data/f"), NodeAttributes::FILE),
            IoStatus::Created
        );
        assert!(vfs.get_node_info(&Path::new("/mnt/data/f")).is_ok());
        assert_eq!(
            vfs.get_node_info(&Path::new("/f")).unwrap_err(),
            IoStatus::NotFound
        );
    }

    #[test]
    fn test_mounts_do_not_nest() {
        let mut vfs = Vfs::new();
        let d = vfs.install_driver(Box::new(MemFsDriver::new()));
        assert_eq!(vfs.mount(Path::new("/data"), 1, d), MountStatus::Mounted);
        assert_eq!(
            vfs.mount(Path::new("/data/inner"), 2, d),
            MountStatus::MountError
        );
        assert_eq!(vfs.mount(Path::new("/data"), 3, d), MountStatus::MountError);
        // Same device twice is refused before driver dispatch.
        assert_eq!(vfs.mount(Path::new("/other"), 1, d), MountStatus::AlreadyMounted);
    }

    #[test]
    fn test_relative_path_rejected() {
        let mut vfs = vfs_with_mount();
        assert_eq!(
            vfs.get_node_info(&Path::new("rel/x")).unwrap_err(),
            IoStatus::BadPath
        );
        assert_eq!(vfs.open(&Path::new("x"), IoMode::Read), Err(IoStatus::BadPath));
    }

    #[test]
    fn test_node_info_carries_full_path() {
        let mut vfs = vfs_with_mount();
        vfs.create(&Path::new("/dir/../f"), NodeAttributes::FILE);
        let info = vfs.get_node_info(&Path::new("/f")).unwrap();
        assert_eq!(info.path, "/f");
    }

    #[test]
    fn test_closed_node_io_reports_closed() {
        let mut vfs = vfs_with_mount();
        vfs.create(&Path::new("/c"), NodeAttributes::FILE);
        let h = vfs.open(&Path::new("/c"), IoMode::Read).unwrap();
        vfs.close_node(h);
        let mut buf = [0u8; 4];
        assert!(vfs.node_read(h, &mut buf).is_none());
        let _ = NodeIoStatus::Closed;
    }
}
