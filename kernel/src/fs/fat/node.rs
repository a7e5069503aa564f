//! FAT nodes: byte-level file IO over cluster chains.

use super::dir_entry::{FatAttributes, LocationAwareFileEntry};
use super::entries;
use super::volume::Volume;
use crate::fs::vfs::node::{IoMode, NodeAttributes, NodeOps, SeekMode};
use crate::fs::vfs::status::{NodeIoResult, NodeIoStatus};
use crate::util::div_round_up;
use alloc::vec;

/// An open file or directory on a FAT volume.
///
/// The cursor is tracked as (clusters fully processed, current cluster,
/// offset within it); the byte position is derived from those.
pub struct FatNode {
    volume: Volume,
    io_mode: IoMode,
    entry: LocationAwareFileEntry,
    processed_clusters: u32,
    current_cluster: u32,
    cluster_offset: u32,
}

impl FatNode {
    pub fn open(volume: Volume, io_mode: IoMode, entry: LocationAwareFileEntry) -> Self {
        let mut node = Self {
            volume,
            io_mode,
            entry,
            processed_clusters: 0,
            current_cluster: 0,
            cluster_offset: 0,
        };
        node.init_file_cursor();
        node
    }

    /// Place the cursor: at the start for `Read`/`Write`, at the current
    /// end of content for `Append`.
    fn init_file_cursor(&mut self) {
        let first = self.entry.file.cluster();
        if self.io_mode != IoMode::Append {
            self.processed_clusters = 0;
            self.current_cluster = first;
            self.cluster_offset = 0;
            return;
        }

        let cluster_size = self.volume.cluster_size();
        let mut last = first;
        let mut count = 0u32;
        let mut cluster = first;
        while cluster != 0 && !self.volume.is_chain_end(cluster) {
            last = cluster;
            cluster = match self.volume.fat_read(cluster) {
                Ok(next) => next,
                Err(_) => break,
            };
            count += 1;
        }

        self.processed_clusters = count;
        if self.entry.file.file_size % cluster_size != 0 {
            self.processed_clusters = self.processed_clusters.saturating_sub(1);
        }
        self.current_cluster = last;
        self.cluster_offset =
            self.entry.file.file_size - self.processed_clusters * cluster_size;
    }

    fn processed_bytes(&self) -> u32 {
        self.processed_clusters * self.volume.cluster_size() + self.cluster_offset
    }

    fn is_file(&self) -> bool {
        !self.entry.file.has_attribute(FatAttributes::DIRECTORY)
    }

    fn map_attribute(attr: NodeAttributes) -> FatAttributes {
        match attr {
            NodeAttributes::READONLY => FatAttributes::READ_ONLY,
            NodeAttributes::HIDDEN => FatAttributes::HIDDEN,
            NodeAttributes::SYSTEM => FatAttributes::SYSTEM,
            NodeAttributes::DIRECTORY => FatAttributes::DIRECTORY,
            NodeAttributes::FILE => FatAttributes::ARCHIVE,
            _ => FatAttributes::empty(),
        }
    }
}

impl NodeOps for FatNode {
    fn size(&self) -> u64 {
        self.entry.file.file_size as u64
    }

    fn has_more(&self) -> bool {
        self.is_file() && self.processed_bytes() < self.entry.file.file_size
    }

    fn read(&mut self, buf: &mut [u8]) -> NodeIoResult {
        if !self.is_file() {
            return NodeIoResult::new(NodeIoStatus::NotSupported, 0);
        }
        if self.entry.file.file_size == 0 || buf.is_empty() {
            return NodeIoResult::okay(0);
        }

        let cluster_size = self.volume.cluster_size() as usize;
        let mut cluster_buf = vec![0u8; cluster_size];
        let mut pos = 0usize;
        while self.has_more() && pos < buf.len() {
            if self
                .volume
                .data_cluster_read(self.current_cluster, &mut cluster_buf)
                .is_err()
            {
                return NodeIoResult::new(NodeIoStatus::DevError, pos);
            }
            // No more than the file holds, the caller wants, or the
            // cluster still has.
            let left_in_file = (self.entry.file.file_size - self.processed_bytes()) as usize;
            let n = core::cmp::min(
                core::cmp::min(left_in_file, buf.len() - pos),
                cluster_size - self.cluster_offset as usize,
            );
            buf[pos..pos + n].copy_from_slice(
                &cluster_buf[self.cluster_offset as usize..self.cluster_offset as usize + n],
            );
            self.cluster_offset += n as u32;
            pos += n;

            if self.cluster_offset >= cluster_size as u32 {
                let next = match self.volume.fat_read(self.current_cluster) {
                    Ok(next) => next,
                    Err(_) => return NodeIoResult::new(NodeIoStatus::DevError, pos),
                };
                if self.volume.is_chain_end(next) {
                    break;
                }
                self.processed_clusters += 1;
                self.current_cluster = next;
                self.cluster_offset = 0;
            }
        }
        NodeIoResult::okay(pos)
    }

    fn write(&mut self, buf: &[u8]) -> NodeIoResult {
        if !self.is_file() {
            return NodeIoResult::new(NodeIoStatus::NotSupported, 0);
        }
        if self.io_mode == IoMode::Read {
            return NodeIoResult::new(NodeIoStatus::NotAllowed, 0);
        }
        if buf.is_empty() {
            return NodeIoResult::okay(0);
        }

        self.volume.lock_device();
        let result = self.write_locked(buf);
        self.volume.unlock_device();
        result
    }

    fn seek(&mut self, mode: SeekMode, offset: i64) -> NodeIoResult {
        if !self.is_file() {
            return NodeIoResult::new(NodeIoStatus::NotSupported, 0);
        }
        let size = self.entry.file.file_size as i64;
        let cluster_size = self.volume.cluster_size() as i64;
        let cursor = self.processed_bytes() as i64;

        // `Begin` rejects positions at or past the size; `End` allows the
        // position exactly at the size (offset 0).
        let target = match mode {
            SeekMode::Begin => {
                if offset < 0 || offset >= size {
                    return NodeIoResult::new(NodeIoStatus::BadArgs, 0);
                }
                offset
            }
            SeekMode::Cursor => {
                let target = cursor + offset;
                if target < 0 || target >= size {
                    return NodeIoResult::new(NodeIoStatus::BadArgs, 0);
                }
                target
            }
            SeekMode::End => {
                if offset > 0 || -offset > size {
                    return NodeIoResult::new(NodeIoStatus::BadArgs, 0);
                }
                size + offset
            }
        };

        let wanted_clusters = (target / cluster_size) as u32;
        let wanted_offset = (target % cluster_size) as u32;

        let mut cluster = self.entry.file.cluster();
        let mut walked = 0u32;
        while walked < wanted_clusters {
            let next = match self.volume.fat_read(cluster) {
                Ok(next) => next,
                Err(_) => return NodeIoResult::new(NodeIoStatus::DevError, 0),
            };
            if self.volume.is_chain_end(next) {
                // Only a position exactly at the end of the chain lands
                // here (target == size on a cluster boundary); the cursor
                // stays on the final cluster.
                walked += 1;
                break;
            }
            cluster = next;
            walked += 1;
        }

        self.processed_clusters = wanted_clusters;
        self.current_cluster = cluster;
        self.cluster_offset = wanted_offset;
        NodeIoResult::okay(target as usize)
    }

    fn has_attribute(&self, attr: NodeAttributes) -> bool {
        self.entry.file.has_attribute(Self::map_attribute(attr))
    }

    fn set_attribute(&mut self, attr: NodeAttributes, value: bool) -> bool {
        let fat_attr = Self::map_attribute(attr);
        if fat_attr.intersects(FatAttributes::DIRECTORY | FatAttributes::ARCHIVE)
            || fat_attr.is_empty()
        {
            return false;
        }
        if value {
            self.entry.file.attributes |= fat_attr.bits();
        } else {
            self.entry.file.attributes &= !fat_attr.bits();
        }
        entries::update(&self.volume, &self.entry)
    }
}

impl FatNode {
    fn write_locked(&mut self, buf: &[u8]) -> NodeIoResult {
        let cluster_size = self.volume.cluster_size();
        let mut cluster_buf = vec![0u8; cluster_size as usize];
        let mut pos = 0usize;
        // The first write in `Write` mode replaces the old content.
        let is_first_write =
            self.processed_clusters == 0 && self.cluster_offset == 0 && self.io_mode == IoMode::Write;

        while pos < buf.len() {
            let allocated = div_round_up(self.entry.file.file_size as u64, cluster_size as u64) as u32;
            if self.current_cluster == 0 || self.processed_clusters >= allocated {
                // Past the end of the existing chain: grow it.
                match entries::allocate_cluster(&self.volume, &mut self.entry, self.current_cluster)
                {
                    Some(cluster) => self.current_cluster = cluster,
                    None => return NodeIoResult::new(NodeIoStatus::DevError, 0),
                }
            }

            if self
                .volume
                .data_cluster_read(self.current_cluster, &mut cluster_buf)
                .is_err()
            {
                return NodeIoResult::new(NodeIoStatus::DevError, pos);
            }
            let n = core::cmp::min(
                buf.len() - pos,
                (cluster_size - self.cluster_offset) as usize,
            );
            let start = self.cluster_offset as usize;
            cluster_buf[start..start + n].copy_from_slice(&buf[pos..pos + n]);
            if is_first_write {
                // Truncating write: zero-pad the rest of the cluster so no
                // stale bytes survive past the new content.
                cluster_buf[start + n..].fill(0);
            }
            if self
                .volume
                .data_cluster_write(self.current_cluster, &cluster_buf)
                .is_err()
            {
                return NodeIoResult::new(NodeIoStatus::DevError, pos);
            }
            pos += n;
            self.cluster_offset += n as u32;

            if self.cluster_offset >= cluster_size {
                self.processed_clusters += 1;
                self.cluster_offset = 0;
                match self.volume.fat_read(self.current_cluster) {
                    Ok(next) if !self.volume.is_chain_end(next) => self.current_cluster = next,
                    Ok(_) => {}
                    Err(_) => return NodeIoResult::new(NodeIoStatus::DevError, pos),
                }
            }
        }

        let old_size = self.entry.file.file_size;
        let new_size = if is_first_write {
            pos as u32
        } else {
            old_size + pos as u32
        };
        self.entry.file.file_size = new_size;

        if new_size < old_size {
            // The file shrank: free the tail of the chain and stamp the
            // new tail with the end-of-chain marker.
            let kept_clusters = div_round_up(new_size as u64, cluster_size as u64) as u32;
            let mut cluster = self.entry.file.cluster();
            let mut tail_cluster = 0;
            let mut index = 0u32;
            while cluster != 0 && !self.volume.is_chain_end(cluster) {
                let next = match self.volume.fat_read(cluster) {
                    Ok(next) => next,
                    Err(_) => {
                        self.entry.file.file_size = old_size;
                        return NodeIoResult::new(NodeIoStatus::DevError, 0);
                    }
                };
                if index == kept_clusters.saturating_sub(1) {
                    tail_cluster = cluster;
                } else if index > kept_clusters.saturating_sub(1) {
                    let _ = self.volume.fat_write(cluster, 0);
                }
                cluster = next;
                index += 1;
            }
            if tail_cluster > 0 {
                let _ = self.volume.fat_write(tail_cluster, self.volume.eoc_marker());
            }
        }

        if !entries::update(&self.volume, &self.entry) {
            self.entry.file.file_size = old_size;
            return NodeIoResult::new(NodeIoStatus::DevError, 0);
        }
        NodeIoResult::okay(pos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::fat::dir_entry::FatAttributes;
    use crate::fs::fat::entries::{create_entry, root_entry, search};
    use crate::fs::fat::volume::tests::fat16_volume;
    use crate::fs::vfs::path::Path;

    fn volume_with_file(name: &str) -> (Volume, LocationAwareFileEntry) {
        let volume = fat16_volume();
        let mut root = root_entry(&volume);
        create_entry(&volume, &mut root, name, FatAttributes::ARCHIVE).unwrap();
        let entry = search(&volume, &Path::new(name)).unwrap();
        (volume, entry)
    }

    fn pattern(len: usize) -> alloc::vec::Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn test_write_then_read_round_trip() {
        let (volume, entry) = volume_with_file("data.bin");
        // 1300 bytes span three 512-byte clusters.
        let data = pattern(1300);
        let mut writer = FatNode::open(volume, IoMode::Write, entry);
        let result = writer.write(&data);
        assert_eq!(result.status, NodeIoStatus::Okay);
        assert_eq!(result.byte_count, 1300);
        assert_eq!(writer.size(), 1300);

        let entry = search(&volume, &Path::new("data.bin")).unwrap();
        assert_eq!(entry.file.file_size, 1300);
        let mut reader = FatNode::open(volume, IoMode::Read, entry);
        let mut back = alloc::vec![0u8; 1300];
        let result = reader.read(&mut back);
        assert_eq!(result.status, NodeIoStatus::Okay);
        assert_eq!(result.byte_count, 1300);
        assert_eq!(back, data);
        assert!(!reader.has_more());
    }

    #[test]
    fn test_short_reads_stop_at_file_size() {
        let (volume, entry) = volume_with_file("small.bin");
        let data = pattern(100);
        FatNode::open(volume, IoMode::Write, entry).write(&data);

        let entry = search(&volume, &Path::new("small.bin")).unwrap();
        let mut reader = FatNode::open(volume, IoMode::Read, entry);
        let mut buf = [0u8; 512];
        let result = reader.read(&mut buf);
        assert_eq!(result.byte_count, 100);
        assert_eq!(&buf[..100], &data[..]);
    }

    #[test]
    fn test_truncating_write_shrinks_chain() {
        let (volume, entry) = volume_with_file("shrink.bin");
        FatNode::open(volume, IoMode::Write, entry).write(&pattern(2000));

        let entry = search(&volume, &Path::new("shrink.bin")).unwrap();
        let chain_before = volume.chain_of(entry.file.cluster()).unwrap();
        assert_eq!(chain_before.len(), 4);

        // Reopening in Write mode and writing less truncates.
        let small = pattern(300);
        let mut writer = FatNode::open(volume, IoMode::Write, entry);
        assert_eq!(writer.write(&small).status, NodeIoStatus::Okay);
        assert_eq!(writer.size(), 300);

        let entry = search(&volume, &Path::new("shrink.bin")).unwrap();
        assert_eq!(entry.file.file_size, 300);
        let chain_after = volume.chain_of(entry.file.cluster()).unwrap();
        assert_eq!(chain_after.len(), 1);
        // The freed clusters are reusable again.
        for cluster in &chain_before[1..] {
            assert_eq!(volume.fat_read(*cluster).unwrap(), 0);
        }

        let mut reader = FatNode::open(volume, IoMode::Read, entry);
        let mut back = alloc::vec![0u8; 300];
        reader.read(&mut back);
        assert_eq!(back, small);
    }

    #[test]
    fn test_append_mode_continues_at_end() {
        let (volume, entry) = volume_with_file("log.txt");
        FatNode::open(volume, IoMode::Write, entry).write(b"hello ");

        let entry = search(&volume, &Path::new("log.txt")).unwrap();
        let mut appender = FatNode::open(volume, IoMode::Append, entry);
        assert_eq!(appender.write(b"world").status, NodeIoStatus::Okay);
        assert_eq!(appender.size(), 11);

        let entry = search(&volume, &Path::new("log.txt")).unwrap();
        let mut reader = FatNode::open(volume, IoMode::Read, entry);
        let mut back = alloc::vec![0u8; 11];
        reader.read(&mut back);
        assert_eq!(&back, b"hello world");
    }

    #[test]
    fn test_second_write_in_write_mode_appends() {
        let (volume, entry) = volume_with_file("two.txt");
        let mut writer = FatNode::open(volume, IoMode::Write, entry);
        writer.write(b"aaaa");
        writer.write(b"bbbb");
        assert_eq!(writer.size(), 8);

        let entry = search(&volume, &Path::new("two.txt")).unwrap();
        let mut reader = FatNode::open(volume, IoMode::Read, entry);
        let mut back = alloc::vec![0u8; 8];
        reader.read(&mut back);
        assert_eq!(&back, b"aaaabbbb");
    }

    #[test]
    fn test_seek_bounds() {
        let (volume, entry) = volume_with_file("seek.bin");
        FatNode::open(volume, IoMode::Write, entry).write(&pattern(1024));

        let entry = search(&volume, &Path::new("seek.bin")).unwrap();
        let mut node = FatNode::open(volume, IoMode::Read, entry);

        // Begin rejects the size itself.
        assert_eq!(node.seek(SeekMode::Begin, 1024).status, NodeIoStatus::BadArgs);
        assert_eq!(node.seek(SeekMode::Begin, -1).status, NodeIoStatus::BadArgs);
        // End of file via End, offset zero: position == size.
        let result = node.seek(SeekMode::End, 0);
        assert_eq!(result.status, NodeIoStatus::Okay);
        assert_eq!(result.byte_count, 1024);
        // Past the end is rejected.
        assert_eq!(node.seek(SeekMode::End, 1).status, NodeIoStatus::BadArgs);
    }

    #[test]
    fn test_seek_read_round_trip() {
        let (volume, entry) = volume_with_file("sr.bin");
        let data = pattern(1024);
        FatNode::open(volume, IoMode::Write, entry).write(&data);

        let entry = search(&volume, &Path::new("sr.bin")).unwrap();
        let mut node = FatNode::open(volume, IoMode::Read, entry);
        let result = node.seek(SeekMode::Begin, 512);
        assert_eq!(result.status, NodeIoStatus::Okay);
        assert_eq!(result.byte_count, 512);

        let mut back = alloc::vec![0u8; 256];
        let read = node.read(&mut back);
        assert_eq!(read.byte_count, 256);
        assert_eq!(&back[..], &data[512..768]);
    }

    #[test]
    fn test_directory_node_refuses_file_io() {
        let volume = fat16_volume();
        let root = root_entry(&volume);
        let mut node = FatNode::open(volume, IoMode::Read, root);
        let mut buf = [0u8; 16];
        assert_eq!(node.read(&mut buf).status, NodeIoStatus::NotSupported);
        assert_eq!(node.write(&buf).status, NodeIoStatus::NotSupported);
        assert_eq!(node.seek(SeekMode::Begin, 0).status, NodeIoStatus::NotSupported);
        assert!(node.has_attribute(NodeAttributes::DIRECTORY));
        assert!(!node.has_more());
    }

    #[test]
    fn test_set_attribute_persists() {
        let (volume, entry) = volume_with_file("attr.txt");
        let mut node = FatNode::open(volume, IoMode::Write, entry);
        assert!(node.set_attribute(NodeAttributes::HIDDEN, true));
        assert!(!node.set_attribute(NodeAttributes::FILE, false));

        let entry = search(&volume, &Path::new("attr.txt")).unwrap();
        assert!(entry.file.has_attribute(FatAttributes::HIDDEN));
    }
}
