//! VFS nodes: open files and directories.

use super::path::Path;
use super::status::{NodeIoResult, NodeIoStatus};
use alloc::boxed::Box;
use alloc::string::String;
use bitflags::bitflags;

bitflags! {
    /// Node attribute bitmask. Exactly one of `DIRECTORY` and `FILE` is set
    /// on every existing node.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct NodeAttributes: u8 {
        const READONLY  = 0x01;
        const HIDDEN    = 0x02;
        const SYSTEM    = 0x04;
        const DIRECTORY = 0x08;
        const FILE      = 0x10;
    }
}

impl NodeAttributes {
    /// Whether the directory/file discriminator is consistent.
    pub fn is_well_formed(&self) -> bool {
        self.contains(NodeAttributes::DIRECTORY) != self.contains(NodeAttributes::FILE)
    }
}

/// How a node is accessed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoMode {
    Read,
    /// First write truncates, further writes append.
    Write,
    /// Writes start at the current end of the file.
    Append,
}

impl IoMode {
    pub fn is_writing(&self) -> bool {
        matches!(self, IoMode::Write | IoMode::Append)
    }
}

/// Origin of a seek operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekMode {
    Begin,
    Cursor,
    End,
}

/// General information about a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfo {
    pub path: String,
    pub size: u64,
    pub attributes: NodeAttributes,
}

/// Driver-side operations of an open node.
pub trait NodeOps: Send {
    /// File size in bytes; 0 for directories.
    fn size(&self) -> u64;

    /// Whether more bytes can be read. Always false for directories.
    fn has_more(&self) -> bool;

    /// Read from the cursor into `buf`.
    fn read(&mut self, buf: &mut [u8]) -> NodeIoResult;

    /// Write `buf` at the cursor.
    fn write(&mut self, buf: &[u8]) -> NodeIoResult;

    /// Move the cursor. The reported byte count is the new position.
    fn seek(&mut self, mode: SeekMode, offset: i64) -> NodeIoResult;

    fn has_attribute(&self, attr: NodeAttributes) -> bool;

    /// Change `READONLY`/`HIDDEN`/`SYSTEM`; the directory/file
    /// discriminator is immutable.
    fn set_attribute(&mut self, attr: NodeAttributes, value: bool) -> bool;
}

/// An open node in the node table.
pub struct Node {
    pub handle: u16,
    /// Absolute, normalized path.
    pub path: Path,
    pub io_mode: IoMode,
    closed: bool,
    pub ops: Box<dyn NodeOps>,
}

impl Node {
    pub fn new(handle: u16, path: Path, io_mode: IoMode, ops: Box<dyn NodeOps>) -> Self {
        Self {
            handle,
            path,
            io_mode,
            closed: false,
            ops,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Mark the node closed; IO after this returns `Closed`.
    pub fn mark_closed(&mut self) {
        self.closed = true;
    }

    pub fn size(&self) -> u64 {
        if self.closed {
            0
        } else {
            self.ops.size()
        }
    }

    pub fn has_more(&self) -> bool {
        !self.closed && self.ops.has_more()
    }

    pub fn read(&mut self, buf: &mut [u8]) -> NodeIoResult {
        if self.closed {
            return NodeIoResult::new(NodeIoStatus::Closed, 0);
        }
        self.ops.read(buf)
    }

    pub fn write(&mut self, buf: &[u8]) -> NodeIoResult {
        if self.closed {
            return NodeIoResult::new(NodeIoStatus::Closed, 0);
        }
        if self.io_mode == IoMode::Read {
            return NodeIoResult::new(NodeIoStatus::NotAllowed, 0);
        }
        self.ops.write(buf)
    }

    pub fn seek(&mut self, mode: SeekMode, offset: i64) -> NodeIoResult {
        if self.closed {
            return NodeIoResult::new(NodeIoStatus::Closed, 0);
        }
        self.ops.seek(mode, offset)
    }

    pub fn has_attribute(&self, attr: NodeAttributes) -> bool {
        !self.closed && self.ops.has_attribute(attr)
    }

    pub fn set_attribute(&mut self, attr: NodeAttributes, value: bool) -> bool {
        if self.closed {
            return false;
        }
        if attr.intersects(NodeAttributes::FILE | NodeAttributes::DIRECTORY) {
            return false;
        }
        self.ops.set_attribute(attr, value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attribute_well_formedness() {
        assert!(NodeAttributes::FILE.is_well_formed());
        assert!((NodeAttributes::DIRECTORY | NodeAttributes::HIDDEN).is_well_formed());
        assert!(!(NodeAttributes::FILE | NodeAttributes::DIRECTORY).is_well_formed());
        assert!(!NodeAttributes::HIDDEN.is_well_formed());
    }

    struct NullOps;
    impl NodeOps for NullOps {
        fn size(&self) -> u64 {
            42
        }
        fn has_more(&self) -> bool {
            true
        }
        fn read(&mut self, _buf: &mut [u8]) -> NodeIoResult {
            NodeIoResult::okay(0)
        }
        fn write(&mut self, _buf: &[u8]) -> NodeIoResult {
            NodeIoResult::okay(0)
        }
        fn seek(&mut self, _mode: SeekMode, _offset: i64) -> NodeIoResult {
            NodeIoResult::okay(0)
        }
        fn has_attribute(&self, attr: NodeAttributes) -> bool {
            attr == NodeAttributes::FILE
        }
        fn set_attribute(&mut self, _attr: NodeAttributes, _value: bool) -> bool {
            true
        }
    }

    #[test]
    fn test_closed_node_refuses_io() {
        let mut node = Node::new(1, Path::new("/x"), IoMode::Read, alloc::boxed::Box::new(NullOps));
        node.mark_closed();
        assert_eq!(node.read(&mut []).status, NodeIoStatus::Closed);
        assert_eq!(node.seek(SeekMode::Begin, 0).status, NodeIoStatus::Closed);
        assert!(!node.has_more());
        assert!(!node.has_attribute(NodeAttributes::FILE));
        assert_eq!(node.size(), 0);
    }

    #[test]
    fn test_write_in_read_mode_not_allowed() {
        let mut node = Node::new(1, Path::new("/x"), IoMode::Read, alloc::boxed::Box::new(NullOps));
        assert_eq!(node.write(&[1]).status, NodeIoStatus::NotAllowed);
    }

    #[test]
    fn test_discriminator_attributes_immutable() {
        let mut node = Node::new(1, Path::new("/x"), IoMode::Write, alloc::boxed::Box::new(NullOps));
        assert!(!node.set_attribute(NodeAttributes::FILE, false));
        assert!(node.set_attribute(NodeAttributes::HIDDEN, true));
    }
}
