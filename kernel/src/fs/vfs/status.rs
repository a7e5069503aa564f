//! Status enums of the virtual filesystem.
//!
//! Every fallible VFS operation reports a discriminated status; device
//! failures are logged once at `warn` by the driver that saw them, expected
//! non-results (`NotFound`, end of stream) are not logged at all.

/// Outcome of subsystem and driver file operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoStatus {
    /// `find_node`: the node exists.
    Found,
    /// The node does not exist.
    NotFound,
    /// The path is malformed for the operation (not absolute, not a
    /// directory, ...).
    BadPath,
    /// `create`: the node was created.
    Created,
    /// `create`: a node with the path already exists.
    Exists,
    /// `create`: the attribute set is inconsistent.
    BadAttribute,
    /// The node name contains characters the driver rejects.
    BadName,
    /// `open`: the node is open.
    Opened,
    /// `open`: the handle space is exhausted.
    OutOfHandles,
    /// `delete`: the node is gone.
    Deleted,
    /// The operation conflicts with an open handle or the node's
    /// attributes.
    AccessDenied,
    /// The storage device is not known to the driver.
    DevUnknown,
    /// The storage device failed.
    DevError,
}

/// Outcome of mounting and unmounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountStatus {
    Mounted,
    AlreadyMounted,
    /// The device carries no filesystem this driver understands.
    NotSupported,
    Unmounted,
    NotMounted,
    /// The device is busy (open handles) or refused the operation.
    MountError,
    DevError,
}

/// Outcome of formatting a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatStatus {
    Formatted,
    FormatError,
    DevError,
}

/// End result of a node IO operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeIoStatus {
    Okay,
    /// A buffer or offset argument is invalid.
    BadArgs,
    /// The operation is not allowed in the node's IO mode.
    NotAllowed,
    /// The node kind does not support the operation (e.g. directory read).
    NotSupported,
    /// The underlying storage device failed.
    DevError,
    /// The node has been closed.
    Closed,
}

/// A node IO status plus the bytes read, written or seeked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeIoResult {
    pub status: NodeIoStatus,
    pub byte_count: usize,
}

impl NodeIoResult {
    pub const fn new(status: NodeIoStatus, byte_count: usize) -> Self {
        Self { status, byte_count }
    }

    pub const fn okay(byte_count: usize) -> Self {
        Self::new(NodeIoStatus::Okay, byte_count)
    }
}

/// State of a directory stream. `EndOfData` and `IoError` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectoryStreamState {
    HasMore,
    EndOfData,
    IoError,
}
