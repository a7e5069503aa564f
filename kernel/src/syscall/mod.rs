//! The numbered system-call surface.
//!
//! Calls are dispatched through a fixed table; every call returns a signed
//! integer, negative values drawn from [`StatusCode`]. The architecture
//! entry stubs that land in [`dispatch`] live outside this tree.

pub mod app_calls;
pub mod io_calls;
pub mod userptr;
pub mod vfs_calls;

/// Status codes returned by system calls. Non-error results are the
/// non-negative call-specific values (byte counts, handles, offsets).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i64)]
pub enum StatusCode {
    Ok = 0,
    BadArg = -1,
    NodeNotFound = -2,
    NodeExists = -3,
    NodeInUse = -4,
    NodeIsDirectory = -5,
    NodeIsFile = -6,
    NodeClosed = -7,
    AccessDenied = -8,
    IoError = -9,
    UnknownId = -10,
    Fault = -11,
    DirectoryStreamHasMore = -12,
    DirectoryStreamEod = -13,
}

impl StatusCode {
    pub const fn as_i64(self) -> i64 {
        self as i64
    }
}

/// Arguments of one system call, as delivered by the entry stub.
#[derive(Debug, Clone, Copy, Default)]
pub struct SyscallArgs {
    pub arg0: u64,
    pub arg1: u64,
    pub arg2: u64,
    pub arg3: u64,
    pub arg4: u64,
    pub arg5: u64,
}

type Handler = fn(&SyscallArgs) -> i64;

/// The dispatch table, indexed by call number minus one.
struct SyscallEntry {
    name: &'static str,
    handler: Handler,
}

const SYSCALL_TABLE: &[SyscallEntry] = &[
    SyscallEntry { name: "read_std_in", handler: io_calls::read_std_in },
    SyscallEntry { name: "write_std_out", handler: io_calls::write_std_out },
    SyscallEntry { name: "write_std_err", handler: io_calls::write_std_err },
    SyscallEntry { name: "app_start", handler: app_calls::app_start },
    SyscallEntry { name: "app_exit", handler: app_calls::app_exit },
    SyscallEntry { name: "app_join", handler: app_calls::app_join },
    SyscallEntry { name: "app_get_cwd", handler: app_calls::app_get_cwd },
    SyscallEntry { name: "app_change_cwd", handler: app_calls::app_change_cwd },
    SyscallEntry { name: "vfs_get_node_info", handler: vfs_calls::vfs_get_node_info },
    SyscallEntry { name: "vfs_create", handler: vfs_calls::vfs_create },
    SyscallEntry { name: "vfs_open", handler: vfs_calls::vfs_open },
    SyscallEntry { name: "vfs_delete", handler: vfs_calls::vfs_delete },
    SyscallEntry { name: "vfs_close", handler: vfs_calls::vfs_close },
    SyscallEntry { name: "vfs_read", handler: vfs_calls::vfs_read },
    SyscallEntry { name: "vfs_write", handler: vfs_calls::vfs_write },
    SyscallEntry { name: "vfs_seek", handler: vfs_calls::vfs_seek },
    SyscallEntry {
        name: "vfs_directory_stream_open",
        handler: vfs_calls::vfs_directory_stream_open,
    },
    SyscallEntry {
        name: "vfs_directory_stream_next",
        handler: vfs_calls::vfs_directory_stream_next,
    },
    SyscallEntry {
        name: "vfs_directory_stream_close",
        handler: vfs_calls::vfs_directory_stream_close,
    },
];

/// Dispatch system call `number` (1-based). Unknown numbers fault.
pub fn dispatch(number: u64, args: &SyscallArgs) -> i64 {
    if number == 0 || number as usize > SYSCALL_TABLE.len() {
        log::warn!("syscall: unknown call number {}", number);
        return StatusCode::Fault.as_i64();
    }
    let entry = &SYSCALL_TABLE[number as usize - 1];
    log::trace!("syscall: {}", entry.name);
    (entry.handler)(args)
}

/// Number of defined system calls.
pub fn call_count() -> usize {
    SYSCALL_TABLE.len()
}
