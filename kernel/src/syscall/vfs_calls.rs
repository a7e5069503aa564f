//! VFS system calls.
//!
//! Paths arriving from user space are copied through the checked string
//! routines, resolved against the calling app's working directory when
//! relative, and validated against the mounted driver's character rules
//! before any driver code runs.

use super::userptr;
use super::{StatusCode, SyscallArgs};
use crate::fs::vfs::node::{IoMode, NodeAttributes, SeekMode};
use crate::fs::vfs::path::Path;
use crate::fs::vfs::status::{IoStatus, NodeIoStatus};
use crate::fs::vfs::stream::StreamItem;
use crate::fs::vfs::with_vfs;
use crate::process;
use alloc::vec;

/// User-space layout of a node info record: a pointer to a caller-provided
/// name buffer plus size and attribute fields.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct RawNodeInfo {
    node_path: u64,
    size: u64,
    attributes: u8,
}

/// Fetch and resolve a path argument: copy, make absolute against the
/// app's working directory, validate driver character rules.
fn resolve_path_arg(addr: u64) -> Result<Path, StatusCode> {
    let raw = userptr::copy_string_from_user(addr).ok_or(StatusCode::BadArg)?;
    let path = Path::new(&raw);
    let absolute = if path.is_absolute() {
        path.normalize()
    } else {
        path.resolve(&process::current_working_directory())
    };
    if !with_vfs(|vfs| vfs.is_valid_file_path(&absolute)) {
        return Err(StatusCode::BadArg);
    }
    Ok(absolute)
}

pub fn vfs_get_node_info(args: &SyscallArgs) -> i64 {
    let path = match resolve_path_arg(args.arg0) {
        Ok(path) => path,
        Err(code) => return code.as_i64(),
    };
    if !userptr::verify_user_buffer(args.arg1, core::mem::size_of::<RawNodeInfo>()) {
        return StatusCode::BadArg.as_i64();
    }

    match with_vfs(|vfs| vfs.get_node_info(&path)) {
        Ok(info) => {
            let raw = match userptr::copy_from_user(args.arg1, core::mem::size_of::<RawNodeInfo>())
            {
                Some(bytes) => unsafe {
                    core::ptr::read_unaligned(bytes.as_ptr() as *const RawNodeInfo)
                },
                None => return StatusCode::BadArg.as_i64(),
            };
            // The caller's name buffer receives the full path, terminated.
            let mut name = info.path.clone().into_bytes();
            name.push(0);
            if !userptr::copy_to_user(raw.node_path, &name) {
                return StatusCode::BadArg.as_i64();
            }
            let updated = RawNodeInfo {
                node_path: raw.node_path,
                size: info.size,
                attributes: info.attributes.bits(),
            };
            let bytes = unsafe {
                core::slice::from_raw_parts(
                    &updated as *const RawNodeInfo as *const u8,
                    core::mem::size_of::<RawNodeInfo>(),
                )
            };
            if !userptr::copy_to_user(args.arg1, bytes) {
                return StatusCode::BadArg.as_i64();
            }
            StatusCode::Ok.as_i64()
        }
        Err(IoStatus::NotFound) => StatusCode::NodeNotFound.as_i64(),
        Err(IoStatus::BadPath) => StatusCode::BadArg.as_i64(),
        Err(_) => StatusCode::IoError.as_i64(),
    }
}

pub fn vfs_create(args: &SyscallArgs) -> i64 {
    let path = match resolve_path_arg(args.arg0) {
        Ok(path) => path,
        Err(code) => return code.as_i64(),
    };
    let attributes = match NodeAttributes::from_bits(args.arg1 as u8) {
        Some(attrs) => attrs,
        None => return StatusCode::BadArg.as_i64(),
    };

    match with_vfs(|vfs| vfs.create(&path, attributes)) {
        IoStatus::Created => StatusCode::Ok.as_i64(),
        IoStatus::Exists => StatusCode::NodeExists.as_i64(),
        IoStatus::BadAttribute | IoStatus::BadName | IoStatus::BadPath => {
            StatusCode::BadArg.as_i64()
        }
        IoStatus::NotFound => StatusCode::NodeNotFound.as_i64(),
        _ => StatusCode::IoError.as_i64(),
    }
}

pub fn vfs_open(args: &SyscallArgs) -> i64 {
    let path = match resolve_path_arg(args.arg0) {
        Ok(path) => path,
        Err(code) => return code.as_i64(),
    };
    let io_mode = match args.arg1 {
        1 => IoMode::Read,
        2 => IoMode::Write,
        3 => IoMode::Append,
        _ => return StatusCode::BadArg.as_i64(),
    };

    match with_vfs(|vfs| vfs.open(&path, io_mode)) {
        Ok(handle) => handle as i64,
        Err(IoStatus::NotFound) => StatusCode::NodeNotFound.as_i64(),
        Err(IoStatus::AccessDenied) => StatusCode::NodeInUse.as_i64(),
        Err(IoStatus::BadPath) => StatusCode::BadArg.as_i64(),
        Err(_) => StatusCode::IoError.as_i64(),
    }
}

pub fn vfs_delete(args: &SyscallArgs) -> i64 {
    let path = match resolve_path_arg(args.arg0) {
        Ok(path) => path,
        Err(code) => return code.as_i64(),
    };

    match with_vfs(|vfs| vfs.delete(&path)) {
        IoStatus::Deleted => StatusCode::Ok.as_i64(),
        IoStatus::AccessDenied => StatusCode::NodeInUse.as_i64(),
        IoStatus::NotFound => StatusCode::NodeNotFound.as_i64(),
        IoStatus::BadPath => StatusCode::BadArg.as_i64(),
        _ => StatusCode::IoError.as_i64(),
    }
}

pub fn vfs_close(args: &SyscallArgs) -> i64 {
    let handle = args.arg0 as u16;
    if handle == 0 {
        return StatusCode::BadArg.as_i64();
    }
    if with_vfs(|vfs| vfs.close_node(handle)) {
        StatusCode::Ok.as_i64()
    } else {
        StatusCode::UnknownId.as_i64()
    }
}

pub fn vfs_read(args: &SyscallArgs) -> i64 {
    let handle = args.arg0 as u16;
    if handle == 0 {
        return StatusCode::BadArg.as_i64();
    }
    let len = args.arg2 as usize;
    if !userptr::verify_user_buffer(args.arg1, len) {
        return StatusCode::BadArg.as_i64();
    }

    let result = with_vfs(|vfs| {
        if !vfs.has_node(handle) {
            return Err(StatusCode::UnknownId);
        }
        let is_file = vfs
            .with_node(handle, |n| n.has_attribute(NodeAttributes::FILE))
            .unwrap_or(false);
        if !is_file {
            return Err(StatusCode::NodeIsDirectory);
        }
        let mut buf = vec![0u8; len];
        let io = vfs.node_read(handle, &mut buf).ok_or(StatusCode::UnknownId)?;
        Ok((io, buf))
    });
    match result {
        Ok((io, buf)) => match io.status {
            NodeIoStatus::Okay => {
                if !userptr::copy_to_user(args.arg1, &buf[..io.byte_count]) {
                    return StatusCode::IoError.as_i64();
                }
                io.byte_count as i64
            }
            NodeIoStatus::NotSupported => StatusCode::AccessDenied.as_i64(),
            NodeIoStatus::Closed => StatusCode::NodeClosed.as_i64(),
            _ => StatusCode::IoError.as_i64(),
        },
        Err(code) => code.as_i64(),
    }
}

pub fn vfs_write(args: &SyscallArgs) -> i64 {
    let handle = args.arg0 as u16;
    if handle == 0 {
        return StatusCode::BadArg.as_i64();
    }
    let len = args.arg2 as usize;
    let Some(buf) = userptr::copy_from_user(args.arg1, len) else {
        return StatusCode::BadArg.as_i64();
    };

    let result = with_vfs(|vfs| {
        if !vfs.has_node(handle) {
            return Err(StatusCode::UnknownId);
        }
        let is_file = vfs
            .with_node(handle, |n| n.has_attribute(NodeAttributes::FILE))
            .unwrap_or(false);
        if !is_file {
            return Err(StatusCode::NodeIsDirectory);
        }
        vfs.node_write(handle, &buf).ok_or(StatusCode::UnknownId)
    });
    match result {
        Ok(io) => match io.status {
            NodeIoStatus::Okay => io.byte_count as i64,
            NodeIoStatus::NotSupported => StatusCode::NodeIsDirectory.as_i64(),
            NodeIoStatus::NotAllowed => StatusCode::AccessDenied.as_i64(),
            NodeIoStatus::Closed => StatusCode::NodeClosed.as_i64(),
            _ => StatusCode::IoError.as_i64(),
        },
        Err(code) => code.as_i64(),
    }
}

pub fn vfs_seek(args: &SyscallArgs) -> i64 {
    let handle = args.arg0 as u16;
    if handle == 0 {
        return StatusCode::BadArg.as_i64();
    }
    let mode = match args.arg1 {
        1 => SeekMode::Begin,
        2 => SeekMode::Cursor,
        3 => SeekMode::End,
        _ => return StatusCode::BadArg.as_i64(),
    };
    let offset = args.arg2 as i64;

    let result = with_vfs(|vfs| {
        if !vfs.has_node(handle) {
            return Err(StatusCode::UnknownId);
        }
        let is_file = vfs
            .with_node(handle, |n| n.has_attribute(NodeAttributes::FILE))
            .unwrap_or(false);
        if !is_file {
            return Err(StatusCode::NodeIsDirectory);
        }
        vfs.with_node(handle, |n| n.seek(mode, offset))
            .ok_or(StatusCode::UnknownId)
    });
    match result {
        Ok(io) => match io.status {
            NodeIoStatus::Okay => io.byte_count as i64,
            NodeIoStatus::NotSupported => StatusCode::NodeIsDirectory.as_i64(),
            NodeIoStatus::BadArgs => StatusCode::BadArg.as_i64(),
            NodeIoStatus::Closed => StatusCode::NodeClosed.as_i64(),
            _ => StatusCode::IoError.as_i64(),
        },
        Err(code) => code.as_i64(),
    }
}

pub fn vfs_directory_stream_open(args: &SyscallArgs) -> i64 {
    let path = match resolve_path_arg(args.arg0) {
        Ok(path) => path,
        Err(code) => return code.as_i64(),
    };

    match with_vfs(|vfs| vfs.open_directory_stream(&path)) {
        Ok(handle) => handle as i64,
        Err(IoStatus::NotFound) => StatusCode::NodeNotFound.as_i64(),
        // The path was made absolute, so a bad path here names a file.
        Err(IoStatus::BadPath) => StatusCode::NodeIsFile.as_i64(),
        Err(IoStatus::OutOfHandles) => StatusCode::IoError.as_i64(),
        Err(_) => StatusCode::IoError.as_i64(),
    }
}

pub fn vfs_directory_stream_next(args: &SyscallArgs) -> i64 {
    let handle = args.arg0 as u16;
    if handle == 0 {
        return StatusCode::BadArg.as_i64();
    }
    if !userptr::verify_user_buffer(args.arg1, core::mem::size_of::<RawNodeInfo>()) {
        return StatusCode::BadArg.as_i64();
    }

    let item = match with_vfs(|vfs| vfs.stream_next(handle)) {
        Some(item) => item,
        None => return StatusCode::UnknownId.as_i64(),
    };
    match item {
        StreamItem::Entry(info) => {
            let raw = match userptr::copy_from_user(args.arg1, core::mem::size_of::<RawNodeInfo>())
            {
                Some(bytes) => unsafe {
                    core::ptr::read_unaligned(bytes.as_ptr() as *const RawNodeInfo)
                },
                None => return StatusCode::BadArg.as_i64(),
            };
            let mut name = info.path.clone().into_bytes();
            name.push(0);
            if !userptr::copy_to_user(raw.node_path, &name) {
                return StatusCode::BadArg.as_i64();
            }
            let updated = RawNodeInfo {
                node_path: raw.node_path,
                size: info.size,
                attributes: info.attributes.bits(),
            };
            let bytes = unsafe {
                core::slice::from_raw_parts(
                    &updated as *const RawNodeInfo as *const u8,
                    core::mem::size_of::<RawNodeInfo>(),
                )
            };
            if !userptr::copy_to_user(args.arg1, bytes) {
                return StatusCode::BadArg.as_i64();
            }
            StatusCode::DirectoryStreamHasMore.as_i64()
        }
        StreamItem::EndOfData => StatusCode::DirectoryStreamEod.as_i64(),
        StreamItem::IoError => StatusCode::IoError.as_i64(),
    }
}

pub fn vfs_directory_stream_close(args: &SyscallArgs) -> i64 {
    let handle = args.arg0 as u16;
    if handle == 0 {
        return StatusCode::BadArg.as_i64();
    }
    if with_vfs(|vfs| vfs.close_stream(handle)) {
        StatusCode::Ok.as_i64()
    } else {
        StatusCode::UnknownId.as_i64()
    }
}
