//! App management system calls.

use super::userptr;
use super::{StatusCode, SyscallArgs};
use crate::fs::vfs::path::Path;
use crate::process;
use alloc::string::String;
use alloc::vec::Vec;

/// Upper bound on argv entries accepted from user space.
const ARGV_LIMIT: usize = 64;

/// Copy a null-terminated array of string pointers from user space.
fn copy_argv(addr: u64) -> Option<Vec<String>> {
    let mut argv = Vec::new();
    if addr == 0 {
        return Some(argv);
    }
    for index in 0..ARGV_LIMIT as u64 {
        let slot = addr + index * 8;
        let raw = userptr::copy_from_user(slot, 8)?;
        let ptr = u64::from_le_bytes(raw.try_into().ok()?);
        if ptr == 0 {
            return Some(argv);
        }
        argv.push(userptr::copy_string_from_user(ptr)?);
    }
    None
}

/// `app_start(app_path, argv, cwd, in_target, out_target, err_target)`
pub fn app_start(args: &SyscallArgs) -> i64 {
    let Some(path) = userptr::copy_string_from_user(args.arg0) else {
        return StatusCode::BadArg.as_i64();
    };
    let Some(argv) = copy_argv(args.arg1) else {
        return StatusCode::BadArg.as_i64();
    };
    let cwd = if args.arg2 == 0 {
        process::current_working_directory()
    } else {
        match userptr::copy_string_from_user(args.arg2) {
            Some(cwd) => Path::new(&cwd).resolve(&process::current_working_directory()),
            None => return StatusCode::BadArg.as_i64(),
        }
    };

    let image = Path::new(&path).resolve(&process::current_working_directory());
    match process::start_app(
        &image,
        &argv,
        cwd,
        args.arg3 as u16,
        args.arg4 as u16,
        args.arg5 as u16,
    ) {
        Ok(handle) => handle as i64,
        Err(process::AppError::UnknownApp) => StatusCode::UnknownId.as_i64(),
        Err(_) => StatusCode::IoError.as_i64(),
    }
}

/// `app_exit(exit_code)`: terminates the calling thread, never returns.
pub fn app_exit(args: &SyscallArgs) -> i64 {
    process::exit_app(args.arg0 as i64 as i32)
}

/// `app_join(app_id)`: blocks until the app exits, returns its exit code.
pub fn app_join(args: &SyscallArgs) -> i64 {
    let handle = args.arg0 as u16;
    if handle == 0 {
        return StatusCode::BadArg.as_i64();
    }
    match process::join_app(handle) {
        Ok(code) => code as i64,
        Err(_) => StatusCode::UnknownId.as_i64(),
    }
}

/// `app_get_cwd(out_buf, out_size)`
pub fn app_get_cwd(args: &SyscallArgs) -> i64 {
    let size = args.arg1 as usize;
    let cwd = process::current_working_directory();
    let mut bytes = cwd.as_str().as_bytes().to_vec();
    bytes.push(0);
    if bytes.len() > size {
        return StatusCode::BadArg.as_i64();
    }
    if !userptr::copy_to_user(args.arg0, &bytes) {
        return StatusCode::BadArg.as_i64();
    }
    StatusCode::Ok.as_i64()
}

/// `app_change_cwd(path)`
pub fn app_change_cwd(args: &SyscallArgs) -> i64 {
    let Some(raw) = userptr::copy_string_from_user(args.arg0) else {
        return StatusCode::BadArg.as_i64();
    };
    let path = Path::new(&raw).resolve(&process::current_working_directory());
    // The new working directory must exist and be a directory.
    let attrs = crate::fs::vfs::with_vfs(|vfs| vfs.get_node_info(&path));
    match attrs {
        Ok(info) => {
            if !info
                .attributes
                .contains(crate::fs::vfs::node::NodeAttributes::DIRECTORY)
            {
                return StatusCode::NodeIsFile.as_i64();
            }
        }
        Err(crate::fs::vfs::status::IoStatus::NotFound) => {
            return StatusCode::NodeNotFound.as_i64()
        }
        Err(_) => return StatusCode::IoError.as_i64(),
    }
    if process::change_working_directory(path) {
        StatusCode::Ok.as_i64()
    } else {
        StatusCode::AccessDenied.as_i64()
    }
}
