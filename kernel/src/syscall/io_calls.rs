//! Standard stream system calls.

use super::userptr;
use super::{StatusCode, SyscallArgs};
use crate::io::stdio;

/// `read_std_in(out_keycode_ptr)`: blocks until a keycode arrives.
pub fn read_std_in(args: &SyscallArgs) -> i64 {
    if !userptr::verify_user_buffer(args.arg0, 2) {
        return StatusCode::BadArg.as_i64();
    }
    let code = stdio::read_keycode();
    if !userptr::copy_to_user(args.arg0, &code.to_le_bytes()) {
        return StatusCode::BadArg.as_i64();
    }
    StatusCode::Ok.as_i64()
}

/// `write_std_out(cstring_ptr)`: returns the bytes written.
pub fn write_std_out(args: &SyscallArgs) -> i64 {
    match userptr::copy_string_from_user(args.arg0) {
        Some(text) => stdio::write_std_out(&text) as i64,
        None => StatusCode::BadArg.as_i64(),
    }
}

/// `write_std_err(cstring_ptr)`: returns the bytes written.
pub fn write_std_err(args: &SyscallArgs) -> i64 {
    match userptr::copy_string_from_user(args.arg0) {
        Some(text) => stdio::write_std_err(&text) as i64,
        None => StatusCode::BadArg.as_i64(),
    }
}
