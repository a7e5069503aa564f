//! User pointer validation and checked copies.
//!
//! Every system call receiving a user pointer validates that the whole
//! buffer lies strictly below the user-space end address before touching
//! it. Strings are bounded by a per-call limit and must carry their null
//! terminator within that bound. Validation failures surface as `BadArg`.

use alloc::string::String;
use alloc::vec;

/// Upper bound for strings copied from user space.
pub const STRING_SIZE_LIMIT: usize = 4096;

/// Check that `[addr, addr + len)` lies strictly below the user-space end.
pub fn verify_user_buffer(addr: u64, len: usize) -> bool {
    if addr == 0 {
        return false;
    }
    let end = match addr.checked_add(len as u64) {
        Some(end) => end,
        None => return false,
    };
    end <= crate::memory::user_space_end()
}

/// Copy `len` bytes from user space into a kernel buffer.
pub fn copy_from_user(addr: u64, len: usize) -> Option<alloc::vec::Vec<u8>> {
    if !verify_user_buffer(addr, len) {
        return None;
    }
    let mut buf = vec![0u8; len];
    unsafe {
        core::ptr::copy_nonoverlapping(addr as *const u8, buf.as_mut_ptr(), len);
    }
    Some(buf)
}

/// Copy a kernel buffer out to user space.
pub fn copy_to_user(addr: u64, bytes: &[u8]) -> bool {
    if !verify_user_buffer(addr, bytes.len()) {
        return false;
    }
    unsafe {
        core::ptr::copy_nonoverlapping(bytes.as_ptr(), addr as *mut u8, bytes.len());
    }
    true
}

/// Copy a null-terminated string from user space.
///
/// The terminator must appear within [`STRING_SIZE_LIMIT`] bytes and the
/// string must be ASCII.
pub fn copy_string_from_user(addr: u64) -> Option<String> {
    if addr == 0 || !verify_user_buffer(addr, 1) {
        return None;
    }
    let mut bytes = alloc::vec::Vec::new();
    for offset in 0..STRING_SIZE_LIMIT as u64 {
        if !verify_user_buffer(addr + offset, 1) {
            return None;
        }
        let byte = unsafe { ((addr + offset) as *const u8).read() };
        if byte == 0 {
            return String::from_utf8(bytes).ok();
        }
        if !byte.is_ascii() {
            return None;
        }
        bytes.push(byte);
    }
    // No terminator within the limit.
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    // Host test processes map their heap below the canonical split, so
    // real buffers double as "user" memory here.

    #[test]
    fn test_null_and_overflow_rejected() {
        assert!(!verify_user_buffer(0, 8));
        assert!(!verify_user_buffer(u64::MAX - 4, 16));
    }

    #[test]
    fn test_kernel_address_rejected() {
        assert!(!verify_user_buffer(0xFFFF_8000_0000_0000, 8));
        assert!(!verify_user_buffer(0x0000_7FFF_FFFF_FFFF, 64));
    }

    #[test]
    fn test_copy_round_trip() {
        let source = [1u8, 2, 3, 4];
        let copied = copy_from_user(source.as_ptr() as u64, 4).unwrap();
        assert_eq!(copied, source);

        let mut target = [0u8; 4];
        assert!(copy_to_user(target.as_mut_ptr() as u64, &copied));
        assert_eq!(target, source);
    }

    #[test]
    fn test_string_copy_requires_terminator() {
        let good = b"hello\0";
        assert_eq!(
            copy_string_from_user(good.as_ptr() as u64).as_deref(),
            Some("hello")
        );

        // A string of limit length with no terminator is refused.
        let unterminated = alloc::vec![b'x'; STRING_SIZE_LIMIT];
        assert!(copy_string_from_user(unterminated.as_ptr() as u64).is_none());
    }
}
