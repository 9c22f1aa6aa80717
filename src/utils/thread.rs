use anyhow::{Result, anyhow};
use std::ffi::CStr;

// Linux limits pthread names to 16 bytes, including the null terminator.
const MAX_PTHREAD_NAME_LEN: usize = 16;

/// Gets the kernel-visible name of the current thread via
/// `pthread_getname_np`. Worker names are assigned through
/// `std::thread::Builder`, which truncates to the same 15-byte budget.
#[cfg(target_os = "linux")]
pub fn current_thread_name() -> Result<String> {
    // Zero-initialized, so guaranteed null-terminated.
    let mut c_name_buf: [libc::c_char; MAX_PTHREAD_NAME_LEN] = [0; MAX_PTHREAD_NAME_LEN];

    let ret = unsafe {
        let thread = libc::pthread_self();
        libc::pthread_getname_np(thread, c_name_buf.as_mut_ptr(), MAX_PTHREAD_NAME_LEN)
    };

    if ret != 0 {
        return Err(anyhow!("pthread_getname_np failed with error code: {}", ret));
    }

    let c_str = unsafe { CStr::from_ptr(c_name_buf.as_ptr()) };
    c_str
        .to_str()
        .map(|s| s.to_string())
        .map_err(|e| anyhow!("failed to convert thread name from CStr: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_the_name_set_by_the_thread_builder() {
        let handle = std::thread::Builder::new()
            .name("quarry-name-t".into())
            .spawn(|| current_thread_name().unwrap())
            .unwrap();
        assert_eq!(handle.join().unwrap(), "quarry-name-t");
    }
}
