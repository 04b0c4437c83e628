//! Small helper macros shared by the `sys` backends.
#![allow(unused_macros)]

/// Call a libc function, turning a `-1` return into `Err(last_os_error())`.
macro_rules! syscall {
    ($fn: ident ( $($arg: expr),* $(,)* ) ) => {{
        let res = unsafe { libc::$fn($($arg, )*) };
        if res == -1 {
            Err(std::io::Error::last_os_error())
        } else {
            Ok(res)
        }
    }};
}
