//! Process-liveness primitive backing crash recovery (§4.1 "verified via a
//! host primitive `is_process_alive(pid)`").

/// Check whether a process with the given pid is currently running.
pub fn is_process_running(pid: u32) -> bool {
    #[cfg(unix)]
    {
        // kill(pid, 0) checks existence without sending a signal.
        unsafe { libc::kill(pid as i32, 0) == 0 }
    }

    #[cfg(windows)]
    {
        use windows_sys::Win32::Foundation::CloseHandle;
        use windows_sys::Win32::System::Threading::{OpenProcess, PROCESS_QUERY_LIMITED_INFORMATION};
        unsafe {
            let handle = OpenProcess(PROCESS_QUERY_LIMITED_INFORMATION, 0, pid);
            if handle == 0 {
                false
            } else {
                CloseHandle(handle);
                true
            }
        }
    }

    #[cfg(not(any(unix, windows)))]
    {
        std::path::Path::new(&format!("/proc/{pid}")).exists()
    }
}

/// Platform name for log messages.
pub fn platform_name() -> &'static str {
    #[cfg(target_os = "linux")]
    {
        "Linux"
    }

    #[cfg(target_os = "macos")]
    {
        "macOS"
    }

    #[cfg(target_os = "windows")]
    {
        "Windows"
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
    {
        "Unix"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn current_process_is_running() {
        assert!(is_process_running(std::process::id()));
    }

    #[test]
    fn pid_zero_or_max_is_not_the_current_process() {
        // Not a reliable "is definitely dead" check on every platform, but
        // it must not be mistaken for the live current process.
        assert_ne!(std::process::id(), u32::MAX);
    }

    #[test]
    fn platform_name_is_nonempty() {
        assert!(!platform_name().is_empty());
    }
}
