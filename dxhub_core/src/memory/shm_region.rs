// Cross-platform shared memory region backing one DataBlock segment.
//
// Each platform uses its native shared-memory mechanism:
// - Linux: /dev/shm files (tmpfs - RAM-backed) via file mmap
// - macOS: POSIX shm_open() (Mach shared memory - RAM-backed)
// - Windows: CreateFileMappingW (pagefile-backed, no temp files)
//
// Segment names follow the on-disk convention `plh.<channel>.v1` (see
// DataBlock), turned into a platform-appropriate path or mapping name here.

use crate::error::HubResult;

#[cfg(target_os = "linux")]
use memmap2::{MmapMut, MmapOptions};
#[cfg(target_os = "linux")]
use std::fs::{File, OpenOptions};
#[cfg(target_os = "linux")]
use std::path::PathBuf;

/// Cross-platform shared memory region for a single DataBlock segment.
#[derive(Debug)]
pub struct ShmRegion {
    #[cfg(target_os = "linux")]
    mmap: MmapMut,
    #[cfg(target_os = "linux")]
    _file: File,
    #[cfg(target_os = "linux")]
    path: PathBuf,

    #[cfg(target_os = "macos")]
    ptr: *mut u8,
    #[cfg(target_os = "macos")]
    fd: i32,
    #[cfg(target_os = "macos")]
    shm_name: String,

    #[cfg(target_os = "windows")]
    ptr: *mut u8,
    #[cfg(target_os = "windows")]
    handle: isize, // HANDLE

    size: usize,
    #[allow(dead_code)]
    name: String,
    owner: bool,
}

/// Linux tmpfs path for a segment named `plh.<channel>.v1`.
#[cfg(any(target_os = "linux", not(any(target_os = "macos", target_os = "windows"))))]
fn linux_shm_path(name: &str) -> std::path::PathBuf {
    std::path::PathBuf::from("/dev/shm").join(name)
}

// ============================================================================
// Linux - file-based mmap on /dev/shm (tmpfs, already RAM-backed)
// ============================================================================

#[cfg(target_os = "linux")]
impl ShmRegion {
    /// Create (or attach to an already-created) segment, sized at least `size`.
    pub fn create(name: &str, size: usize) -> HubResult<Self> {
        let path = linux_shm_path(name);

        let (file, is_owner) = if path.exists() {
            let file = OpenOptions::new().read(true).write(true).open(&path)?;
            let metadata = file.metadata()?;
            if metadata.len() < size as u64 {
                file.set_len(size as u64)?;
            }
            (file, false)
        } else {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(true)
                .mode(0o600)
                .open(&path)?;
            file.set_len(size as u64)?;
            (file, true)
        };

        let mut mmap = unsafe { MmapOptions::new().len(size).map_mut(&file)? };
        if is_owner {
            mmap.fill(0);
        }

        Ok(Self {
            mmap,
            size,
            path,
            _file: file,
            name: name.to_string(),
            owner: is_owner,
        })
    }

    /// Attach to an existing segment, mapping at least `size_hint` bytes.
    pub fn open(name: &str, size_hint: usize) -> HubResult<Self> {
        let path = linux_shm_path(name);
        if !path.exists() {
            return Err(crate::error::HubError::Fatal(format!(
                "shared memory segment '{name}' does not exist"
            )));
        }

        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let actual = file.metadata()?.len() as usize;
        let size = actual.max(size_hint);
        let mmap = unsafe { MmapOptions::new().len(size).map_mut(&file)? };

        Ok(Self {
            mmap,
            size,
            path,
            _file: file,
            name: name.to_string(),
            owner: false,
        })
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.mmap.as_ptr()
    }

    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.mmap.as_mut_ptr()
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_owner(&self) -> bool {
        self.owner
    }
}

#[cfg(target_os = "linux")]
use std::os::unix::fs::OpenOptionsExt;

#[cfg(target_os = "linux")]
impl Drop for ShmRegion {
    fn drop(&mut self) {
        if self.owner && self.path.exists() {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

// ============================================================================
// macOS - POSIX shm_open() (Mach shared memory, RAM-backed)
// ============================================================================

#[cfg(target_os = "macos")]
impl ShmRegion {
    pub fn create(name: &str, size: usize) -> HubResult<Self> {
        use std::ffi::CString;

        let shm_name = format!("/{}", name);
        let c_name = CString::new(shm_name.clone())
            .map_err(|e| crate::error::HubError::Fatal(format!("invalid shm name: {e}")))?;

        let fd = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDWR, 0o600) };

        let (fd, is_owner) = if fd >= 0 {
            (fd, false)
        } else {
            let fd = unsafe {
                libc::shm_open(c_name.as_ptr(), libc::O_CREAT | libc::O_RDWR | libc::O_EXCL, 0o600)
            };
            if fd < 0 {
                let fd = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDWR, 0o600) };
                if fd < 0 {
                    return Err(crate::error::HubError::Fatal(format!(
                        "failed to open/create shm '{shm_name}': {}",
                        std::io::Error::last_os_error()
                    )));
                }
                (fd, false)
            } else {
                if unsafe { libc::ftruncate(fd, size as libc::off_t) } != 0 {
                    unsafe { libc::close(fd) };
                    unsafe { libc::shm_unlink(c_name.as_ptr()) };
                    return Err(crate::error::HubError::Fatal(format!(
                        "failed to size shm: {}",
                        std::io::Error::last_os_error()
                    )));
                }
                (fd, true)
            }
        };

        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };

        if ptr == libc::MAP_FAILED {
            unsafe { libc::close(fd) };
            if is_owner {
                unsafe { libc::shm_unlink(c_name.as_ptr()) };
            }
            return Err(crate::error::HubError::Fatal(format!(
                "mmap failed: {}",
                std::io::Error::last_os_error()
            )));
        }

        if is_owner {
            unsafe { std::ptr::write_bytes(ptr as *mut u8, 0, size) };
        }

        Ok(Self {
            ptr: ptr as *mut u8,
            fd,
            shm_name,
            size,
            name: name.to_string(),
            owner: is_owner,
        })
    }

    pub fn open(name: &str, size_hint: usize) -> HubResult<Self> {
        use std::ffi::CString;

        let shm_name = format!("/{}", name);
        let c_name = CString::new(shm_name.clone())
            .map_err(|e| crate::error::HubError::Fatal(format!("invalid shm name: {e}")))?;

        let fd = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDWR, 0o600) };
        if fd < 0 {
            return Err(crate::error::HubError::Fatal(format!(
                "shared memory segment '{name}' does not exist"
            )));
        }

        let mut stat: libc::stat = unsafe { std::mem::zeroed() };
        if unsafe { libc::fstat(fd, &mut stat) } != 0 {
            unsafe { libc::close(fd) };
            return Err(crate::error::HubError::Fatal(format!(
                "fstat failed: {}",
                std::io::Error::last_os_error()
            )));
        }
        let size = (stat.st_size as usize).max(size_hint);

        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };

        if ptr == libc::MAP_FAILED {
            unsafe { libc::close(fd) };
            return Err(crate::error::HubError::Fatal(format!(
                "mmap failed: {}",
                std::io::Error::last_os_error()
            )));
        }

        Ok(Self {
            ptr: ptr as *mut u8,
            fd,
            shm_name,
            size,
            name: name.to_string(),
            owner: false,
        })
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.ptr
    }

    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.ptr
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_owner(&self) -> bool {
        self.owner
    }
}

#[cfg(target_os = "macos")]
impl Drop for ShmRegion {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr as *mut libc::c_void, self.size);
            libc::close(self.fd);
        }
        if self.owner {
            if let Ok(c_name) = std::ffi::CString::new(self.shm_name.clone()) {
                unsafe { libc::shm_unlink(c_name.as_ptr()) };
            }
        }
    }
}

// ============================================================================
// Windows - CreateFileMappingW, pagefile-backed
// ============================================================================

#[cfg(target_os = "windows")]
impl ShmRegion {
    pub fn create(name: &str, size: usize) -> HubResult<Self> {
        use windows_sys::Win32::Foundation::{CloseHandle, ERROR_ALREADY_EXISTS, GetLastError, INVALID_HANDLE_VALUE};
        use windows_sys::Win32::System::Memory::{CreateFileMappingW, FILE_MAP_ALL_ACCESS, MapViewOfFile, PAGE_READWRITE};

        let mapping_name = format!("Local\\{}", name);
        let wide_name: Vec<u16> = mapping_name.encode_utf16().chain(std::iter::once(0)).collect();

        let handle = unsafe {
            CreateFileMappingW(
                INVALID_HANDLE_VALUE as isize,
                std::ptr::null(),
                PAGE_READWRITE,
                (size >> 32) as u32,
                size as u32,
                wide_name.as_ptr(),
            )
        };

        if handle == 0 {
            return Err(crate::error::HubError::Fatal(format!(
                "CreateFileMappingW failed: error {}",
                unsafe { GetLastError() }
            )));
        }

        let is_owner = unsafe { GetLastError() } != ERROR_ALREADY_EXISTS;

        let ptr = unsafe { MapViewOfFile(handle, FILE_MAP_ALL_ACCESS, 0, 0, size) };
        if ptr.is_null() {
            unsafe { CloseHandle(handle) };
            return Err(crate::error::HubError::Fatal(format!(
                "MapViewOfFile failed: error {}",
                unsafe { GetLastError() }
            )));
        }

        if is_owner {
            unsafe { std::ptr::write_bytes(ptr as *mut u8, 0, size) };
        }

        Ok(Self {
            ptr: ptr as *mut u8,
            handle,
            size,
            name: name.to_string(),
            owner: is_owner,
        })
    }

    pub fn open(name: &str, size_hint: usize) -> HubResult<Self> {
        use windows_sys::Win32::Foundation::{CloseHandle, GetLastError};
        use windows_sys::Win32::System::Memory::{FILE_MAP_ALL_ACCESS, MapViewOfFile, OpenFileMappingW};

        let mapping_name = format!("Local\\{}", name);
        let wide_name: Vec<u16> = mapping_name.encode_utf16().chain(std::iter::once(0)).collect();

        let handle = unsafe { OpenFileMappingW(FILE_MAP_ALL_ACCESS, 0, wide_name.as_ptr()) };
        if handle == 0 {
            return Err(crate::error::HubError::Fatal(format!(
                "shared memory segment '{name}' does not exist"
            )));
        }

        let ptr = unsafe { MapViewOfFile(handle, FILE_MAP_ALL_ACCESS, 0, 0, size_hint) };
        if ptr.is_null() {
            unsafe { CloseHandle(handle) };
            return Err(crate::error::HubError::Fatal(format!(
                "MapViewOfFile failed: error {}",
                unsafe { GetLastError() }
            )));
        }

        Ok(Self {
            ptr: ptr as *mut u8,
            handle,
            size: size_hint,
            name: name.to_string(),
            owner: false,
        })
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.ptr
    }

    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.ptr
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_owner(&self) -> bool {
        self.owner
    }
}

#[cfg(target_os = "windows")]
impl Drop for ShmRegion {
    fn drop(&mut self) {
        use windows_sys::Win32::Foundation::CloseHandle;
        use windows_sys::Win32::System::Memory::UnmapViewOfFile;

        unsafe {
            UnmapViewOfFile(self.ptr as *const std::ffi::c_void);
            CloseHandle(self.handle);
        }
        // Windows cleans up named mappings once all handles are closed.
    }
}

unsafe impl Send for ShmRegion {}
unsafe impl Sync for ShmRegion {}

// ============================================================================
// Fallback (other Unix-like systems) - file-based mmap under /tmp
// ============================================================================

#[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
use memmap2::{MmapMut, MmapOptions};
#[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
use std::fs::{File, OpenOptions};

#[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
impl ShmRegion {
    pub fn create(name: &str, size: usize) -> HubResult<Self> {
        let dir = std::path::PathBuf::from("/tmp/plh");
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(name);

        let (file, is_owner) = if path.exists() {
            let file = OpenOptions::new().read(true).write(true).open(&path)?;
            (file, false)
        } else {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(true)
                .open(&path)?;
            file.set_len(size as u64)?;
            (file, true)
        };

        let mut mmap = unsafe { MmapOptions::new().len(size).map_mut(&file)? };
        if is_owner {
            mmap.fill(0);
        }

        Ok(Self {
            mmap,
            size,
            path,
            _file: file,
            name: name.to_string(),
            owner: is_owner,
        })
    }

    pub fn open(name: &str, size_hint: usize) -> HubResult<Self> {
        let path = std::path::PathBuf::from("/tmp/plh").join(name);
        if !path.exists() {
            return Err(crate::error::HubError::Fatal(format!(
                "shared memory segment '{name}' does not exist"
            )));
        }
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let actual = file.metadata()?.len() as usize;
        let size = actual.max(size_hint);
        let mmap = unsafe { MmapOptions::new().len(size).map_mut(&file)? };
        Ok(Self {
            mmap,
            size,
            path,
            _file: file,
            name: name.to_string(),
            owner: false,
        })
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.mmap.as_ptr()
    }
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.mmap.as_mut_ptr()
    }
    pub fn size(&self) -> usize {
        self.size
    }
    pub fn is_owner(&self) -> bool {
        self.owner
    }
}

#[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
impl Drop for ShmRegion {
    fn drop(&mut self) {
        if self.owner && self.path.exists() {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}
