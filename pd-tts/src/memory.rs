//! Executable memory for committed stubs.
//!
//! A region is reserved writable first so its address is known before
//! linking, then [`CodeRegion::commit`] copies the linked bytes, flips the
//! protection to read+execute and performs instruction-cache maintenance.

use crate::error::{StubError, StubResult};

pub struct CodeRegion {
    ptr: *mut u8,
    len: usize,
    committed: bool,
}

// The region is only written before commit, through `&mut self`.
unsafe impl Send for CodeRegion {}
unsafe impl Sync for CodeRegion {}

impl CodeRegion {
    pub fn reserve(len: usize) -> StubResult<Self> {
        if len == 0 {
            return Err(StubError::ExecutableMemory(
                "cannot reserve an empty code region".to_string(),
            ));
        }
        let ptr = sys::map(len)?;
        Ok(Self {
            ptr,
            len,
            committed: false,
        })
    }

    pub fn address(&self) -> u64 {
        self.ptr as usize as u64
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_committed(&self) -> bool {
        self.committed
    }

    pub fn commit(&mut self, code: &[u8]) -> StubResult<()> {
        if self.committed {
            return Err(StubError::ExecutableMemory(
                "code region committed twice".to_string(),
            ));
        }
        if code.len() > self.len {
            return Err(StubError::ExecutableMemory(format!(
                "{} bytes do not fit a {}-byte region",
                code.len(),
                self.len
            )));
        }
        unsafe { sys::seal(self.ptr, self.len, code)? };
        self.committed = true;
        Ok(())
    }
}

impl Drop for CodeRegion {
    fn drop(&mut self) {
        unsafe { sys::unmap(self.ptr, self.len) };
    }
}

impl std::fmt::Debug for CodeRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodeRegion")
            .field("address", &format_args!("{:#x}", self.address()))
            .field("len", &self.len)
            .field("committed", &self.committed)
            .finish()
    }
}

fn os_error(call: &str) -> StubError {
    StubError::ExecutableMemory(format!("{call} failed: {}", std::io::Error::last_os_error()))
}

/// Page mapping per platform: `map` returns writable pages, `seal` copies the
/// code in and leaves the pages executable with a coherent icache, `unmap`
/// releases them.
#[cfg(all(unix, not(target_os = "macos")))]
mod sys {
    use super::os_error;
    use crate::error::StubResult;

    #[cfg(target_arch = "aarch64")]
    unsafe extern "C" {
        fn __clear_cache(begin: *mut libc::c_char, end: *mut libc::c_char);
    }

    pub fn map(len: usize) -> StubResult<*mut u8> {
        let flags = libc::MAP_ANON | libc::MAP_PRIVATE;
        let prot = libc::PROT_READ | libc::PROT_WRITE;
        let ptr = unsafe { libc::mmap(std::ptr::null_mut(), len, prot, flags, -1, 0) };
        if ptr == libc::MAP_FAILED {
            return Err(os_error("mmap"));
        }
        Ok(ptr.cast())
    }

    pub unsafe fn seal(ptr: *mut u8, len: usize, code: &[u8]) -> StubResult<()> {
        unsafe {
            std::ptr::copy_nonoverlapping(code.as_ptr(), ptr, code.len());
            if libc::mprotect(ptr.cast(), len, libc::PROT_READ | libc::PROT_EXEC) != 0 {
                return Err(os_error("mprotect"));
            }
            #[cfg(target_arch = "aarch64")]
            __clear_cache(ptr.cast(), ptr.add(len).cast());
        }
        Ok(())
    }

    pub unsafe fn unmap(ptr: *mut u8, len: usize) {
        unsafe { libc::munmap(ptr.cast(), len) };
    }
}

/// MAP_JIT pages are RWX; writes are gated per thread instead.
#[cfg(target_os = "macos")]
mod sys {
    use super::os_error;
    use crate::error::StubResult;

    unsafe extern "C" {
        fn pthread_jit_write_protect_supported_np() -> libc::c_int;
        fn pthread_jit_write_protect_np(enabled: libc::c_int);
        fn sys_icache_invalidate(start: *mut libc::c_void, len: libc::size_t);
    }

    pub fn map(len: usize) -> StubResult<*mut u8> {
        let flags = libc::MAP_ANON | libc::MAP_PRIVATE | libc::MAP_JIT;
        let prot = libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC;
        let ptr = unsafe { libc::mmap(std::ptr::null_mut(), len, prot, flags, -1, 0) };
        if ptr == libc::MAP_FAILED {
            return Err(os_error("mmap(MAP_JIT)"));
        }
        Ok(ptr.cast())
    }

    pub unsafe fn seal(ptr: *mut u8, _len: usize, code: &[u8]) -> StubResult<()> {
        unsafe {
            let gated = pthread_jit_write_protect_supported_np() != 0;
            if gated {
                pthread_jit_write_protect_np(0);
            }
            std::ptr::copy_nonoverlapping(code.as_ptr(), ptr, code.len());
            if gated {
                pthread_jit_write_protect_np(1);
            }
            sys_icache_invalidate(ptr.cast(), code.len());
        }
        Ok(())
    }

    pub unsafe fn unmap(ptr: *mut u8, len: usize) {
        unsafe { libc::munmap(ptr.cast(), len) };
    }
}

#[cfg(windows)]
mod sys {
    use windows_sys::Win32::System::Diagnostics::Debug::FlushInstructionCache;
    use windows_sys::Win32::System::Memory::{
        MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_EXECUTE_READ, PAGE_READWRITE, VirtualAlloc,
        VirtualFree, VirtualProtect,
    };
    use windows_sys::Win32::System::Threading::GetCurrentProcess;

    use super::os_error;
    use crate::error::StubResult;

    pub fn map(len: usize) -> StubResult<*mut u8> {
        let ptr = unsafe {
            VirtualAlloc(std::ptr::null(), len, MEM_COMMIT | MEM_RESERVE, PAGE_READWRITE)
        };
        if ptr.is_null() {
            return Err(os_error("VirtualAlloc"));
        }
        Ok(ptr.cast())
    }

    pub unsafe fn seal(ptr: *mut u8, len: usize, code: &[u8]) -> StubResult<()> {
        unsafe {
            std::ptr::copy_nonoverlapping(code.as_ptr(), ptr, code.len());
            let mut old = 0u32;
            if VirtualProtect(ptr as *const _, len, PAGE_EXECUTE_READ, &mut old) == 0 {
                return Err(os_error("VirtualProtect"));
            }
            if FlushInstructionCache(GetCurrentProcess(), ptr as *const _, len) == 0 {
                return Err(os_error("FlushInstructionCache"));
            }
        }
        Ok(())
    }

    pub unsafe fn unmap(ptr: *mut u8, _len: usize) {
        unsafe { VirtualFree(ptr.cast(), 0, MEM_RELEASE) };
    }
}

#[cfg(not(any(unix, windows)))]
mod sys {
    use crate::error::{StubError, StubResult};

    pub fn map(_len: usize) -> StubResult<*mut u8> {
        Err(StubError::ExecutableMemory(
            "executable memory is not available on this platform".to_string(),
        ))
    }

    pub unsafe fn seal(_ptr: *mut u8, _len: usize, _code: &[u8]) -> StubResult<()> {
        Ok(())
    }

    pub unsafe fn unmap(_ptr: *mut u8, _len: usize) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_is_known_before_commit() {
        let mut region = CodeRegion::reserve(64).expect("reserve");
        assert_ne!(region.address(), 0);
        assert!(!region.is_committed());
        region.commit(&[0xC3]).expect("commit");
        assert!(region.is_committed());
        assert!(region.commit(&[0xC3]).is_err());
    }

    #[test]
    fn oversized_code_is_rejected() {
        let mut region = CodeRegion::reserve(4).expect("reserve");
        assert!(region.commit(&[0; 8]).is_err());
        assert!(CodeRegion::reserve(0).is_err());
    }
}
