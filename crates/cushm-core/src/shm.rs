//! POSIX shared memory wrapper

use crate::{agent, Error, Result};
use shared_memory::{Shmem, ShmemConf, ShmemError};
use std::fmt;
use std::io::ErrorKind;

/// Who is responsible for removing a segment from the OS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ownership {
    /// The creating handle removes the segment when it is dropped, including
    /// on error and unwinding paths.
    AutoCleanup,
    /// The segment outlives every handle; only a project teardown removes it.
    Project,
}

/// Shared memory region wrapper
pub struct SharedMemory {
    inner: Shmem,
    name: String,
    size: usize,
    ownership: Ownership,
}

/// OS identity for a public segment name.
pub fn os_id(name: &str) -> String {
    if name.starts_with('/') {
        name.to_string()
    } else {
        format!("/{}", name)
    }
}

fn public_name(name: &str) -> &str {
    name.trim_start_matches('/')
}

fn map_error(name: &str, err: ShmemError) -> Error {
    match err {
        ShmemError::MappingIdExists | ShmemError::LinkExists => {
            Error::AlreadyExists(public_name(name).to_string())
        }
        ShmemError::MapOpenFailed(code)
            if std::io::Error::from_raw_os_error(code as i32).kind() == ErrorKind::NotFound =>
        {
            Error::NotFound(public_name(name).to_string())
        }
        ShmemError::LinkDoesNotExist => Error::NotFound(public_name(name).to_string()),
        other => Error::SharedMemory(format!("{}: {}", public_name(name), other)),
    }
}

#[cfg(unix)]
fn remove_name(name: &str) -> Result<()> {
    use nix::errno::Errno;
    use nix::sys::mman::shm_unlink;

    match shm_unlink(os_id(name).as_str()) {
        Ok(()) => Ok(()),
        Err(Errno::ENOENT) => Err(Error::NotFound(public_name(name).to_string())),
        Err(e) => Err(Error::SharedMemory(format!("{}: {}", public_name(name), e))),
    }
}

#[cfg(not(unix))]
fn remove_name(name: &str) -> Result<()> {
    let mut shmem = ShmemConf::new()
        .os_id(os_id(name))
        .open()
        .map_err(|e| map_error(name, e))?;
    shmem.set_owner(true);
    Ok(())
}

impl SharedMemory {
    /// Create a new shared memory region of exactly `size` bytes.
    ///
    /// The returned handle holds auto-cleanup authority until
    /// [`release_to_project`](Self::release_to_project) is called. The
    /// segment is also registered with the cleanup agent, so it is removed
    /// even if this process is killed before handing it over.
    pub fn create(name: &str, size: usize) -> Result<Self> {
        let mut shmem = ShmemConf::new()
            .size(size)
            .os_id(os_id(name))
            .create()
            .map_err(|e| map_error(name, e))?;
        // Removal goes through `remove_name` so its outcome is observable.
        shmem.set_owner(false);

        let name = public_name(name).to_string();
        agent::track_segment(&name);

        Ok(Self {
            inner: shmem,
            name,
            size,
            ownership: Ownership::AutoCleanup,
        })
    }

    /// Open an existing shared memory region.
    ///
    /// Opening never takes cleanup authority: dropping the handle only unmaps.
    pub fn open(name: &str) -> Result<Self> {
        let mut shmem = ShmemConf::new()
            .os_id(os_id(name))
            .open()
            .map_err(|e| map_error(name, e))?;
        shmem.set_owner(false);

        let size = shmem.len();

        Ok(Self {
            inner: shmem,
            name: public_name(name).to_string(),
            size,
            ownership: Ownership::Project,
        })
    }

    /// Whether a segment with this name currently exists.
    ///
    /// Only looks the name up; nothing is mapped.
    #[cfg(unix)]
    pub fn exists(name: &str) -> bool {
        use nix::errno::Errno;
        use nix::fcntl::OFlag;
        use nix::sys::mman::shm_open;
        use nix::sys::stat::Mode;

        match shm_open(os_id(name).as_str(), OFlag::O_RDONLY, Mode::empty()) {
            Ok(_fd) => true,
            Err(Errno::EACCES) => true,
            Err(_) => false,
        }
    }

    #[cfg(not(unix))]
    pub fn exists(name: &str) -> bool {
        Self::open(name).is_ok()
    }

    /// Remove a segment this process does not hold.
    ///
    /// A name that is already gone is `NotFound`.
    pub fn unlink_name(name: &str) -> Result<()> {
        remove_name(name)
    }

    /// Get the public name of the shared memory region
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the identity the OS knows the region under
    pub fn os_id(&self) -> &str {
        self.inner.get_os_id()
    }

    /// Get the size of the shared memory region
    pub fn size(&self) -> usize {
        self.size
    }

    /// Current cleanup responsibility
    pub fn ownership(&self) -> Ownership {
        self.ownership
    }

    /// Hand cleanup authority over to the project record.
    ///
    /// One-way; the segment now survives this handle and this process.
    pub fn release_to_project(&mut self) {
        if self.ownership == Ownership::AutoCleanup {
            tracing::trace!(segment = %self.name, "released to project");
            self.ownership = Ownership::Project;
            agent::forget_segment(&self.name);
        }
    }

    /// Drop the local mapping.
    ///
    /// A handle still holding auto-cleanup authority removes the region too.
    pub fn close(self) {
        drop(self);
    }

    /// Drop the local mapping and remove the region name from the OS.
    ///
    /// The memory is reclaimed once every other process has unmapped it.
    /// Fails with `NotFound` if the name was already removed.
    pub fn unlink(mut self) -> Result<()> {
        tracing::trace!(segment = %self.name, "unlinking");
        let removed = remove_name(&self.name);
        if self.ownership == Ownership::AutoCleanup {
            self.ownership = Ownership::Project;
            agent::forget_segment(&self.name);
        }
        removed
    }

    /// Get a raw pointer to the shared memory
    pub fn as_ptr(&self) -> *const u8 {
        self.inner.as_ptr()
    }

    /// Get a mutable raw pointer to the shared memory
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.inner.as_ptr()
    }

    /// Get a slice view of the shared memory
    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.as_ptr(), self.size) }
    }

    /// Get a mutable slice view of the shared memory
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.as_mut_ptr(), self.size) }
    }
}

impl Drop for SharedMemory {
    fn drop(&mut self) {
        if self.ownership != Ownership::AutoCleanup {
            return;
        }
        match remove_name(&self.name) {
            Ok(()) => tracing::trace!(segment = %self.name, "auto-cleaned"),
            Err(e) if e.is_not_found() => {}
            Err(e) => tracing::warn!(segment = %self.name, error = %e, "auto-cleanup failed"),
        }
        agent::forget_segment(&self.name);
    }
}

impl fmt::Debug for SharedMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedMemory")
            .field("name", &self.name)
            .field("size", &self.size)
            .field("ownership", &self.ownership)
            .finish()
    }
}
