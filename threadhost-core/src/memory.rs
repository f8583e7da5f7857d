//! Shared Linear Memory
//!
//! One growable block of WebAssembly linear memory that every execution unit
//! imports as `env.memory`. Units hold clones of the same handle, so a store
//! performed by one unit is the storage every other unit reads; nothing is
//! copied when the region is handed to a new unit.
//!
//! The host never inserts barriers or locks around the region. Ordering
//! between units is the module's job (atomics, `memory.atomic.wait`/`notify`).

use std::cell::UnsafeCell;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use wasmtime::{Engine, MemoryType, SharedMemory};

use crate::error::{HostError, HostResult};
use crate::messages::ModuleAddr;

/// Size of one WebAssembly page in bytes.
pub const PAGE_SIZE: usize = 64 * 1024;

/// Largest page count addressable by a 32-bit memory (4 GiB).
pub const MAX_WASM32_PAGES: u32 = 65536;

/// Handle to the process-wide shared memory.
///
/// Cloning is cheap and yields another reference to the same storage.
#[derive(Clone)]
pub struct SharedMemoryRegion {
    inner: SharedMemory,
    max_pages: u32,
}

impl SharedMemoryRegion {
    /// Reserve a shared region of `max_pages` and commit `initial_pages` of it.
    pub fn create(engine: &Engine, initial_pages: u32, max_pages: u32) -> HostResult<Self> {
        let fail = |reason: String| HostError::Allocation {
            initial: u64::from(initial_pages),
            maximum: u64::from(max_pages),
            reason,
        };

        if initial_pages > max_pages {
            return Err(fail("initial size exceeds maximum size".to_string()));
        }
        if max_pages > MAX_WASM32_PAGES {
            return Err(fail(format!(
                "maximum exceeds the {MAX_WASM32_PAGES} pages of a 32-bit memory"
            )));
        }

        let ty = MemoryType::shared(initial_pages, max_pages);
        let inner = SharedMemory::new(engine, ty).map_err(|e| fail(format!("{e:#}")))?;

        Ok(Self { inner, max_pages })
    }

    /// Current size in pages.
    pub fn size_pages(&self) -> u64 {
        u64::from(self.inner.size())
    }

    /// Current size in bytes.
    pub fn size_bytes(&self) -> usize {
        self.inner.data_size()
    }

    pub fn max_pages(&self) -> u32 {
        self.max_pages
    }

    /// Grow by `delta_pages`, returning the previous size in pages.
    ///
    /// Growth is visible to every unit holding the region; it never shrinks.
    pub fn grow(&self, delta_pages: u64) -> HostResult<u64> {
        self.inner.grow(delta_pages).map_err(|e| HostError::Allocation {
            initial: self.size_pages(),
            maximum: u64::from(self.max_pages),
            reason: format!("cannot grow by {delta_pages} pages: {e:#}"),
        })
    }

    /// `true` if `addr` names a byte inside the region as it is right now.
    pub fn contains(&self, addr: ModuleAddr) -> bool {
        addr.offset() < self.size_bytes()
    }

    /// Copy up to `len` bytes starting at `addr` into a private buffer.
    ///
    /// The copy is clamped to the end of the region: an address past the end
    /// yields an empty buffer, a range running past it is truncated.
    pub fn read(&self, addr: ModuleAddr, len: usize) -> Vec<u8> {
        let data = self.inner.data();
        let start = addr.offset().min(data.len());
        let end = start.saturating_add(len).min(data.len());

        data[start..end].iter().map(|cell| byte_cell(cell).load(Ordering::SeqCst)).collect()
    }

    /// Store `bytes` at `addr`. The whole range must be inside the region.
    pub fn write(&self, addr: ModuleAddr, bytes: &[u8]) -> HostResult<()> {
        let data = self.inner.data();
        let start = addr.offset();
        let end = start
            .checked_add(bytes.len())
            .filter(|&end| end <= data.len())
            .ok_or(HostError::OutOfBounds {
                addr,
                len: bytes.len(),
                size: data.len(),
            })?;

        for (cell, byte) in data[start..end].iter().zip(bytes) {
            byte_cell(cell).store(*byte, Ordering::SeqCst);
        }
        Ok(())
    }

    /// The wasmtime handle, for defining the `env.memory` import.
    pub(crate) fn handle(&self) -> &SharedMemory {
        &self.inner
    }
}

/// View one byte of shared memory as an atomic.
///
/// Unit threads access the same bytes with wasm loads, stores and atomics
/// while the host copies in or out, so host accesses must be atomic too.
fn byte_cell(cell: &UnsafeCell<u8>) -> &AtomicU8 {
    // SAFETY: `AtomicU8` has the size and alignment of `u8`, the pointer is
    // valid for as long as `cell` is borrowed, and every host access to the
    // region goes through this view, never through a plain reference.
    unsafe { AtomicU8::from_ptr(cell.get()) }
}

impl fmt::Debug for SharedMemoryRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedMemoryRegion")
            .field("size_pages", &self.size_pages())
            .field("max_pages", &self.max_pages)
            .finish()
    }
}
