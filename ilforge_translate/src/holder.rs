//! Scope-bound ownership of temporary registers and spill buffers.
//!
//! A [`TempSlot`] owns one physical resource for the duration of its
//! lifetime and returns it to the [`TempPool`] exactly once, on drop.
//! Slots cannot be cloned; [`TempSlot::alias`] produces a view that reads
//! the same location but never releases it, and a pinned slot wraps a
//! fixed register whose lifetime the caller owns.

use std::cell::RefCell;
use std::collections::BTreeSet;
use std::rc::Rc;

use ilforge_target::Reg;

use crate::error::TranslateError;

/// Upper bound on the per-method spill area.
const SPILL_LIMIT: u32 = 4096;

/// Requested placement for a new temporary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocPolicy {
    /// A register or failure.
    RegisterOnly,
    /// A register if one is free, otherwise a spill buffer.
    PreferredRegister,
    /// Always a spill buffer.
    StackOnly,
}

/// The physical resource behind a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TempResource {
    Register(Reg),
    /// Byte range in the spill area.
    Buffer { offset: i32, size: u32 },
    /// A fixed register owned by the caller; never released by the pool.
    Pinned(Reg),
}

struct PoolInner {
    free: BTreeSet<u8>,
    /// High-water mark of the spill area, in bytes.
    spill_size: u32,
    /// Released buffer ranges available for exact-size reuse.
    spill_free: Vec<(i32, u32)>,
    allocations: u64,
    releases: u64,
}

/// Pool of temporary registers and spill space for one method.
///
/// Cheap to clone; all clones share the same underlying pool.
#[derive(Clone)]
pub struct TempPool {
    inner: Rc<RefCell<PoolInner>>,
    word: u32,
}

impl TempPool {
    pub fn new(registers: &[Reg], word: u32) -> Self {
        Self {
            inner: Rc::new(RefCell::new(PoolInner {
                free: registers.iter().map(|r| r.0).collect(),
                spill_size: 0,
                spill_free: Vec::new(),
                allocations: 0,
                releases: 0,
            })),
            word,
        }
    }

    /// Allocate a slot of `size` bytes under the given policy.
    pub fn allocate(&self, policy: AllocPolicy, size: u32) -> Result<TempSlot, TranslateError> {
        let resource = {
            let mut inner = self.inner.borrow_mut();
            match policy {
                AllocPolicy::RegisterOnly => inner
                    .take_register()
                    .ok_or(TranslateError::RegisterExhausted)?,
                AllocPolicy::PreferredRegister => match inner.take_register() {
                    Some(r) => r,
                    None => inner.take_buffer(size, self.word)?,
                },
                AllocPolicy::StackOnly => inner.take_buffer(size, self.word)?,
            }
        };
        self.inner.borrow_mut().allocations += 1;
        Ok(TempSlot {
            pool: Rc::clone(&self.inner),
            resource,
            owned: true,
        })
    }

    /// Wrap a caller-owned register. The slot never releases it.
    pub fn pinned(&self, reg: Reg) -> TempSlot {
        TempSlot {
            pool: Rc::clone(&self.inner),
            resource: TempResource::Pinned(reg),
            owned: false,
        }
    }

    /// Total owned allocations handed out so far.
    pub fn allocations(&self) -> u64 {
        self.inner.borrow().allocations
    }

    /// Total owned slots released so far.
    pub fn releases(&self) -> u64 {
        self.inner.borrow().releases
    }

    /// Number of registers currently free.
    pub fn free_registers(&self) -> usize {
        self.inner.borrow().free.len()
    }

    /// Bytes of spill area used at peak.
    pub fn spill_high_water(&self) -> u32 {
        self.inner.borrow().spill_size
    }
}

impl PoolInner {
    fn take_register(&mut self) -> Option<TempResource> {
        let first = self.free.iter().next().copied()?;
        self.free.remove(&first);
        Some(TempResource::Register(Reg(first)))
    }

    fn take_buffer(&mut self, size: u32, word: u32) -> Result<TempResource, TranslateError> {
        let size = size.max(word);
        if let Some(pos) = self.spill_free.iter().position(|&(_, s)| s == size) {
            let (offset, size) = self.spill_free.swap_remove(pos);
            return Ok(TempResource::Buffer { offset, size });
        }
        // Grow the spill area, aligned to the natural alignment of the
        // request (at least one word).
        let align = size.max(word);
        let aligned = (self.spill_size + align - 1) & !(align - 1);
        let end = aligned + size;
        if end > SPILL_LIMIT {
            return Err(TranslateError::StackBufferExhausted { requested: size });
        }
        self.spill_size = end;
        Ok(TempResource::Buffer {
            offset: aligned as i32,
            size,
        })
    }

    fn give_back(&mut self, resource: TempResource) {
        match resource {
            TempResource::Register(reg) => {
                self.free.insert(reg.0);
            }
            TempResource::Buffer { offset, size } => {
                self.spill_free.push((offset, size));
            }
            TempResource::Pinned(_) => {}
        }
        self.releases += 1;
    }
}

/// Owning handle over one temporary resource.
///
/// Move-only: there is no `Clone`. Dropping the last owner returns the
/// resource to the pool; aliases and pinned slots are views and never
/// release anything.
pub struct TempSlot {
    pool: Rc<RefCell<PoolInner>>,
    resource: TempResource,
    owned: bool,
}

impl TempSlot {
    pub fn resource(&self) -> TempResource {
        self.resource
    }

    /// The register behind this slot, if it is register-resident.
    pub fn register(&self) -> Option<Reg> {
        match self.resource {
            TempResource::Register(r) | TempResource::Pinned(r) => Some(r),
            TempResource::Buffer { .. } => None,
        }
    }

    /// The spill range behind this slot, if buffer-resident.
    pub fn buffer(&self) -> Option<(i32, u32)> {
        match self.resource {
            TempResource::Buffer { offset, size } => Some((offset, size)),
            _ => None,
        }
    }

    /// A non-owning view of the same location. Used when a block's
    /// evaluation-stack snapshot is shared with a second continuation:
    /// the view reads the location, the original keeps the lifetime.
    pub fn alias(&self) -> TempSlot {
        TempSlot {
            pool: Rc::clone(&self.pool),
            resource: self.resource,
            owned: false,
        }
    }

    pub fn is_owned(&self) -> bool {
        self.owned
    }
}

impl std::fmt::Debug for TempSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TempSlot")
            .field("resource", &self.resource)
            .field("owned", &self.owned)
            .finish()
    }
}

impl Drop for TempSlot {
    fn drop(&mut self) {
        if self.owned {
            self.pool.borrow_mut().give_back(self.resource);
        }
    }
}
