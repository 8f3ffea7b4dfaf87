use core::ptr::NonNull;

use crate::{
    allocator::{Allocator, AllocatorSettings},
    block::{Block, BlockHeader, BlockQueue, HEADER_SIZE},
    clock,
    config::{MemtxConfig, ReadViewOpts},
    error::Error,
};

/// Blocks freed per [`MemtxAllocator::collect_garbage`] step.
pub const GC_BATCH_SIZE: usize = 100;

/// Alignment every underlying allocator guarantees.
const BASE_ALIGN: usize = 8;
const ALIGN_MAX: usize = 4096;

/// Blocks of ordinary and of temporary spaces are pinned independently.
const KIND_DEFAULT: usize = 0;
const KIND_TEMPORARY: usize = 1;
const KINDS: usize = 2;

#[inline]
const fn kind_of(is_temporary: bool) -> usize {
    if is_temporary {
        KIND_TEMPORARY
    } else {
        KIND_DEFAULT
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MemtxAllocatorStats {
    /// Bytes held by live and not yet collected blocks.
    pub used_total: usize,
    /// Bytes of freed blocks pinned by open read views.
    pub used_rv: usize,
    /// Bytes of freed blocks waiting for collection.
    pub used_gc: usize,
}

impl core::ops::AddAssign for MemtxAllocatorStats {
    #[inline]
    fn add_assign(&mut self, rhs: Self) {
        self.used_total += rhs.used_total;
        self.used_rv += rhs.used_rv;
        self.used_gc += rhs.used_gc;
    }
}

/// Freed blocks with versions in `[previous list version, version)`.
#[derive(Debug)]
struct RvList {
    version: u32,
    mem_used: usize,
    blocks: BlockQueue,
}

impl RvList {
    #[inline]
    fn new(version: u32) -> Self {
        Self {
            version,
            mem_used: 0,
            blocks: BlockQueue::new(),
        }
    }

    #[inline]
    fn append(&mut self, other: &mut Self) {
        self.blocks.append(&mut other.blocks);
        self.mem_used += core::mem::take(&mut other.mem_used);
    }
}

/// One open read view of a kind. It owns a list per read view that was open
/// when it was created, itself last.
#[derive(Debug)]
struct RvNode {
    refs: u32,
    lists: Vec<RvList>,
}

impl RvNode {
    #[inline]
    fn version(&self) -> u32 {
        self.lists.last().map_or(0, |list| list.version)
    }

    fn add(&mut self, block: Block, size: usize) {
        let version = block.version();
        let Some(list) = self.lists.iter_mut().find(|list| list.version > version) else {
            debug_assert!(false, "block {version} is not visible from read view");
            return;
        };
        list.blocks.push_back(block);
        list.mem_used += size;
    }
}

/// Open read views of one kind, oldest first, unique by version.
#[derive(Debug, Default)]
struct Chain {
    nodes: Vec<RvNode>,
}

impl Chain {
    fn open(&mut self, version: u32) {
        if let Some(last) = self.nodes.last_mut() {
            if last.version() == version {
                last.refs += 1;
                return;
            }
            debug_assert!(last.version() < version);
        }
        let lists = self
            .nodes
            .iter()
            .map(|node| RvList::new(node.version()))
            .chain(core::iter::once(RvList::new(version)))
            .collect();
        self.nodes.push(RvNode { refs: 1, lists });
    }

    #[inline]
    fn last_mut(&mut self) -> Option<&mut RvNode> {
        self.nodes.last_mut()
    }

    /// Drops a reference to the view of `version`. Once unreferenced, blocks
    /// the next older view can still see move to its lists; the rest go to
    /// `gc`. Returns the bytes moved to `gc`.
    fn close(&mut self, version: u32, gc: &mut BlockQueue) -> usize {
        let Ok(idx) = self.nodes.binary_search_by_key(&version, RvNode::version) else {
            debug_assert!(false, "read view {version} is not open");
            return 0;
        };
        let node = &mut self.nodes[idx];
        node.refs -= 1;
        if node.refs > 0 {
            return 0;
        }

        let node = self.nodes.remove(idx);
        let mut freed = 0;
        let mut prev = idx.checked_sub(1).map(|p| &mut self.nodes[p]);
        let mut j = 0;
        for mut list in node.lists {
            match prev.as_deref_mut() {
                Some(prev) if list.version <= prev.version() => {
                    while prev.lists[j].version != list.version {
                        j += 1;
                    }
                    prev.lists[j].append(&mut list);
                }
                _ => {
                    freed += list.mem_used;
                    gc.append(&mut list.blocks);
                }
            }
        }
        freed
    }

    /// Unlinks every view, handing all pinned blocks to `gc`.
    fn drain(&mut self, gc: &mut BlockQueue) -> usize {
        let mut freed = 0;
        for node in self.nodes.drain(..) {
            for mut list in node.lists {
                freed += list.mem_used;
                gc.append(&mut list.blocks);
            }
        }
        freed
    }
}

/// Handle of an open read view. Must be passed back to
/// [`MemtxAllocator::close_read_view`] of the allocator that opened it.
#[must_use = "a read view pins freed blocks until it is closed"]
#[derive(Debug, PartialEq, Eq)]
pub struct ReadView {
    versions: [Option<u32>; KINDS],
}

impl ReadView {
    /// Generation the view observes.
    #[inline]
    pub fn version(&self) -> u32 {
        self.versions.iter().flatten().copied().next().unwrap_or(0)
    }

    #[inline]
    pub fn includes_temporary(&self) -> bool {
        self.versions[KIND_TEMPORARY].is_some()
    }
}

/// MVCC wrapper over an allocation strategy.
///
/// Every block is stamped with the read-view generation current at
/// allocation. A freed block that the newest open read view of its kind can
/// still see is parked in that view; closing views hands parked blocks to
/// older views or to the garbage queue, which allocation drains in bounded
/// steps.
pub struct MemtxAllocator<A: Allocator> {
    allocator: A,
    gc: BlockQueue,
    chains: [Chain; KINDS],
    version: u32,
    /// No block carries the current version yet.
    may_reuse: bool,
    timestamp: f64,
    reuse_interval: f64,
    stats: MemtxAllocatorStats,
}

unsafe impl<A: Allocator> Send for MemtxAllocator<A> {}

impl<A: Allocator> core::fmt::Debug for MemtxAllocator<A> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MemtxAllocator")
            .field("allocator", &A::NAME)
            .field("version", &self.version)
            .field("gc", &self.gc.len())
            .field("stats", &self.stats)
            .finish()
    }
}

impl<A: Allocator> MemtxAllocator<A> {
    pub fn new(allocator: A) -> Self {
        Self {
            allocator,
            gc: BlockQueue::new(),
            chains: [Chain::default(), Chain::default()],
            version: 0,
            may_reuse: false,
            timestamp: 0.0,
            reuse_interval: MemtxConfig::DEFAULT_REUSE_INTERVAL,
            stats: MemtxAllocatorStats::default(),
        }
    }

    pub fn create(settings: &AllocatorSettings) -> Result<Self, Error> {
        A::create(settings).map(Self::new)
    }

    #[inline]
    pub fn allocator(&self) -> &A {
        &self.allocator
    }

    #[inline]
    pub fn allocator_mut(&mut self) -> &mut A {
        &mut self.allocator
    }

    #[inline]
    pub fn stats(&self) -> MemtxAllocatorStats {
        self.stats
    }

    /// Generation of the most recent read view.
    #[inline]
    pub fn read_view_version(&self) -> u32 {
        self.version
    }

    #[inline]
    pub fn read_view_reuse_interval(&self) -> f64 {
        self.reuse_interval
    }

    /// Within `interval` seconds of opening a read view, new blocks are
    /// stamped with the previous generation so that the next view may share
    /// the current one. Zero disables sharing after any allocation.
    #[inline]
    pub fn set_read_view_reuse_interval(&mut self, interval: f64) {
        self.reuse_interval = interval;
    }

    pub fn open_read_view(&mut self, opts: &ReadViewOpts) -> ReadView {
        if !self.may_reuse {
            self.version = self.version.wrapping_add(1);
            debug_assert_ne!(self.version, 0, "read view version wrapped around");
            self.may_reuse = true;
            self.timestamp = clock::monotonic_lowres();
        }

        let mut versions = [None; KINDS];
        for (kind, chain) in self.chains.iter_mut().enumerate() {
            if kind == KIND_TEMPORARY && !opts.enable_temporary_spaces {
                continue;
            }
            chain.open(self.version);
            versions[kind] = Some(self.version);
        }

        #[cfg(feature = "tracing")]
        tracing::debug!("{}: read view {} opened", A::NAME, self.version);

        ReadView { versions }
    }

    pub fn close_read_view(&mut self, rv: ReadView) {
        for (kind, version) in rv.versions.into_iter().enumerate() {
            let Some(version) = version else {
                continue;
            };
            let freed = self.chains[kind].close(version, &mut self.gc);
            debug_assert!(self.stats.used_rv >= freed);
            self.stats.used_rv -= freed;
            self.stats.used_gc += freed;
        }

        #[cfg(feature = "tracing")]
        tracing::debug!(
            "{}: read view {} closed, {} bytes to collect",
            A::NAME,
            rv.version(),
            self.stats.used_gc
        );
    }

    /// Allocates `data_size` payload bytes preceded by `data_offset` bytes of
    /// caller prefix. A compact block is only made when both fit the compact
    /// bounds; see [`Block::is_compact`].
    #[inline]
    pub fn alloc(
        &mut self,
        data_size: usize,
        data_offset: usize,
        compact: bool,
    ) -> Result<Block, Error> {
        self.alloc_aligned(data_size, data_offset, compact, 1)
    }

    /// Like [`MemtxAllocator::alloc`] with the payload aligned to `align`.
    /// Headers stay 8-byte aligned, so `data_offset` must be a multiple of
    /// `align` or of 8, whichever is smaller.
    pub fn alloc_aligned(
        &mut self,
        data_size: usize,
        data_offset: usize,
        compact: bool,
        align: usize,
    ) -> Result<Block, Error> {
        if !align.is_power_of_two()
            || align > ALIGN_MAX
            || data_offset % align.min(BASE_ALIGN) != 0
        {
            return Err(Error::InvalidLayout {
                size: data_size,
                align,
            });
        }
        let data_offset16 = u16::try_from(data_offset).map_err(|_| Error::InvalidLayout {
            size: data_offset,
            align,
        })?;
        let slack = align.saturating_sub(BASE_ALIGN);
        let Some(size) = data_size
            .checked_add(HEADER_SIZE + data_offset + slack)
            .filter(|&size| size <= u32::MAX as usize)
        else {
            return Err(Error::TooLarge {
                requested: data_size,
                bound: u32::MAX as usize,
            });
        };
        let (size32, data_size32) = (size as u32, data_size as u32);

        self.collect_garbage();
        let raw = self.allocator.alloc(size)?;
        self.stats.used_total += size;

        let data_addr = raw.as_ptr() as usize + HEADER_SIZE + data_offset;
        let shift = memory_addr::align_up(data_addr, align) - data_addr;
        let version = self.stamp();
        let hdr = unsafe {
            BlockHeader::init(
                raw.add(shift),
                size32,
                data_size32,
                data_offset16,
                shift as u16,
                compact,
                version,
            )
        };
        Ok(Block::from_header(hdr))
    }

    #[inline]
    fn stamp(&mut self) -> u32 {
        let now = clock::monotonic_lowres();
        if self.version > 0
            && self.reuse_interval > 0.0
            && now - self.timestamp < self.reuse_interval
        {
            self.version - 1
        } else {
            self.may_reuse = false;
            self.version
        }
    }

    /// Frees `block` now, or parks it if the newest read view of its kind
    /// was opened after the block was allocated.
    pub fn free(&mut self, block: Block, is_temporary: bool) {
        let size = block.size();
        match self.chains[kind_of(is_temporary)].last_mut() {
            Some(node) if block.version() < node.version() => {
                self.stats.used_rv += size;
                node.add(block, size);
            }
            _ => unsafe { self.release(block.into_header()) },
        }
    }

    /// Frees up to [`GC_BATCH_SIZE`] collectable blocks. Returns whether any
    /// remain.
    pub fn collect_garbage(&mut self) -> bool {
        for _ in 0..GC_BATCH_SIZE {
            let Some(hdr) = self.gc.pop_front() else {
                break;
            };
            let size = unsafe { hdr.as_ref().size() };
            debug_assert!(self.stats.used_gc >= size);
            self.stats.used_gc -= size;
            unsafe { self.release(hdr) };
        }
        !self.gc.is_empty()
    }

    /// # Safety
    /// `hdr` must be a block of this allocator that nothing references.
    unsafe fn release(&mut self, hdr: NonNull<BlockHeader>) {
        let (raw, size) = unsafe { (BlockHeader::raw(hdr), hdr.as_ref().size()) };
        debug_assert!(self.stats.used_total >= size);
        self.stats.used_total -= size;
        unsafe { self.allocator.free(raw, size) };
    }
}

impl<A: Allocator> Drop for MemtxAllocator<A> {
    fn drop(&mut self) {
        for chain in self.chains.iter_mut() {
            let freed = chain.drain(&mut self.gc);
            self.stats.used_rv -= freed;
            self.stats.used_gc += freed;
        }
        while self.collect_garbage() {}
    }
}
