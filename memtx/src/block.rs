use core::{mem, ptr::NonNull};

bitflags::bitflags! {
    #[repr(transparent)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BlockFlags: u8 {
        const COMPACT = 0x1;
    }
}

/// Compact blocks keep their prefix and payload within these bounds.
const COMPACT_OFFSET_MAX: usize = i8::MAX as usize;
const COMPACT_SIZE_MAX: usize = u8::MAX as usize;

#[derive(Clone, Copy)]
#[repr(C)]
struct Stamp {
    version: u32,
    _reserved: u32,
}

/// First word of a block header: the version stamp while the block is
/// live, the queue link once it has been parked or scheduled for collection.
#[repr(C)]
union Link {
    stamp: Stamp,
    next: *mut BlockHeader,
}

#[repr(C)]
pub(crate) struct BlockHeader {
    link: Link,
    /// Bytes requested from the underlying allocator.
    size: u32,
    data_size: u32,
    data_offset: u16,
    /// Distance from the underlying allocation to this header.
    shift: u16,
    flags: BlockFlags,
}

pub(crate) const HEADER_SIZE: usize = mem::size_of::<BlockHeader>();

impl BlockHeader {
    /// # Safety
    /// `ptr` must be valid for writes of a header followed by `data_offset +
    /// data_size` bytes.
    pub(crate) unsafe fn init(
        ptr: NonNull<u8>,
        size: u32,
        data_size: u32,
        data_offset: u16,
        shift: u16,
        compact: bool,
        version: u32,
    ) -> NonNull<Self> {
        let compact = compact
            && data_offset as usize <= COMPACT_OFFSET_MAX
            && data_size as usize <= COMPACT_SIZE_MAX;
        let hdr = ptr.cast::<Self>();
        unsafe {
            hdr.as_ptr().write(Self {
                link: Link {
                    stamp: Stamp {
                        version,
                        _reserved: 0,
                    },
                },
                size,
                data_size,
                data_offset,
                shift,
                flags: if compact {
                    BlockFlags::COMPACT
                } else {
                    BlockFlags::empty()
                },
            })
        };
        hdr
    }

    #[inline]
    pub(crate) fn size(&self) -> usize {
        self.size as usize
    }

    /// Start of the underlying allocation.
    ///
    /// # Safety
    /// `this` must point to an initialized header.
    #[inline]
    pub(crate) unsafe fn raw(this: NonNull<Self>) -> NonNull<u8> {
        unsafe {
            let shift = this.as_ref().shift as usize;
            this.cast::<u8>().sub(shift)
        }
    }
}

/// A live allocation of a [`crate::MemtxAllocator`].
///
/// Layout: header, `data_offset` bytes of caller prefix, then the payload.
/// The handle is the only owner; freeing consumes it.
#[must_use]
pub struct Block {
    hdr: NonNull<BlockHeader>,
}

unsafe impl Send for Block {}

impl core::fmt::Debug for Block {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Block")
            .field("ptr", &self.hdr)
            .field("version", &self.version())
            .field("data_size", &self.data_size())
            .finish()
    }
}

impl Block {
    #[inline]
    pub(crate) fn from_header(hdr: NonNull<BlockHeader>) -> Self {
        Self { hdr }
    }

    #[inline]
    pub(crate) fn into_header(self) -> NonNull<BlockHeader> {
        self.hdr
    }

    #[inline]
    fn header(&self) -> &BlockHeader {
        unsafe { self.hdr.as_ref() }
    }

    /// Read-view generation the block was stamped with.
    #[inline]
    pub fn version(&self) -> u32 {
        unsafe { self.header().link.stamp.version }
    }

    /// Bytes requested from the underlying allocator, header included.
    #[inline]
    pub fn size(&self) -> usize {
        self.header().size()
    }

    #[inline]
    pub fn data_size(&self) -> usize {
        self.header().data_size as usize
    }

    #[inline]
    pub fn data_offset(&self) -> usize {
        self.header().data_offset as usize
    }

    #[inline]
    pub fn is_compact(&self) -> bool {
        self.header().flags.contains(BlockFlags::COMPACT)
    }

    /// The `data_offset` bytes reserved in front of the payload.
    #[inline]
    pub fn prefix(&self) -> NonNull<u8> {
        unsafe { self.hdr.cast::<u8>().add(HEADER_SIZE) }
    }

    #[inline]
    pub fn data(&self) -> NonNull<u8> {
        unsafe { self.prefix().add(self.data_offset()) }
    }

    /// # Safety
    /// Nothing else may access the payload while the slice lives.
    #[inline]
    pub unsafe fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { core::slice::from_raw_parts_mut(self.data().as_ptr(), self.data_size()) }
    }

    /// Gives up the handle, returning the prefix pointer.
    #[inline]
    pub fn into_raw(self) -> NonNull<u8> {
        self.prefix()
    }

    /// # Safety
    /// `ptr` must come from [`Block::into_raw`] and the block must not have
    /// been freed.
    #[inline]
    pub unsafe fn from_raw(ptr: NonNull<u8>) -> Self {
        Self {
            hdr: unsafe { ptr.sub(HEADER_SIZE) }.cast(),
        }
    }
}

/// Intrusive FIFO of blocks linked through their header's first word.
pub(crate) struct BlockQueue {
    head: *mut BlockHeader,
    tail: *mut BlockHeader,
    len: usize,
}

impl core::fmt::Debug for BlockQueue {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("BlockQueue").field("len", &self.len).finish()
    }
}

impl Default for BlockQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockQueue {
    pub(crate) const fn new() -> Self {
        Self {
            head: core::ptr::null_mut(),
            tail: core::ptr::null_mut(),
            len: 0,
        }
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.head.is_null()
    }

    /// Overwrites the block's stamp with the queue link.
    pub(crate) fn push_back(&mut self, block: Block) {
        let hdr = block.into_header().as_ptr();
        unsafe { (*hdr).link.next = core::ptr::null_mut() };
        match NonNull::new(self.tail) {
            Some(tail) => unsafe { (*tail.as_ptr()).link.next = hdr },
            None => self.head = hdr,
        }
        self.tail = hdr;
        self.len += 1;
    }

    pub(crate) fn pop_front(&mut self) -> Option<NonNull<BlockHeader>> {
        let head = NonNull::new(self.head)?;
        self.head = unsafe { head.as_ref().link.next };
        if self.head.is_null() {
            self.tail = core::ptr::null_mut();
        }
        self.len -= 1;
        Some(head)
    }

    /// Moves every block of `other` to the back of `self` in O(1).
    pub(crate) fn append(&mut self, other: &mut Self) {
        let Some(other_head) = NonNull::new(other.head) else {
            return;
        };
        match NonNull::new(self.tail) {
            Some(tail) => unsafe { (*tail.as_ptr()).link.next = other_head.as_ptr() },
            None => self.head = other_head.as_ptr(),
        }
        self.tail = other.tail;
        self.len += other.len;
        *other = Self::new();
    }
}
