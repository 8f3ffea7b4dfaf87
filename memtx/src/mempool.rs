use core::{mem, ptr::NonNull};

use crate::{
    arena::SlabArena,
    error::Error,
    header::{Layout, Magic},
    os::Mmap,
};

/// Offset of the first object in a slab.
const OBJ_OFFSET: usize = memory_addr::align_up(mem::size_of::<SlabHeader>(), 16);
/// At least this many of the largest objects must fit in one slab.
const OBJ_PER_SLAB_MIN: usize = 4;

/// Largest object a pool over `slab_size` slabs may serve.
#[inline]
pub const fn objsize_max(slab_size: usize) -> usize {
    memory_addr::align_down((slab_size - OBJ_OFFSET) / OBJ_PER_SLAB_MIN, 8)
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub objsize: usize,
    pub slab_size: usize,
    pub slab_count: usize,
    /// Live objects.
    pub object_count: usize,
    pub bytes_used: usize,
    pub bytes_free: usize,
}

struct FreeObject {
    next: *mut FreeObject,
}

/// In-band header at the start of every slab owned by a pool.
#[repr(C)]
struct SlabHeader {
    /// Reserved for the arena's cache link while the slab is cached.
    _link: usize,
    magic: Magic,
    objsize: u32,
    used: u32,
    capacity: u32,
    /// Objects ever carved by bumping; the rest of the slab is untouched.
    carved: u32,
    /// Position in the owning pool's slab table.
    index: u32,
    free: *mut FreeObject,
    prev: *mut SlabHeader,
    next: *mut SlabHeader,
    in_avail: bool,
}

impl Layout for SlabHeader {
    const MAGIC: Magic = 0xEE7A;

    #[inline]
    fn magic(&self) -> Magic {
        self.magic
    }
}

impl SlabHeader {
    /// # Safety
    /// `slab` must point to a slab of at least `OBJ_OFFSET + capacity *
    /// objsize` bytes.
    unsafe fn init(slab: NonNull<u8>, objsize: usize, capacity: u32, index: u32) -> NonNull<Self> {
        let ptr = slab.cast::<Self>();
        unsafe {
            ptr.as_ptr().write(Self {
                _link: 0,
                magic: Self::MAGIC,
                objsize: objsize as u32,
                used: 0,
                capacity,
                carved: 0,
                index,
                free: core::ptr::null_mut(),
                prev: core::ptr::null_mut(),
                next: core::ptr::null_mut(),
                in_avail: false,
            })
        };
        ptr
    }

    #[inline]
    fn is_full(&self) -> bool {
        self.used == self.capacity
    }

    #[inline]
    fn base(&mut self) -> *mut u8 {
        unsafe { (self as *mut Self).cast::<u8>().add(OBJ_OFFSET) }
    }

    fn take(&mut self) -> NonNull<u8> {
        debug_assert!(!self.is_full());
        self.used += 1;
        if let Some(obj) = NonNull::new(self.free) {
            self.free = unsafe { obj.as_ref().next };
            return obj.cast();
        }
        let offset = self.carved as usize * self.objsize as usize;
        self.carved += 1;
        unsafe { NonNull::new_unchecked(self.base().add(offset)) }
    }

    fn put(&mut self, obj: NonNull<u8>) {
        debug_assert!(self.used > 0, "double free in slab");
        let obj = obj.cast::<FreeObject>();
        unsafe { obj.as_ptr().write(FreeObject { next: self.free }) };
        self.free = obj.as_ptr();
        self.used -= 1;
    }
}

/// All objects of one size, carved from arena slabs.
///
/// Slabs with room are kept on an intrusive list; a slab that becomes empty
/// is kept as the single spare or handed back to the arena.
pub struct Pool {
    objsize: usize,
    slab_size: usize,
    capacity: u32,
    slabs: Vec<NonNull<SlabHeader>>,
    avail: *mut SlabHeader,
    spare: Option<NonNull<SlabHeader>>,
    used: usize,
}

unsafe impl Send for Pool {}

impl core::fmt::Debug for Pool {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Pool")
            .field("objsize", &self.objsize)
            .field("slabs", &self.slabs.len())
            .field("used", &self.used)
            .finish()
    }
}

impl Pool {
    pub fn new(objsize: usize, slab_size: usize) -> Self {
        debug_assert!(objsize >= mem::size_of::<FreeObject>());
        debug_assert!(objsize <= objsize_max(slab_size));
        Self {
            objsize,
            slab_size,
            capacity: ((slab_size - OBJ_OFFSET) / objsize) as u32,
            slabs: Vec::new(),
            avail: core::ptr::null_mut(),
            spare: None,
            used: 0,
        }
    }

    #[inline]
    pub fn objsize(&self) -> usize {
        self.objsize
    }

    /// Live objects.
    #[inline]
    pub fn used(&self) -> usize {
        self.used
    }

    #[inline]
    pub fn slab_count(&self) -> usize {
        self.slabs.len() + self.spare.is_some() as usize
    }

    pub fn stats(&self) -> PoolStats {
        let slab_count = self.slab_count();
        let bytes_used = self.used * self.objsize;
        PoolStats {
            objsize: self.objsize,
            slab_size: self.slab_size,
            slab_count,
            object_count: self.used,
            bytes_used,
            bytes_free: slab_count * self.slab_size - bytes_used,
        }
    }

    pub fn alloc<M: Mmap + ?Sized>(&mut self, arena: &SlabArena<M>) -> Result<NonNull<u8>, Error> {
        let slab = match NonNull::new(self.avail) {
            Some(slab) => slab,
            None => self.grow(arena)?,
        };
        let hdr = unsafe { &mut *slab.as_ptr() };
        let obj = hdr.take();
        if hdr.is_full() {
            self.unlink(slab);
        }
        self.used += 1;
        Ok(obj)
    }

    /// # Safety
    /// `ptr` must have been returned by [`Pool::alloc`] of this pool and not
    /// freed since.
    pub unsafe fn free<M: Mmap + ?Sized>(&mut self, arena: &SlabArena<M>, ptr: NonNull<u8>) {
        let slab = memory_addr::align_down(ptr.as_ptr() as usize, self.slab_size);
        let hdr = unsafe { SlabHeader::from_raw(slab as *mut SlabHeader) };
        debug_assert_eq!(hdr.objsize as usize, self.objsize, "object freed to a foreign pool");

        let was_full = hdr.is_full();
        hdr.put(ptr);
        self.used -= 1;

        let slab = NonNull::from(hdr);
        if was_full {
            self.link(slab);
        }
        if unsafe { slab.as_ref().used } == 0 {
            self.release(arena, slab);
        }
    }

    /// Returns every slab to the arena, live objects included.
    pub fn destroy<M: Mmap + ?Sized>(&mut self, arena: &SlabArena<M>) {
        for slab in self.slabs.drain(..).chain(self.spare.take()) {
            unsafe { arena.unmap(slab.cast()) };
        }
        self.avail = core::ptr::null_mut();
        self.used = 0;
    }

    fn grow<M: Mmap + ?Sized>(
        &mut self,
        arena: &SlabArena<M>,
    ) -> Result<NonNull<SlabHeader>, Error> {
        let raw = match self.spare.take() {
            Some(spare) => spare.cast(),
            None => arena.map()?,
        };
        let index = self.slabs.len() as u32;
        let slab = unsafe { SlabHeader::init(raw, self.objsize, self.capacity, index) };
        self.slabs.push(slab);
        self.link(slab);
        Ok(slab)
    }

    fn release<M: Mmap + ?Sized>(&mut self, arena: &SlabArena<M>, slab: NonNull<SlabHeader>) {
        self.unlink(slab);
        let index = unsafe { slab.as_ref().index } as usize;
        self.slabs.swap_remove(index);
        if let Some(moved) = self.slabs.get_mut(index) {
            unsafe { moved.as_mut().index = index as u32 };
        }

        if self.spare.is_none() {
            self.spare = Some(slab);
        } else {
            unsafe { arena.unmap(slab.cast()) };
        }
    }

    fn link(&mut self, mut slab: NonNull<SlabHeader>) {
        let hdr = unsafe { slab.as_mut() };
        debug_assert!(!hdr.in_avail);
        hdr.prev = core::ptr::null_mut();
        hdr.next = self.avail;
        if let Some(mut head) = NonNull::new(self.avail) {
            unsafe { head.as_mut().prev = slab.as_ptr() };
        }
        hdr.in_avail = true;
        self.avail = slab.as_ptr();
    }

    fn unlink(&mut self, mut slab: NonNull<SlabHeader>) {
        let hdr = unsafe { slab.as_mut() };
        if !hdr.in_avail {
            return;
        }
        match NonNull::new(hdr.prev) {
            Some(mut prev) => unsafe { prev.as_mut().next = hdr.next },
            None => self.avail = hdr.next,
        }
        if let Some(mut next) = NonNull::new(hdr.next) {
            unsafe { next.as_mut().prev = hdr.prev };
        }
        hdr.prev = core::ptr::null_mut();
        hdr.next = core::ptr::null_mut();
        hdr.in_avail = false;
    }
}
