/// Marker stored at the front of in-band metadata so stray pointers are
/// caught in debug builds.
pub type Magic = u16;

pub trait Layout: Sized {
    const MAGIC: Magic;

    fn magic(&self) -> Magic;

    #[inline]
    fn is_valid(&self) -> bool {
        self.magic() == Self::MAGIC
    }

    /// # Safety
    /// `ptr` must point to an initialized `Self`.
    #[inline]
    unsafe fn from_raw<'a>(ptr: *mut Self) -> &'a mut Self {
        let this = unsafe { &mut *ptr };
        debug_assert!(this.is_valid(), "corrupted header at {ptr:p}");
        this
    }
}
