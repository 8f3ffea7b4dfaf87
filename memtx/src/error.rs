#[derive(Clone, PartialEq, Eq)]
pub enum Error {
    /// The quota cannot cover the request.
    QuotaExceeded {
        requested: usize,
        available: usize,
    },
    /// The arena reached its `maxalloc` bound.
    ArenaExhausted { used: usize, maxalloc: usize },
    /// No pool serves an object of this size.
    TooLarge { requested: usize, bound: usize },
    InvalidLayout { size: usize, align: usize },
    /// The heap backend refused a mapping.
    OutofMemory { requested: usize },
    /// Allocator name that no strategy answers to.
    UnknownAllocator(String),
    #[cfg(all(unix, feature = "unix"))]
    MapError(nix::Error),
}

impl core::error::Error for Error {}

impl core::fmt::Debug for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(self, f)
    }
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::QuotaExceeded {
                requested,
                available,
            } => write!(
                f,
                "Quota exceeded: requested {} bytes, but only {} is available",
                requested, available
            ),
            Self::ArenaExhausted { used, maxalloc } => write!(
                f,
                "Arena exhausted: {} bytes used out of {} bytes",
                used, maxalloc
            ),
            Self::TooLarge { requested, bound } => write!(
                f,
                "Allocation failed: requested size is {}, but the bound is {}",
                requested, bound
            ),
            Self::InvalidLayout { size, align } => {
                write!(f, "Invalid layout: size {}, align {}", size, align)
            }
            Self::OutofMemory { requested } => {
                write!(f, "Out of memory: failed to map {} bytes", requested)
            }
            Self::UnknownAllocator(name) => write!(f, "Unknown allocator: {:?}", name),
            #[cfg(all(unix, feature = "unix"))]
            Self::MapError(err) => write!(f, "Map error: {}", err),
        }
    }
}

#[cfg(all(unix, feature = "unix"))]
impl From<nix::Error> for Error {
    #[inline]
    fn from(err: nix::Error) -> Self {
        Self::MapError(err)
    }
}
