//! PCM sample storage
//!
//! `PcmBuffer` owns interleaved PCM for one source. Allocation walks an
//! ordered list of strategies and keeps the first that succeeds:
//!
//! - whole-song buffers: huge-page mapping, then plain anonymous mapping
//! - double-buffer chunks: page-locked heap array, then plain heap array
//!
//! `SharedPcm` lets one background writer fill a buffer front to back while
//! the consumer reads the already-published prefix. The published watermark
//! is the only hand-off point; the two sides never see the same items.

use super::types::{PcmSlice, PcmSliceMut, SampleFormat};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Size of huge pages assumed when rounding huge-page mappings
#[cfg(target_os = "linux")]
const HUGE_PAGE_BYTES: usize = 2 * 1024 * 1024;

/// Ways of obtaining PCM memory, in the order they are usually preferred
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationStrategy {
    /// Anonymous mapping backed by huge pages (Linux)
    HugePageMapping,
    /// Plain anonymous memory mapping
    AnonymousMapping,
    /// Heap array pinned in RAM with `mlock`
    LockedHeap,
    /// Plain heap array
    Heap,
}

impl AllocationStrategy {
    /// Fallback chain for whole-song buffers
    pub const WHOLE_SONG: &'static [AllocationStrategy] = &[
        AllocationStrategy::HugePageMapping,
        AllocationStrategy::AnonymousMapping,
    ];

    /// Fallback chain for double-buffer chunks
    pub const DOUBLE_BUFFER: &'static [AllocationStrategy] =
        &[AllocationStrategy::LockedHeap, AllocationStrategy::Heap];
}

/// Why a single allocation strategy failed
#[derive(Debug, Error)]
pub enum AllocationError {
    #[error("{0:?} is not supported on this platform")]
    Unsupported(AllocationStrategy),

    #[error("{strategy:?} failed for {bytes} bytes: {reason}")]
    Failed {
        strategy: AllocationStrategy,
        bytes: usize,
        reason: String,
    },

    #[error("buffer of {items} {format} samples overflows the address space")]
    Overflow { items: usize, format: SampleFormat },

    #[error("no allocation strategy given")]
    NoStrategy,
}

enum Storage {
    #[cfg(unix)]
    Mapped {
        ptr: std::ptr::NonNull<u32>,
        map_bytes: usize,
    },
    Heap {
        words: Vec<u32>,
        locked: bool,
    },
}

/// Owned interleaved PCM memory with checked, typed views
pub struct PcmBuffer {
    storage: Storage,
    format: SampleFormat,
    items: usize,
    words: usize,
    strategy: AllocationStrategy,
}

// Mapped memory is exclusively owned by the buffer, like a Vec.
unsafe impl Send for PcmBuffer {}
unsafe impl Sync for PcmBuffer {}

impl PcmBuffer {
    /// Allocate `items` samples, trying `strategies` in order.
    ///
    /// Returns the error of the last strategy if all of them fail.
    pub fn allocate(
        format: SampleFormat,
        items: usize,
        strategies: &[AllocationStrategy],
    ) -> Result<Self, AllocationError> {
        let mut last_error = AllocationError::NoStrategy;
        for &strategy in strategies {
            match Self::try_allocate(format, items, strategy) {
                Ok(buffer) => return Ok(buffer),
                Err(e) => {
                    debug!("PCM allocation via {:?} failed: {}", strategy, e);
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }

    /// Allocate with exactly one strategy
    pub fn try_allocate(
        format: SampleFormat,
        items: usize,
        strategy: AllocationStrategy,
    ) -> Result<Self, AllocationError> {
        let bytes = items
            .checked_mul(format.bytes_per_sample())
            .filter(|b| *b <= isize::MAX as usize)
            .ok_or(AllocationError::Overflow { items, format })?;
        if format == SampleFormat::Unknown {
            return Err(AllocationError::Failed {
                strategy,
                bytes,
                reason: "unknown sample format".to_string(),
            });
        }
        // Never allocate zero bytes; mappings reject it
        let words = bytes.div_ceil(4).max(1);

        let storage = match strategy {
            AllocationStrategy::HugePageMapping => map_anonymous(words, true, strategy)?,
            AllocationStrategy::AnonymousMapping => map_anonymous(words, false, strategy)?,
            AllocationStrategy::LockedHeap => {
                let mut words_vec = heap_words(words, strategy)?;
                lock_heap(&mut words_vec, strategy)?;
                Storage::Heap {
                    words: words_vec,
                    locked: true,
                }
            }
            AllocationStrategy::Heap => Storage::Heap {
                words: heap_words(words, strategy)?,
                locked: false,
            },
        };

        Ok(Self {
            storage,
            format,
            items,
            words,
            strategy,
        })
    }

    /// Number of samples (items) held
    pub fn len(&self) -> usize {
        self.items
    }

    pub fn is_empty(&self) -> bool {
        self.items == 0
    }

    pub fn format(&self) -> SampleFormat {
        self.format
    }

    /// Strategy that provided the memory
    pub fn strategy(&self) -> AllocationStrategy {
        self.strategy
    }

    fn words(&self) -> &[u32] {
        match &self.storage {
            #[cfg(unix)]
            Storage::Mapped { ptr, .. } => unsafe {
                std::slice::from_raw_parts(ptr.as_ptr(), self.words)
            },
            Storage::Heap { words, .. } => words,
        }
    }

    fn words_mut(&mut self) -> &mut [u32] {
        match &mut self.storage {
            #[cfg(unix)]
            Storage::Mapped { ptr, .. } => unsafe {
                std::slice::from_raw_parts_mut(ptr.as_ptr(), self.words)
            },
            Storage::Heap { words, .. } => words,
        }
    }

    /// Typed view of all items
    pub fn as_pcm(&self) -> PcmSlice<'_> {
        let items = self.items;
        let words = self.words();
        match self.format {
            SampleFormat::I16 => PcmSlice::I16(&bytemuck::cast_slice::<u32, i16>(words)[..items]),
            SampleFormat::I32 => PcmSlice::I32(&bytemuck::cast_slice::<u32, i32>(words)[..items]),
            // Unknown is rejected at allocation
            SampleFormat::F32 | SampleFormat::Unknown => {
                PcmSlice::F32(&bytemuck::cast_slice::<u32, f32>(words)[..items])
            }
        }
    }

    /// Mutable typed view of all items
    pub fn as_pcm_mut(&mut self) -> PcmSliceMut<'_> {
        let items = self.items;
        let format = self.format;
        let words = self.words_mut();
        match format {
            SampleFormat::I16 => {
                PcmSliceMut::I16(&mut bytemuck::cast_slice_mut::<u32, i16>(words)[..items])
            }
            SampleFormat::I32 => {
                PcmSliceMut::I32(&mut bytemuck::cast_slice_mut::<u32, i32>(words)[..items])
            }
            SampleFormat::F32 | SampleFormat::Unknown => {
                PcmSliceMut::F32(&mut bytemuck::cast_slice_mut::<u32, f32>(words)[..items])
            }
        }
    }

    fn base_ptr(&mut self) -> *mut u8 {
        self.words_mut().as_mut_ptr() as *mut u8
    }
}

impl Drop for PcmBuffer {
    fn drop(&mut self) {
        match &mut self.storage {
            #[cfg(unix)]
            Storage::Mapped { ptr, map_bytes } => unsafe {
                libc::munmap(ptr.as_ptr() as *mut libc::c_void, *map_bytes);
            },
            #[cfg(unix)]
            Storage::Heap { words, locked: true } => unsafe {
                libc::munlock(words.as_ptr() as *const libc::c_void, words.len() * 4);
            },
            Storage::Heap { .. } => {}
        }
    }
}

impl std::fmt::Debug for PcmBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PcmBuffer")
            .field("format", &self.format)
            .field("items", &self.items)
            .field("strategy", &self.strategy)
            .finish()
    }
}

fn heap_words(words: usize, strategy: AllocationStrategy) -> Result<Vec<u32>, AllocationError> {
    let mut vec: Vec<u32> = Vec::new();
    vec.try_reserve_exact(words)
        .map_err(|e| AllocationError::Failed {
            strategy,
            bytes: words.saturating_mul(4),
            reason: e.to_string(),
        })?;
    vec.resize(words, 0);
    Ok(vec)
}

#[cfg(unix)]
fn lock_heap(words: &mut [u32], strategy: AllocationStrategy) -> Result<(), AllocationError> {
    let bytes = words.len() * 4;
    let rc = unsafe { libc::mlock(words.as_ptr() as *const libc::c_void, bytes) };
    if rc == 0 {
        Ok(())
    } else {
        Err(AllocationError::Failed {
            strategy,
            bytes,
            reason: std::io::Error::last_os_error().to_string(),
        })
    }
}

#[cfg(not(unix))]
fn lock_heap(_words: &mut [u32], strategy: AllocationStrategy) -> Result<(), AllocationError> {
    Err(AllocationError::Unsupported(strategy))
}

#[cfg(unix)]
fn map_anonymous(
    words: usize,
    huge: bool,
    strategy: AllocationStrategy,
) -> Result<Storage, AllocationError> {
    let bytes = words * 4;

    #[cfg(target_os = "linux")]
    let (flags, map_bytes) = if huge {
        (
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_HUGETLB,
            bytes.div_ceil(HUGE_PAGE_BYTES) * HUGE_PAGE_BYTES,
        )
    } else {
        (libc::MAP_PRIVATE | libc::MAP_ANONYMOUS, bytes)
    };

    #[cfg(not(target_os = "linux"))]
    let (flags, map_bytes) = if huge {
        return Err(AllocationError::Unsupported(strategy));
    } else {
        (libc::MAP_PRIVATE | libc::MAP_ANON, bytes)
    };

    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            map_bytes,
            libc::PROT_READ | libc::PROT_WRITE,
            flags,
            -1,
            0,
        )
    };

    if ptr == libc::MAP_FAILED {
        return Err(AllocationError::Failed {
            strategy,
            bytes: map_bytes,
            reason: std::io::Error::last_os_error().to_string(),
        });
    }

    // Anonymous mappings are zero-filled, which is silence for every format
    std::ptr::NonNull::new(ptr as *mut u32)
        .map(|ptr| Storage::Mapped { ptr, map_bytes })
        .ok_or(AllocationError::Failed {
            strategy,
            bytes: map_bytes,
            reason: "mmap returned null".to_string(),
        })
}

#[cfg(not(unix))]
fn map_anonymous(
    _words: usize,
    _huge: bool,
    strategy: AllocationStrategy,
) -> Result<Storage, AllocationError> {
    Err(AllocationError::Unsupported(strategy))
}

/// A PCM buffer filled front to back by one writer while readers see the
/// published prefix.
pub struct SharedPcm {
    /// Owner of the memory; not touched again until drop
    _buffer: PcmBuffer,
    base: *mut u8,
    format: SampleFormat,
    items: usize,
    published: AtomicUsize,
}

// Readers only touch [0, published) and the single PcmWriter only touches
// [published, items); published only grows, with Release/Acquire ordering.
unsafe impl Send for SharedPcm {}
unsafe impl Sync for SharedPcm {}

impl SharedPcm {
    /// Wrap a buffer, returning the shared reader side and its only writer
    pub fn new(mut buffer: PcmBuffer) -> (Arc<SharedPcm>, PcmWriter) {
        let base = buffer.base_ptr();
        let shared = Arc::new(SharedPcm {
            format: buffer.format(),
            items: buffer.len(),
            _buffer: buffer,
            base,
            published: AtomicUsize::new(0),
        });
        let writer = PcmWriter {
            shared: Arc::clone(&shared),
        };
        (shared, writer)
    }

    /// Total capacity in items
    pub fn len(&self) -> usize {
        self.items
    }

    pub fn is_empty(&self) -> bool {
        self.items == 0
    }

    /// Items published so far
    pub fn published(&self) -> usize {
        self.published.load(Ordering::Acquire)
    }

    pub fn is_complete(&self) -> bool {
        self.published() >= self.items
    }

    /// The published prefix
    pub fn rendered(&self) -> PcmSlice<'_> {
        let len = self.published();
        unsafe { typed_slice(self.base, self.format, 0, len) }
    }
}

impl std::fmt::Debug for SharedPcm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedPcm")
            .field("format", &self.format)
            .field("items", &self.items)
            .field("published", &self.published())
            .finish()
    }
}

/// The single writer of a [`SharedPcm`]
pub struct PcmWriter {
    shared: Arc<SharedPcm>,
}

impl PcmWriter {
    /// Items not yet published
    pub fn remaining(&self) -> usize {
        self.shared.items - self.shared.published.load(Ordering::Relaxed)
    }

    /// Writable region of up to `items` samples directly after the published prefix
    pub fn next_region(&mut self, items: usize) -> PcmSliceMut<'_> {
        let start = self.shared.published.load(Ordering::Relaxed);
        let len = items.min(self.shared.items - start);
        unsafe { typed_slice_mut(self.shared.base, self.shared.format, start, len) }
    }

    /// Hand `items` more samples to readers
    pub fn publish(&mut self, items: usize) {
        let items = items.min(self.remaining());
        self.shared.published.fetch_add(items, Ordering::Release);
    }
}

unsafe fn typed_slice<'a>(base: *mut u8, format: SampleFormat, start: usize, len: usize) -> PcmSlice<'a> {
    match format {
        SampleFormat::I16 => PcmSlice::I16(std::slice::from_raw_parts((base as *const i16).add(start), len)),
        SampleFormat::I32 => PcmSlice::I32(std::slice::from_raw_parts((base as *const i32).add(start), len)),
        SampleFormat::F32 | SampleFormat::Unknown => {
            PcmSlice::F32(std::slice::from_raw_parts((base as *const f32).add(start), len))
        }
    }
}

unsafe fn typed_slice_mut<'a>(
    base: *mut u8,
    format: SampleFormat,
    start: usize,
    len: usize,
) -> PcmSliceMut<'a> {
    match format {
        SampleFormat::I16 => PcmSliceMut::I16(std::slice::from_raw_parts_mut((base as *mut i16).add(start), len)),
        SampleFormat::I32 => PcmSliceMut::I32(std::slice::from_raw_parts_mut((base as *mut i32).add(start), len)),
        SampleFormat::F32 | SampleFormat::Unknown => {
            PcmSliceMut::F32(std::slice::from_raw_parts_mut((base as *mut f32).add(start), len))
        }
    }
}
