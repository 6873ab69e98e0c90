//! Buffer allocation for swapchains.

use std::cell::Cell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use smithay::backend::allocator::{Fourcc, Modifier};
use smithay::utils::{Physical, Size};

/// Formats a layer or buffer consumer accepts, each with its allowed modifiers.
pub type FormatSet = HashMap<Fourcc, Vec<Modifier>>;

static BUFFER_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(u64);

impl BufferId {
    fn next() -> Self {
        Self(BUFFER_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    #[cfg(test)]
    pub fn for_tests(id: u64) -> Self {
        Self(id)
    }
}

/// Layout facts about a pixel format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatInfo {
    /// Bytes per pixel of the first plane.
    pub bytes_per_pixel: usize,
    pub planes: usize,
    pub has_alpha: bool,
    pub floating_point: bool,
}

/// Returns layout information for formats the compositor can handle.
pub fn format_info(format: Fourcc) -> Option<FormatInfo> {
    let packed = |bytes_per_pixel, has_alpha| FormatInfo {
        bytes_per_pixel,
        planes: 1,
        has_alpha,
        floating_point: false,
    };

    let info = match format {
        Fourcc::Argb8888 | Fourcc::Abgr8888 => packed(4, true),
        Fourcc::Xrgb8888 | Fourcc::Xbgr8888 => packed(4, false),
        Fourcc::Argb2101010 | Fourcc::Abgr2101010 => packed(4, true),
        Fourcc::Xrgb2101010 | Fourcc::Xbgr2101010 => packed(4, false),
        Fourcc::Rgb565 => packed(2, false),
        Fourcc::Abgr16161616f => FormatInfo {
            floating_point: true,
            ..packed(8, true)
        },
        Fourcc::Nv12 => FormatInfo {
            planes: 2,
            ..packed(1, false)
        },
        _ => return None,
    };
    Some(info)
}

/// One plane of a DMA-BUF.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmabufPlane {
    /// Opaque handle of the kernel object backing this plane.
    pub handle: u64,
    pub offset: u32,
    pub stride: u32,
}

pub enum BufferStorage {
    /// CPU-visible pixels.
    Memory { data: Vec<u8>, stride: usize },
    /// Device memory described by its planes; contents are not CPU-visible.
    Dmabuf { planes: Vec<DmabufPlane> },
}

/// A graphics buffer.
pub struct Buffer {
    id: BufferId,
    size: Size<i32, Physical>,
    format: Fourcc,
    modifier: Modifier,
    storage: BufferStorage,
    _allocation: Option<Allocation>,
}

impl Buffer {
    /// Wraps a client-provided DMA-BUF.
    pub fn dmabuf(
        size: Size<i32, Physical>,
        format: Fourcc,
        modifier: Modifier,
        planes: Vec<DmabufPlane>,
    ) -> Self {
        Self {
            id: BufferId::next(),
            size,
            format,
            modifier,
            storage: BufferStorage::Dmabuf { planes },
            _allocation: None,
        }
    }

    /// Wraps client-provided shared memory pixels.
    pub fn memory(size: Size<i32, Physical>, format: Fourcc, data: Vec<u8>, stride: usize) -> Self {
        Self {
            id: BufferId::next(),
            size,
            format,
            modifier: Modifier::Linear,
            storage: BufferStorage::Memory { data, stride },
            _allocation: None,
        }
    }

    pub fn id(&self) -> BufferId {
        self.id
    }

    pub fn size(&self) -> Size<i32, Physical> {
        self.size
    }

    pub fn format(&self) -> Fourcc {
        self.format
    }

    pub fn modifier(&self) -> Modifier {
        self.modifier
    }

    pub fn storage(&self) -> &BufferStorage {
        &self.storage
    }

    pub fn is_dmabuf(&self) -> bool {
        matches!(self.storage, BufferStorage::Dmabuf { .. })
    }

    /// Returns the CPU-visible pixels and their stride.
    pub fn pixels(&self) -> Option<(&[u8], usize)> {
        match &self.storage {
            BufferStorage::Memory { data, stride } => Some((data, *stride)),
            BufferStorage::Dmabuf { .. } => None,
        }
    }

    pub fn pixels_mut(&mut self) -> Option<(&mut [u8], usize)> {
        match &mut self.storage {
            BufferStorage::Memory { data, stride } => Some((data, *stride)),
            BufferStorage::Dmabuf { .. } => None,
        }
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.storage {
            BufferStorage::Memory { .. } => "memory",
            BufferStorage::Dmabuf { .. } => "dmabuf",
        };
        f.debug_struct("Buffer")
            .field("id", &self.id)
            .field("size", &self.size)
            .field("format", &self.format)
            .field("modifier", &self.modifier)
            .field("storage", &kind)
            .finish()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AllocationError {
    #[error("invalid buffer size {0}x{1}")]
    InvalidSize(i32, i32),
    #[error("unsupported format {0:?}")]
    UnsupportedFormat(Fourcc),
    #[error("none of the modifiers {0:?} can be allocated")]
    UnsupportedModifiers(Vec<Modifier>),
    #[error("out of memory: requested {requested} bytes with {available} available")]
    OutOfMemory { requested: usize, available: usize },
}

/// Produces buffers for swapchain slots.
pub trait Allocator {
    fn create_buffer(
        &mut self,
        size: Size<i32, Physical>,
        format: Fourcc,
        modifiers: &[Modifier],
    ) -> Result<Buffer, AllocationError>;
}

/// Bytes held by a live buffer, returned to the allocator's budget on drop.
struct Allocation {
    bytes: usize,
    in_use: Rc<Cell<usize>>,
}

impl Drop for Allocation {
    fn drop(&mut self) {
        self.in_use.set(self.in_use.get().saturating_sub(self.bytes));
    }
}

/// Allocates linear buffers in system memory.
///
/// Clones share one budget and one usage counter.
#[derive(Debug, Clone)]
pub struct MemoryAllocator {
    budget: Option<usize>,
    in_use: Rc<Cell<usize>>,
}

impl MemoryAllocator {
    pub fn new() -> Self {
        Self {
            budget: None,
            in_use: Rc::new(Cell::new(0)),
        }
    }

    /// Limits the total number of bytes alive at once.
    pub fn with_budget(budget: usize) -> Self {
        Self {
            budget: Some(budget),
            ..Self::new()
        }
    }

    /// Bytes held by buffers that are still alive.
    pub fn bytes_in_use(&self) -> usize {
        self.in_use.get()
    }
}

impl Allocator for MemoryAllocator {
    fn create_buffer(
        &mut self,
        size: Size<i32, Physical>,
        format: Fourcc,
        modifiers: &[Modifier],
    ) -> Result<Buffer, AllocationError> {
        let _span = tracy_client::span!("MemoryAllocator::create_buffer");

        if size.w <= 0 || size.h <= 0 {
            return Err(AllocationError::InvalidSize(size.w, size.h));
        }

        let info = format_info(format).ok_or(AllocationError::UnsupportedFormat(format))?;
        if info.planes != 1 {
            return Err(AllocationError::UnsupportedFormat(format));
        }

        let linear_ok = modifiers.is_empty()
            || modifiers
                .iter()
                .any(|m| matches!(m, Modifier::Linear | Modifier::Invalid));
        if !linear_ok {
            return Err(AllocationError::UnsupportedModifiers(modifiers.to_vec()));
        }

        let stride = size.w as usize * info.bytes_per_pixel;
        let bytes = stride * size.h as usize;
        if let Some(budget) = self.budget {
            let available = budget.saturating_sub(self.in_use.get());
            if bytes > available {
                return Err(AllocationError::OutOfMemory {
                    requested: bytes,
                    available,
                });
            }
        }

        self.in_use.set(self.in_use.get() + bytes);
        Ok(Buffer {
            id: BufferId::next(),
            size,
            format,
            modifier: Modifier::Linear,
            storage: BufferStorage::Memory {
                data: vec![0; bytes],
                stride,
            },
            _allocation: Some(Allocation {
                bytes,
                in_use: self.in_use.clone(),
            }),
        })
    }
}
