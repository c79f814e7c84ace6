//! Renderable entities: whole source pages and user-defined crop boxes

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use super::types::{PixelFormat, SourceSpec};

/// Smallest scale a box may be placed at on its destination page
pub const MIN_DEST_SCALE: f64 = 0.1;

static NEXT_BOX_ID: AtomicU64 = AtomicU64::new(1);

/// Rectangle in source page space (PDF points)
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SourceRect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl SourceRect {
    #[must_use]
    pub const fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.width <= 0.0 || self.height <= 0.0
    }
}

/// Where a box lands on the composed output
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Placement {
    pub page: usize,
    pub x: f64,
    pub y: f64,
    pub scale: f64,
}

impl Default for Placement {
    fn default() -> Self {
        Self {
            page: 0,
            x: 0.0,
            y: 0.0,
            scale: 1.0,
        }
    }
}

/// Mutable geometry behind a [`BoxHandle`]
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BoxGeometry {
    /// Source page index
    pub page: usize,
    /// Region cut out of the source page
    pub rect: SourceRect,
    /// Destination placement
    pub dest: Placement,
    /// Layout colour flag, carried for the editing layer
    pub colored: bool,
}

impl Default for BoxGeometry {
    fn default() -> Self {
        Self {
            page: 0,
            rect: SourceRect::new(0.0, 0.0, 100.0, 100.0),
            dest: Placement::default(),
            colored: false,
        }
    }
}

impl BoxGeometry {
    #[must_use]
    pub fn new(page: usize, rect: SourceRect) -> Self {
        Self {
            page,
            rect,
            ..Self::default()
        }
    }

    fn clamp(&mut self) {
        if !(self.dest.scale >= MIN_DEST_SCALE) {
            self.dest.scale = MIN_DEST_SCALE;
        }
    }
}

/// A whole source page
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PageEntity(pub usize);

struct BoxShared {
    id: u64,
    geometry: RwLock<BoxGeometry>,
}

/// Shared handle to a crop box.
///
/// Clones refer to the same box. Equality and hashing use the box identity,
/// never its geometry, so moving or resizing a box keeps it the same cache
/// and queue key.
#[derive(Clone)]
pub struct BoxHandle {
    inner: Arc<BoxShared>,
}

impl BoxHandle {
    #[must_use]
    pub fn new(geometry: BoxGeometry) -> Self {
        let mut geometry = geometry;
        geometry.clamp();
        Self {
            inner: Arc::new(BoxShared {
                id: NEXT_BOX_ID.fetch_add(1, Ordering::Relaxed),
                geometry: RwLock::new(geometry),
            }),
        }
    }

    /// Process-unique identity of this box
    #[must_use]
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Snapshot of the current geometry
    #[must_use]
    pub fn geometry(&self) -> BoxGeometry {
        *self
            .inner
            .geometry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Mutate the geometry in place; the destination scale is clamped after
    pub fn update<F>(&self, edit: F)
    where
        F: FnOnce(&mut BoxGeometry),
    {
        let mut geometry = self
            .inner
            .geometry
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        edit(&mut geometry);
        geometry.clamp();
    }

    pub fn set_source(&self, page: usize, rect: SourceRect) {
        self.update(|g| {
            g.page = page;
            g.rect = rect;
        });
    }

    pub fn set_placement(&self, dest: Placement) {
        self.update(|g| g.dest = dest);
    }
}

impl PartialEq for BoxHandle {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for BoxHandle {}

impl Hash for BoxHandle {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.id.hash(state);
    }
}

impl fmt::Debug for BoxHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoxHandle")
            .field("id", &self.inner.id)
            .field("geometry", &self.geometry())
            .finish()
    }
}

/// Anything the render core can produce a bitmap for
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Entity {
    Page(PageEntity),
    Box(BoxHandle),
}

impl Entity {
    #[must_use]
    pub fn page(index: usize) -> Self {
        Self::Page(PageEntity(index))
    }

    /// Live source fields that decide whether a bitmap still depicts this
    /// entity
    #[must_use]
    pub fn source(&self) -> SourceSpec {
        match self {
            Self::Page(PageEntity(page)) => SourceSpec {
                page: *page,
                rect: None,
            },
            Self::Box(handle) => {
                let geometry = handle.geometry();
                SourceSpec {
                    page: geometry.page,
                    rect: Some(geometry.rect),
                }
            }
        }
    }

    /// Pages are opaque backgrounds; boxes are clipped onto other content
    #[must_use]
    pub fn pixel_format(&self) -> PixelFormat {
        match self {
            Self::Page(_) => PixelFormat::Rgb,
            Self::Box(_) => PixelFormat::Rgba,
        }
    }
}

impl From<PageEntity> for Entity {
    fn from(page: PageEntity) -> Self {
        Self::Page(page)
    }
}

impl From<BoxHandle> for Entity {
    fn from(handle: BoxHandle) -> Self {
        Self::Box(handle)
    }
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Page(PageEntity(page)) => write!(f, "page {page}"),
            Self::Box(handle) => write!(f, "box #{}", handle.id()),
        }
    }
}
