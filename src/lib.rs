pub mod panic_handler;
pub mod render;
pub mod settings;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use render::{
    Entity, Lookup, Offset, PageRenderer, RenderConfig, RenderError, RenderService, WorkerMode,
};
#[cfg(feature = "pdf")]
pub use render::MupdfRenderer;
