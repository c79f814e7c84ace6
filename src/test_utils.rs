pub mod test_helpers {
    use std::collections::HashSet;
    use std::sync::{Arc, Mutex, PoisonError};
    use std::time::Duration;

    use flume::{Receiver, Sender};

    use crate::render::{
        Bitmap, PageRenderer, RenderError, RenderTarget, SourceRect, checked_output_size,
    };

    /// US Letter in PDF points
    pub const LETTER: (f64, f64) = (612.0, 792.0);

    /// Targets a [`FakeRenderer`] has been asked to render, shared with the test
    #[derive(Clone, Default)]
    pub struct RenderLog {
        targets: Arc<Mutex<Vec<RenderTarget>>>,
    }

    impl RenderLog {
        pub fn targets(&self) -> Vec<RenderTarget> {
            self.targets
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
        }

        pub fn len(&self) -> usize {
            self.targets
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .len()
        }

        pub fn is_empty(&self) -> bool {
            self.len() == 0
        }

        fn push(&self, target: RenderTarget) {
            self.targets
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(target);
        }
    }

    /// Holds every render until the test releases it
    pub struct Gate {
        tx: Sender<()>,
    }

    impl Gate {
        /// Let one pending render through
        pub fn release(&self) {
            let _ = self.tx.send(());
        }

        pub fn release_many(&self, count: usize) {
            for _ in 0..count {
                self.release();
            }
        }
    }

    /// In-memory stand-in for the PDF engine.
    ///
    /// Every pixel byte of a rendered bitmap is the source page index, so
    /// tests can tell which page a bitmap came from.
    pub struct FakeRenderer {
        page_count: usize,
        page_size: (f64, f64),
        failing_pages: HashSet<usize>,
        max_scale: Option<f64>,
        delay: Option<Duration>,
        gate: Option<Receiver<()>>,
        log: RenderLog,
    }

    impl FakeRenderer {
        pub fn new(page_count: usize) -> Self {
            Self {
                page_count,
                page_size: LETTER,
                failing_pages: HashSet::new(),
                max_scale: None,
                delay: None,
                gate: None,
                log: RenderLog::default(),
            }
        }

        /// Fail every render of `page` with a logical error
        pub fn failing_page(mut self, page: usize) -> Self {
            self.failing_pages.insert(page);
            self
        }

        /// Report allocation failure for any scale above `scale`
        pub fn max_scale(mut self, scale: f64) -> Self {
            self.max_scale = Some(scale);
            self
        }

        /// Sleep this long inside every render
        pub fn delay(mut self, delay: Duration) -> Self {
            self.delay = Some(delay);
            self
        }

        /// Block every render until the returned gate is released
        pub fn gated(mut self) -> (Self, Gate) {
            let (tx, rx) = flume::unbounded();
            self.gate = Some(rx);
            (self, Gate { tx })
        }

        pub fn log(&self) -> RenderLog {
            self.log.clone()
        }
    }

    impl PageRenderer for FakeRenderer {
        fn page_count(&self) -> usize {
            self.page_count
        }

        fn render(&mut self, target: &RenderTarget) -> Result<Bitmap, RenderError> {
            self.log.push(*target);

            if let Some(gate) = &self.gate {
                // A dropped gate lets everything through
                let _ = gate.recv();
            }
            if let Some(delay) = self.delay {
                std::thread::sleep(delay);
            }

            if target.page >= self.page_count {
                return Err(RenderError::InvalidPage {
                    page: target.page,
                    page_count: self.page_count,
                });
            }
            if self.failing_pages.contains(&target.page) {
                return Err(RenderError::generic(format!(
                    "page {} is damaged",
                    target.page
                )));
            }

            let region = target
                .region
                .unwrap_or(SourceRect::new(0.0, 0.0, self.page_size.0, self.page_size.1));
            let (width, height) = checked_output_size(region.width, region.height, target.scale)?;
            if self.max_scale.is_some_and(|max| target.scale > max) {
                return Err(RenderError::OutOfMemory { width, height });
            }

            let mut bitmap = Bitmap::blank(target.format, width, height)?;
            bitmap.pixels_mut().fill(target.page as u8);
            Ok(bitmap)
        }
    }
}
