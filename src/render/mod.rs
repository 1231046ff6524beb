//! Render Surface Bridge
//!
//! Ties a GPU context bound to the swap-chain to the [`DisplayManager`]:
//! draw, swap, lock the freshly swapped buffer and present it.

#[cfg(feature = "kms")]
pub mod egl;

use std::os::fd::RawFd;
use tracing::warn;

use crate::display::{DisplayManager, PresentOutcome, PresentStats, ScanoutDevice};
use crate::error::DisplayError;

/// GPU side of the swap-chain
pub trait GpuSurface<D: ScanoutDevice> {
    /// Make the context current and reset the frame
    fn begin_frame(&mut self, width: u32, height: u32);

    /// Flush rendering and swap the back buffer to the front
    fn swap(&mut self) -> Result<(), DisplayError>;

    /// Lock the buffer the last swap produced
    fn acquire(&mut self, device: &mut D) -> Result<D::Buffer, DisplayError>;
}

/// What the dispatcher needs from an initialised display
pub trait DisplaySink {
    /// Descriptor signalled on flip completion
    fn raw_fd(&self) -> RawFd;

    /// Handle flip-completion events
    fn on_readable(&mut self);

    /// Draw one frame through `draw(width, height)` and present it
    fn submit_frame(&mut self, draw: &mut dyn FnMut(u32, u32)) -> Result<PresentOutcome, DisplayError>;

    fn stats(&self) -> PresentStats;
}

/// GPU surface + display manager pair
pub struct RenderBridge<D: ScanoutDevice, S: GpuSurface<D>> {
    // declared first: the GPU surface must go before the swap-chain it renders into
    surface: S,
    manager: DisplayManager<D>,
}

impl<D: ScanoutDevice, S: GpuSurface<D>> RenderBridge<D, S> {
    pub fn new(manager: DisplayManager<D>, surface: S) -> Self {
        Self { surface, manager }
    }

    pub fn manager(&self) -> &DisplayManager<D> {
        &self.manager
    }

    pub fn surface(&self) -> &S {
        &self.surface
    }
}

impl<D: ScanoutDevice, S: GpuSurface<D>> DisplaySink for RenderBridge<D, S> {
    fn raw_fd(&self) -> RawFd {
        self.manager.device().raw_fd()
    }

    fn on_readable(&mut self) {
        if let Err(e) = self.manager.dispatch_events() {
            warn!("Failed to read display events: {}", e);
        }
    }

    fn submit_frame(&mut self, draw: &mut dyn FnMut(u32, u32)) -> Result<PresentOutcome, DisplayError> {
        let mode = self.manager.output().mode;
        let (width, height) = (u32::from(mode.width), u32::from(mode.height));

        self.surface.begin_frame(width, height);
        draw(width, height);
        self.surface.swap()?;

        let buffer = self.surface.acquire(self.manager.device_mut())?;
        self.manager.present(buffer)
    }

    fn stats(&self) -> PresentStats {
        self.manager.stats()
    }
}
