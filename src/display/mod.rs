//! Display Buffer Manager
//!
//! Owns the scan-out swap-chain and its flip state machine. A rendered
//! buffer enters through [`DisplayManager::present`] and moves through
//! `Rendering -> PendingFlip -> OnScreen -> RetiredAwaitingRelease`; at most
//! one flip is ever in flight, and a retired buffer is only handed back to
//! the device after the flip that replaced it has completed.
//!
//! The hardware is reached through [`ScanoutDevice`], implemented for
//! DRM/KMS + GBM in [`kms`] (feature `kms`).

pub mod output;

#[cfg(feature = "kms")]
pub mod kms;

use std::os::fd::RawFd;
use tracing::{debug, info, warn};

use crate::error::DisplayError;
pub use output::{select_output, ConnectorInfo, ModeInfo, ModePreference, OutputConfig};

/// Kernel framebuffer object id
pub type FramebufferId = u32;

/// Lifecycle of a swap-chain buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferState {
    /// Rendered, not yet handed to the display
    Rendering,
    /// Flip requested, completion not yet seen
    PendingFlip,
    OnScreen,
    /// Replaced by a pending flip; released once that flip completes
    RetiredAwaitingRelease,
}

/// Size and layout of a hardware buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferGeometry {
    pub width: u32,
    pub height: u32,
    pub stride: u32,
}

/// Proof that the device reported a completed flip.
///
/// Only a [`ScanoutDevice`] reading its event queue creates one, and
/// [`DisplayManager::on_flip_complete`] consumes it; retired buffers cannot
/// be released any other way.
#[derive(Debug)]
pub struct FlipComplete {
    sequence: u32,
}

impl FlipComplete {
    pub(crate) fn confirmed(sequence: u32) -> Self {
        Self { sequence }
    }

    /// Vblank sequence the flip landed on
    pub fn sequence(&self) -> u32 {
        self.sequence
    }
}

/// Hardware scan-out backend
pub trait ScanoutDevice {
    /// A locked swap-chain buffer
    type Buffer;

    fn geometry(&self, buffer: &Self::Buffer) -> BufferGeometry;

    /// Wrap a buffer in a kernel framebuffer
    fn add_framebuffer(&mut self, buffer: &Self::Buffer) -> Result<FramebufferId, DisplayError>;

    fn remove_framebuffer(&mut self, framebuffer: FramebufferId);

    /// Hand a buffer back to the swap-chain
    fn release_buffer(&mut self, buffer: Self::Buffer);

    /// Synchronous modeset showing `framebuffer`
    fn set_crtc(&mut self, output: &OutputConfig, framebuffer: FramebufferId) -> Result<(), DisplayError>;

    /// Asynchronous flip; completion arrives through [`ScanoutDevice::read_events`]
    fn page_flip(&mut self, output: &OutputConfig, framebuffer: FramebufferId) -> Result<(), DisplayError>;

    /// Drain completion events from the device descriptor
    fn read_events(&mut self) -> Result<Vec<FlipComplete>, DisplayError>;

    /// Descriptor that becomes readable when events are queued
    fn raw_fd(&self) -> RawFd;
}

/// A swap-chain buffer owned by the manager
#[derive(Debug)]
pub struct ScanoutBuffer<B> {
    handle: B,
    geometry: BufferGeometry,
    framebuffer: FramebufferId,
    state: BufferState,
}

impl<B> ScanoutBuffer<B> {
    pub fn geometry(&self) -> BufferGeometry {
        self.geometry
    }

    pub fn framebuffer(&self) -> FramebufferId {
        self.framebuffer
    }

    pub fn state(&self) -> BufferState {
        self.state
    }
}

/// What `present` did with the buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentOutcome {
    /// First frame: shown through an immediate modeset
    Modeset,
    /// Flip queued, buffer is PendingFlip
    FlipQueued,
    /// A flip was already in flight; the buffer was released unused
    Dropped,
}

/// Frame counters, logged periodically by the dispatcher
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PresentStats {
    pub presented: u64,
    pub flipped: u64,
    pub dropped: u64,
}

/// Scan-out state machine over a [`ScanoutDevice`]
pub struct DisplayManager<D: ScanoutDevice> {
    device: D,
    output: OutputConfig,
    on_screen: Option<ScanoutBuffer<D::Buffer>>,
    pending: Option<ScanoutBuffer<D::Buffer>>,
    retired: Option<ScanoutBuffer<D::Buffer>>,
    stats: PresentStats,
}

impl<D: ScanoutDevice> DisplayManager<D> {
    /// Take ownership of an initialised device and its chosen output
    pub fn new(device: D, output: OutputConfig) -> Self {
        info!(
            "Display: {}x{}@{} crtc={} connector={}",
            output.mode.width, output.mode.height, output.mode.refresh, output.crtc_id, output.connector_id
        );
        Self {
            device,
            output,
            on_screen: None,
            pending: None,
            retired: None,
            stats: PresentStats::default(),
        }
    }

    pub fn output(&self) -> &OutputConfig {
        &self.output
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    pub fn stats(&self) -> PresentStats {
        self.stats
    }

    pub fn is_flip_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// States of every buffer currently held
    pub fn buffer_states(&self) -> Vec<BufferState> {
        [&self.on_screen, &self.pending, &self.retired]
            .into_iter()
            .flatten()
            .map(ScanoutBuffer::state)
            .collect()
    }

    /// Submit a rendered buffer for scan-out.
    ///
    /// On error the manager's state is unchanged and the buffer has been
    /// returned to the device; the caller retries with the next frame.
    pub fn present(&mut self, handle: D::Buffer) -> Result<PresentOutcome, DisplayError> {
        let geometry = self.device.geometry(&handle);
        let framebuffer = match self.device.add_framebuffer(&handle) {
            Ok(fb) => fb,
            Err(e) => {
                self.device.release_buffer(handle);
                return Err(e);
            }
        };
        let mut buffer = ScanoutBuffer {
            handle,
            geometry,
            framebuffer,
            state: BufferState::Rendering,
        };
        self.stats.presented += 1;

        if self.on_screen.is_none() && self.pending.is_none() {
            if let Err(e) = self.device.set_crtc(&self.output, framebuffer) {
                self.discard(buffer);
                return Err(e);
            }
            debug!("Modeset with framebuffer {}", framebuffer);
            buffer.state = BufferState::OnScreen;
            self.on_screen = Some(buffer);
            return Ok(PresentOutcome::Modeset);
        }

        if self.pending.is_some() {
            debug!("Flip still pending, dropping framebuffer {}", framebuffer);
            self.stats.dropped += 1;
            self.discard(buffer);
            return Ok(PresentOutcome::Dropped);
        }

        if let Err(e) = self.device.page_flip(&self.output, framebuffer) {
            self.discard(buffer);
            return Err(e);
        }

        buffer.state = BufferState::PendingFlip;
        self.pending = Some(buffer);
        if let Some(mut previous) = self.on_screen.take() {
            previous.state = BufferState::RetiredAwaitingRelease;
            self.retired = Some(previous);
        }
        Ok(PresentOutcome::FlipQueued)
    }

    /// Promote the pending buffer and release the one it replaced
    pub fn on_flip_complete(&mut self, event: FlipComplete) {
        let Some(mut delivered) = self.pending.take() else {
            debug!("Flip event {} with nothing pending", event.sequence());
            return;
        };

        delivered.state = BufferState::OnScreen;
        self.on_screen = Some(delivered);
        self.stats.flipped += 1;

        if let Some(retired) = self.retired.take() {
            self.discard(retired);
        }
    }

    /// Read and apply every queued completion event
    pub fn dispatch_events(&mut self) -> Result<usize, DisplayError> {
        let events = self.device.read_events()?;
        let count = events.len();
        for event in events {
            self.on_flip_complete(event);
        }
        Ok(count)
    }

    fn discard(&mut self, buffer: ScanoutBuffer<D::Buffer>) {
        self.device.remove_framebuffer(buffer.framebuffer);
        self.device.release_buffer(buffer.handle);
    }
}

impl<D: ScanoutDevice> Drop for DisplayManager<D> {
    fn drop(&mut self) {
        if self.pending.is_some() {
            warn!("Releasing display with a flip in flight");
        }
        for buffer in [self.retired.take(), self.pending.take(), self.on_screen.take()]
            .into_iter()
            .flatten()
        {
            self.discard(buffer);
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    /// What the fake device saw, shared with the test body
    #[derive(Debug, Default)]
    pub(crate) struct DeviceLog {
        pub next_fb: FramebufferId,
        pub live_framebuffers: Vec<FramebufferId>,
        pub released: Vec<u32>,
        pub modesets: Vec<FramebufferId>,
        pub flips: Vec<FramebufferId>,
        pub queued_events: u32,
        pub fail_flip: bool,
        pub fail_framebuffer: bool,
    }

    /// Buffers are plain serial numbers
    pub(crate) struct FakeDevice {
        pub log: Rc<RefCell<DeviceLog>>,
    }

    impl FakeDevice {
        pub(crate) fn new() -> (Self, Rc<RefCell<DeviceLog>>) {
            let log = Rc::new(RefCell::new(DeviceLog { next_fb: 100, ..Default::default() }));
            (Self { log: log.clone() }, log)
        }
    }

    impl ScanoutDevice for FakeDevice {
        type Buffer = u32;

        fn geometry(&self, _buffer: &u32) -> BufferGeometry {
            BufferGeometry { width: 1920, height: 1080, stride: 7680 }
        }

        fn add_framebuffer(&mut self, _buffer: &u32) -> Result<FramebufferId, DisplayError> {
            let mut log = self.log.borrow_mut();
            if log.fail_framebuffer {
                return Err(DisplayError::Framebuffer("fake".into()));
            }
            log.next_fb += 1;
            let fb = log.next_fb;
            log.live_framebuffers.push(fb);
            Ok(fb)
        }

        fn remove_framebuffer(&mut self, framebuffer: FramebufferId) {
            self.log.borrow_mut().live_framebuffers.retain(|&fb| fb != framebuffer);
        }

        fn release_buffer(&mut self, buffer: u32) {
            self.log.borrow_mut().released.push(buffer);
        }

        fn set_crtc(&mut self, _output: &OutputConfig, framebuffer: FramebufferId) -> Result<(), DisplayError> {
            self.log.borrow_mut().modesets.push(framebuffer);
            Ok(())
        }

        fn page_flip(&mut self, _output: &OutputConfig, framebuffer: FramebufferId) -> Result<(), DisplayError> {
            let mut log = self.log.borrow_mut();
            if log.fail_flip {
                return Err(DisplayError::PageFlip("busy".into()));
            }
            log.flips.push(framebuffer);
            log.queued_events += 1;
            Ok(())
        }

        fn read_events(&mut self) -> Result<Vec<FlipComplete>, DisplayError> {
            let mut log = self.log.borrow_mut();
            let events = (0..log.queued_events).map(FlipComplete::confirmed).collect();
            log.queued_events = 0;
            Ok(events)
        }

        fn raw_fd(&self) -> RawFd {
            -1
        }
    }

    pub(crate) fn test_output() -> OutputConfig {
        OutputConfig {
            connector_id: 1,
            crtc_id: 2,
            mode: ModeInfo { width: 1920, height: 1080, refresh: 60 },
            mode_index: 0,
        }
    }

    fn pending_count(manager: &DisplayManager<FakeDevice>) -> usize {
        manager
            .buffer_states()
            .into_iter()
            .filter(|s| *s == BufferState::PendingFlip)
            .count()
    }

    #[test]
    fn test_first_frame_modesets() {
        let (device, log) = FakeDevice::new();
        let mut manager = DisplayManager::new(device, test_output());

        assert_eq!(manager.present(1).unwrap(), PresentOutcome::Modeset);
        assert_eq!(manager.buffer_states(), vec![BufferState::OnScreen]);
        assert_eq!(log.borrow().modesets.len(), 1);
        assert!(log.borrow().flips.is_empty());
    }

    #[test]
    fn test_flip_then_drop_while_pending() {
        let (device, log) = FakeDevice::new();
        let mut manager = DisplayManager::new(device, test_output());

        manager.present(1).unwrap();
        assert_eq!(manager.present(2).unwrap(), PresentOutcome::FlipQueued);
        assert_eq!(
            manager.buffer_states(),
            vec![BufferState::PendingFlip, BufferState::RetiredAwaitingRelease]
        );

        assert_eq!(manager.present(3).unwrap(), PresentOutcome::Dropped);
        assert_eq!(log.borrow().released, vec![3]);
        assert_eq!(manager.stats().dropped, 1);
        // only buffers 1 and 2 still hold framebuffers
        assert_eq!(log.borrow().live_framebuffers.len(), 2);
    }

    #[test]
    fn test_retired_buffer_released_only_after_flip_completes() {
        let (device, log) = FakeDevice::new();
        let mut manager = DisplayManager::new(device, test_output());

        manager.present(1).unwrap();
        manager.present(2).unwrap();
        assert!(log.borrow().released.is_empty());

        assert_eq!(manager.dispatch_events().unwrap(), 1);
        assert_eq!(log.borrow().released, vec![1]);
        assert_eq!(manager.buffer_states(), vec![BufferState::OnScreen]);
        assert!(!manager.is_flip_pending());

        assert_eq!(manager.present(3).unwrap(), PresentOutcome::FlipQueued);
        manager.dispatch_events().unwrap();
        assert_eq!(log.borrow().released, vec![1, 2]);
    }

    #[test]
    fn test_at_most_one_pending_for_any_sequence() {
        let (device, _log) = FakeDevice::new();
        let mut manager = DisplayManager::new(device, test_output());

        // present-heavy pattern with sporadic completions
        for n in 0..200u32 {
            manager.present(n).unwrap();
            assert!(pending_count(&manager) <= 1);
            if n % 3 == 0 || n % 7 == 0 {
                manager.dispatch_events().unwrap();
                assert_eq!(pending_count(&manager), 0);
            }
        }
    }

    #[test]
    fn test_failed_flip_leaves_state_unchanged() {
        let (device, log) = FakeDevice::new();
        let mut manager = DisplayManager::new(device, test_output());

        manager.present(1).unwrap();
        log.borrow_mut().fail_flip = true;
        assert!(manager.present(2).is_err());
        assert_eq!(manager.buffer_states(), vec![BufferState::OnScreen]);
        assert_eq!(log.borrow().released, vec![2]);

        log.borrow_mut().fail_flip = false;
        assert_eq!(manager.present(3).unwrap(), PresentOutcome::FlipQueued);
    }

    #[test]
    fn test_failed_framebuffer_releases_buffer() {
        let (device, log) = FakeDevice::new();
        let mut manager = DisplayManager::new(device, test_output());

        log.borrow_mut().fail_framebuffer = true;
        assert!(matches!(manager.present(9), Err(DisplayError::Framebuffer(_))));
        assert_eq!(log.borrow().released, vec![9]);
        assert!(manager.buffer_states().is_empty());
    }

    #[test]
    fn test_spurious_flip_event_is_ignored() {
        let (device, _log) = FakeDevice::new();
        let mut manager = DisplayManager::new(device, test_output());

        manager.present(1).unwrap();
        manager.on_flip_complete(FlipComplete::confirmed(5));
        assert_eq!(manager.buffer_states(), vec![BufferState::OnScreen]);
    }

    #[test]
    fn test_drop_releases_everything() {
        let (device, log) = FakeDevice::new();
        let mut manager = DisplayManager::new(device, test_output());
        manager.present(1).unwrap();
        manager.present(2).unwrap();
        drop(manager);

        let log = log.borrow();
        assert!(log.live_framebuffers.is_empty());
        assert_eq!(log.released.len(), 2);
    }
}
