//! DRM/KMS + GBM scan-out device
//!
//! Opens the card node, discovers the output once, and allocates a GBM
//! surface (ARGB8888, scanout | rendering) that serves as the swap-chain the
//! EGL surface renders into.

use std::ffi::c_void;
use std::fs::{File, OpenOptions};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, RawFd};

use drm::control::{
    connector, crtc, framebuffer, from_u32, Device as ControlDevice, Event, FbCmd2Flags, Mode, PageFlipFlags,
    RawResourceHandle,
};
use drm::{ClientCapability, Device as BasicDevice};
use gbm::{AsRaw, BufferObject, BufferObjectFlags, Format as GbmFormat, Surface};
use tracing::{debug, info, warn};

use super::{
    select_output, BufferGeometry, ConnectorInfo, FlipComplete, FramebufferId, ModeInfo, ModePreference, OutputConfig,
    ScanoutDevice,
};
use crate::config::DisplayConfig;
use crate::error::DisplayError;

/// Open DRM card node
pub struct Card(File);

impl AsFd for Card {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0.as_fd()
    }
}

impl BasicDevice for Card {}
impl ControlDevice for Card {}

fn raw<H: Into<RawResourceHandle>>(handle: H) -> u32 {
    handle.into().get()
}

/// Connector handle plus what we need to drive it after selection
struct Probe {
    connector: connector::Handle,
    modes: Vec<Mode>,
    crtcs: Vec<crtc::Handle>,
}

/// KMS device with its GBM swap-chain surface
pub struct KmsDevice {
    gbm: gbm::Device<Card>,
    surface: Surface<()>,
    connector: connector::Handle,
    crtc: crtc::Handle,
    mode: Mode,
}

impl KmsDevice {
    /// Open the card, choose the output, create the swap-chain surface
    pub fn open(config: &DisplayConfig) -> Result<(Self, OutputConfig), DisplayError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&config.device)
            .map_err(|source| DisplayError::Open { path: config.device.clone(), source })?;
        let card = Card(file);

        if let Err(e) = card.set_client_capability(ClientCapability::UniversalPlanes, true) {
            debug!("Universal planes unavailable: {}", e);
        }

        let (infos, probes) = probe_connectors(&card)?;
        let preference = ModePreference {
            width: config.preferred_width,
            height: config.preferred_height,
            refresh: config.preferred_refresh,
        };
        let output = select_output(&infos, preference)?;

        let (probe, _) = probes
            .into_iter()
            .zip(&infos)
            .find(|(_, info)| info.id == output.connector_id)
            .ok_or(DisplayError::NoConnectedOutput)?;
        let crtc = probe
            .crtcs
            .iter()
            .copied()
            .find(|c| raw(*c) == output.crtc_id)
            .or_else(|| from_u32(output.crtc_id))
            .ok_or(DisplayError::NoCrtc(output.connector_id))?;
        let mode = probe.modes[output.mode_index];

        let gbm = gbm::Device::new(card).map_err(|e| DisplayError::Allocation(e.to_string()))?;
        let surface = gbm
            .create_surface::<()>(
                u32::from(output.mode.width),
                u32::from(output.mode.height),
                GbmFormat::Argb8888,
                BufferObjectFlags::SCANOUT | BufferObjectFlags::RENDERING,
            )
            .map_err(|e| DisplayError::Allocation(e.to_string()))?;

        info!("KMS device {:?} ready", config.device);
        Ok((
            Self {
                gbm,
                surface,
                connector: probe.connector,
                crtc,
                mode,
            },
            output,
        ))
    }

    /// GBM device pointer, the EGL native display
    pub fn native_display(&self) -> *mut c_void {
        self.gbm.as_raw() as *mut c_void
    }

    /// GBM surface pointer, the EGL native window
    pub fn native_window(&self) -> *mut c_void {
        self.surface.as_raw() as *mut c_void
    }

    /// Lock the buffer EGL just swapped to the front.
    ///
    /// Must follow `eglSwapBuffers` on the surface created over this device.
    pub fn lock_front_buffer(&mut self) -> Result<BufferObject<()>, DisplayError> {
        // SAFETY: called only by the render bridge right after a swap
        unsafe { self.surface.lock_front_buffer() }.map_err(|e| DisplayError::BufferAcquire(e.to_string()))
    }
}

fn probe_connectors(card: &Card) -> Result<(Vec<ConnectorInfo>, Vec<Probe>), DisplayError> {
    let resources = card.resource_handles()?;
    let mut infos = Vec::new();
    let mut probes = Vec::new();

    for &handle in resources.connectors() {
        let connector = match card.get_connector(handle, false) {
            Ok(c) => c,
            Err(e) => {
                warn!("Skipping connector {:?}: {}", handle, e);
                continue;
            }
        };

        let current_crtc = connector
            .current_encoder()
            .and_then(|enc| card.get_encoder(enc).ok())
            .and_then(|enc| enc.crtc());
        let crtcs: Vec<crtc::Handle> = connector
            .encoders()
            .first()
            .and_then(|&enc| card.get_encoder(enc).ok())
            .map(|enc| resources.filter_crtcs(enc.possible_crtcs()))
            .unwrap_or_default();

        let modes = connector.modes().to_vec();
        infos.push(ConnectorInfo {
            id: raw(handle),
            connected: connector.state() == connector::State::Connected,
            preferred_class: connector.interface() == connector::Interface::HDMIA,
            modes: modes
                .iter()
                .map(|m| {
                    let (width, height) = m.size();
                    ModeInfo { width, height, refresh: m.vrefresh() }
                })
                .collect(),
            current_crtc: current_crtc.map(raw),
            possible_crtcs: crtcs.iter().copied().map(raw).collect(),
        });
        probes.push(Probe { connector: handle, modes, crtcs });
    }

    Ok((infos, probes))
}

fn framebuffer_handle(id: FramebufferId) -> Result<framebuffer::Handle, DisplayError> {
    from_u32(id).ok_or_else(|| DisplayError::Framebuffer(format!("invalid framebuffer id {}", id)))
}

impl ScanoutDevice for KmsDevice {
    type Buffer = BufferObject<()>;

    fn geometry(&self, buffer: &Self::Buffer) -> BufferGeometry {
        BufferGeometry {
            width: buffer.width(),
            height: buffer.height(),
            stride: buffer.stride(),
        }
    }

    fn add_framebuffer(&mut self, buffer: &Self::Buffer) -> Result<FramebufferId, DisplayError> {
        self.gbm
            .add_planar_framebuffer(buffer, FbCmd2Flags::empty())
            .map(raw)
            .map_err(|e| DisplayError::Framebuffer(e.to_string()))
    }

    fn remove_framebuffer(&mut self, framebuffer: FramebufferId) {
        let Ok(handle) = framebuffer_handle(framebuffer) else { return };
        if let Err(e) = self.gbm.destroy_framebuffer(handle) {
            warn!("Failed to remove framebuffer {}: {}", framebuffer, e);
        }
    }

    fn release_buffer(&mut self, buffer: Self::Buffer) {
        // a surface-locked buffer object returns to the surface on drop
        drop(buffer);
    }

    fn set_crtc(&mut self, _output: &OutputConfig, framebuffer: FramebufferId) -> Result<(), DisplayError> {
        let fb = framebuffer_handle(framebuffer)?;
        self.gbm
            .set_crtc(self.crtc, Some(fb), (0, 0), &[self.connector], Some(self.mode))
            .map_err(|e| DisplayError::Modeset(e.to_string()))
    }

    fn page_flip(&mut self, _output: &OutputConfig, framebuffer: FramebufferId) -> Result<(), DisplayError> {
        let fb = framebuffer_handle(framebuffer)?;
        self.gbm
            .page_flip(self.crtc, fb, PageFlipFlags::EVENT, None)
            .map_err(|e| DisplayError::PageFlip(e.to_string()))
    }

    fn read_events(&mut self) -> Result<Vec<FlipComplete>, DisplayError> {
        let events = self.gbm.receive_events()?;
        Ok(events
            .filter_map(|event| match event {
                Event::PageFlip(flip) if flip.crtc == self.crtc => Some(FlipComplete::confirmed(flip.frame)),
                _ => None,
            })
            .collect())
    }

    fn raw_fd(&self) -> RawFd {
        self.gbm.as_fd().as_raw_fd()
    }
}
