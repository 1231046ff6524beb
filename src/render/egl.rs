//! EGL on GBM, GLES2 context bound to the KMS swap-chain

use std::ffi::c_void;
use std::ptr;

use khronos_egl as egl;
use tracing::{debug, info};

use super::{GpuSurface, RenderBridge};
use crate::config::DisplayConfig;
use crate::display::kms::KmsDevice;
use crate::display::DisplayManager;
use crate::error::DisplayError;

type Egl = egl::DynamicInstance<egl::EGL1_4>;

/// DRM fourcc of the swap-chain format (ARGB8888)
const ARGB8888: i32 = gbm::Format::Argb8888 as i32;

const CONFIG_ATTRIBS: [egl::Int; 13] = [
    egl::SURFACE_TYPE,
    egl::WINDOW_BIT,
    egl::RENDERABLE_TYPE,
    egl::OPENGL_ES2_BIT,
    egl::RED_SIZE,
    8,
    egl::GREEN_SIZE,
    8,
    egl::BLUE_SIZE,
    8,
    egl::ALPHA_SIZE,
    8,
    egl::NONE,
];

const CONTEXT_ATTRIBS: [egl::Int; 3] = [egl::CONTEXT_CLIENT_VERSION, 2, egl::NONE];

fn context_err(step: &str, e: impl std::fmt::Display) -> DisplayError {
    DisplayError::Context(format!("{}: {}", step, e))
}

/// Bring up scan-out: KMS device, swap-chain and GL context
pub fn open(config: &DisplayConfig) -> Result<RenderBridge<KmsDevice, EglSurface>, DisplayError> {
    let (device, output) = KmsDevice::open(config)?;
    let surface = EglSurface::new(&device)?;
    Ok(RenderBridge::new(DisplayManager::new(device, output), surface))
}

/// GLES2 context rendering into the GBM surface
pub struct EglSurface {
    egl: Egl,
    display: egl::Display,
    context: egl::Context,
    surface: egl::Surface,
}

impl EglSurface {
    /// Create display, context and window surface over the KMS device
    pub fn new(device: &KmsDevice) -> Result<Self, DisplayError> {
        // SAFETY: loads libEGL once; the instance lives as long as the surface
        let egl = unsafe { Egl::load_required() }.map_err(|e| context_err("load libEGL", e))?;

        // SAFETY: the GBM device outlives this surface (both owned by the render bridge)
        let display = unsafe { egl.get_display(device.native_display()) }
            .ok_or_else(|| context_err("eglGetDisplay", "no display"))?;

        let (major, minor) = egl.initialize(display).map_err(|e| context_err("eglInitialize", e))?;
        info!("EGL {}.{}", major, minor);

        egl.bind_api(egl::OPENGL_ES_API).map_err(|e| context_err("eglBindAPI", e))?;

        let mut configs = Vec::with_capacity(64);
        egl.choose_config(display, &CONFIG_ATTRIBS, &mut configs)
            .map_err(|e| context_err("eglChooseConfig", e))?;
        let config = configs
            .iter()
            .copied()
            .find(|&c| egl.get_config_attrib(display, c, egl::NATIVE_VISUAL_ID).ok() == Some(ARGB8888))
            .or_else(|| configs.first().copied())
            .ok_or_else(|| context_err("eglChooseConfig", "no matching config"))?;

        let context = egl
            .create_context(display, config, None, &CONTEXT_ATTRIBS)
            .map_err(|e| context_err("eglCreateContext", e))?;

        // SAFETY: the GBM surface outlives the EGL surface
        let surface = unsafe { egl.create_window_surface(display, config, device.native_window(), None) }
            .map_err(|e| context_err("eglCreateWindowSurface", e))?;

        egl.make_current(display, Some(surface), Some(surface), Some(context))
            .map_err(|e| context_err("eglMakeCurrent", e))?;

        gl::load_with(|name| Self::lookup(&egl, name));
        debug!("GL function pointers loaded");

        Ok(Self { egl, display, context, surface })
    }

    fn lookup(egl: &Egl, name: &str) -> *const c_void {
        egl.get_proc_address(name).map_or(ptr::null(), |f| f as *const c_void)
    }

    /// Procedure-address resolver the decode engine reuses for its GL calls
    pub fn proc_address(&self, name: &str) -> *const c_void {
        Self::lookup(&self.egl, name)
    }
}

impl GpuSurface<KmsDevice> for EglSurface {
    fn begin_frame(&mut self, width: u32, height: u32) {
        // SAFETY: the context is current on this (the only) thread
        unsafe {
            gl::Viewport(0, 0, width as i32, height as i32);
            gl::ClearColor(0.0, 0.0, 0.0, 1.0);
            gl::Clear(gl::COLOR_BUFFER_BIT);
        }
    }

    fn swap(&mut self) -> Result<(), DisplayError> {
        // SAFETY: see begin_frame
        unsafe { gl::Flush() };
        self.egl
            .swap_buffers(self.display, self.surface)
            .map_err(|e| context_err("eglSwapBuffers", e))
    }

    fn acquire(&mut self, device: &mut KmsDevice) -> Result<gbm::BufferObject<()>, DisplayError> {
        device.lock_front_buffer()
    }
}

impl Drop for EglSurface {
    fn drop(&mut self) {
        let _ = self.egl.make_current(self.display, None, None, None);
        let _ = self.egl.destroy_surface(self.display, self.surface);
        let _ = self.egl.destroy_context(self.display, self.context);
        let _ = self.egl.terminate(self.display);
    }
}
