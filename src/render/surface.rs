//! Rendering surfaces: the trait seam and the bundled software framebuffer.

use super::scene::{rotate, Placement, Projection, Scene};
use crate::error::AccelError;
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SurfaceEvent {
    /// The user closed the window
    CloseRequested,
}

/// Window parameters for a new surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SurfaceSpec {
    pub title: String,
    pub width: u32,
    pub height: u32,
}

/// Decoded RGB texture.
#[derive(Clone, PartialEq, Eq)]
pub struct Texture {
    pub width: u32,
    pub height: u32,
    pub rgb: Vec<u8>,
}

impl fmt::Debug for Texture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Texture({}x{})", self.width, self.height)
    }
}

impl Texture {
    pub fn load(path: &Path) -> Result<Self, image::ImageError> {
        let img = image::open(path)?.to_rgb8();
        let (width, height) = img.dimensions();
        Ok(Self {
            width,
            height,
            rgb: img.into_raw(),
        })
    }

    /// ARGB texel at normalized coordinates, clamped to the edges.
    pub fn sample(&self, u: f32, v: f32) -> u32 {
        if self.width == 0 || self.height == 0 {
            return 0xFF_00_00_00;
        }
        let x = ((u.clamp(0.0, 1.0) * (self.width - 1) as f32) as u32).min(self.width - 1);
        let y = ((v.clamp(0.0, 1.0) * (self.height - 1) as f32) as u32).min(self.height - 1);
        let i = ((y * self.width + x) * 3) as usize;
        match self.rgb.get(i..i + 3) {
            Some(&[r, g, b]) => 0xFF_00_00_00 | (r as u32) << 16 | (g as u32) << 8 | b as u32,
            _ => 0xFF_00_00_00,
        }
    }
}

/// A rendering context bound to one device.
pub trait RenderSurface: Send {
    fn poll_events(&mut self) -> Vec<SurfaceEvent>;

    fn set_projection(&mut self, projection: Projection);

    fn bind_texture(&mut self, texture: Option<Arc<Texture>>);

    fn clear(&mut self, argb: u32);

    fn draw(&mut self, scene: &Scene, placements: &[Placement]);

    fn present(&mut self) -> Result<(), AccelError>;

    /// Tear down the context and window. Idempotent.
    fn close(&mut self);
}

/// Creates one surface per render unit, on the unit's own thread.
pub trait SurfaceFactory: Send + Sync + fmt::Debug {
    fn create(&self, device: u32, spec: &SurfaceSpec) -> Result<Box<dyn RenderSurface>, AccelError>;
}

#[derive(Debug, Default)]
struct Shared {
    close_requested: AtomicBool,
    open: AtomicUsize,
    frames: AtomicU64,
}

/// Factory for [`OffscreenSurface`]s; also the place to simulate a window close.
#[derive(Debug, Clone, Default)]
pub struct OffscreenSurfaceFactory {
    shared: Arc<Shared>,
}

impl OffscreenSurfaceFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every open surface reports [`SurfaceEvent::CloseRequested`] on its next poll.
    pub fn request_close(&self) {
        self.shared.close_requested.store(true, Ordering::SeqCst);
    }

    /// Surfaces created and not yet closed.
    pub fn open_surfaces(&self) -> usize {
        self.shared.open.load(Ordering::SeqCst)
    }

    pub fn frames_presented(&self) -> u64 {
        self.shared.frames.load(Ordering::SeqCst)
    }
}

impl SurfaceFactory for OffscreenSurfaceFactory {
    fn create(&self, device: u32, spec: &SurfaceSpec) -> Result<Box<dyn RenderSurface>, AccelError> {
        if spec.width == 0 || spec.height == 0 {
            return Err(AccelError::Device {
                id: device,
                message: format!("invalid surface size {}x{}", spec.width, spec.height),
            });
        }
        self.shared.open.fetch_add(1, Ordering::SeqCst);
        debug!("Opened offscreen surface \"{}\" on device {}", spec.title, device);
        Ok(Box::new(OffscreenSurface {
            device,
            width: spec.width,
            height: spec.height,
            framebuffer: vec![0; (spec.width * spec.height) as usize],
            projection: Projection::perspective(spec.width, spec.height),
            texture: None,
            shared: Arc::clone(&self.shared),
            close_seen: false,
            open: true,
        }))
    }
}

/// Software framebuffer that plots the projected scene.
pub struct OffscreenSurface {
    device: u32,
    width: u32,
    height: u32,
    framebuffer: Vec<u32>,
    projection: Projection,
    texture: Option<Arc<Texture>>,
    shared: Arc<Shared>,
    close_seen: bool,
    open: bool,
}

impl OffscreenSurface {
    fn plot(&mut self, x: f32, y: f32, argb: u32) {
        let px = ((x + 1.0) * 0.5 * (self.width - 1) as f32) as usize;
        let py = ((1.0 - y) * 0.5 * (self.height - 1) as f32) as usize;
        if let Some(pixel) = self.framebuffer.get_mut(py * self.width as usize + px) {
            *pixel = argb;
        }
    }
}

impl RenderSurface for OffscreenSurface {
    fn poll_events(&mut self) -> Vec<SurfaceEvent> {
        if !self.close_seen && self.shared.close_requested.load(Ordering::SeqCst) {
            self.close_seen = true;
            return vec![SurfaceEvent::CloseRequested];
        }
        Vec::new()
    }

    fn set_projection(&mut self, projection: Projection) {
        self.projection = projection;
    }

    fn bind_texture(&mut self, texture: Option<Arc<Texture>>) {
        self.texture = texture;
    }

    fn clear(&mut self, argb: u32) {
        self.framebuffer.fill(argb);
    }

    fn draw(&mut self, scene: &Scene, placements: &[Placement]) {
        for placement in placements {
            let mesh = scene.mesh(placement.kind);
            for (vertex, uv) in &mesh.vertices {
                let r = rotate(*vertex, placement.rotation);
                let world = [
                    r[0] + placement.offset[0],
                    r[1] + placement.offset[1],
                    r[2] + placement.offset[2],
                ];
                if let Some((x, y)) = self.projection.project(world) {
                    let color = match &self.texture {
                        Some(t) => t.sample(uv[0], uv[1]),
                        None => placement.kind.color(),
                    };
                    self.plot(x, y, color);
                }
            }
        }
    }

    fn present(&mut self) -> Result<(), AccelError> {
        if !self.open {
            return Err(AccelError::Device {
                id: self.device,
                message: "present on a closed surface".to_string(),
            });
        }
        self.shared.frames.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn close(&mut self) {
        if self.open {
            self.open = false;
            self.texture = None;
            self.framebuffer = Vec::new();
            self.shared.open.fetch_sub(1, Ordering::SeqCst);
            debug!("Closed offscreen surface on device {}", self.device);
        }
    }
}

impl Drop for OffscreenSurface {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> SurfaceSpec {
        SurfaceSpec {
            title: "test".to_string(),
            width: 64,
            height: 48,
        }
    }

    #[test]
    fn close_request_is_reported_once() {
        let factory = OffscreenSurfaceFactory::new();
        let mut surface = factory.create(0, &spec()).unwrap();
        assert!(surface.poll_events().is_empty());
        factory.request_close();
        assert_eq!(surface.poll_events(), vec![SurfaceEvent::CloseRequested]);
        assert!(surface.poll_events().is_empty());
    }

    #[test]
    fn close_and_drop_release_the_surface() {
        let factory = OffscreenSurfaceFactory::new();
        let mut a = factory.create(0, &spec()).unwrap();
        let b = factory.create(1, &spec()).unwrap();
        assert_eq!(factory.open_surfaces(), 2);
        a.close();
        a.close();
        assert_eq!(factory.open_surfaces(), 1);
        drop(b);
        assert_eq!(factory.open_surfaces(), 0);
        assert!(a.present().is_err());
    }

    #[test]
    fn zero_sized_surface_is_rejected() {
        let factory = OffscreenSurfaceFactory::new();
        let bad = SurfaceSpec { width: 0, ..spec() };
        assert!(factory.create(0, &bad).is_err());
        assert_eq!(factory.open_surfaces(), 0);
    }

    #[test]
    fn missing_texture_is_an_error() {
        assert!(Texture::load(Path::new("/nonexistent/texture.jpg")).is_err());
    }

    #[test]
    fn texture_sampling_clamps() {
        let t = Texture {
            width: 2,
            height: 1,
            rgb: vec![255, 0, 0, 0, 0, 255],
        };
        assert_eq!(t.sample(-1.0, 0.0), 0xFF_FF_00_00);
        assert_eq!(t.sample(2.0, 0.5), 0xFF_00_00_FF);
    }

    #[test]
    fn drawing_marks_pixels() {
        let factory = OffscreenSurfaceFactory::new();
        let scene = Scene::default();
        let mut surface = OffscreenSurface {
            device: 0,
            width: 64,
            height: 48,
            framebuffer: vec![0; 64 * 48],
            projection: Projection::perspective(64, 48),
            texture: None,
            shared: Arc::clone(&factory.shared),
            close_seen: false,
            open: true,
        };
        surface.clear(0xFF_4C_4C_4C);
        let placements = [Placement {
            kind: crate::render::scene::ShapeKind::Sphere,
            offset: [0.0, 0.0, 0.0],
            rotation: 0.0,
        }];
        surface.draw(&scene, &placements);
        assert!(surface.framebuffer.iter().any(|&p| p == 0xFF_00_00_FF));
        surface.open = false;
    }
}
