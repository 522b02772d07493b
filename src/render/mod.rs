//! Continuous render loop on one device.
//!
//! A unit moves through `Init -> Running -> Stopping -> Terminal`. Closing the
//! window sets the shared token instead of leaving on its own, so sibling
//! units and the controller stop with it.

pub mod scene;
pub mod surface;

pub use scene::{Placement, Projection, Scene, ShapeKind};
pub use surface::{
    OffscreenSurface, OffscreenSurfaceFactory, RenderSurface, SurfaceEvent, SurfaceFactory,
    SurfaceSpec, Texture,
};

use crate::cancel::CancellationToken;
use crate::config::RenderConfig;
use crate::duty_cycle::Percentage;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

const CLEAR_COLOR: u32 = 0xFF_4C_4C_4C;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderState {
    Init,
    Running,
    Stopping,
    Terminal,
}

/// What a render unit did before it returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RenderStats {
    pub frames: u64,
    pub closed_by_user: bool,
    pub textured: bool,
}

#[derive(Debug, Clone)]
pub struct GpuRenderLoadGenerator {
    device: u32,
    percentage: Percentage,
    config: RenderConfig,
    factory: Arc<dyn SurfaceFactory>,
}

impl GpuRenderLoadGenerator {
    pub fn new(
        device: u32,
        percentage: Percentage,
        config: RenderConfig,
        factory: Arc<dyn SurfaceFactory>,
    ) -> Self {
        Self {
            device,
            percentage,
            config,
            factory,
        }
    }

    /// Degrees added to the rotation every frame.
    pub fn rotation_step(&self) -> f32 {
        (self.percentage.value() / 10.0) as f32
    }

    pub fn run(&self, token: &CancellationToken) -> RenderStats {
        let mut stats = RenderStats::default();
        let mut state = RenderState::Init;
        let mut surface: Option<Box<dyn RenderSurface>> = None;
        let mut texture: Option<Arc<Texture>> = None;
        let scene = Scene::default();
        let mut rng = rand::rng();
        let mut rotation = 0.0f32;

        loop {
            state = match state {
                RenderState::Init => {
                    let spec = SurfaceSpec {
                        title: format!("GPU Load Test (GPU {})", self.device),
                        width: self.config.width,
                        height: self.config.height,
                    };
                    match self.factory.create(self.device, &spec) {
                        Ok(mut s) => {
                            s.set_projection(Projection::perspective(spec.width, spec.height));
                            texture = self.load_texture();
                            stats.textured = texture.is_some();
                            s.bind_texture(texture.clone());
                            surface = Some(s);
                            info!("Render load started on device {} at {}", self.device, self.percentage);
                            RenderState::Running
                        }
                        Err(e) => {
                            error!("Render surface on device {} unavailable: {}", self.device, e);
                            RenderState::Terminal
                        }
                    }
                }
                RenderState::Running => match surface.as_mut() {
                    Some(s) => {
                        if s.poll_events().contains(&SurfaceEvent::CloseRequested) {
                            info!("Window closed on device {}; stopping load", self.device);
                            stats.closed_by_user = true;
                            token.set();
                        }
                        if token.is_set() {
                            RenderState::Stopping
                        } else {
                            s.clear(CLEAR_COLOR);
                            let placements = scene.frame(rotation, &mut rng);
                            s.draw(&scene, &placements);
                            rotation = (rotation + self.rotation_step()) % 360.0;
                            match s.present() {
                                Ok(()) => stats.frames += 1,
                                Err(e) => warn!("Present failed on device {}: {}", self.device, e),
                            }
                            token.sleep(self.config.frame_pause);
                            RenderState::Running
                        }
                    }
                    None => RenderState::Stopping,
                },
                RenderState::Stopping => {
                    if let Some(mut s) = surface.take() {
                        s.bind_texture(None);
                        s.close();
                    }
                    texture = None;
                    debug!("Render unit on device {} released its surface", self.device);
                    RenderState::Terminal
                }
                RenderState::Terminal => break,
            };
        }
        drop(texture);
        stats
    }

    fn load_texture(&self) -> Option<Arc<Texture>> {
        let path = self.config.texture.as_ref()?;
        match Texture::load(path) {
            Ok(t) => {
                debug!("Loaded texture {} ({}x{})", path.display(), t.width, t.height);
                Some(Arc::new(t))
            }
            Err(e) => {
                warn!(
                    "Texture {} failed to load ({}); proceeding without texture",
                    path.display(),
                    e
                );
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LoadConfig;
    use std::path::PathBuf;
    use std::thread;
    use std::time::{Duration, Instant};

    fn generator(factory: &OffscreenSurfaceFactory, texture: Option<PathBuf>) -> GpuRenderLoadGenerator {
        let mut cfg = LoadConfig::fast().render;
        cfg.texture = texture;
        GpuRenderLoadGenerator::new(0, Percentage::from(50u32), cfg, Arc::new(factory.clone()))
    }

    #[test]
    fn renders_until_token_set_then_releases_surface() {
        let factory = OffscreenSurfaceFactory::new();
        let gen = generator(&factory, None);
        let token = CancellationToken::new();
        let t = token.clone();
        let h = thread::spawn(move || gen.run(&t));
        thread::sleep(Duration::from_millis(100));
        assert_eq!(factory.open_surfaces(), 1);
        let stop = Instant::now();
        token.set();
        let stats = h.join().unwrap();
        assert!(stop.elapsed() < Duration::from_millis(500));
        assert!(stats.frames > 0);
        assert!(!stats.closed_by_user);
        assert_eq!(factory.open_surfaces(), 0);
    }

    #[test]
    fn window_close_sets_the_shared_token() {
        let factory = OffscreenSurfaceFactory::new();
        let gen = generator(&factory, None);
        let token = CancellationToken::new();
        let t = token.clone();
        let h = thread::spawn(move || gen.run(&t));
        thread::sleep(Duration::from_millis(50));
        factory.request_close();
        let stats = h.join().unwrap();
        assert!(stats.closed_by_user);
        assert!(token.is_set());
        assert_eq!(factory.open_surfaces(), 0);
    }

    #[test]
    fn missing_texture_is_not_fatal() {
        let factory = OffscreenSurfaceFactory::new();
        let gen = generator(&factory, Some(PathBuf::from("/nonexistent/texture.jpg")));
        let token = CancellationToken::new();
        let t = token.clone();
        let h = thread::spawn(move || gen.run(&t));
        thread::sleep(Duration::from_millis(50));
        token.set();
        let stats = h.join().unwrap();
        assert!(!stats.textured);
        assert!(stats.frames > 0);
    }

    #[test]
    fn texture_is_loaded_when_present() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("texture.png");
        image::RgbImage::from_pixel(4, 4, image::Rgb([10, 20, 30]))
            .save(&path)
            .unwrap();
        let factory = OffscreenSurfaceFactory::new();
        let gen = generator(&factory, Some(path));
        let token = CancellationToken::new();
        token.set();
        let stats = gen.run(&token);
        assert!(stats.textured);
        assert_eq!(stats.frames, 0);
        assert_eq!(factory.open_surfaces(), 0);
    }

    #[test]
    fn surface_failure_ends_the_unit() {
        let factory = OffscreenSurfaceFactory::new();
        let mut cfg = LoadConfig::fast().render;
        cfg.width = 0;
        let gen = GpuRenderLoadGenerator::new(0, Percentage::FULL, cfg, Arc::new(factory.clone()));
        let stats = gen.run(&CancellationToken::new());
        assert_eq!(stats, RenderStats::default());
    }

    #[test]
    fn rotation_scales_with_load() {
        let factory = OffscreenSurfaceFactory::new();
        assert_eq!(generator(&factory, None).rotation_step(), 5.0);
    }
}
