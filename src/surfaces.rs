//! egui display surfaces: one texture and camera per viewport slot.

use std::sync::Arc;

use anyhow::{bail, Context as _, Result};
use eframe::egui::{self, TextureHandle, TextureOptions};
use log::debug;

use crate::dicom::DicomBackend;
use crate::engine::{DisplayBackend, ImageRef, SurfaceHandle, WindowLevel};
use crate::renderer::render_image;
use crate::selection::Tool;
use crate::sequencer::SortStrategy;
use crate::viewport::ViewportSlot;

const MIN_ZOOM: f32 = 0.25;
const MAX_ZOOM: f32 = 12.0;

#[derive(Default)]
struct Surface {
    images: Vec<ImageRef>,
    index: usize,
    window: Option<WindowLevel>,
    zoom: f32,
    pan: egui::Vec2,
    scroll_accum: f32,
    texture: Option<TextureHandle>,
    shown: Option<(ImageRef, Option<WindowLevel>)>,
}

impl Surface {
    fn new() -> Self {
        Self {
            zoom: 1.0,
            ..Self::default()
        }
    }

    fn reset_camera(&mut self) {
        self.zoom = 1.0;
        self.pan = egui::Vec2::ZERO;
        self.scroll_accum = 0.0;
    }
}

/// What the overlay shows for one surface.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OverlayInfo {
    pub position: usize,
    pub count: usize,
    pub zoom: f32,
    pub window: Option<WindowLevel>,
    /// Set when the slices could not be ordered by patient position.
    pub fallback_order: Option<SortStrategy>,
    pub spacing: Option<f64>,
}

pub struct EguiSurfaces {
    backend: Arc<DicomBackend>,
    ctx: egui::Context,
    surfaces: Vec<Option<Surface>>,
}

impl EguiSurfaces {
    pub fn new(backend: Arc<DicomBackend>, ctx: egui::Context) -> Self {
        Self {
            backend,
            ctx,
            surfaces: Vec::new(),
        }
    }

    fn surface(&self, handle: SurfaceHandle) -> Result<&Surface> {
        self.surfaces
            .get(handle.0)
            .and_then(Option::as_ref)
            .with_context(|| format!("Surface {} does not exist", handle.0))
    }

    fn surface_mut(&mut self, handle: SurfaceHandle) -> Result<&mut Surface> {
        self.surfaces
            .get_mut(handle.0)
            .and_then(Option::as_mut)
            .with_context(|| format!("Surface {} does not exist", handle.0))
    }

    /// Overlay for the image `slot` points at. Position and order come from
    /// the slot, camera and window from the surface.
    pub fn overlay(&self, handle: SurfaceHandle, slot: &ViewportSlot) -> Option<OverlayInfo> {
        let surface = self.surface(handle).ok()?;
        let images = slot.images();
        let image = *images.get(slot.current_index())?;
        let window = surface.window.or_else(|| {
            self.backend
                .image(image)
                .filter(|decoded| decoded.is_monochrome())
                .map(|decoded| decoded.default_window)
        });
        Some(OverlayInfo {
            position: slot.current_index() + 1,
            count: images.len(),
            zoom: surface.zoom,
            window,
            fallback_order: slot.strategy().filter(|strategy| strategy.is_degraded()),
            spacing: slot.spacing(),
        })
    }

    /// Paints `handle` into `rect` and applies pointer input from `response`.
    ///
    /// Returns the number of slices the wheel asked to move.
    pub fn show(
        &mut self,
        handle: SurfaceHandle,
        ui: &egui::Ui,
        rect: egui::Rect,
        response: &egui::Response,
        tool: Option<Tool>,
    ) -> isize {
        let backend = Arc::clone(&self.backend);
        let Ok(surface) = self.surface_mut(handle) else {
            return 0;
        };
        let Some(texture) = surface.texture.as_ref() else {
            return 0;
        };
        let texture_size = texture.size_vec2();
        let texture_id = texture.id();
        if texture_size.x <= 0.0 || texture_size.y <= 0.0 || !rect.is_positive() {
            return 0;
        }
        let fit_scale = (rect.width() / texture_size.x)
            .min(rect.height() / texture_size.y)
            .max(0.01);

        let mut slice_steps = 0;
        if response.double_clicked() {
            surface.reset_camera();
        }
        if response.dragged() {
            let (delta, shift) = ui.input(|input| (input.pointer.delta(), input.modifiers.shift));
            let current = surface.images.get(surface.index).copied();
            match (tool, shift) {
                (Some(Tool::WindowLevel), _) | (_, true) => {
                    if let Some(decoded) = current.and_then(|image| backend.image(image)) {
                        if decoded.is_monochrome() {
                            let window = surface.window.unwrap_or(decoded.default_window);
                            surface.window = Some(drag_window(
                                window,
                                decoded.min_value,
                                decoded.max_value,
                                delta,
                            ));
                        }
                    }
                }
                (Some(Tool::Zoom), _) => {
                    surface.zoom = (surface.zoom * (-delta.y * 0.01).exp()).clamp(MIN_ZOOM, MAX_ZOOM);
                }
                (Some(Tool::StackScroll), _) => {
                    slice_steps += scroll_steps(&mut surface.scroll_accum, delta.y);
                }
                _ => surface.pan += delta,
            }
        }
        if response.hovered() {
            let (modifiers, raw, smooth, pinch) = ui.input(|input| {
                (
                    input.modifiers,
                    input.raw_scroll_delta,
                    input.smooth_scroll_delta,
                    input.zoom_delta(),
                )
            });
            let scroll = dominant_axis(raw, smooth);
            if (pinch - 1.0).abs() > f32::EPSILON || modifiers.command {
                let factor = if (pinch - 1.0).abs() > f32::EPSILON {
                    pinch
                } else {
                    (scroll * 0.0015).exp()
                };
                let old_zoom = surface.zoom;
                surface.zoom = (surface.zoom * factor).clamp(MIN_ZOOM, MAX_ZOOM);
                if let Some(pointer) = response.hover_pos() {
                    let offset = pointer - (rect.center() + surface.pan);
                    surface.pan += offset * (1.0 - surface.zoom / old_zoom);
                }
            } else {
                slice_steps += scroll_steps(&mut surface.scroll_accum, scroll);
            }
        }

        let draw_size = texture_size * fit_scale * surface.zoom;
        let max_pan = ((draw_size + rect.size()) * 0.5 - egui::vec2(16.0, 16.0)).max(egui::Vec2::ZERO);
        surface.pan = surface.pan.clamp(-max_pan, max_pan);

        let image_rect = egui::Rect::from_center_size(rect.center() + surface.pan, draw_size);
        ui.painter().with_clip_rect(rect).image(
            texture_id,
            image_rect,
            egui::Rect::from_min_max(egui::Pos2::ZERO, egui::pos2(1.0, 1.0)),
            egui::Color32::WHITE,
        );
        slice_steps
    }
}

impl DisplayBackend for EguiSurfaces {
    fn create_surface(&mut self, slot: usize) -> Result<SurfaceHandle> {
        if self.surfaces.len() <= slot {
            self.surfaces.resize_with(slot + 1, || None);
        }
        if self.surfaces[slot].is_some() {
            bail!("Surface {slot} is already owned by a viewport");
        }
        self.surfaces[slot] = Some(Surface::new());
        Ok(SurfaceHandle(slot))
    }

    fn bind_image_list(
        &mut self,
        handle: SurfaceHandle,
        images: &[ImageRef],
        start_index: usize,
    ) -> Result<()> {
        if start_index >= images.len() {
            bail!("Start index {start_index} outside {} images", images.len());
        }
        let surface = self.surface_mut(handle)?;
        surface.images = images.to_vec();
        surface.index = start_index;
        surface.shown = None;
        surface.reset_camera();
        Ok(())
    }

    fn set_current_index(&mut self, handle: SurfaceHandle, index: usize) -> Result<()> {
        let surface = self.surface_mut(handle)?;
        if index >= surface.images.len() {
            bail!("Index {index} outside {} images", surface.images.len());
        }
        surface.index = index;
        Ok(())
    }

    fn set_window_level(
        &mut self,
        handle: SurfaceHandle,
        window: Option<WindowLevel>,
    ) -> Result<()> {
        self.surface_mut(handle)?.window = window;
        Ok(())
    }

    fn reset_camera(&mut self, handle: SurfaceHandle) -> Result<()> {
        self.surface_mut(handle)?.reset_camera();
        Ok(())
    }

    fn render(&mut self, handle: SurfaceHandle) -> Result<()> {
        let backend = Arc::clone(&self.backend);
        let ctx = self.ctx.clone();
        let surface = self.surface_mut(handle)?;
        let Some(image) = surface.images.get(surface.index).copied() else {
            surface.texture = None;
            surface.shown = None;
            return Ok(());
        };
        if surface.shown == Some((image, surface.window)) {
            return Ok(());
        }

        let decoded = backend
            .image(image)
            .with_context(|| format!("{image} is not decoded"))?;
        let color_image = render_image(&decoded, surface.window);
        match surface.texture.as_mut() {
            Some(texture) => texture.set(color_image, TextureOptions::LINEAR),
            None => {
                surface.texture = Some(ctx.load_texture(
                    format!("viewport-{}", handle.0),
                    color_image,
                    TextureOptions::LINEAR,
                ))
            }
        }
        surface.shown = Some((image, surface.window));
        debug!("Surface {} shows {image}", handle.0);
        ctx.request_repaint();
        Ok(())
    }

    fn destroy(&mut self, handle: SurfaceHandle) {
        if let Some(slot) = self.surfaces.get_mut(handle.0) {
            *slot = None;
        }
    }
}

pub fn overlay_lines(info: &OverlayInfo, series_description: &str) -> Vec<String> {
    let mut lines = Vec::with_capacity(6);
    if !series_description.is_empty() {
        lines.push(series_description.to_string());
    }
    lines.push(format!("Im: {}/{}", info.position, info.count));
    lines.push(format!("Zoom: {:.0}%", info.zoom * 100.0));
    if let Some(window) = info.window {
        lines.push(format!("W: {:.0} L: {:.0}", window.width, window.center));
    }
    if let Some(spacing) = info.spacing {
        lines.push(format!("Spacing: {spacing:.2} mm"));
    }
    if let Some(strategy) = info.fallback_order {
        lines.push(format!("Order: {}", strategy.label()));
    }
    lines
}

/// Accumulates wheel or drag distance into whole slice steps. Scrolling up
/// moves towards the first slice.
fn scroll_steps(accum: &mut f32, delta: f32) -> isize {
    const DEAD_ZONE: f32 = 0.5;
    const PIXELS_PER_SLICE: f32 = 30.0;

    if delta.abs() <= DEAD_ZONE {
        return 0;
    }
    if *accum != 0.0 && delta.signum() != accum.signum() {
        *accum = 0.0;
    }
    *accum += delta;

    let steps = (*accum / PIXELS_PER_SLICE).trunc();
    *accum -= steps * PIXELS_PER_SLICE;
    -(steps as isize)
}

fn dominant_axis(raw: egui::Vec2, smooth: egui::Vec2) -> f32 {
    let delta = if smooth != egui::Vec2::ZERO { smooth } else { raw };
    if delta.y.abs() >= delta.x.abs() {
        delta.y
    } else {
        delta.x
    }
}

/// Horizontal drag widens the window, vertical drag moves the level.
fn drag_window(window: WindowLevel, min_value: i32, max_value: i32, delta: egui::Vec2) -> WindowLevel {
    let span = (i64::from(max_value) - i64::from(min_value)).unsigned_abs() as f32;
    let sensitivity = (span / 512.0).clamp(0.25, 256.0);
    WindowLevel {
        width: (window.width + delta.x * sensitivity).max(1.0),
        center: window.center - delta.y * sensitivity,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hierarchy::SeriesKey;
    use crate::sequencer::SliceOrder;
    use crate::viewport::tests::FakeDisplay;
    use crate::viewport::ViewportRegistry;

    fn surfaces() -> EguiSurfaces {
        EguiSurfaces::new(Arc::new(DicomBackend::new()), egui::Context::default())
    }

    #[test]
    fn surfaces_belong_to_one_slot() {
        let mut surfaces = surfaces();
        let handle = surfaces.create_surface(2).expect("create");
        assert_eq!(handle, SurfaceHandle(2));
        assert!(surfaces.create_surface(2).is_err());
        surfaces.destroy(handle);
        assert!(surfaces.create_surface(2).is_ok());
    }

    #[test]
    fn index_must_stay_inside_bound_list() {
        let mut surfaces = surfaces();
        let handle = surfaces.create_surface(0).expect("create");
        let images = [ImageRef(1), ImageRef(2)];
        assert!(surfaces.bind_image_list(handle, &images, 2).is_err());
        surfaces.bind_image_list(handle, &images, 0).expect("bind");
        surfaces.set_current_index(handle, 1).expect("index 1");
        assert!(surfaces.set_current_index(handle, 2).is_err());
        assert!(surfaces.bind_image_list(SurfaceHandle(7), &images, 0).is_err());
    }

    #[test]
    fn rendering_an_undecoded_image_fails() {
        let mut surfaces = surfaces();
        let handle = surfaces.create_surface(0).expect("create");
        surfaces.render(handle).expect("empty surface renders nothing");
        surfaces
            .bind_image_list(handle, &[ImageRef(9)], 0)
            .expect("bind");
        assert!(surfaces.render(handle).is_err());
    }

    #[test]
    fn camera_reset_keeps_window_override() {
        let mut surfaces = surfaces();
        let handle = surfaces.create_surface(0).expect("create");
        surfaces.bind_image_list(handle, &[ImageRef(1)], 0).expect("bind");
        let bone = WindowLevel {
            width: 1800.0,
            center: 400.0,
        };
        surfaces.set_window_level(handle, Some(bone)).expect("window");
        if let Ok(surface) = surfaces.surface_mut(handle) {
            surface.zoom = 3.0;
            surface.pan = egui::vec2(10.0, -4.0);
        }
        surfaces.reset_camera(handle).expect("reset");
        let surface = surfaces.surface(handle).expect("surface");
        assert_eq!(surface.zoom, 1.0);
        assert_eq!(surface.pan, egui::Vec2::ZERO);
        assert_eq!(surface.window, Some(bone));
    }

    #[test]
    fn overlay_follows_the_slot_cursor() {
        let mut registry = ViewportRegistry::new(FakeDisplay::default(), 1);
        let order = SliceOrder {
            images: vec![ImageRef(4), ImageRef(5), ImageRef(6)],
            strategy: SortStrategy::InstanceNumber,
            spacing: None,
        };
        registry
            .bind_series(0, SeriesKey::new("P1", "S1", "1.1"), order)
            .expect("bind");
        registry.jump_to(0, 2).expect("jump");
        let slot = registry.slot(0).expect("slot");

        let mut surfaces = surfaces();
        let handle = surfaces.create_surface(0).expect("create");
        surfaces
            .bind_image_list(handle, slot.images(), 0)
            .expect("bind");

        let info = surfaces.overlay(handle, slot).expect("overlay");
        assert_eq!((info.position, info.count), (3, 3));
        assert_eq!(info.fallback_order, Some(SortStrategy::InstanceNumber));
        assert_eq!(info.zoom, 1.0);
        assert_eq!(info.window, None);
    }

    #[test]
    fn overlay_hides_preferred_order() {
        let mut registry = ViewportRegistry::new(FakeDisplay::default(), 1);
        let order = SliceOrder {
            images: vec![ImageRef(1), ImageRef(2)],
            strategy: SortStrategy::PatientPosition,
            spacing: Some(2.5),
        };
        registry
            .bind_series(0, SeriesKey::new("P1", "S1", "1.1"), order)
            .expect("bind");
        let slot = registry.slot(0).expect("slot");

        let mut surfaces = surfaces();
        let handle = surfaces.create_surface(0).expect("create");
        let info = surfaces.overlay(handle, slot).expect("overlay");
        assert_eq!(info.position, 1);
        assert_eq!(info.fallback_order, None);
        assert_eq!(info.spacing, Some(2.5));

        let empty = ViewportRegistry::new(FakeDisplay::default(), 1);
        let unbound = empty.slot(0).expect("slot");
        assert_eq!(surfaces.overlay(handle, unbound), None);
    }

    #[test]
    fn overlay_text() {
        let info = OverlayInfo {
            position: 3,
            count: 120,
            zoom: 1.5,
            window: Some(WindowLevel {
                width: 400.0,
                center: 50.0,
            }),
            fallback_order: None,
            spacing: Some(1.25),
        };
        assert_eq!(
            overlay_lines(&info, "AX CHEST"),
            vec![
                "AX CHEST",
                "Im: 3/120",
                "Zoom: 150%",
                "W: 400 L: 50",
                "Spacing: 1.25 mm"
            ]
        );
        let bare = OverlayInfo {
            window: None,
            spacing: None,
            fallback_order: Some(SortStrategy::FileName),
            ..info
        };
        assert_eq!(
            overlay_lines(&bare, ""),
            vec!["Im: 3/120", "Zoom: 150%", "Order: file name"]
        );
    }

    #[test]
    fn wheel_accumulates_into_slice_steps() {
        let mut accum = 0.0;
        assert_eq!(scroll_steps(&mut accum, 0.2), 0);
        assert_eq!(scroll_steps(&mut accum, 20.0), 0);
        assert_eq!(scroll_steps(&mut accum, 20.0), -1);
        assert_eq!(scroll_steps(&mut accum, -65.0), 2);
        assert_eq!(scroll_steps(&mut accum, 45.0), -1);
    }

    #[test]
    fn window_drag_scales_with_sample_range() {
        let start = WindowLevel {
            width: 400.0,
            center: 40.0,
        };
        let dragged = drag_window(start, -1024, 3072, egui::vec2(10.0, -5.0));
        assert_eq!(dragged.width, 480.0);
        assert_eq!(dragged.center, 80.0);
        let narrow = drag_window(start, 0, 10, egui::vec2(-10_000.0, 0.0));
        assert_eq!(narrow.width, 1.0);
    }
}
