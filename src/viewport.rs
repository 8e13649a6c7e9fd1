use log::{debug, error, warn};

use crate::engine::{DisplayBackend, ImageRef, SurfaceHandle, WindowLevel};
use crate::error::ViewerError;
use crate::hierarchy::SeriesKey;
use crate::sequencer::{SliceOrder, SortStrategy};

pub const MAX_VIEWPORTS: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Previous,
    Next,
}

impl Direction {
    fn delta(self) -> isize {
        match self {
            Self::Previous => -1,
            Self::Next => 1,
        }
    }
}

#[derive(Debug, Clone)]
struct Binding {
    series: SeriesKey,
    order: SliceOrder,
}

/// One display region. Rebinding replaces everything it shows.
#[derive(Debug, Clone, Default)]
pub struct ViewportSlot {
    surface: Option<SurfaceHandle>,
    binding: Option<Binding>,
    current_index: usize,
    window: Option<WindowLevel>,
}

impl ViewportSlot {
    pub fn is_ready(&self) -> bool {
        self.surface.is_some()
    }

    pub fn surface(&self) -> Option<SurfaceHandle> {
        self.surface
    }

    pub fn bound_series(&self) -> Option<&SeriesKey> {
        self.binding.as_ref().map(|binding| &binding.series)
    }

    pub fn images(&self) -> &[ImageRef] {
        self.binding
            .as_ref()
            .map_or(&[], |binding| binding.order.images.as_slice())
    }

    pub fn current_index(&self) -> usize {
        self.current_index
    }

    pub fn strategy(&self) -> Option<SortStrategy> {
        self.binding.as_ref().map(|binding| binding.order.strategy)
    }

    pub fn spacing(&self) -> Option<f64> {
        self.binding.as_ref().and_then(|binding| binding.order.spacing)
    }

    /// Preset window chosen for this slot, `None` for the image default.
    pub fn window(&self) -> Option<WindowLevel> {
        self.window
    }
}

/// Fixed set of independent viewports on top of a [`DisplayBackend`].
///
/// Every operation touches exactly one slot; there is no cross-slot state
/// besides which slot is active.
pub struct ViewportRegistry<D: DisplayBackend> {
    display: D,
    slots: Vec<ViewportSlot>,
    active: usize,
}

impl<D: DisplayBackend> ViewportRegistry<D> {
    pub fn new(display: D, count: usize) -> Self {
        let count = count.clamp(1, MAX_VIEWPORTS);
        let mut registry = Self {
            display,
            slots: vec![ViewportSlot::default(); count],
            active: 0,
        };
        registry.ensure_surfaces();
        registry
    }

    /// Creates surfaces for slots whose surface failed earlier. Returns how
    /// many slots are still without one.
    pub fn ensure_surfaces(&mut self) -> usize {
        let mut missing = 0;
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if slot.surface.is_some() {
                continue;
            }
            match self.display.create_surface(index) {
                Ok(surface) => slot.surface = Some(surface),
                Err(err) => {
                    missing += 1;
                    warn!("Viewport {} surface not ready: {err:#}", index + 1);
                }
            }
        }
        missing
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn slots(&self) -> &[ViewportSlot] {
        &self.slots
    }

    pub fn slot(&self, index: usize) -> Option<&ViewportSlot> {
        self.slots.get(index)
    }

    pub fn active_slot(&self) -> usize {
        self.active
    }

    pub fn is_active(&self, index: usize) -> bool {
        self.active == index
    }

    pub fn display(&self) -> &D {
        &self.display
    }

    pub fn display_mut(&mut self) -> &mut D {
        &mut self.display
    }

    pub fn set_active_slot(&mut self, index: usize) -> Result<(), ViewerError> {
        self.checked(index)?;
        self.active = index;
        Ok(())
    }

    /// Shows `order` in slot `index` starting at its first image.
    ///
    /// On any failure the slot keeps what it showed before.
    pub fn bind_series(
        &mut self,
        index: usize,
        series: SeriesKey,
        order: SliceOrder,
    ) -> Result<(), ViewerError> {
        let surface = self.ready_surface(index)?;
        if order.images.is_empty() {
            return Err(ViewerError::EmptySeries(series.series_uid));
        }

        self.display
            .bind_image_list(surface, &order.images, 0)
            .and_then(|()| self.display.set_window_level(surface, None))
            .map_err(|err| {
                error!("Viewport {} rejected series {series}: {err:#}", index + 1);
                ViewerError::ViewportNotReady(index)
            })?;
        self.render(index, surface);

        debug!(
            "Viewport {} bound to {series} ({} images, {})",
            index + 1,
            order.images.len(),
            order.strategy.label()
        );
        let slot = &mut self.slots[index];
        slot.binding = Some(Binding { series, order });
        slot.current_index = 0;
        slot.window = None;
        Ok(())
    }

    /// Moves one image forward or back. Returns `false` at either end.
    pub fn navigate(&mut self, index: usize, direction: Direction) -> Result<bool, ViewerError> {
        self.navigate_by(index, direction.delta())
    }

    /// Moves by `delta` images, clamped to the bound list.
    pub fn navigate_by(&mut self, index: usize, delta: isize) -> Result<bool, ViewerError> {
        let slot = self.checked(index)?;
        let len = slot.images().len();
        if len == 0 {
            return Ok(false);
        }
        let current = slot.current_index;
        let target = current.saturating_add_signed(delta).min(len - 1);
        self.jump_to(index, target)
    }

    /// Moves to image `target`, clamped to the bound list.
    pub fn jump_to(&mut self, index: usize, target: usize) -> Result<bool, ViewerError> {
        let slot = self.checked(index)?;
        let len = slot.images().len();
        if len == 0 {
            return Ok(false);
        }
        let target = target.min(len - 1);
        if target == slot.current_index {
            return Ok(false);
        }

        let surface = self.ready_surface(index)?;
        self.display
            .set_current_index(surface, target)
            .map_err(|err| {
                warn!("Viewport {} could not change image: {err:#}", index + 1);
                ViewerError::ViewportNotReady(index)
            })?;
        self.slots[index].current_index = target;
        self.render(index, surface);
        Ok(true)
    }

    /// Resets pan, zoom and rotation. The current image stays.
    pub fn reset_camera(&mut self, index: usize) -> Result<(), ViewerError> {
        let surface = self.ready_surface(index)?;
        self.display.reset_camera(surface).map_err(|err| {
            warn!("Viewport {} could not reset camera: {err:#}", index + 1);
            ViewerError::ViewportNotReady(index)
        })?;
        self.render(index, surface);
        Ok(())
    }

    /// Overrides the window of slot `index`; `None` restores the image's own.
    pub fn set_window(
        &mut self,
        index: usize,
        window: Option<WindowLevel>,
    ) -> Result<(), ViewerError> {
        let surface = self.ready_surface(index)?;
        self.display
            .set_window_level(surface, window)
            .map_err(|err| {
                warn!("Viewport {} could not change window: {err:#}", index + 1);
                ViewerError::ViewportNotReady(index)
            })?;
        self.slots[index].window = window;
        self.render(index, surface);
        Ok(())
    }

    fn checked(&self, index: usize) -> Result<&ViewportSlot, ViewerError> {
        self.slots.get(index).ok_or(ViewerError::UnknownSlot(index))
    }

    fn ready_surface(&self, index: usize) -> Result<SurfaceHandle, ViewerError> {
        self.checked(index)?
            .surface
            .ok_or(ViewerError::ViewportNotReady(index))
    }

    fn render(&mut self, index: usize, surface: SurfaceHandle) {
        if let Err(err) = self.display.render(surface) {
            warn!("Viewport {} render failed: {err:#}", index + 1);
        }
    }
}

impl<D: DisplayBackend> Drop for ViewportRegistry<D> {
    fn drop(&mut self) {
        for surface in self.slots.iter().filter_map(|slot| slot.surface) {
            self.display.destroy(surface);
        }
    }
}
