//! Operations the window shell calls. Owns the tree, the viewports and the
//! interaction state, and turns component failures into alerts.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, TryRecvError};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use log::{debug, error, info, warn};

use crate::alerts::{batch_summary, batch_variant, AlertQueue, AlertVariant};
use crate::config::{ViewerConfig, ALERT_AUTO_CLOSE, SURFACE_RETRY_INTERVAL};
use crate::engine::{DisplayBackend, ImageBackend};
use crate::error::ViewerError;
use crate::extract::{expand_inputs, extract_batch, ExtractedBatch};
use crate::hierarchy::{BatchStats, SeriesKey, StudyTree};
use crate::presets::find_preset;
use crate::selection::{KeyOutcome, KeySequence, Selection, ShortcutAction, Tool};
use crate::sequencer::sequence_series;
use crate::viewport::{Direction, ViewportRegistry};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadReport {
    pub stats: BatchStats,
    pub failed: usize,
    pub summary: String,
    /// First series of this load in display order.
    pub first_series: Option<SeriesKey>,
}

pub struct Viewer<D: DisplayBackend> {
    backend: Arc<dyn ImageBackend>,
    config: ViewerConfig,
    tree: StudyTree,
    viewports: ViewportRegistry<D>,
    selection: Selection,
    keys: KeySequence,
    alerts: AlertQueue,
    active_tool: Option<Tool>,
    pending_load: Option<(Receiver<ExtractedBatch>, Option<usize>)>,
    queued_loads: VecDeque<(Vec<PathBuf>, Option<usize>)>,
    /// Series waiting for its viewport surface to come up.
    pending_show: Option<(SeriesKey, usize)>,
    display_alert: Option<u64>,
}

impl<D: DisplayBackend> Viewer<D> {
    pub fn new(backend: Arc<dyn ImageBackend>, display: D, config: ViewerConfig) -> Self {
        let viewports = ViewportRegistry::new(display, config.viewport_count);
        let mut alerts = AlertQueue::new();
        let display_alert = if viewports.slots().iter().all(|slot| !slot.is_ready()) {
            let err = ViewerError::BackendUnavailable("no display surface could be created".into());
            error!("{err}");
            Some(alerts.push(AlertVariant::Danger, "Display unavailable", err.to_string(), None))
        } else {
            None
        };
        Self {
            backend,
            config,
            tree: StudyTree::new(),
            viewports,
            selection: Selection::default(),
            keys: KeySequence::new(config.sequence_timeout),
            alerts,
            active_tool: None,
            pending_load: None,
            queued_loads: VecDeque::new(),
            pending_show: None,
            display_alert,
        }
    }

    pub fn tree(&self) -> &StudyTree {
        &self.tree
    }

    pub fn viewports(&self) -> &ViewportRegistry<D> {
        &self.viewports
    }

    pub fn viewports_mut(&mut self) -> &mut ViewportRegistry<D> {
        &mut self.viewports
    }

    pub fn selection(&self) -> &Selection {
        &self.selection
    }

    pub fn alerts(&self) -> &AlertQueue {
        &self.alerts
    }

    pub fn alerts_mut(&mut self) -> &mut AlertQueue {
        &mut self.alerts
    }

    pub fn active_tool(&self) -> Option<Tool> {
        self.active_tool
    }

    pub fn key_display(&self, now: Instant) -> Option<&str> {
        self.keys.display(now)
    }

    pub fn is_loading(&self) -> bool {
        self.pending_load.is_some() || !self.queued_loads.is_empty()
    }

    /// Expands and extracts `paths` on a worker thread. The result is folded
    /// into the tree by [`Viewer::poll_load`]. Loads requested while one is
    /// running are queued.
    pub fn load_files(&mut self, paths: Vec<PathBuf>) {
        self.load_files_into(paths, None);
    }

    /// Like [`Viewer::load_files`], then shows the first series of the load
    /// in `show_in` as soon as that viewport can take it.
    pub fn load_files_into(&mut self, paths: Vec<PathBuf>, show_in: Option<usize>) {
        if paths.is_empty() {
            return;
        }
        if self.pending_load.is_some() {
            self.queued_loads.push_back((paths, show_in));
            return;
        }

        let (sender, receiver) = mpsc::channel();
        let backend = Arc::clone(&self.backend);
        let config = self.config;
        thread::spawn(move || {
            let files = expand_inputs(&paths);
            let batch = extract_batch(backend.as_ref(), &files, config.workers_for(files.len()));
            let _ = sender.send(batch);
        });
        self.pending_load = Some((receiver, show_in));
    }

    /// Folds a finished background load into the tree.
    pub fn poll_load(&mut self, now: Instant) -> Option<LoadReport> {
        let (receiver, show_in) = self.pending_load.as_ref()?;
        let show_in = *show_in;
        let report = match receiver.try_recv() {
            Ok(batch) => Some(self.apply_batch(batch, show_in, now)),
            Err(TryRecvError::Empty) => return None,
            Err(TryRecvError::Disconnected) => {
                let err = ViewerError::BackendUnavailable("file loader stopped before reporting".into());
                error!("{err}");
                self.alerts
                    .push(AlertVariant::Danger, "Loading failed", err.to_string(), None);
                None
            }
        };
        self.pending_load = None;
        if let Some((paths, show_in)) = self.queued_loads.pop_front() {
            self.load_files_into(paths, show_in);
        }
        report
    }

    fn apply_batch(
        &mut self,
        batch: ExtractedBatch,
        show_in: Option<usize>,
        now: Instant,
    ) -> LoadReport {
        let failed = batch.failures.len();
        if batch.total() == 0 {
            warn!("No DICOM files found");
            self.alerts.push(
                AlertVariant::Warning,
                "Nothing loaded",
                "No DICOM files found",
                Some((now, ALERT_AUTO_CLOSE)),
            );
            return LoadReport {
                stats: BatchStats::default(),
                failed,
                summary: "No DICOM files found".to_string(),
                first_series: None,
            };
        }

        let outcome = self.tree.merge_batch(batch.records);
        for image in &outcome.discarded {
            self.backend.release(*image);
        }
        let stats = BatchStats {
            total_in_batch: outcome.stats.total_in_batch + failed,
            ..outcome.stats
        };

        let summary = batch_summary(&stats, failed);
        info!("{summary}");
        self.alerts.push(
            batch_variant(&stats, failed),
            "Files loaded",
            summary.clone(),
            Some((now, ALERT_AUTO_CLOSE)),
        );

        if self.selection.series().is_none() {
            if let Some(first) = self.tree.first_series_key() {
                self.selection.select_series(&first);
            }
        }

        let first_series = self.tree.first_series_among(&outcome.series);
        if let (Some(key), Some(slot)) = (&first_series, show_in) {
            self.pending_show = Some((key.clone(), slot));
            self.show_pending();
        }

        LoadReport {
            stats,
            failed,
            summary,
            first_series,
        }
    }

    /// Binds the series queued by [`Viewer::load_files_into`]. An unready
    /// viewport keeps it queued for the next tick.
    fn show_pending(&mut self) {
        let Some((key, slot)) = self.pending_show.take() else {
            return;
        };
        match self.bind(&key, slot) {
            Ok(()) => self.selection.select_series(&key),
            Err(ViewerError::ViewportNotReady(_)) => {
                debug!("Viewport {} not ready for {key}, retrying", slot + 1);
                self.pending_show = Some((key, slot));
            }
            Err(err) => self.report(err),
        }
    }

    fn report(&mut self, err: ViewerError) {
        warn!("{err}");
        self.alerts
            .push(AlertVariant::Warning, "Viewport", err.to_string(), None);
    }

    /// Sequences a series and shows it in `slot`, starting at its first
    /// image. A shown series is also highlighted in the browser.
    pub fn load_series_into_viewport(
        &mut self,
        key: &SeriesKey,
        slot: usize,
    ) -> Result<(), ViewerError> {
        match self.bind(key, slot) {
            Ok(()) => {
                self.selection.select_series(key);
                Ok(())
            }
            Err(err) => {
                self.report(err.clone());
                Err(err)
            }
        }
    }

    fn bind(&mut self, key: &SeriesKey, slot: usize) -> Result<(), ViewerError> {
        let series = self
            .tree
            .series(key)
            .ok_or_else(|| ViewerError::UnknownSeries(key.series_uid.clone()))?;
        let order = sequence_series(&series.images, self.backend.as_ref());
        self.viewports.bind_series(slot, key.clone(), order)
    }

    /// Highlights a series in the browser without displaying it.
    pub fn select_series(&mut self, key: &SeriesKey) -> Result<(), ViewerError> {
        if self.tree.series(key).is_none() {
            return Err(ViewerError::UnknownSeries(key.series_uid.clone()));
        }
        self.selection.select_series(key);
        Ok(())
    }

    pub fn select_patient(&mut self, patient_id: &str) {
        self.selection.select_patient(patient_id);
    }

    pub fn select_study(&mut self, patient_id: &str, study_uid: &str) {
        self.selection.select_study(patient_id, study_uid);
    }

    pub fn set_active_viewport(&mut self, slot: usize) -> Result<(), ViewerError> {
        self.viewports.set_active_slot(slot)
    }

    pub fn cycle_active_viewport(&mut self) {
        let next = (self.viewports.active_slot() + 1) % self.viewports.len();
        let _ = self.viewports.set_active_slot(next);
    }

    pub fn navigate_active_viewport(&mut self, direction: Direction) -> Result<bool, ViewerError> {
        self.viewports
            .navigate(self.viewports.active_slot(), direction)
    }

    pub fn reset_active_viewport(&mut self) -> Result<(), ViewerError> {
        self.viewports.reset_camera(self.viewports.active_slot())
    }

    /// Applies a named preset, or the image's own window for `None`.
    pub fn apply_preset_to_active_viewport(&mut self, name: Option<&str>) -> Result<(), ViewerError> {
        let window = match name {
            Some(name) => Some(
                find_preset(name)
                    .ok_or_else(|| ViewerError::UnknownPreset(name.to_string()))?
                    .window,
            ),
            None => None,
        };
        self.viewports
            .set_window(self.viewports.active_slot(), window)
    }

    /// Feeds one typed character to the shortcut recognizer and runs the
    /// bound action when a sequence completes.
    pub fn handle_key(&mut self, key: char, now: Instant) -> KeyOutcome {
        let outcome = self.keys.press(key, now);
        if let KeyOutcome::Completed {
            action: Some(action),
            ..
        } = &outcome
        {
            match action {
                ShortcutAction::ActivateTool(tool) => self.active_tool = Some(*tool),
                ShortcutAction::ResetActiveViewport => {
                    if let Err(err) = self.reset_active_viewport() {
                        warn!("Reset shortcut: {err}");
                    }
                }
            }
        }
        outcome
    }

    /// Expires timed state. Returns when the shell should wake up next.
    pub fn tick(&mut self, now: Instant) -> Option<Instant> {
        self.keys.expire(now);
        let missing = self.viewports.ensure_surfaces();
        if missing < self.viewports.len() {
            if let Some(id) = self.display_alert.take() {
                info!("Display surfaces are available again");
                self.alerts.dismiss(id);
            }
        }
        self.show_pending();

        let alert_deadline = self.alerts.prune(now);
        let retry = self.pending_show.as_ref().map(|_| now + SURFACE_RETRY_INTERVAL);
        alert_deadline
            .into_iter()
            .chain(self.keys.next_deadline())
            .chain(retry)
            .min()
    }
}
