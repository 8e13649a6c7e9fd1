use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use eframe::egui::{self, Sense};
use log::{debug, warn};

use crate::alerts::AlertVariant;
use crate::config::ViewerConfig;
use crate::dicom::DicomBackend;
use crate::engine::{DisplayBackend, ImageBackend};
use crate::hierarchy::SeriesKey;
use crate::launch::LaunchRequest;
use crate::presets::presets_by_category;
use crate::selection::Tool;
use crate::surfaces::{overlay_lines, EguiSurfaces};
use crate::viewer::Viewer;
use crate::viewport::Direction;

const APP_TITLE: &str = "Quadview";
const APP_VERSION: &str = env!("CARGO_PKG_VERSION");
const ACTIVE_STROKE: egui::Color32 = egui::Color32::from_rgb(90, 140, 220);
const VISIBLE_ALERTS: usize = 3;

enum BrowserAction {
    SelectPatient(String),
    SelectStudy(String, String),
    SelectSeries(SeriesKey),
    LoadSeries(SeriesKey),
}

pub struct QuadViewApp {
    viewer: Viewer<EguiSurfaces>,
    pending_launch_request: Option<LaunchRequest>,
    status_line: String,
}

impl QuadViewApp {
    pub fn new(
        ctx: &egui::Context,
        initial_request: Option<LaunchRequest>,
        initial_status: Option<String>,
    ) -> Self {
        let backend = Arc::new(DicomBackend::new());
        let surfaces = EguiSurfaces::new(Arc::clone(&backend), ctx.clone());
        let image_backend: Arc<dyn ImageBackend> = backend;
        Self {
            viewer: Viewer::new(image_backend, surfaces, ViewerConfig::from_env()),
            pending_launch_request: initial_request,
            status_line: initial_status.unwrap_or_default(),
        }
    }

    fn apply_black_background(ctx: &egui::Context) {
        let mut visuals = egui::Visuals::dark();
        let line = egui::Color32::from_gray(28);

        visuals.panel_fill = egui::Color32::BLACK;
        visuals.window_fill = egui::Color32::BLACK;
        visuals.extreme_bg_color = egui::Color32::BLACK;
        visuals.window_stroke = egui::Stroke::new(1.0, line);
        visuals.widgets.noninteractive.bg_stroke = egui::Stroke::new(1.0, line);
        ctx.set_visuals(visuals);
    }

    fn open_dicoms(&mut self) {
        if let Some(paths) = rfd::FileDialog::new()
            .add_filter("DICOM", &["dcm", "dicom", "ima"])
            .pick_files()
        {
            self.viewer.load_files(paths);
        }
    }

    fn open_folder(&mut self) {
        if let Some(folder) = rfd::FileDialog::new().pick_folder() {
            self.viewer.load_files(vec![folder]);
        }
    }

    fn poll_load(&mut self, now: Instant) {
        let Some(report) = self.viewer.poll_load(now) else {
            return;
        };
        self.status_line = report.summary;
    }

    fn handle_keyboard(&mut self, ctx: &egui::Context, now: Instant) {
        const DIGITS: [(egui::Key, char); 5] = [
            (egui::Key::Num1, '1'),
            (egui::Key::Num2, '2'),
            (egui::Key::Num3, '3'),
            (egui::Key::Num4, '4'),
            (egui::Key::Num5, '5'),
        ];

        if ctx.wants_keyboard_input() {
            return;
        }
        let mut open_requested = false;
        let mut cycle = false;
        let mut direction = None;
        let mut digits = Vec::new();
        ctx.input_mut(|input| {
            open_requested = input.consume_key(egui::Modifiers::COMMAND, egui::Key::O);
            cycle = input.consume_key(egui::Modifiers::NONE, egui::Key::Tab);
            for key in [egui::Key::ArrowUp, egui::Key::ArrowLeft] {
                if input.consume_key(egui::Modifiers::NONE, key) {
                    direction = Some(Direction::Previous);
                }
            }
            for key in [egui::Key::ArrowDown, egui::Key::ArrowRight] {
                if input.consume_key(egui::Modifiers::NONE, key) {
                    direction = Some(Direction::Next);
                }
            }
            for (key, digit) in DIGITS {
                if input.consume_key(egui::Modifiers::NONE, key) {
                    digits.push(digit);
                }
            }
        });

        if open_requested {
            self.open_dicoms();
        }
        if cycle {
            self.viewer.cycle_active_viewport();
        }
        if let Some(direction) = direction {
            if let Err(err) = self.viewer.navigate_active_viewport(direction) {
                debug!("Navigation ignored: {err}");
            }
        }
        for digit in digits {
            self.viewer.handle_key(digit, now);
        }
    }

    fn show_menu_bar(&mut self, ctx: &egui::Context, now: Instant) {
        let mut open_files = false;
        let mut open_folder = false;
        let mut preset = None;
        let viewports = self.viewer.viewports();
        let chosen_window = viewports
            .slot(viewports.active_slot())
            .and_then(|slot| slot.window());

        egui::TopBottomPanel::top("menu-bar").show(ctx, |ui| {
            egui::menu::bar(ui, |ui| {
                ui.menu_button("File", |ui| {
                    if ui.button("Open DICOM(s)").clicked() {
                        open_files = true;
                        ui.close_menu();
                    }
                    if ui.button("Open Folder").clicked() {
                        open_folder = true;
                        ui.close_menu();
                    }
                });
                ui.menu_button("Presets", |ui| {
                    if ui
                        .selectable_label(chosen_window.is_none(), "Image default")
                        .clicked()
                    {
                        preset = Some(None);
                        ui.close_menu();
                    }
                    for (category, presets) in presets_by_category() {
                        ui.menu_button(category, |ui| {
                            for entry in presets {
                                let label = format!(
                                    "{}  W {:.0} / L {:.0}",
                                    entry.name, entry.window.width, entry.window.center
                                );
                                let chosen = chosen_window == Some(entry.window);
                                if ui.selectable_label(chosen, label).clicked() {
                                    preset = Some(Some(entry.name));
                                    ui.close_menu();
                                }
                            }
                        });
                    }
                });

                ui.with_layout(egui::Layout::right_to_left(egui::Align::Center), |ui| {
                    ui.label(format!("{APP_TITLE} v{APP_VERSION}"));
                    if let Some(sequence) = self.viewer.key_display(now) {
                        ui.monospace(sequence);
                    }
                    if let Some(tool) = self.viewer.active_tool() {
                        ui.label(format!("Tool: {}", tool.label()));
                    }
                    if self.viewer.is_loading() {
                        ui.spinner();
                    }
                });
            });
        });

        if open_files {
            self.open_dicoms();
        }
        if open_folder {
            self.open_folder();
        }
        if let Some(name) = preset {
            if let Err(err) = self.viewer.apply_preset_to_active_viewport(name) {
                self.status_line = err.to_string();
            }
        }
    }

    fn show_status_bar(&mut self, ctx: &egui::Context) {
        let mut dismissed = None;
        if self.viewer.alerts().is_empty() && self.status_line.is_empty() {
            return;
        }
        egui::TopBottomPanel::bottom("status-bar").show(ctx, |ui| {
            for alert in self.viewer.alerts().newest(VISIBLE_ALERTS) {
                let color = match alert.variant {
                    AlertVariant::Info => egui::Color32::from_gray(190),
                    AlertVariant::Success => egui::Color32::from_rgb(110, 200, 120),
                    AlertVariant::Warning => egui::Color32::from_rgb(230, 190, 80),
                    AlertVariant::Danger => egui::Color32::from_rgb(230, 90, 80),
                };
                ui.horizontal(|ui| {
                    ui.colored_label(color, egui::RichText::new(&alert.title).strong());
                    ui.label(&alert.message);
                    if ui.small_button("x").clicked() {
                        dismissed = Some(alert.id);
                    }
                });
            }
            let hidden = self.viewer.alerts().len().saturating_sub(VISIBLE_ALERTS);
            if hidden > 0 {
                ui.weak(format!("{hidden} older messages"));
            }
            if !self.status_line.is_empty() {
                ui.label(&self.status_line);
            }
        });
        if let Some(id) = dismissed {
            self.viewer.alerts_mut().dismiss(id);
        }
    }

    fn show_browser(&mut self, ctx: &egui::Context) {
        let mut actions = Vec::new();
        egui::SidePanel::left("series-browser")
            .resizable(true)
            .default_width(280.0)
            .show(ctx, |ui| {
                if self.viewer.tree().is_empty() {
                    ui.label("Drop DICOM files or folders here.");
                    return;
                }
                let selection = self.viewer.selection();
                egui::ScrollArea::vertical()
                    .id_salt("series-tree")
                    .show(ui, |ui| {
                        for patient in self.viewer.tree().patients() {
                            let label = format!("{} ({})", patient.name, patient.id);
                            if ui
                                .selectable_label(selection.is_patient_selected(&patient.id), label)
                                .clicked()
                            {
                                actions.push(BrowserAction::SelectPatient(patient.id.clone()));
                            }
                            ui.indent(("patient", &patient.id), |ui| {
                                for study in patient.studies.values() {
                                    let label = format!("{} {}", study.date, study.description);
                                    if ui
                                        .selectable_label(
                                            selection
                                                .is_study_selected(&patient.id, &study.instance_uid),
                                            label.trim(),
                                        )
                                        .clicked()
                                    {
                                        actions.push(BrowserAction::SelectStudy(
                                            patient.id.clone(),
                                            study.instance_uid.clone(),
                                        ));
                                    }
                                    ui.indent(("study", &study.instance_uid), |ui| {
                                        for series in &study.series {
                                            let key = SeriesKey::new(
                                                &patient.id,
                                                &study.instance_uid,
                                                &series.instance_uid,
                                            );
                                            let label = format!(
                                                "#{} {} {} ({})",
                                                series.number,
                                                series.modality,
                                                series.description,
                                                series.images.len()
                                            );
                                            let selected = selection.is_series_selected(&key);
                                            let row = ui.dnd_drag_source(
                                                egui::Id::new(("series-row", &key)),
                                                key.clone(),
                                                |ui| ui.selectable_label(selected, label),
                                            );
                                            if row.inner.double_clicked() {
                                                actions.push(BrowserAction::LoadSeries(key));
                                            } else if row.inner.clicked() {
                                                actions.push(BrowserAction::SelectSeries(key));
                                            }
                                        }
                                    });
                                }
                            });
                        }
                    });
            });

        for action in actions {
            let result = match action {
                BrowserAction::SelectPatient(id) => {
                    self.viewer.select_patient(&id);
                    Ok(())
                }
                BrowserAction::SelectStudy(patient, study) => {
                    self.viewer.select_study(&patient, &study);
                    Ok(())
                }
                BrowserAction::SelectSeries(key) => self.viewer.select_series(&key),
                BrowserAction::LoadSeries(key) => {
                    let slot = self.viewer.viewports().active_slot();
                    self.viewer.load_series_into_viewport(&key, slot)
                }
            };
            if let Err(err) = result {
                self.status_line = err.to_string();
            }
        }
    }

    fn show_viewport_grid(&mut self, ui: &mut egui::Ui) {
        const GRID_GAP: f32 = 2.0;
        const VIEW_INNER_MARGIN: f32 = 3.0;

        let count = self.viewer.viewports().len();
        let cols = if count > 1 { 2 } else { 1 };
        let rows = count.div_ceil(cols);
        let tool = self.viewer.active_tool();
        let mut activate = None;
        let mut dropped = None;

        ui.scope(|ui| {
            ui.spacing_mut().item_spacing = egui::vec2(GRID_GAP, GRID_GAP);
            let available = ui.available_size();
            let cell_size = egui::vec2(
                ((available.x - GRID_GAP * (cols - 1) as f32).max(2.0)) / cols as f32,
                ((available.y - GRID_GAP * (rows - 1) as f32).max(2.0)) / rows as f32,
            );

            for row in 0..rows {
                ui.horizontal(|ui| {
                    for col in 0..cols {
                        let index = row * cols + col;
                        if index >= count {
                            continue;
                        }
                        ui.allocate_ui_with_layout(
                            cell_size,
                            egui::Layout::top_down(egui::Align::Center),
                            |ui| {
                                let stroke_color = if self.viewer.viewports().is_active(index) {
                                    ACTIVE_STROKE
                                } else {
                                    egui::Color32::from_gray(35)
                                };
                                egui::Frame::none()
                                    .stroke(egui::Stroke::new(1.0, stroke_color))
                                    .inner_margin(egui::Margin::same(VIEW_INNER_MARGIN))
                                    .show(ui, |ui| {
                                        let (rect, response) = ui.allocate_exact_size(
                                            ui.available_size(),
                                            Sense::click_and_drag(),
                                        );
                                        if response.clicked() || response.drag_started() {
                                            activate = Some(index);
                                        }
                                        if let Some(key) = response.dnd_release_payload::<SeriesKey>() {
                                            dropped = Some(((*key).clone(), index));
                                        }
                                        self.show_viewport(ui, index, rect, &response, tool);
                                    });
                            },
                        );
                    }
                });
            }
        });

        if let Some(index) = activate {
            let _ = self.viewer.set_active_viewport(index);
        }
        if let Some((key, index)) = dropped {
            let _ = self.viewer.set_active_viewport(index);
            if let Err(err) = self.viewer.load_series_into_viewport(&key, index) {
                self.status_line = err.to_string();
            }
        }
    }

    fn show_viewport(
        &mut self,
        ui: &egui::Ui,
        index: usize,
        rect: egui::Rect,
        response: &egui::Response,
        tool: Option<Tool>,
    ) {
        let slot = self.viewer.viewports().slot(index);
        let handle = slot.and_then(|slot| slot.surface());
        let description = slot
            .and_then(|slot| slot.bound_series())
            .and_then(|key| self.viewer.tree().series(key))
            .map(|series| series.description.clone());

        let (Some(handle), Some(description)) = (handle, description) else {
            let text = if handle.is_some() {
                format!("Viewport {}\nDouble-click or drag a series here", index + 1)
            } else {
                format!("Viewport {} is not ready", index + 1)
            };
            ui.painter().text(
                rect.center(),
                egui::Align2::CENTER_CENTER,
                text,
                egui::FontId::proportional(14.0),
                egui::Color32::from_gray(90),
            );
            return;
        };

        let steps = self
            .viewer
            .viewports_mut()
            .display_mut()
            .show(handle, ui, rect, response, tool);
        if steps != 0 {
            let _ = self.viewer.viewports_mut().navigate_by(index, steps);
        }
        if let Err(err) = self.viewer.viewports_mut().display_mut().render(handle) {
            warn!("Viewport {} redraw failed: {err:#}", index + 1);
        }
        let viewports = self.viewer.viewports();
        let overlay = viewports
            .slot(index)
            .and_then(|slot| viewports.display().overlay(handle, slot));

        if let Some(info) = overlay {
            let text = overlay_lines(&info, &description).join("\n");
            ui.painter().with_clip_rect(rect).text(
                rect.left_top() + egui::vec2(6.0, 6.0),
                egui::Align2::LEFT_TOP,
                text,
                egui::FontId::monospace(12.0),
                egui::Color32::from_gray(220),
            );
        }
    }
}

impl eframe::App for QuadViewApp {
    fn update(&mut self, ctx: &egui::Context, _frame: &mut eframe::Frame) {
        Self::apply_black_background(ctx);
        let now = Instant::now();

        if let Some(request) = self.pending_launch_request.take() {
            self.viewer.load_files_into(request.paths, request.show_in);
        }
        self.poll_load(now);

        let dropped = ctx.input(|input| {
            input
                .raw
                .dropped_files
                .iter()
                .filter_map(|file| file.path.clone())
                .collect::<Vec<PathBuf>>()
        });
        if !dropped.is_empty() {
            self.viewer.load_files(dropped);
        }

        self.handle_keyboard(ctx, now);
        self.show_menu_bar(ctx, now);
        self.show_status_bar(ctx);
        self.show_browser(ctx);
        egui::CentralPanel::default()
            .frame(egui::Frame::none().fill(egui::Color32::BLACK))
            .show(ctx, |ui| self.show_viewport_grid(ui));

        if self.viewer.is_loading() {
            ctx.set_cursor_icon(egui::CursorIcon::Progress);
            ctx.request_repaint_after(std::time::Duration::from_millis(50));
        }
        if let Some(deadline) = self.viewer.tick(now) {
            ctx.request_repaint_after(deadline.saturating_duration_since(now));
        }
    }
}
