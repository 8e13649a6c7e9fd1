mod alerts;
mod app;
mod config;
mod dicom;
mod engine;
mod error;
mod extract;
mod hierarchy;
mod launch;
mod presets;
mod renderer;
mod selection;
mod sequencer;
mod surfaces;
mod viewer;
mod viewport;

fn main() -> eframe::Result<()> {
    let _ = env_logger::Builder::from_default_env()
        .format_timestamp_secs()
        .try_init();

    let cli_args = std::env::args().skip(1).collect::<Vec<_>>();
    let (initial_request, initial_status) = match launch::parse_launch_request_from_args(&cli_args)
    {
        Ok(request) => (request, None),
        Err(err) => {
            log::warn!("Ignoring command line: {err}");
            (None, Some(format!("Command line error: {err}")))
        }
    };

    let native_options = eframe::NativeOptions {
        viewport: eframe::egui::ViewportBuilder::default()
            .with_title("Quadview")
            .with_inner_size([1440.0, 900.0])
            .with_drag_and_drop(true),
        ..Default::default()
    };

    eframe::run_native(
        "Quadview",
        native_options,
        Box::new(move |cc| {
            Ok(Box::new(app::QuadViewApp::new(
                &cc.egui_ctx,
                initial_request,
                initial_status,
            )))
        }),
    )
}
