//! roadcam demo: records a synthetic camera into segmented MP4 files with a live preview window.
//!
//! ```text
//! roadcam [--seconds N] [--strict] [--log-file PATH]
//! ```
//!
//! Keys: `W` toggles the watermark, `P` toggles the preview. Closing the window (or reaching
//! `--seconds`) stops the recording and releases the pipeline.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use raw_window_handle::{HasRawDisplayHandle, HasRawWindowHandle};
use roadcam::config::{self, RecorderConfig};
use roadcam::hotreload::{HotEvent, HotReload};
use roadcam::validate::{emit_issues, emit_summary};
use roadcam::{
    logging, CameraSurface, ChannelCallback, DesktopBackend, PreviewTarget, Recorder, RecorderEvent,
};
use roadcam::{logd, loge, logi, logw};
use roadcam_engine::{AssetsRoot, ConfigMode};
use winit::dpi::PhysicalSize;
use winit::event::{Event, WindowEvent};
use winit::event_loop::{ControlFlow, EventLoopBuilder};
use winit::keyboard::{KeyCode, PhysicalKey};
use winit::window::{Window, WindowBuilder};

#[derive(Debug)]
enum AppEvent {
    ConfigChanged,
}

#[derive(Debug, Default)]
struct Args {
    log_file: Option<PathBuf>,
    seconds: Option<u64>,
    strict: bool,
}

fn parse_args() -> Args {
    let mut args = Args::default();
    let mut it = std::env::args().skip(1);
    while let Some(a) = it.next() {
        match a.as_str() {
            "--log-file" => args.log_file = it.next().map(PathBuf::from),
            "--seconds" => args.seconds = it.next().and_then(|s| s.parse().ok()),
            "--strict" => args.strict = true,
            other => eprintln!("roadcam: ignoring unknown argument {other}"),
        }
    }
    if args.log_file.is_none() {
        if let Ok(p) = std::env::var("ROADCAM_LOG_FILE") {
            if !p.trim().is_empty() {
                args.log_file = Some(PathBuf::from(p));
            }
        }
    }
    args
}

fn load_config(assets: &AssetsRoot, mode: ConfigMode) -> Option<RecorderConfig> {
    match config::load(assets, mode) {
        Ok(loaded) => {
            emit_issues("CONFIG", &loaded.issues);
            let label = loaded
                .source
                .as_deref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "defaults".to_string());
            emit_summary("CONFIG", &label, &loaded.issues);
            Some(loaded.config)
        }
        Err(e) => {
            loge!("CONFIG", "{e}");
            None
        }
    }
}

fn preview_for(window: &Arc<Window>) -> PreviewTarget {
    let size = window.inner_size();
    PreviewTarget {
        handle: window.raw_window_handle(),
        width: size.width.max(1),
        height: size.height.max(1),
        owner: Some(window.clone()),
    }
}

/// Moving color bars at `fps`, stamped with a monotonic clock.
fn spawn_test_pattern(camera: CameraSurface, fps: u32, stop: Arc<AtomicBool>) -> std::io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("test-pattern".into())
        .spawn(move || {
            let (w, h) = (camera.width() as usize, camera.height() as usize);
            let mut frame = vec![0u8; camera.frame_bytes()];
            let interval = Duration::from_secs_f64(1.0 / f64::from(fps.max(1)));
            let t0 = Instant::now();
            let mut next = t0;
            let mut n: usize = 0;
            while !stop.load(Ordering::Relaxed) {
                let shift = n * 4;
                for y in 0..h {
                    let row = &mut frame[y * w * 4..(y + 1) * w * 4];
                    for (x, px) in row.chunks_exact_mut(4).enumerate() {
                        let bar = ((x + shift) * 8 / w.max(1)) % 8;
                        px[0] = if bar & 1 != 0 { 230 } else { 20 };
                        px[1] = if bar & 2 != 0 { 230 } else { 20 };
                        px[2] = if bar & 4 != 0 { 230 } else { 20 };
                        px[3] = 255;
                    }
                }
                camera.submit_frame(&frame, t0.elapsed().as_nanos() as i64);
                n += 1;
                next += interval;
                if let Some(wait) = next.checked_duration_since(Instant::now()) {
                    std::thread::sleep(wait);
                }
            }
        })
}

fn main() {
    let args = parse_args();
    let run_id = logging::init(args.log_file.clone());
    logi!("INIT", "run_id={run_id}");

    let assets = AssetsRoot::discover(Path::new(env!("CARGO_MANIFEST_DIR"))).unwrap_or_else(|e| {
        eprintln!("roadcam init error: {e}");
        std::process::exit(1);
    });
    let mode = if args.strict { ConfigMode::Strict } else { ConfigMode::Lenient };
    logi!("INIT", "assets: {} ({mode:?})", assets.path().display());
    let Some(cfg) = load_config(&assets, mode) else {
        std::process::exit(1);
    };

    let event_loop = match EventLoopBuilder::<AppEvent>::with_user_event().build() {
        Ok(el) => el,
        Err(e) => {
            loge!("INIT", "event loop: {e}");
            std::process::exit(1);
        }
    };
    let window = match WindowBuilder::new()
        .with_title("roadcam")
        .with_inner_size(PhysicalSize::new(cfg.width, cfg.height))
        .build(&event_loop)
    {
        Ok(w) => Arc::new(w),
        Err(e) => {
            loge!("INIT", "window: {e}");
            std::process::exit(1);
        }
    };

    let backend = Arc::new(DesktopBackend::new(event_loop.raw_display_handle()));
    let (callback, rec_events) = ChannelCallback::new();
    let fps = cfg.frame_rate;
    let mut preview_on = cfg.preview;
    let mut recorder = Recorder::new(cfg, backend).with_callback(Arc::new(callback));
    if preview_on {
        recorder.set_preview_target(Some(preview_for(&window)));
    }

    let first = recorder.next_output_path();
    let camera = match recorder.prepare(&first) {
        Ok(c) => c,
        Err(e) => {
            loge!("INIT", "prepare failed: {e}");
            recorder.release();
            std::process::exit(1);
        }
    };

    let stop_camera = Arc::new(AtomicBool::new(false));
    let mut camera_thread = match spawn_test_pattern(camera, fps, stop_camera.clone()) {
        Ok(h) => Some(h),
        Err(e) => {
            loge!("INIT", "camera thread: {e}");
            None
        }
    };

    if let Err(e) = recorder.start_recording() {
        loge!("REC", "start failed: {e}");
    }

    // Hot reload: the watcher thread only signals; the loop re-reads the file.
    let proxy = event_loop.create_proxy();
    match HotReload::new(assets.path()) {
        Ok(hot) => {
            let _ = std::thread::Builder::new().name("hotreload".into()).spawn(move || {
                while let Ok(ev) = hot.rx().recv() {
                    if let HotEvent::RecorderConfigChanged(p) = ev {
                        logd!("WATCH", "changed: {}", p.display());
                        if proxy.send_event(AppEvent::ConfigChanged).is_err() {
                            break;
                        }
                    }
                }
            });
        }
        Err(e) => logw!("WATCH", "hot reload unavailable: {e:#}"),
    }

    let deadline = args.seconds.map(|s| Instant::now() + Duration::from_secs(s));

    let res = event_loop.run(move |event, target| {
        target.set_control_flow(ControlFlow::WaitUntil(Instant::now() + Duration::from_millis(100)));

        match event {
            Event::UserEvent(AppEvent::ConfigChanged) => {
                if let Some(new_cfg) = load_config(&assets, mode) {
                    if new_cfg.watermark != recorder.watermark_enabled() {
                        recorder.set_watermark_enabled(new_cfg.watermark);
                    }
                    if new_cfg.preview != preview_on {
                        preview_on = new_cfg.preview;
                        recorder.set_preview_target(preview_on.then(|| preview_for(&window)));
                    }
                    logi!("CONFIG", "reloaded (recording settings apply at next prepare)");
                }
            }

            Event::WindowEvent { event, .. } => match event {
                WindowEvent::CloseRequested => target.exit(),
                WindowEvent::KeyboardInput { event, .. } => {
                    if event.state.is_pressed() && !event.repeat {
                        match event.physical_key {
                            PhysicalKey::Code(KeyCode::KeyW) => {
                                let on = !recorder.watermark_enabled();
                                logi!("INPUT", "watermark {}", if on { "on" } else { "off" });
                                recorder.set_watermark_enabled(on);
                            }
                            PhysicalKey::Code(KeyCode::KeyP) => {
                                preview_on = !preview_on;
                                logi!("INPUT", "preview {}", if preview_on { "on" } else { "off" });
                                recorder.set_preview_target(preview_on.then(|| preview_for(&window)));
                            }
                            _ => {}
                        }
                    }
                }
                WindowEvent::Resized(_) if preview_on => {
                    recorder.set_preview_target(Some(preview_for(&window)));
                }
                _ => {}
            },

            Event::AboutToWait => {
                for ev in rec_events.try_iter() {
                    match ev {
                        RecorderEvent::RecordStarted { session } => logi!("REC", "started {session}"),
                        RecorderEvent::RecordStopped { session } => logi!("REC", "stopped {session}"),
                        RecorderEvent::SegmentSwitched { new_index, completed_path, .. } => {
                            logi!("REC", "segment {new_index} started; closed {}", completed_path.display())
                        }
                    }
                }
                if deadline.is_some_and(|d| Instant::now() >= d) {
                    target.exit();
                }
            }

            Event::LoopExiting => {
                stop_camera.store(true, Ordering::Relaxed);
                if let Err(e) = recorder.stop_recording() {
                    logw!("REC", "stop: {e}");
                }
                recorder.release();
                if let Some(h) = camera_thread.take() {
                    let _ = h.join();
                }
                let s = recorder.stats();
                logi!(
                    "REC",
                    "frames={} queued={} direct={} dropped={} segments={}",
                    s.frames_rendered,
                    s.units_queued,
                    s.units_direct,
                    s.samples_dropped,
                    s.segments_completed
                );
            }

            _ => {}
        }
    });
    if let Err(e) = res {
        loge!("INIT", "event loop: {e}");
    }
}
