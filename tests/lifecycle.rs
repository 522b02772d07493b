use load_stress::accel::{Accelerator, DeviceSet, HostAccelerator};
use load_stress::config::LoadConfig;
use load_stress::controller::{LoadKind, LoadRequest, LoadTestController};
use load_stress::render::OffscreenSurfaceFactory;
use load_stress::Percentage;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const MIB: u64 = 1 << 20;

fn wait_until(limit: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < limit {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    cond()
}

#[test]
fn idle_cpu_run_stops_promptly() {
    let mut cfg = LoadConfig::fast();
    cfg.cpu.units = Some(4);
    let ctl = LoadTestController::with_host_devices(cfg);
    let run = ctl.start_run(LoadRequest::cpu(0.0)).unwrap();
    assert_eq!(run.units(), 4);
    thread::sleep(Duration::from_millis(50));

    let start = Instant::now();
    let summary = ctl.stop_run(run);
    assert!(start.elapsed() < Duration::from_secs(1));
    assert_eq!(summary.units, 4);
    assert!(!ctl.is_running());
}

#[test]
fn compute_run_on_one_device_stops_promptly() {
    let ctl = LoadTestController::with_host_devices(LoadConfig::fast());
    let run = ctl
        .start_run(LoadRequest::new(LoadKind::GpuCompute, 50.0, vec![0]))
        .unwrap();
    assert_eq!(run.worker_names(), vec!["gpu-compute-0"]);
    thread::sleep(Duration::from_millis(100));
    assert_eq!(run.alive(), 1);

    let start = Instant::now();
    ctl.stop_run(run);
    assert!(start.elapsed() < Duration::from_secs(2));
}

#[test]
fn vram_run_converges_then_releases_everything() {
    let cfg = LoadConfig::fast();
    let dev = Arc::new(HostAccelerator::new(0, 8 * MIB));
    let devices = DeviceSet::new(vec![dev.clone() as Arc<dyn Accelerator>]);
    let ctl = LoadTestController::new(cfg, devices, Arc::new(OffscreenSurfaceFactory::new()));

    let run = ctl
        .start_run(LoadRequest::new(LoadKind::GpuVram, 30.0, vec![]))
        .unwrap();
    let target = (8 * MIB) as f64 * 0.30;
    assert!(wait_until(Duration::from_secs(5), || {
        (target - dev.used_bytes() as f64) < 4.0
    }));
    assert!(dev.used_bytes() as f64 <= target);

    ctl.stop_run(run);
    assert_eq!(dev.used_bytes(), 0);
    assert_eq!(dev.cached_bytes(), 0);
}

#[test]
fn out_of_range_percentage_is_clamped() {
    let req = LoadRequest::new(LoadKind::Cpu, 150.0, vec![]);
    assert_eq!(req.percentage, Percentage::FULL);

    let mut cfg = LoadConfig::fast();
    cfg.cpu.units = Some(1);
    let ctl = LoadTestController::with_host_devices(cfg);
    let run = ctl.start_run(req).unwrap();
    assert_eq!(run.requests()[0].percentage.value(), 100.0);
    ctl.stop_run(run);
}

#[test]
fn combined_plan_shares_one_token() {
    let mut cfg = LoadConfig::fast();
    cfg.cpu.units = Some(2);
    cfg.host_devices = 2;
    let ctl = LoadTestController::with_host_devices(cfg);
    let run = ctl
        .start_plan(&[
            LoadRequest::cpu(20.0),
            LoadRequest::new(LoadKind::GpuCombined, 40.0, vec![1]),
            LoadRequest::new(LoadKind::GpuVram, 10.0, vec![]),
        ])
        .unwrap();

    let mut names = run.worker_names();
    names.sort();
    assert_eq!(
        names,
        vec!["cpu-0", "cpu-1", "gpu-compute-1", "gpu-render-1", "gpu-vram-0", "gpu-vram-1"]
    );
    assert!(run.token().holders() > 1);
    let summary = ctl.stop_run(run);
    assert_eq!(summary.units, 6);
}

#[test]
fn closing_a_render_window_stops_the_whole_run() {
    let mut cfg = LoadConfig::fast();
    cfg.cpu.units = Some(2);
    let surfaces = OffscreenSurfaceFactory::new();
    let devices = DeviceSet::host(1, 16 * MIB, 32);
    let ctl = LoadTestController::new(cfg, devices, Arc::new(surfaces.clone()));

    let run = ctl
        .start_plan(&[
            LoadRequest::cpu(10.0),
            LoadRequest::new(LoadKind::GpuRender, 50.0, vec![]),
        ])
        .unwrap();
    assert!(wait_until(Duration::from_secs(2), || surfaces.frames_presented() > 0));

    surfaces.request_close();
    assert!(wait_until(Duration::from_secs(2), || run.token().is_set()));
    assert!(wait_until(Duration::from_secs(2), || run.alive() == 0));
    assert_eq!(surfaces.open_surfaces(), 0);
    ctl.stop_run(run);
}

#[test]
fn dropping_a_run_stops_it() {
    let mut cfg = LoadConfig::fast();
    cfg.cpu.units = Some(1);
    let ctl = LoadTestController::with_host_devices(cfg);
    {
        let run = ctl.start_run(LoadRequest::cpu(0.0)).unwrap();
        assert!(ctl.is_running());
        let _ = run.id();
    }
    assert!(!ctl.is_running());
    ctl.start_run(LoadRequest::cpu(0.0)).unwrap().stop();
}
