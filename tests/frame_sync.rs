//! Simulation and rendering on separate threads.

mod common;

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use glam::Vec3;
use parking_lot::Mutex;

use cluster_renderer::scene::Light;
use cluster_renderer::{FrameLimiter, FrameSync, RendererConfig};
use common::{Backend, CubeMesh};

#[test]
fn test_render_loop_consumes_every_simulated_frame() {
    common::init_logger();
    const FRAMES: u32 = 20;
    let Some(mut renderer) = common::renderer(Backend::Software, RendererConfig::default()) else {
        return;
    };
    let cube = CubeMesh::new(renderer.backend_mut(), 0.5);
    let view = Arc::new(Mutex::new(common::cube_view(
        1280,
        720,
        &cube,
        vec![Light::point(Vec3::ZERO, 10.0, Vec3::ONE)],
    )));
    let sync = Arc::new(FrameSync::new());

    let simulate = {
        let (sync, view) = (Arc::clone(&sync), Arc::clone(&view));
        thread::spawn(move || {
            let mut steps = 0u32;
            while sync.wait_render() {
                steps += 1;
                let mut view = view.lock();
                view.lights[0].position.x = steps as f32 * 0.01;
                drop(view);
                sync.post_simulate();
            }
            steps
        })
    };

    let mut limiter = FrameLimiter::new(Some(500.0));
    let mut rendered = Vec::new();
    for _ in 0..FRAMES {
        assert!(sync.wait_simulate());
        let snapshot = view.lock().clone();
        sync.post_render();
        renderer.render_frame(&snapshot).unwrap();
        rendered.push(snapshot.lights[0].position.x);
        limiter.wait();
    }
    sync.close();
    let steps = simulate.join().unwrap();
    renderer.shutdown().unwrap();

    assert_eq!(renderer.frame_context().frame_number, FRAMES as u64);
    // The simulation runs at most one step ahead of rendering.
    assert!(steps == FRAMES || steps == FRAMES + 1, "steps {steps}");
    assert!(rendered.windows(2).all(|w| w[1] > w[0]), "a frame was repeated");
}

#[test]
fn test_limiter_paces_frames() {
    let mut limiter = FrameLimiter::new(Some(100.0));
    let budget = limiter.budget().unwrap();
    assert!(budget > Duration::from_micros(9_990) && budget < Duration::from_micros(10_010));

    let start = Instant::now();
    for _ in 0..5 {
        limiter.wait();
    }
    assert!(start.elapsed() >= Duration::from_millis(40));
    assert!(limiter.last_frame_time() >= Duration::from_millis(9));
}

#[test]
fn test_close_unblocks_both_sides() {
    let sync = Arc::new(FrameSync::new());
    let renderer_side = {
        let sync = Arc::clone(&sync);
        thread::spawn(move || sync.wait_simulate())
    };
    thread::sleep(Duration::from_millis(10));
    sync.close();
    assert!(!renderer_side.join().unwrap());
    assert!(sync.is_closed());
    assert!(!sync.wait_render());
}
