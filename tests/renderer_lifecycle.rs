//! Renderer setup, resizing, queue sharing and teardown.

mod common;

use glam::Vec3;
use rstest::rstest;

use cluster_renderer::backend::{pod_vec_from_bytes, Extent2D};
use cluster_renderer::cluster::ClusterUniforms;
use cluster_renderer::frame_graph::Pass;
use cluster_renderer::renderer::shadow::{SHADOW_CASCADE_COUNT, SHADOW_MAP_SIZE};
use cluster_renderer::resources::QueueSharing;
use cluster_renderer::scene::Light;
use cluster_renderer::{
    ClusterRenderer, GpuTimer, RendererConfig, RendererError, SoftwareBackend, SoftwareConfig,
};
use common::{Backend, CubeMesh};

fn software(config: SoftwareConfig, renderer: RendererConfig) -> ClusterRenderer<SoftwareBackend> {
    common::init_logger();
    ClusterRenderer::new(SoftwareBackend::new(config), renderer).unwrap()
}

fn lights() -> Vec<Light> {
    vec![Light::point(Vec3::ZERO, 10.0, Vec3::ONE)]
}

fn sunlit() -> Vec<Light> {
    let mut lights = lights();
    lights.push(Light::directional(Vec3::new(-0.4, -1.0, -0.2), Vec3::ONE));
    lights
}

#[rstest]
#[case::software(Backend::Software)]
#[case::vulkan(Backend::Vulkan)]
fn test_uniforms_reach_current_slot(#[case] backend: Backend) {
    common::init_logger();
    let Some(mut renderer) = common::renderer(backend, RendererConfig::default()) else {
        return;
    };
    let cube = CubeMesh::new(renderer.backend_mut(), 0.5);
    let view = common::cube_view(1280, 720, &cube, lights());

    renderer.update(&view).unwrap();
    let slot = renderer.frame_context().slot;
    let bytes = renderer.uniforms().unwrap().read_back(renderer.backend(), slot).unwrap();
    let uniforms: Vec<ClusterUniforms> = pod_vec_from_bytes(&bytes);
    assert_eq!(uniforms.len(), 1);
    assert_eq!(uniforms[0].num_lights, 1);
    assert_eq!(uniforms[0].grid_dim, [20, 12]);
    assert_eq!(uniforms[0].cam_pos, Vec3::new(0.0, 0.0, 5.0));

    renderer.draw(&view).unwrap();
    renderer.submit().unwrap();
    assert_eq!(renderer.frame_context().frame_number, 1);
    assert_eq!(renderer.frame_context().slot, 1);

    renderer.shutdown().unwrap();
    cube.destroy(renderer.backend_mut());
}

#[rstest]
#[case::software(Backend::Software)]
#[case::vulkan(Backend::Vulkan)]
fn test_resize_keeps_rendering(#[case] backend: Backend) {
    common::init_logger();
    let Some(mut renderer) = common::renderer(backend, RendererConfig::default()) else {
        return;
    };
    let cube = CubeMesh::new(renderer.backend_mut(), 0.5);
    let mut view = common::cube_view(1280, 720, &cube, lights());
    renderer.render_frame(&view).unwrap();

    view.resize(800, 600);
    renderer.render_frame(&view).unwrap();
    assert_eq!(renderer.frame_context().extent.width, 800);
    assert_eq!(renderer.frame_context().extent.height, 600);

    renderer.resize(1920, 1080).unwrap();
    view.resize(1920, 1080);
    renderer.render_frame(&view).unwrap();

    renderer.shutdown().unwrap();
    cube.destroy(renderer.backend_mut());
}

#[test]
fn test_resize_releases_old_targets() {
    let mut renderer = software(SoftwareConfig::default(), RendererConfig::default());
    let cube = CubeMesh::new(renderer.backend_mut(), 0.5);
    let mut view = common::cube_view(1280, 720, &cube, lights());
    renderer.render_frame(&view).unwrap();
    let before = renderer.backend().stats();

    view.resize(800, 600);
    renderer.render_frame(&view).unwrap();
    let after = renderer.backend().stats();
    assert_eq!(after.live_images, before.live_images);
    assert_eq!(after.live_framebuffers, before.live_framebuffers);
    assert_eq!(after.live_buffers, before.live_buffers);
}

#[rstest]
#[case::too_wide(1921, 1080)]
#[case::too_tall(1920, 1081)]
fn test_oversized_viewport_is_rejected(#[case] width: u32, #[case] height: u32) {
    let result = ClusterRenderer::new(
        SoftwareBackend::new(SoftwareConfig::default()),
        RendererConfig::default().with_viewport(width, height),
    );
    assert!(matches!(result, Err(RendererError::ViewportTooLarge { .. })));

    let mut renderer = software(SoftwareConfig::default(), RendererConfig::default());
    assert!(matches!(
        renderer.resize(width, height),
        Err(RendererError::ViewportTooLarge { .. })
    ));
    assert_eq!(renderer.frame_context().extent.width, 1280);
}

#[test]
fn test_empty_viewport_is_rejected() {
    let mut renderer = software(SoftwareConfig::default(), RendererConfig::default());
    assert!(matches!(renderer.resize(0, 720), Err(RendererError::EmptyViewport { .. })));
}

#[test]
fn test_ownership_transfer_on_split_queues() {
    let config = RendererConfig::default().with_queue_sharing(QueueSharing::OwnershipTransfer);
    let mut renderer = software(SoftwareConfig::split_queues(), config);
    let cube = CubeMesh::new(renderer.backend_mut(), 0.5);
    let view = common::cube_view(1280, 720, &cube, lights());

    for _ in 0..3 {
        renderer.render_frame(&view).unwrap();
    }
    let stats = renderer.backend().stats();
    assert_eq!(stats.validation_errors, 0);
    // Seven grid buffers, graphics to compute and back, every frame.
    assert_eq!(stats.ownership_transfers, 3 * 2 * 7);
}

#[test]
fn test_concurrent_sharing_needs_no_transfers() {
    let mut renderer = software(SoftwareConfig::split_queues(), RendererConfig::default());
    let cube = CubeMesh::new(renderer.backend_mut(), 0.5);
    let view = common::cube_view(1280, 720, &cube, lights());

    renderer.render_frame(&view).unwrap();
    let stats = renderer.backend().stats();
    assert_eq!(stats.validation_errors, 0);
    assert_eq!(stats.ownership_transfers, 0);
}

#[test]
fn test_grid_cleared_at_end_of_frame() {
    let mut renderer = software(SoftwareConfig::default(), RendererConfig::default());
    let cube = CubeMesh::new(renderer.backend_mut(), 0.5);
    let view = common::cube_view(1280, 720, &cube, lights());
    let fills_after_init = renderer.backend().stats().fills;

    renderer.render_frame(&view).unwrap();
    assert_eq!(renderer.backend().stats().fills - fills_after_init, 7);

    let grid = renderer.grid_buffers().unwrap();
    for buffer in grid.all() {
        let size = renderer.backend().buffer_size(buffer).unwrap();
        let words = common::read_words(renderer.backend(), buffer, (size / 4).min(64) as u32);
        assert!(words.iter().all(|&w| w == 0));
    }
}

#[test]
fn test_submission_order_and_dispatches() {
    let mut renderer = software(SoftwareConfig::default(), RendererConfig::default());
    let cube = CubeMesh::new(renderer.backend_mut(), 0.5);
    let view = common::cube_view(1280, 720, &cube, lights());
    let queues = std::sync::Arc::new(parking_lot::Mutex::new(Vec::new()));
    let sink = std::sync::Arc::clone(&queues);
    renderer.on_submit_completed(move |_, queue| sink.lock().push(queue));

    let before = renderer.backend().stats();
    renderer.render_frame(&view).unwrap();
    let after = renderer.backend().stats();

    use cluster_renderer::SubmitQueue;
    assert_eq!(
        *queues.lock(),
        vec![SubmitQueue::EarlyGraphics, SubmitQueue::Compute, SubmitQueue::Graphics]
    );
    assert_eq!(after.submissions - before.submissions, 3);
    assert_eq!(after.dispatches - before.dispatches, 3);
    // One clustering draw and one forward draw.
    assert_eq!(after.draws - before.draws, 2);
}

#[test]
fn test_shadow_draws_per_cascade() {
    let mut renderer = software(SoftwareConfig::default(), RendererConfig::default());
    let cube = CubeMesh::new(renderer.backend_mut(), 0.5);
    let view = common::cube_view(1280, 720, &cube, sunlit());

    let before = renderer.backend().stats();
    renderer.render_frame(&view).unwrap();
    let after = renderer.backend().stats();
    assert_eq!(after.validation_errors, 0);
    // One shadow draw per cascade, then clustering and forward.
    assert_eq!(after.draws - before.draws, SHADOW_CASCADE_COUNT as u64 + 2);
}

#[rstest]
#[case::software(Backend::Software)]
#[case::vulkan(Backend::Vulkan)]
fn test_sun_renders_shadow_cascades(#[case] backend: Backend) {
    common::init_logger();
    let Some(mut renderer) = common::renderer(backend, RendererConfig::default()) else {
        return;
    };
    let cube = CubeMesh::new(renderer.backend_mut(), 0.5);
    let mut view = common::cube_view(1280, 720, &cube, sunlit());
    renderer.render_frame(&view).unwrap();

    let cascades = *renderer.shadow_cascades().unwrap();
    assert!(cascades.windows(2).all(|w| w[0].split_depth < w[1].split_depth));
    let shadow = renderer.frame_graph().pass("shadow").and_then(Pass::as_graphics).unwrap();
    assert_eq!(shadow.targets().len(), SHADOW_CASCADE_COUNT);
    assert_eq!(shadow.extent(), Some(Extent2D::new(SHADOW_MAP_SIZE, SHADOW_MAP_SIZE)));
    let maps = shadow.targets().to_vec();

    // Shadow maps do not follow the viewport.
    view.resize(800, 600);
    renderer.render_frame(&view).unwrap();
    let shadow = renderer.frame_graph().pass("shadow").and_then(Pass::as_graphics).unwrap();
    assert_eq!(shadow.targets(), &maps[..]);

    renderer.shutdown().unwrap();
    cube.destroy(renderer.backend_mut());
}

#[test]
fn test_timings_after_first_frame() {
    let mut renderer = software(SoftwareConfig::default(), RendererConfig::default());
    let cube = CubeMesh::new(renderer.backend_mut(), 0.5);
    let view = common::cube_view(1280, 720, &cube, lights());
    assert!(renderer.frame_timings().is_none());

    renderer.render_frame(&view).unwrap();
    let timings = renderer.frame_timings().unwrap();
    assert_eq!(timings.frame_number, 0);
    for timer in [GpuTimer::DepthPass, GpuTimer::Clustering, GpuTimer::LightGrids, GpuTimer::Onscreen] {
        assert!(timings.get(timer).is_some(), "missing {}", timer.name());
    }
    assert!(timings.total_ms() >= 0.0);
}

#[test]
fn test_gpu_timing_disabled() {
    let config = RendererConfig::default().with_gpu_timing(false);
    let mut renderer = software(SoftwareConfig::default(), config);
    let cube = CubeMesh::new(renderer.backend_mut(), 0.5);
    renderer.render_frame(&common::cube_view(1280, 720, &cube, lights())).unwrap();
    assert!(renderer.frame_timings().is_none());
    assert_eq!(renderer.backend().stats().live_query_pools, 0);
}

#[test]
fn test_shutdown_releases_buffers_and_targets() {
    let mut renderer = software(SoftwareConfig::default(), RendererConfig::default());
    let view = common::cube_view(1280, 720, &CubeMesh::new(renderer.backend_mut(), 0.5), lights());
    renderer.render_frame(&view).unwrap();
    let cube_buffers = 2;

    renderer.shutdown().unwrap();
    let stats = renderer.backend().stats();
    assert_eq!(stats.live_buffers, cube_buffers);
    assert_eq!(stats.live_images, 0);
    assert_eq!(stats.live_framebuffers, 0);
    assert_eq!(stats.live_render_passes, 0);

    assert!(matches!(renderer.update(&view), Err(RendererError::ShutDown)));
    assert!(matches!(renderer.grid_buffers(), Err(RendererError::ShutDown)));
    // A second shutdown is a no-op.
    renderer.shutdown().unwrap();
}
