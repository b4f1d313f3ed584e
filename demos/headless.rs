//! # Headless clustered lighting demo
//!
//! Renders a grid of cubes lit by orbiting point lights and a shadow casting
//! sun, without a window.
//! The simulation runs on its own thread and hands each frame to the render
//! loop through [`FrameSync`]. GPU timings and light list sizes are logged.
//!
//! ```bash
//! RUST_LOG=info cargo run --example headless -- --lights 256 --frames 120
//! cargo run --example headless -- --backend software --max-fps 30
//! ```

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;

use clap::Parser;
use glam::{Mat4, Vec3};
use parking_lot::Mutex;

use cluster_renderer::backend::{
    pod_vec_from_bytes, BufferDescriptor, BufferHandle, BufferUsage, GraphicsBackend,
    MemoryProperties,
};
use cluster_renderer::scene::{Aabb, BatchKind, DrawBatch};
use cluster_renderer::{
    Camera, ClusterRenderer, FrameLimiter, FrameSync, Light, RenderView, RendererConfig,
    SoftwareBackend, SoftwareConfig, SubmitQueue,
};

/// Graphics backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
enum CliBackend {
    /// Vulkan when available, the software backend otherwise.
    #[default]
    Auto,
    /// Native Vulkan via ash.
    Vulkan,
    /// CPU reference backend.
    Software,
}

#[derive(Debug, Parser)]
#[command(name = "headless", about = "Clustered forward lighting without a window")]
struct Args {
    #[arg(long, value_enum, default_value_t = CliBackend::Auto)]
    backend: CliBackend,

    #[arg(long, default_value_t = 1280)]
    width: u32,

    #[arg(long, default_value_t = 720)]
    height: u32,

    /// Number of point lights
    #[arg(long, default_value_t = 64)]
    lights: u32,

    /// Frames to render before exiting
    #[arg(long, default_value_t = 60)]
    frames: u64,

    /// Frame rate cap, unlimited when omitted
    #[arg(long)]
    max_fps: Option<f32>,

    /// Enable Vulkan validation layers
    #[arg(long)]
    validation: bool,

    /// Hand grid buffers between queues with ownership transfers
    #[arg(long)]
    ownership_transfer: bool,
}

fn create_backend(args: &Args) -> Result<Box<dyn GraphicsBackend>, Box<dyn std::error::Error>> {
    if args.backend != CliBackend::Software {
        match create_vulkan(args.validation) {
            Ok(backend) => return Ok(backend),
            Err(err) if args.backend == CliBackend::Auto => {
                log::warn!("Vulkan unavailable ({}), using the software backend", err);
            }
            Err(err) => return Err(err),
        }
    }
    Ok(Box::new(SoftwareBackend::new(SoftwareConfig::default())))
}

#[cfg(feature = "vulkan-backend")]
fn create_vulkan(validation: bool) -> Result<Box<dyn GraphicsBackend>, Box<dyn std::error::Error>> {
    let config = cluster_renderer::VulkanConfig {
        validation,
        ..Default::default()
    };
    Ok(Box::new(cluster_renderer::VulkanBackend::new(config)?))
}

#[cfg(not(feature = "vulkan-backend"))]
fn create_vulkan(_validation: bool) -> Result<Box<dyn GraphicsBackend>, Box<dyn std::error::Error>> {
    Err("built without the vulkan-backend feature".into())
}

fn create_cube(backend: &mut dyn GraphicsBackend) -> Result<(BufferHandle, BufferHandle, u32), Box<dyn std::error::Error>> {
    let mut vertices: Vec<[f32; 6]> = Vec::with_capacity(24);
    let mut indices: Vec<u32> = Vec::with_capacity(36);
    for (n, u, v) in [
        (Vec3::X, Vec3::Y, Vec3::Z),
        (Vec3::NEG_X, Vec3::Y, Vec3::NEG_Z),
        (Vec3::Y, Vec3::Z, Vec3::X),
        (Vec3::NEG_Y, Vec3::Z, Vec3::NEG_X),
        (Vec3::Z, Vec3::X, Vec3::Y),
        (Vec3::NEG_Z, Vec3::X, Vec3::NEG_Y),
    ] {
        let base = vertices.len() as u32;
        for (su, sv) in [(-1.0, -1.0), (1.0, -1.0), (1.0, 1.0), (-1.0, 1.0)] {
            let p = (n + u * su + v * sv) * 0.5;
            vertices.push([p.x, p.y, p.z, n.x, n.y, n.z]);
        }
        indices.extend_from_slice(&[base, base + 1, base + 2, base, base + 2, base + 3]);
    }

    let host = MemoryProperties::HOST_VISIBLE | MemoryProperties::HOST_COHERENT;
    let mut upload = |label: &str, usage: BufferUsage, bytes: &[u8]| {
        let buffer = backend.create_buffer(
            &BufferDescriptor::new(bytes.len() as u64, usage)
                .with_label(label)
                .with_memory(host),
        )?;
        backend.write_buffer(buffer, 0, bytes)?;
        Ok::<_, cluster_renderer::backend::BackendError>(buffer)
    };
    let vertex_buffer = upload("cube_vertices", BufferUsage::VERTEX, bytemuck::cast_slice(&vertices))?;
    let index_buffer = upload("cube_indices", BufferUsage::INDEX, bytemuck::cast_slice(&indices))?;
    Ok((vertex_buffer, index_buffer, indices.len() as u32))
}

/// Lights orbiting the origin at `time` seconds, plus a sun casting shadows.
fn orbiting_lights(count: u32, time: f32) -> Vec<Light> {
    let sun = Light::directional(Vec3::new(-0.4, -1.0, -0.3), Vec3::splat(0.2));
    (0..count)
        .map(|i| {
            let t = i as f32 / count.max(1) as f32;
            let angle = t * std::f32::consts::TAU + time * 0.5;
            let radius = 3.0 + 4.0 * t;
            let position = Vec3::new(angle.cos() * radius, 0.5 + (t * 7.0).sin(), angle.sin() * radius);
            let color = Vec3::new(t, 1.0 - t, 0.5 + 0.5 * (angle * 3.0).sin());
            Light::point(position, 2.5, color)
        })
        .chain(std::iter::once(sun))
        .collect()
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut config = RendererConfig::default().with_viewport(args.width, args.height);
    if args.ownership_transfer {
        config = config.with_queue_sharing(cluster_renderer::resources::QueueSharing::OwnershipTransfer);
    }
    let mut renderer = ClusterRenderer::new(create_backend(&args)?, config)?;

    let (vertex_buffer, index_buffer, index_count) = create_cube(&mut **renderer.backend_mut())?;
    let mut view = RenderView::new(Camera::new(Vec3::new(0.0, 6.0, 14.0), Vec3::ZERO), args.width, args.height);
    for x in -3..=3 {
        for z in -3..=3 {
            view.add_batch(
                BatchKind::Opaque,
                DrawBatch {
                    vertex_buffer,
                    index_buffer,
                    index_count,
                    transform: Mat4::from_translation(Vec3::new(x as f32 * 2.0, 0.0, z as f32 * 2.0)),
                    bounds: Aabb::from_center_extent(Vec3::ZERO, Vec3::splat(0.5)),
                },
            );
        }
    }

    let grid = renderer.grid_buffers()?;
    let list_size = Arc::new(AtomicU32::new(0));
    {
        let list_size = Arc::clone(&list_size);
        renderer.on_submit_completed(move |backend, queue| {
            if queue != SubmitQueue::Compute {
                return;
            }
            match backend.read_buffer(grid.grid_light_count_total, 0, 4) {
                Ok(bytes) => {
                    let total = pod_vec_from_bytes::<u32>(&bytes).first().copied().unwrap_or(0);
                    list_size.store(total, Ordering::Relaxed);
                }
                Err(err) => log::warn!("Failed to read light list size: {}", err),
            }
        });
    }

    let shared = Arc::new(Mutex::new(view.clone()));
    let sync = Arc::new(FrameSync::new());
    let simulate = {
        let (shared, sync) = (Arc::clone(&shared), Arc::clone(&sync));
        let lights = args.lights;
        thread::spawn(move || {
            let mut time = 0.0f32;
            while sync.wait_render() {
                shared.lock().lights = orbiting_lights(lights, time);
                time += 1.0 / 60.0;
                sync.post_simulate();
            }
        })
    };

    let mut limiter = FrameLimiter::new(args.max_fps);
    let mut result = Ok(());
    for frame in 0..args.frames {
        if !sync.wait_simulate() {
            break;
        }
        view.lights = shared.lock().lights.clone();
        sync.post_render();

        if let Err(err) = renderer.render_frame(&view) {
            result = Err(err);
            break;
        }
        limiter.wait();

        if frame % 30 == 0 {
            log::info!(
                "Frame {}: {:.2} ms, {} light list entries",
                frame,
                limiter.last_frame_time().as_secs_f64() * 1000.0,
                list_size.load(Ordering::Relaxed)
            );
            if let Some(timings) = renderer.frame_timings() {
                for (timer, ms) in &timings.entries {
                    log::info!("  {:<18} {:.3} ms", timer.name(), ms);
                }
            }
        }
    }

    sync.close();
    if simulate.join().is_err() {
        log::error!("Simulation thread panicked");
    }
    renderer.shutdown()?;
    renderer.backend_mut().destroy_buffer(vertex_buffer);
    renderer.backend_mut().destroy_buffer(index_buffer);
    result.map_err(Into::into)
}
