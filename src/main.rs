use std::process::ExitCode;
use std::sync::Arc;
use std::time::Instant;

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use rtframework::{
    Camera, ContextConfig, Material, Mat4, PipelineConfig, RawGeometry, RaytracingPipeline,
    RecordingDevice, Result, RtContext, RtDevice, RtModel, RtScene, Transform, Vec3, WgpuDevice,
};

/// Command-line options of the demo.
#[derive(Parser, Debug, Clone)]
#[command(version, about = "Renders a small scene through the hybrid raytracing context")]
struct Options {
    /// Frames to render before exiting.
    #[arg(long, default_value_t = 16)]
    frames: u32,
    #[arg(long, default_value_t = 640)]
    width: u32,
    #[arg(long, default_value_t = 360)]
    height: u32,
    /// Record commands without opening a GPU.
    #[arg(long, default_value_t = false)]
    headless: bool,
    /// Use the compute fallback even when native raytracing is available.
    #[arg(long, default_value_t = false)]
    emulated: bool,
}

fn open_device(options: &Options) -> Arc<dyn RtDevice> {
    if options.headless {
        return Arc::new(RecordingDevice::native());
    }
    match WgpuDevice::new() {
        Ok(device) => Arc::new(device),
        Err(err) => {
            warn!("{err}, recording commands without a GPU instead");
            Arc::new(RecordingDevice::native())
        }
    }
}

fn build_scene(ctx: &mut RtContext, pipeline: &mut RaytracingPipeline) -> Result<RtScene> {
    let floor = pipeline.add_material(Material::diffuse(Vec3::new(0.55, 0.55, 0.5)));
    let red = pipeline.add_material(Material::diffuse(Vec3::new(0.8, 0.2, 0.15)));
    let mirror = pipeline.add_material(Material::reflective(
        Vec3::new(0.9, 0.9, 0.95),
        Vec3::ONE,
        0.8,
        0.05,
    ));

    let mut scene = RtScene::new("Demo");
    scene.add_model_with_material(
        RtModel::new(ctx, "Floor", &RawGeometry::plane(8.0))?,
        Mat4::IDENTITY,
        floor,
    );
    scene.add_model_with_material(
        RtModel::new(ctx, "Cube", &RawGeometry::cube())?,
        Transform::from_position(Vec3::new(-0.8, 0.5, 0.0)).matrix(),
        red,
    );
    scene.add_model_with_material(
        RtModel::new(ctx, "Sphere", &RawGeometry::sphere(32, 16))?,
        Transform::from_position(Vec3::new(0.9, 0.5, 0.3))
            .uniform_scale(0.5)
            .matrix(),
        mirror,
    );
    Ok(scene)
}

fn run(options: &Options) -> Result<()> {
    let device = open_device(options);

    let mut config = ContextConfig::from_env().label("Demo Context");
    if options.emulated {
        config = config.force_emulated(true);
    }
    let mut ctx = RtContext::new(device.clone(), config)?;
    info!(device = device.name(), mode = %ctx.mode(), "context ready");

    let pipeline_config = PipelineConfig::default();
    let frames_in_flight = pipeline_config.frame_count;
    let mut pipeline = RaytracingPipeline::new(pipeline_config);
    let scene = build_scene(&mut ctx, &mut pipeline)?;
    pipeline.set_scene(scene);
    pipeline.set_camera(
        Camera::new()
            .at(Vec3::new(0.0, 1.5, 4.5))
            .looking_at(Vec3::new(0.0, 0.4, 0.0)),
    );

    pipeline.load_resources(&mut ctx)?;
    pipeline.create_output_resource(&mut ctx, options.width, options.height)?;

    let start = Instant::now();
    let mut prev_frame = 0;
    for frame in 0..options.frames {
        let cur_frame = frame % frames_in_flight;
        let mut list = device.create_command_list(&format!("Frame {frame}"))?;
        {
            let mut rec = ctx.record(list.as_mut());
            pipeline.build_acceleration_structures(&mut rec)?;
            pipeline.update(
                start.elapsed().as_secs_f32(),
                frame as u64,
                prev_frame,
                cur_frame,
                options.width,
                options.height,
            )?;
            pipeline.render(&mut rec, cur_frame, options.width, options.height)?;
        }
        device.submit(list)?;

        // Constant buffers are reused once every frame in flight was written.
        if cur_frame + 1 == frames_in_flight {
            device.wait_idle()?;
        }
        prev_frame = cur_frame;
    }
    device.wait_idle()?;

    let elapsed = start.elapsed();
    info!(
        frames = options.frames,
        accumulated = pipeline.accumulated_frames(),
        ms_per_frame = elapsed.as_secs_f64() * 1000.0 / options.frames.max(1) as f64,
        "rendering finished"
    );

    pipeline.release();
    Ok(())
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let options = Options::parse();

    match run(&options) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(category = ?err.category(), fatal = err.is_fatal(), "{err}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_render_sixteen_frames() {
        let options = Options::try_parse_from(["rtframework"]).unwrap();
        assert_eq!((options.frames, options.width, options.height), (16, 640, 360));
        assert!(!options.headless && !options.emulated);
    }

    #[test]
    fn flags_and_sizes_are_parsed() {
        let options = Options::try_parse_from([
            "rtframework",
            "--headless",
            "--emulated",
            "--frames",
            "3",
            "--width",
            "100",
            "--height",
            "60",
        ])
        .unwrap();
        assert!(options.headless && options.emulated);
        assert_eq!((options.frames, options.width, options.height), (3, 100, 60));
    }

    #[test]
    fn unknown_arguments_are_rejected() {
        assert!(Options::try_parse_from(["rtframework", "--size", "1x1"]).is_err());
    }
}
