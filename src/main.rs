mod engine;

use engine::cli::{Cli, CliCommand};
use engine::gpu::GpuContext;
use engine::scene::ClearRenderer;
use engine::vr::{MockVrRuntime, OwnerKey, Teleporter, VrContext};

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    // No native backend is linked in this build; the scripted runtime serves
    // a plausible device constellation.
    let runtime = MockVrRuntime::new();
    let mut context = VrContext::new(Box::new(runtime), "assets/vr/actions.json")
        .expect("VR context construction failed");
    context.init_system().expect("VR runtime initialization failed");

    let _teleporter = Teleporter::register(&context, OwnerKey::new());

    match cli.command {
        CliCommand::Headless { frames } => run_headless(context, frames),
        CliCommand::Run => run_windowed(context),
    }
}

fn run_windowed(mut context: VrContext) {
    let gpu = GpuContext::new().expect("no usable Vulkan device");
    context.setup_eyes(&gpu).expect("eye surface allocation failed");

    let scene = Box::new(ClearRenderer::new(&gpu, [0.05, 0.05, 0.08, 1.0]));
    engine::Windowing::run_app(context, scene).expect("windowing failed");
}

fn run_headless(mut context: VrContext, frames: u32) {
    for _ in 0..frames {
        context.wait_get_poses().expect("pose wait failed");
        context.poll_events().expect("event poll failed");
    }

    let headset_frame = context.headset().frame();
    if let Ok(world_from_headset) = context.transform_to_world(headset_frame) {
        let t = world_from_headset.translation.vector;
        log::info!(
            "headset world position after {frames} frames: [{:.3}, {:.3}, {:.3}]",
            t.x,
            t.y,
            t.z
        );
    }
    context.dispose();
}
