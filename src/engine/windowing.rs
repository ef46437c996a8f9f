//! Companion window (2025 winit style: ApplicationHandler).
//!
//! The desktop window exists to host the VR session on a desktop: one VR
//! cycle runs per redraw, and the compositor's `wait_get_poses` does the
//! pacing, so the event loop polls instead of waiting on the desktop vsync.

use std::sync::Arc;

use winit::application::ApplicationHandler;
use winit::event::{ElementState, KeyEvent, WindowEvent};
use winit::event_loop::{ActiveEventLoop, ControlFlow, EventLoop};
use winit::keyboard::{Key, NamedKey};
use winit::window::{Window, WindowAttributes, WindowId};

use crate::engine::scene::SceneRenderer;
use crate::engine::vr::{ContextState, VrContext};
use crate::engine::{EngineError, EngineResult};

pub struct Windowing;

impl Windowing {
    /// Run the VR cycle under a companion window until it closes. The
    /// context must already be initialized with eyes set up.
    pub fn run_app(context: VrContext, scene: Box<dyn SceneRenderer>) -> EngineResult<()> {
        let event_loop =
            EventLoop::new().map_err(|e| EngineError::Windowing(e.to_string()))?;
        event_loop.set_control_flow(ControlFlow::Poll);

        let mut app = App {
            window: None,
            context,
            scene,
        };

        event_loop
            .run_app(&mut app)
            .map_err(|e| EngineError::Windowing(e.to_string()))?;

        Ok(())
    }
}

struct App {
    window: Option<Arc<Window>>,
    context: VrContext,
    scene: Box<dyn SceneRenderer>,
}

impl App {
    fn cycle(&mut self) -> EngineResult<()> {
        self.context.wait_get_poses()?;
        self.context.poll_events()?;
        self.context.render_eyes(self.scene.as_mut())
    }
}

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        let attrs: WindowAttributes = Window::default_attributes()
            .with_title("farsight")
            .with_inner_size(winit::dpi::LogicalSize::new(1024.0, 768.0));

        let window = event_loop
            .create_window(attrs)
            .expect("failed to create window");
        let window = Arc::new(window);

        self.window = Some(window);

        if let Some(w) = &self.window {
            w.request_redraw();
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        match event {
            WindowEvent::CloseRequested => {
                self.context.dispose();
                event_loop.exit();
            }

            WindowEvent::KeyboardInput {
                event:
                    KeyEvent {
                        logical_key: Key::Named(NamedKey::Escape),
                        state: ElementState::Pressed,
                        ..
                    },
                ..
            } => {
                self.context.dispose();
                event_loop.exit();
            }

            WindowEvent::RedrawRequested => {
                if self.context.state() != ContextState::Running {
                    return;
                }
                if let Err(e) = self.cycle() {
                    log::error!("VR cycle failed: {e}");
                    self.context.dispose();
                    event_loop.exit();
                    return;
                }
                if let Some(w) = &self.window {
                    w.request_redraw();
                }
            }

            _ => {}
        }
    }
}
