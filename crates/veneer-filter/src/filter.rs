//! The overlay stage: configuration, activation, runtime commands, teardown.
//!
//! # Lifecycle
//!
//! ```text
//! new(config)            compile x/y, no device work
//! configure_output()     frames contexts → format pair → init-mode position
//!                        → sync time base → kernel image → device session
//! activate() ...         one synchronizer step; events blend into the output
//! process_command()      replace x or y at runtime
//! teardown()             unload the module (also on drop)
//! ```

use tracing::{debug, info};

use veneer_core::error::{Result, VeneerError};
use veneer_core::frame::GpuFrame;
use veneer_core::types::InputRole;
use veneer_cuda::dispatch::PlaneCompositor;
use veneer_cuda::kernels::KernelImage;
use veneer_cuda::planes::{OverlayOffset, check_formats};
use veneer_cuda::session::DeviceSession;

use crate::config::{EvalMode, OverlayConfig};
use crate::framesync::{Activation, DualInputSync, EventHandler, SyncEvent};
use crate::link::{FrameQueue, InputLink, LinkInfo};
use crate::position::{Axis, FrameVars, PositionEvaluator};

struct DeviceStage {
    compositor: PlaneCompositor,
    session: DeviceSession,
}

/// Event handler: positions, blends, and queues each main frame.
pub struct OverlayBlend {
    position: PositionEvaluator,
    eval: EvalMode,
    stage: Option<DeviceStage>,
    output: FrameQueue<GpuFrame>,
    composited: u64,
    forwarded: u64,
}

impl OverlayBlend {
    fn new(position: PositionEvaluator, eval: EvalMode) -> Self {
        Self {
            position,
            eval,
            stage: None,
            output: FrameQueue::new(),
            composited: 0,
            forwarded: 0,
        }
    }

    /// Frames blended with an overlay so far.
    pub fn composited(&self) -> u64 {
        self.composited
    }

    /// Frames forwarded without an overlay so far.
    pub fn forwarded(&self) -> u64 {
        self.forwarded
    }
}

impl EventHandler<GpuFrame> for OverlayBlend {
    fn on_event(&mut self, event: SyncEvent<'_, GpuFrame>) -> Result<()> {
        let t = event.seconds();
        let SyncEvent {
            mut main,
            overlay,
            index,
            ..
        } = event;

        let Some(overlay) = overlay else {
            self.forwarded += 1;
            self.output.push(main);
            return Ok(());
        };
        let stage = self.stage.as_ref().ok_or(VeneerError::NotConfigured)?;

        if self.eval == EvalMode::Frame {
            self.position.evaluate_frame(&FrameVars {
                main_w: main.width,
                main_h: main.height,
                overlay_w: overlay.width,
                overlay_h: overlay.height,
                n: index,
                t,
                pos: main.pos,
            });
        }

        stage
            .compositor
            .composite(&stage.session, &mut main, overlay, self.position.offset())?;
        self.composited += 1;
        self.output.push(main);
        Ok(())
    }
}

/// GPU overlay stage over two frame links.
pub struct OverlayCudaFilter {
    config: OverlayConfig,
    sync: DualInputSync<GpuFrame, OverlayBlend>,
    output_info: Option<LinkInfo>,
}

impl OverlayCudaFilter {
    /// Validate `config` and compile its position expressions.
    pub fn new(config: OverlayConfig) -> Result<Self> {
        config.validate()?;
        let position = PositionEvaluator::new(&config.x, &config.y)?;
        let blend = OverlayBlend::new(position, config.eval);
        Ok(Self {
            config,
            sync: DualInputSync::new(blend),
            output_info: None,
        })
    }

    /// Configure the output from both input links, compiling the embedded
    /// kernel with NVRTC.
    pub fn configure_output(&mut self, main: &LinkInfo, overlay: &LinkInfo) -> Result<LinkInfo> {
        self.configure(main, overlay, None)
    }

    /// [`configure_output`](Self::configure_output) with a prebuilt kernel
    /// image.
    pub fn configure_output_with_image(
        &mut self,
        main: &LinkInfo,
        overlay: &LinkInfo,
        image: &KernelImage,
    ) -> Result<LinkInfo> {
        self.configure(main, overlay, Some(image))
    }

    fn configure(
        &mut self,
        main: &LinkInfo,
        overlay: &LinkInfo,
        image: Option<&KernelImage>,
    ) -> Result<LinkInfo> {
        if self.output_info.is_some() {
            return Err(VeneerError::Config("output is already configured".into()));
        }
        let main_ctx = main
            .frames_ctx
            .as_ref()
            .ok_or(VeneerError::MissingFramesContext(InputRole::Main))?;
        let overlay_ctx = overlay
            .frames_ctx
            .as_ref()
            .ok_or(VeneerError::MissingFramesContext(InputRole::Overlay))?;

        let plan = check_formats(main_ctx.sw_format, overlay_ctx.sw_format)?;

        let blend = self.sync.handler_mut();
        blend
            .position
            .set_dimensions(main.width, main.height, overlay.width, overlay.height);
        if blend.eval == EvalMode::Init {
            let offset = blend.position.evaluate();
            info!(x = %offset.x, y = offset.y, "Overlay position evaluated at init");
        }

        let time_base = self.sync.configure(
            self.config.sync_options(),
            main.time_base,
            overlay.time_base,
            self.config.time_base,
        )?;

        let compiled;
        let image = match image {
            Some(image) => image,
            None => {
                compiled = KernelImage::overlay()?;
                &compiled
            }
        };
        let session = DeviceSession::open(main_ctx.device().clone(), image)?;

        info!(
            main_format = %plan.main_format(),
            overlay_format = %plan.overlay_format(),
            main_size = ?(main.width, main.height),
            overlay_size = ?(overlay.width, overlay.height),
            %time_base,
            eval = ?self.config.eval,
            launches_per_frame = plan.launches(),
            "Overlay output configured"
        );

        self.sync.handler_mut().stage = Some(DeviceStage {
            compositor: PlaneCompositor::new(plan),
            session,
        });
        let info = LinkInfo {
            time_base,
            width: main.width,
            height: main.height,
            frames_ctx: Some(main_ctx.clone()),
        };
        self.output_info = Some(info.clone());
        Ok(info)
    }

    /// Run one synchronizer step; a delivered event leaves one frame in the
    /// output queue.
    pub fn activate(
        &mut self,
        main: &mut dyn InputLink<GpuFrame>,
        overlay: &mut dyn InputLink<GpuFrame>,
    ) -> Result<Activation> {
        if self.output_info.is_none() || self.sync.handler().stage.is_none() {
            return Err(VeneerError::NotConfigured);
        }
        self.sync.activate(main, overlay)
    }

    /// Replace the `x` or `y` expression.  In `init` mode the position is
    /// re-evaluated immediately; in `frame` mode it takes effect with the
    /// next event.
    pub fn process_command(&mut self, command: &str, arg: &str) -> Result<()> {
        let axis = Axis::from_name(command)
            .ok_or_else(|| VeneerError::UnknownCommand(command.to_string()))?;
        let blend = self.sync.handler_mut();
        blend.position.set_expression(axis, arg)?;
        match axis {
            Axis::X => self.config.x = arg.to_string(),
            Axis::Y => self.config.y = arg.to_string(),
        }
        if blend.eval == EvalMode::Init {
            let offset = blend.position.evaluate();
            debug!(command, arg, x = %offset.x, y = offset.y, "Overlay position re-evaluated");
        }
        Ok(())
    }

    pub fn pop_output(&mut self) -> Option<GpuFrame> {
        self.sync.handler_mut().output.pop()
    }

    pub fn drain_output(&mut self) -> Vec<GpuFrame> {
        self.sync.handler_mut().output.drain().collect()
    }

    /// Output link properties, once configured.
    pub fn output_info(&self) -> Option<&LinkInfo> {
        self.output_info.as_ref()
    }

    /// Offset from the most recent evaluation.
    pub fn position(&self) -> OverlayOffset {
        self.sync.handler().position.offset()
    }

    pub fn config(&self) -> &OverlayConfig {
        &self.config
    }

    pub fn sync(&self) -> &DualInputSync<GpuFrame, OverlayBlend> {
        &self.sync
    }

    pub fn blend(&self) -> &OverlayBlend {
        self.sync.handler()
    }

    /// Unload the kernel module.  Safe to call at any point, and more than
    /// once.
    pub fn teardown(&mut self) -> Result<()> {
        match self.sync.handler_mut().stage.take() {
            Some(mut stage) => stage.session.close(),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for OverlayCudaFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OverlayCudaFilter")
            .field("config", &self.config)
            .field("sync", &self.sync)
            .field("configured", &self.output_info.is_some())
            .finish()
    }
}
