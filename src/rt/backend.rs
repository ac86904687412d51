//! Process-wide ray-tracing backend.
//!
//! Owns the device context, the compiled LiDAR module, its three program
//! groups and the linked pipeline. Construction compiles and links once;
//! afterwards the state is immutable and shared through `Arc`.

use parking_lot::Mutex;
use std::sync::Arc;

use super::context::{
    DeviceContext, LogCallback, LOG_LEVEL_ERROR, LOG_LEVEL_FATAL, LOG_LEVEL_INFO, LOG_LEVEL_WARN,
};
use super::device_code::{
    LIDAR_ANY_HIT, LIDAR_CLOSEST_HIT, LIDAR_DEVICE_CODE, LIDAR_MISS, LIDAR_RAYGEN,
};
use super::launch_params::LaunchLidarParams;
use super::module::{
    Module, ModuleCompileOptions, Pipeline, PipelineCompileOptions, PipelineLinkOptions,
    ProgramGroup, ProgramGroupDesc,
};
use super::sbt::{SbtRecordHeader, ShaderBindingTable};
use crate::device::{Device, Stream};
use crate::util::{BackendConfig, CheckStatus, Error, Result};

static INSTANCE: Mutex<Option<Arc<RayTracingBackend>>> = parking_lot::const_mutex(None);

/// Compiled LiDAR tracing pipeline bound to one device.
///
/// Fields drop in declaration order: pipeline, program groups, module,
/// then the context.
pub struct RayTracingBackend {
    pipeline: Pipeline,
    raygen: ProgramGroup,
    miss: ProgramGroup,
    hitgroup: ProgramGroup,
    module: Module,
    context: DeviceContext,
    config: BackendConfig,
}

impl RayTracingBackend {
    /// Build a backend on `device`.
    ///
    /// Most callers want the shared [`instance`](Self::instance) instead.
    pub fn new(device: &Device, config: &BackendConfig) -> Result<Self> {
        let context = DeviceContext::create(device).checked("DeviceContext::create")?;
        for level in [LOG_LEVEL_FATAL, LOG_LEVEL_ERROR, LOG_LEVEL_WARN, LOG_LEVEL_INFO] {
            context
                .set_log_callback(level, Some(route_to_tracing()))
                .checked("DeviceContext::set_log_callback")?;
        }

        let pipeline_options = PipelineCompileOptions::from(config);
        let module = Module::create(
            &context,
            &ModuleCompileOptions::from(config),
            &pipeline_options,
            &LIDAR_DEVICE_CODE,
        )
        .checked("Module::create")?;

        let raygen = ProgramGroup::create(
            &context,
            &ProgramGroupDesc::Raygen {
                module: &module,
                entry: LIDAR_RAYGEN,
            },
        )
        .checked("ProgramGroup::create(raygen)")?;
        let miss = ProgramGroup::create(
            &context,
            &ProgramGroupDesc::Miss {
                module: &module,
                entry: LIDAR_MISS,
            },
        )
        .checked("ProgramGroup::create(miss)")?;
        let hitgroup = ProgramGroup::create(
            &context,
            &ProgramGroupDesc::Hitgroup {
                module: &module,
                closest_hit: Some(LIDAR_CLOSEST_HIT),
                any_hit: Some(LIDAR_ANY_HIT),
            },
        )
        .checked("ProgramGroup::create(hitgroup)")?;

        let pipeline = Pipeline::create(
            &context,
            &pipeline_options,
            &PipelineLinkOptions::from(config),
            &[&raygen, &miss, &hitgroup],
        )
        .checked("Pipeline::create")?;
        pipeline
            .set_stack_size(
                config.direct_callable_stack_size_from_traversal,
                config.direct_callable_stack_size_from_state,
                config.continuation_stack_size,
                config.max_traversable_graph_depth,
            )
            .checked("Pipeline::set_stack_size")?;

        tracing::debug!(
            device = device.name(),
            context = context.id(),
            graph_depth = config.max_traversable_graph_depth,
            "ray tracing backend ready"
        );
        Ok(Self {
            pipeline,
            raygen,
            miss,
            hitgroup,
            module,
            context,
            config: config.clone(),
        })
    }

    /// Configure the shared backend. Returns the existing instance if one is
    /// already up; the config only applies to the first construction.
    pub fn init(config: &BackendConfig) -> Result<Arc<Self>> {
        let mut slot = INSTANCE.lock();
        if let Some(backend) = slot.as_ref() {
            if backend.config != *config {
                tracing::warn!("ray tracing backend already initialized, ignoring new config");
            }
            return Ok(Arc::clone(backend));
        }
        let device = Device::current().checked("Device::current")?;
        let backend = Arc::new(Self::new(&device, config)?);
        *slot = Some(Arc::clone(&backend));
        Ok(backend)
    }

    /// The shared backend, constructed with default settings on first use.
    pub fn instance() -> Result<Arc<Self>> {
        Self::init(&BackendConfig::default())
    }

    /// Release the shared backend. Teardown happens once the last handle is
    /// dropped. Returns false if there was nothing to release.
    pub fn shutdown() -> bool {
        let backend = INSTANCE.lock().take();
        match backend {
            Some(backend) => {
                tracing::debug!(handles = Arc::strong_count(&backend), "ray tracing backend shutdown");
                true
            }
            None => false,
        }
    }

    /// Enqueue a LiDAR launch over `params.fb_size` rays on `stream`.
    ///
    /// The parameter block is copied into a fresh device allocation that lives
    /// until the launch has executed.
    ///
    /// # Safety
    /// Every buffer referenced by `params` and `sbt` must stay valid until
    /// the launch has executed on `stream`.
    pub unsafe fn launch(
        &self,
        params: &LaunchLidarParams,
        sbt: &ShaderBindingTable,
        stream: &Stream,
    ) -> Result<()> {
        let width = u32::try_from(params.fb_size)
            .map_err(|_| Error::invalid_argument(format!("negative ray count {}", params.fb_size)))?;
        if width == 0 {
            return Ok(());
        }
        let block_size = std::mem::size_of::<LaunchLidarParams>();
        let block = stream
            .device()
            .alloc_managed(block_size)
            .checked("alloc_managed(launch params)")?;
        block.device_ptr().write(0, *params);

        self.pipeline
            .launch(stream, block.device_ptr(), block_size, sbt, width, 1, 1)
            .checked("Pipeline::launch")?;
        stream
            .enqueue("release_launch_params", move || {
                drop(block);
                Ok(())
            })
            .checked("Stream::enqueue")
    }

    pub fn raygen_header(&self) -> SbtRecordHeader {
        self.raygen.pack_header()
    }

    pub fn miss_header(&self) -> SbtRecordHeader {
        self.miss.pack_header()
    }

    pub fn hitgroup_header(&self) -> SbtRecordHeader {
        self.hitgroup.pack_header()
    }

    pub fn context(&self) -> &DeviceContext {
        &self.context
    }

    pub fn device(&self) -> &Device {
        self.context.device()
    }

    pub fn module(&self) -> &Module {
        &self.module
    }

    pub fn config(&self) -> &BackendConfig {
        &self.config
    }
}

/// Route backend diagnostics into `tracing` by severity.
fn route_to_tracing() -> LogCallback {
    Arc::new(|level: u32, tag: &str, message: &str| match level {
        LOG_LEVEL_FATAL => tracing::error!(target: "lidarsim::rt", tag, "fatal: {message}"),
        LOG_LEVEL_ERROR => tracing::error!(target: "lidarsim::rt", tag, "{message}"),
        LOG_LEVEL_WARN => tracing::warn!(target: "lidarsim::rt", tag, "{message}"),
        _ => tracing::info!(target: "lidarsim::rt", tag, "{message}"),
    })
}
