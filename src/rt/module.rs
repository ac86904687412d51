//! Modules, program groups and pipelines.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use super::context::{ContextRef, DeviceContext, LOG_LEVEL_ERROR, LOG_LEVEL_INFO};
use super::device_code::{
    AnyHitFn, ClosestHitFn, DeviceCode, MissFn, RaygenContext, RaygenFn,
    LIDAR_LAUNCH_PARAMS_VARIABLE,
};
use super::sbt::{SbtRecordHeader, ShaderBindingTable};
use crate::device::{DevicePtr, Status, Stream};
use crate::util::{BackendConfig, DebugLevel, OptLevel};

const MAX_PAYLOAD_VALUES: u32 = 8;
const MAX_ATTRIBUTE_VALUES: u32 = 8;
const MAX_TRACE_DEPTH: u32 = 31;
const DEFAULT_GRAPH_DEPTH: u32 = 2;

static NEXT_PROGRAM_GROUP_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TraversableGraphFlags {
    #[default]
    AllowAny,
    AllowSingleGas,
    AllowSingleLevelInstancing,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModuleCompileOptions {
    /// 0 means unlimited
    pub max_register_count: u32,
    pub opt_level: OptLevel,
    pub debug_level: DebugLevel,
}

impl Default for ModuleCompileOptions {
    /// Full debug info in debug builds, optimized otherwise.
    fn default() -> Self {
        Self::from(&BackendConfig::default())
    }
}

impl From<&BackendConfig> for ModuleCompileOptions {
    fn from(config: &BackendConfig) -> Self {
        Self {
            max_register_count: config.max_register_count,
            opt_level: config.opt_level,
            debug_level: config.debug_level,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PipelineCompileOptions {
    pub traversable_graph_flags: TraversableGraphFlags,
    pub uses_motion_blur: bool,
    pub num_payload_values: u32,
    pub num_attribute_values: u32,
    pub launch_params_variable_name: String,
}

impl Default for PipelineCompileOptions {
    fn default() -> Self {
        Self::from(&BackendConfig::default())
    }
}

impl From<&BackendConfig> for PipelineCompileOptions {
    fn from(config: &BackendConfig) -> Self {
        Self {
            traversable_graph_flags: TraversableGraphFlags::AllowAny,
            uses_motion_blur: false,
            num_payload_values: config.num_payload_values,
            num_attribute_values: config.num_attribute_values,
            launch_params_variable_name: LIDAR_LAUNCH_PARAMS_VARIABLE.to_string(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PipelineLinkOptions {
    pub max_trace_depth: u32,
    pub debug_level: DebugLevel,
}

impl Default for PipelineLinkOptions {
    fn default() -> Self {
        Self::from(&BackendConfig::default())
    }
}

impl From<&BackendConfig> for PipelineLinkOptions {
    fn from(config: &BackendConfig) -> Self {
        Self {
            max_trace_depth: config.max_trace_depth,
            debug_level: config.debug_level,
        }
    }
}

/// Device code compiled against a context.
pub struct Module {
    ctx: ContextRef,
    code: &'static DeviceCode,
}

impl Module {
    pub fn create(
        ctx: &DeviceContext,
        module_options: &ModuleCompileOptions,
        pipeline_options: &PipelineCompileOptions,
        code: &'static DeviceCode,
    ) -> Result<Self, Status> {
        if pipeline_options.num_payload_values > MAX_PAYLOAD_VALUES
            || pipeline_options.num_attribute_values > MAX_ATTRIBUTE_VALUES
        {
            return Err(Status::InvalidValue);
        }
        if pipeline_options.launch_params_variable_name != code.launch_params_variable {
            ctx.log(
                LOG_LEVEL_ERROR,
                "COMPILER",
                &format!(
                    "launch params variable '{}' not found in '{}'",
                    pipeline_options.launch_params_variable_name, code.name
                ),
            );
            return Err(Status::InvalidDeviceCode);
        }
        tracing::debug!(
            code = code.name,
            opt = ?module_options.opt_level,
            debug = ?module_options.debug_level,
            "module created"
        );
        ctx.log(LOG_LEVEL_INFO, "COMPILER", &format!("module '{}' compiled", code.name));
        Ok(Self {
            ctx: ctx.share(),
            code,
        })
    }

    pub fn code(&self) -> &'static DeviceCode {
        self.code
    }
}

impl Drop for Module {
    fn drop(&mut self) {
        self.ctx.log(LOG_LEVEL_INFO, "MODULE", "module destroyed");
    }
}

/// Program group description; entry names resolve against the module.
#[derive(Clone, Copy)]
pub enum ProgramGroupDesc<'a> {
    Raygen {
        module: &'a Module,
        entry: &'a str,
    },
    Miss {
        module: &'a Module,
        entry: &'a str,
    },
    Hitgroup {
        module: &'a Module,
        closest_hit: Option<&'a str>,
        any_hit: Option<&'a str>,
    },
}

#[derive(Clone, Copy)]
pub(crate) struct HitgroupPrograms {
    pub closest_hit: Option<ClosestHitFn>,
    pub any_hit: Option<AnyHitFn>,
}

#[derive(Clone, Copy)]
enum Programs {
    Raygen { entry: RaygenFn, params_size: usize },
    Miss(MissFn),
    Hitgroup(HitgroupPrograms),
}

impl Programs {
    fn kind(&self) -> &'static str {
        match self {
            Programs::Raygen { .. } => "raygen",
            Programs::Miss(_) => "miss",
            Programs::Hitgroup(_) => "hitgroup",
        }
    }
}

pub struct ProgramGroup {
    ctx: ContextRef,
    id: u64,
    programs: Programs,
}

impl ProgramGroup {
    pub fn create(ctx: &DeviceContext, desc: &ProgramGroupDesc<'_>) -> Result<Self, Status> {
        let programs = match *desc {
            ProgramGroupDesc::Raygen { module, entry } => Programs::Raygen {
                entry: module
                    .code
                    .raygen_entry(entry)
                    .ok_or(Status::EntryFunctionNotFound)?,
                params_size: module.code.launch_params_size,
            },
            ProgramGroupDesc::Miss { module, entry } => Programs::Miss(
                module
                    .code
                    .miss_entry(entry)
                    .ok_or(Status::EntryFunctionNotFound)?,
            ),
            ProgramGroupDesc::Hitgroup {
                module,
                closest_hit,
                any_hit,
            } => {
                let closest_hit = closest_hit
                    .map(|e| module.code.closest_hit_entry(e).ok_or(Status::EntryFunctionNotFound))
                    .transpose()?;
                let any_hit = any_hit
                    .map(|e| module.code.any_hit_entry(e).ok_or(Status::EntryFunctionNotFound))
                    .transpose()?;
                Programs::Hitgroup(HitgroupPrograms {
                    closest_hit,
                    any_hit,
                })
            }
        };
        let id = NEXT_PROGRAM_GROUP_ID.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(id, kind = programs.kind(), "program group created");
        Ok(Self {
            ctx: ctx.share(),
            id,
            programs,
        })
    }

    /// Header to place at the start of an SBT record for this group.
    pub fn pack_header(&self) -> SbtRecordHeader {
        SbtRecordHeader::from_program_group(self.id)
    }
}

impl Drop for ProgramGroup {
    fn drop(&mut self) {
        self.ctx.log(
            LOG_LEVEL_INFO,
            "PROGRAM_GROUP",
            &format!("{} program group destroyed", self.programs.kind()),
        );
    }
}

/// Stack budgets recorded by [`Pipeline::set_stack_size`], in bytes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StackSizes {
    pub direct_callable_from_traversal: u32,
    pub direct_callable_from_state: u32,
    pub continuation: u32,
}

/// Programs linked into a pipeline, shared with in-flight launches.
#[derive(Clone)]
pub(crate) struct LinkedPipeline {
    raygen_group: u64,
    raygen: RaygenFn,
    params_size: usize,
    programs: HashMap<u64, Programs>,
    stack_sizes: StackSizes,
    pub(crate) max_graph_depth: u32,
}

impl LinkedPipeline {
    pub(crate) fn hitgroup(&self, id: u64) -> Result<HitgroupPrograms, Status> {
        match self.programs.get(&id) {
            Some(Programs::Hitgroup(h)) => Ok(*h),
            _ => Err(Status::InvalidValue),
        }
    }

    pub(crate) fn miss(&self, id: u64) -> Result<MissFn, Status> {
        match self.programs.get(&id) {
            Some(Programs::Miss(m)) => Ok(*m),
            _ => Err(Status::InvalidValue),
        }
    }
}

pub struct Pipeline {
    ctx: ContextRef,
    linked: Mutex<Arc<LinkedPipeline>>,
}

impl Pipeline {
    pub fn create(
        ctx: &DeviceContext,
        compile_options: &PipelineCompileOptions,
        link_options: &PipelineLinkOptions,
        groups: &[&ProgramGroup],
    ) -> Result<Self, Status> {
        if link_options.max_trace_depth > MAX_TRACE_DEPTH {
            return Err(Status::InvalidValue);
        }
        let mut raygen = None;
        let mut programs = HashMap::with_capacity(groups.len());
        for group in groups {
            if let Programs::Raygen { entry, params_size } = group.programs {
                if raygen.is_some() {
                    return Err(Status::PipelineLinkError);
                }
                raygen = Some((group.id, entry, params_size));
            }
            programs.insert(group.id, group.programs);
        }
        let (raygen_group, raygen, params_size) = raygen.ok_or(Status::PipelineLinkError)?;
        ctx.log(
            LOG_LEVEL_INFO,
            "PIPELINE",
            &format!(
                "pipeline linked: {} program groups, params '{}'",
                groups.len(),
                compile_options.launch_params_variable_name
            ),
        );
        Ok(Self {
            ctx: ctx.share(),
            linked: Mutex::new(Arc::new(LinkedPipeline {
                raygen_group,
                raygen,
                params_size,
                programs,
                stack_sizes: StackSizes::default(),
                max_graph_depth: DEFAULT_GRAPH_DEPTH,
            })),
        })
    }

    /// Configure stack sizes and the deepest traversable graph a launch may walk.
    ///
    /// Programs run on host threads whose stacks are sized by the device's
    /// pool, so the three byte budgets are only checked and recorded. The
    /// graph depth is enforced by every launch started afterwards.
    pub fn set_stack_size(
        &self,
        direct_callable_stack_size_from_traversal: u32,
        direct_callable_stack_size_from_state: u32,
        continuation_stack_size: u32,
        max_traversable_graph_depth: u32,
    ) -> Result<(), Status> {
        if max_traversable_graph_depth == 0 {
            return Err(Status::InvalidValue);
        }
        let stack_sizes = StackSizes {
            direct_callable_from_traversal: direct_callable_stack_size_from_traversal,
            direct_callable_from_state: direct_callable_stack_size_from_state,
            continuation: continuation_stack_size,
        };
        // The combined budget must be addressable as one 32-bit size.
        direct_callable_stack_size_from_traversal
            .max(direct_callable_stack_size_from_state)
            .checked_add(continuation_stack_size)
            .ok_or(Status::InvalidValue)?;
        tracing::debug!(
            traversal = direct_callable_stack_size_from_traversal,
            state = direct_callable_stack_size_from_state,
            continuation = continuation_stack_size,
            depth = max_traversable_graph_depth,
            "pipeline stack size set"
        );
        let mut linked = self.linked.lock();
        let mut updated = LinkedPipeline::clone(&linked);
        updated.stack_sizes = stack_sizes;
        updated.max_graph_depth = max_traversable_graph_depth;
        *linked = Arc::new(updated);
        Ok(())
    }

    pub fn max_traversable_graph_depth(&self) -> u32 {
        self.linked.lock().max_graph_depth
    }

    pub fn stack_sizes(&self) -> StackSizes {
        self.linked.lock().stack_sizes
    }

    /// Enqueue a `width * height * depth` launch of the raygen program on `stream`.
    ///
    /// # Safety
    /// `params` and every device address reachable from it or from `sbt`
    /// must stay valid until the launch has executed.
    #[allow(clippy::too_many_arguments)]
    pub unsafe fn launch(
        &self,
        stream: &Stream,
        params: DevicePtr,
        params_size: usize,
        sbt: &ShaderBindingTable,
        width: u32,
        height: u32,
        depth: u32,
    ) -> Result<(), Status> {
        let linked = Arc::clone(&*self.linked.lock());
        if params_size != linked.params_size {
            return Err(Status::InvalidLaunchParameter);
        }
        if params.is_null() || sbt.raygen_record.is_null() {
            return Err(Status::InvalidValue);
        }
        let count = width as usize * height as usize * depth as usize;
        if count == 0 {
            return Ok(());
        }
        let sbt = *sbt;
        let device = stream.device().clone();
        stream.enqueue("pipeline_launch", move || {
            // SAFETY: the caller keeps the raygen record alive until execution.
            let header: SbtRecordHeader = unsafe { sbt.raygen_record.read(0) };
            if header.program_group() != linked.raygen_group {
                return Err(Status::InvalidValue);
            }
            let fault: Mutex<Option<Status>> = Mutex::new(None);
            device.run_kernel(count, |i| {
                let ctx = RaygenContext {
                    launch_index: i as u32,
                    launch_dimensions: [width, height, depth],
                    params,
                    sbt: &sbt,
                    pipeline: &linked,
                };
                if let Err(status) = (linked.raygen)(&ctx) {
                    fault.lock().get_or_insert(status);
                }
            });
            fault.into_inner().map_or(Ok(()), Err)
        })
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.ctx.log(LOG_LEVEL_INFO, "PIPELINE", "pipeline destroyed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Device;
    use crate::rt::device_code::{LIDAR_DEVICE_CODE, LIDAR_MISS, LIDAR_RAYGEN};
    use crate::util::DeviceConfig;

    fn context() -> (Device, DeviceContext) {
        let device = Device::new(&DeviceConfig::default()).unwrap();
        let ctx = DeviceContext::create(&device).unwrap();
        (device, ctx)
    }

    fn lidar_module(ctx: &DeviceContext) -> Module {
        Module::create(
            ctx,
            &ModuleCompileOptions::default(),
            &PipelineCompileOptions::default(),
            &LIDAR_DEVICE_CODE,
        )
        .unwrap()
    }

    #[test]
    fn test_module_checks_params_variable() {
        let (_device, ctx) = context();
        let options = PipelineCompileOptions {
            launch_params_variable_name: "optixLaunchParams".into(),
            ..Default::default()
        };
        let err = Module::create(&ctx, &ModuleCompileOptions::default(), &options, &LIDAR_DEVICE_CODE)
            .err();
        assert_eq!(err, Some(Status::InvalidDeviceCode));
    }

    #[test]
    fn test_missing_entry() {
        let (_device, ctx) = context();
        let module = lidar_module(&ctx);
        let desc = ProgramGroupDesc::Raygen {
            module: &module,
            entry: "__raygen__renderCamera",
        };
        assert_eq!(ProgramGroup::create(&ctx, &desc).err(), Some(Status::EntryFunctionNotFound));
    }

    #[test]
    fn test_pipeline_needs_one_raygen() {
        let (_device, ctx) = context();
        let module = lidar_module(&ctx);
        let miss = ProgramGroup::create(
            &ctx,
            &ProgramGroupDesc::Miss {
                module: &module,
                entry: LIDAR_MISS,
            },
        )
        .unwrap();
        let raygen_desc = ProgramGroupDesc::Raygen {
            module: &module,
            entry: LIDAR_RAYGEN,
        };
        let a = ProgramGroup::create(&ctx, &raygen_desc).unwrap();
        let b = ProgramGroup::create(&ctx, &raygen_desc).unwrap();
        let compile = PipelineCompileOptions::default();
        let link = PipelineLinkOptions::default();

        assert_eq!(
            Pipeline::create(&ctx, &compile, &link, &[&miss]).err(),
            Some(Status::PipelineLinkError)
        );
        assert_eq!(
            Pipeline::create(&ctx, &compile, &link, &[&a, &b, &miss]).err(),
            Some(Status::PipelineLinkError)
        );

        let pipeline = Pipeline::create(&ctx, &compile, &link, &[&a, &miss]).unwrap();
        assert_eq!(pipeline.set_stack_size(2048, 2048, 2048, 0), Err(Status::InvalidValue));
        pipeline.set_stack_size(2048, 1024, 4096, 3).unwrap();
        assert_eq!(pipeline.max_traversable_graph_depth(), 3);
        assert_eq!(
            pipeline.stack_sizes(),
            StackSizes {
                direct_callable_from_traversal: 2048,
                direct_callable_from_state: 1024,
                continuation: 4096,
            }
        );

        // Rejected settings leave the previous ones in place.
        assert_eq!(
            pipeline.set_stack_size(u32::MAX, 0, 1, 2),
            Err(Status::InvalidValue)
        );
        assert_eq!(pipeline.max_traversable_graph_depth(), 3);
        assert_eq!(pipeline.stack_sizes().continuation, 4096);
    }

    #[test]
    fn test_launch_checks_params_size() {
        let (device, ctx) = context();
        let stream = Stream::new(&device).unwrap();
        let module = lidar_module(&ctx);
        let raygen = ProgramGroup::create(
            &ctx,
            &ProgramGroupDesc::Raygen {
                module: &module,
                entry: LIDAR_RAYGEN,
            },
        )
        .unwrap();
        let pipeline = Pipeline::create(
            &ctx,
            &PipelineCompileOptions::default(),
            &PipelineLinkOptions::default(),
            &[&raygen],
        )
        .unwrap();
        let sbt = ShaderBindingTable {
            raygen_record: DevicePtr::from_raw(0x100),
            ..Default::default()
        };
        let err = unsafe { pipeline.launch(&stream, DevicePtr::from_raw(0x200), 88, &sbt, 1, 1, 1) };
        assert_eq!(err, Err(Status::InvalidLaunchParameter));
    }
}
