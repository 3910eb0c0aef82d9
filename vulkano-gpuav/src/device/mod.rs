//! A software device that executes shader programs on host threads.
//!
//! The device plays the part of the driver: it creates [`Buffer`]s with device addresses, creates
//! [`ShaderModule`]s from [`Program`]s, records [`CommandBuffer`]s and executes them on a
//! [`Queue`]. Each of these calls the matching hook of the device's [`GpuAv`], exactly where a
//! validation layer would intercept the corresponding Vulkan call. There is no rasterization;
//! a draw of `n` vertices runs the bound shader `n` times, the same as a dispatch of `n`
//! invocations.
//!
//! ```
//! use vulkano_gpuav::device::{Device, DeviceCreateInfo, Queue};
//!
//! let device = Device::new(DeviceCreateInfo::default()).unwrap();
//! let queue = Queue::new(device.clone());
//! assert!(queue.wait().unwrap().is_empty());
//! ```
//!
//! [`Program`]: crate::shader::ir::Program

pub use self::{
    buffer::{Buffer, BufferCreateInfo, BufferError},
    command_buffer::{CommandBuffer, RecordError, RecordingCommandBuffer},
    executor::ExecutionError,
    memory::{ALLOCATION_ALIGNMENT, BASE_ADDRESS, GUARD_SIZE},
    queue::{Queue, QueueError},
    shader_module::ShaderModule,
};
use self::memory::DeviceMemory;
use crate::{GpuAv, GpuAvCreateInfo, NonExhaustive, ValidationError};
use ash::vk::Handle;
use std::{
    fmt,
    num::NonZeroUsize,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    thread,
};

mod buffer;
mod command_buffer;
pub(crate) mod executor;
mod memory;
mod queue;
mod shader_module;

/// The software device.
pub struct Device {
    gpuav: Arc<GpuAv>,
    memory: DeviceMemory,
    next_handle: AtomicU64,
    max_invocation_steps: u64,
    worker_threads: usize,
}

impl Device {
    /// Creates a new `Device`, together with its validation context.
    pub fn new(create_info: DeviceCreateInfo) -> Result<Arc<Self>, Box<ValidationError>> {
        create_info.validate()?;

        let DeviceCreateInfo {
            gpuav,
            max_invocation_steps,
            worker_threads,
            _ne: _,
        } = create_info;

        let gpuav = GpuAv::new(gpuav)?;

        Ok(Arc::new(Device {
            gpuav,
            memory: DeviceMemory::new(),
            next_handle: AtomicU64::new(1),
            max_invocation_steps,
            worker_threads,
        }))
    }

    /// Returns the validation context of the device.
    #[inline]
    pub fn gpuav(&self) -> &Arc<GpuAv> {
        &self.gpuav
    }

    /// Returns the number of instructions that one invocation may execute before it is aborted.
    #[inline]
    pub fn max_invocation_steps(&self) -> u64 {
        self.max_invocation_steps
    }

    /// Returns the number of threads that invocations of one draw or dispatch are spread over.
    #[inline]
    pub fn worker_threads(&self) -> usize {
        self.worker_threads
    }

    #[inline]
    pub(crate) fn memory(&self) -> &DeviceMemory {
        &self.memory
    }

    /// Returns a fresh handle of type `H`. Handles are never reused.
    pub(crate) fn allocate_handle<H: Handle>(&self) -> H {
        H::from_raw(self.next_handle.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("gpuav", &self.gpuav)
            .field("max_invocation_steps", &self.max_invocation_steps)
            .field("worker_threads", &self.worker_threads)
            .finish_non_exhaustive()
    }
}

/// Parameters to create a new `Device`.
#[derive(Clone, Debug)]
pub struct DeviceCreateInfo {
    /// The configuration of the validation context.
    ///
    /// The default value is `GpuAvCreateInfo::default()`.
    pub gpuav: GpuAvCreateInfo,

    /// The number of instructions that one invocation may execute before it is aborted with
    /// [`ExecutionError::StepLimit`].
    ///
    /// The default value is `1 << 20`.
    pub max_invocation_steps: u64,

    /// The number of threads that the invocations of one draw or dispatch are spread over.
    ///
    /// The default value is the available parallelism of the host, but at most 8.
    pub worker_threads: usize,

    pub _ne: NonExhaustive,
}

impl Default for DeviceCreateInfo {
    #[inline]
    fn default() -> Self {
        DeviceCreateInfo {
            gpuav: GpuAvCreateInfo::default(),
            max_invocation_steps: 1 << 20,
            worker_threads: thread::available_parallelism().map_or(1, NonZeroUsize::get).min(8),
            _ne: NonExhaustive(()),
        }
    }
}

impl DeviceCreateInfo {
    pub(crate) fn validate(&self) -> Result<(), Box<ValidationError>> {
        let &Self {
            ref gpuav,
            max_invocation_steps,
            worker_threads,
            _ne: _,
        } = self;

        gpuav.validate().map_err(|err| err.add_context("gpuav"))?;

        if max_invocation_steps == 0 {
            return Err(Box::new(ValidationError {
                context: "max_invocation_steps".into(),
                problem: "is zero".into(),
                ..Default::default()
            }));
        }

        if worker_threads == 0 {
            return Err(Box::new(ValidationError {
                context: "worker_threads".into(),
                problem: "is zero".into(),
                ..Default::default()
            }));
        }

        Ok(())
    }
}
