#![doc(html_logo_url = "https://raw.githubusercontent.com/vulkano-rs/vulkano/master/logo.png")]
//! GPU-assisted validation of buffer device address dereferences.
//!
//! Shaders that dereference raw device addresses (`GL_EXT_buffer_reference`) can read and write
//! anywhere. No amount of host-side validation can tell whether an address computed inside a
//! shader points into a live allocation, so this crate checks it on the device instead:
//!
//! - Every allocation created with the `SHADER_DEVICE_ADDRESS` usage is recorded in the
//!   [`AddressRangeRegistry`](address_range::AddressRangeRegistry).
//!
//! - When a shader module is created, the
//!   [`InstrumentationEngine`](shader::InstrumentationEngine) rewrites its program so that every
//!   load and store through a buffer reference first calls a bounds-check routine.
//!
//! - When the check fails, the invocation writes a
//!   [`ViolationRecord`](diagnostic::ViolationRecord) to a
//!   [`DiagnosticBuffer`](diagnostic::DiagnosticBuffer) and skips the access.
//!
//! - After the submission completes, the
//!   [`SubmissionMonitor`](monitor::SubmissionMonitor) drains the diagnostic buffer and reports one
//!   message per record to an [`ErrorSink`](report::ErrorSink).
//!
//! [`GpuAv`] ties these together behind the hooks that a driver layer calls. The [`device`]
//! module contains a software device that calls those hooks, which is enough to run
//! instrumented shaders end to end.

pub use ash;
use ash::vk;
/// A GPU virtual address.
pub use ash::vk::DeviceAddress;
/// Represents memory size and offset values on a Vulkan device.
/// Analogous to the Rust `usize` type on the host.
pub use ash::vk::DeviceSize;
use address_range::{AddressRange, AddressRangeRegistry, OverlapError, OwnerHandle};
use diagnostic::DiagnosticBuffer;
use monitor::{DrainSummary, MonitorError, SubmissionBindings, SubmissionMonitor};
use report::{
    ErrorSink, Message, MessageSeverity, TracingSink, INSTRUMENTATION_FAILED_ID,
    UNSUPPORTED_CONSTRUCT_ID,
};
use shader::{ir::Program, InstrumentationConfig, InstrumentationEngine, InstrumentedShader};
use std::{borrow::Cow, error::Error, fmt, sync::Arc};

pub mod address_range;
mod cache;
pub mod device;
pub mod diagnostic;
pub mod monitor;
pub mod report;
pub mod shader;

/// The GPU-assisted validation context.
///
/// One of these exists per device. It owns the address range registry, the instrumentation
/// engine and the submission monitor, and is driven through its `on_*`, `pre_submit` and
/// `post_wait` hooks.
pub struct GpuAv {
    diagnostic_capacity: u32,
    instrumentation: InstrumentationConfig,
    registry: AddressRangeRegistry,
    engine: InstrumentationEngine,
    monitor: SubmissionMonitor,
    error_sink: Arc<dyn ErrorSink>,
}

impl GpuAv {
    /// Creates a new validation context.
    pub fn new(create_info: GpuAvCreateInfo) -> Result<Arc<Self>, Box<ValidationError>> {
        create_info.validate()?;

        let GpuAvCreateInfo {
            diagnostic_capacity,
            validate_buffer_device_address,
            error_sink,
            _ne: _,
        } = create_info;

        Ok(Arc::new(GpuAv {
            diagnostic_capacity,
            instrumentation: InstrumentationConfig {
                validate_buffer_device_address,
            },
            registry: AddressRangeRegistry::new(),
            engine: InstrumentationEngine::new(),
            monitor: SubmissionMonitor::new(diagnostic_capacity),
            error_sink,
        }))
    }

    /// Returns the number of records each diagnostic buffer can hold.
    #[inline]
    pub fn diagnostic_capacity(&self) -> u32 {
        self.diagnostic_capacity
    }

    #[inline]
    pub fn instrumentation_config(&self) -> InstrumentationConfig {
        self.instrumentation
    }

    #[inline]
    pub fn registry(&self) -> &AddressRangeRegistry {
        &self.registry
    }

    #[inline]
    pub fn engine(&self) -> &InstrumentationEngine {
        &self.engine
    }

    #[inline]
    pub fn monitor(&self) -> &SubmissionMonitor {
        &self.monitor
    }

    /// Called after an allocation has been created.
    ///
    /// If `address_capable` is true, the allocation's range becomes valid for shaders to
    /// dereference.
    ///
    /// # Errors
    ///
    /// - Returns an error if the range overlaps the range of an allocation that is still live.
    pub fn on_allocation_created(
        &self,
        owner: OwnerHandle,
        base: DeviceAddress,
        size: DeviceSize,
        address_capable: bool,
    ) -> Result<(), OverlapError> {
        if !address_capable {
            return Ok(());
        }

        self.registry.register(AddressRange::new(base, size, owner))
    }

    /// Called before an allocation is destroyed.
    #[inline]
    pub fn on_allocation_destroyed(&self, owner: OwnerHandle) {
        self.registry.unregister(owner);
    }

    /// Called when a shader module is created from `program`.
    ///
    /// Returns the instrumented shader to execute instead of `program`, or `None` if `program`
    /// should be used as-is. That is the case when buffer device address validation is disabled,
    /// and when instrumentation failed, which is reported to the error sink.
    ///
    /// If some of the accesses in the program can't be checked, one warning is reported.
    pub fn on_shader_created(&self, program: &Program) -> Option<Arc<InstrumentedShader>> {
        if !self.instrumentation.validate_buffer_device_address {
            return None;
        }

        let shader = match self.engine.instrument(program, self.instrumentation) {
            Ok((shader, _)) => shader,
            Err(err) => {
                let description = match err.source() {
                    Some(source) => format!(
                        "shader `{}` was not instrumented: {err}: {source}",
                        program.name,
                    ),
                    None => format!("shader `{}` was not instrumented: {err}", program.name),
                };
                self.error_sink.report(&Message {
                    severity: MessageSeverity::Error,
                    id: INSTRUMENTATION_FAILED_ID,
                    description: &description,
                    command_buffer: None,
                });

                return None;
            }
        };

        if let Some(first) = shader.unsupported().first() {
            let description = format!(
                "{} accesses through buffer references in shader `{}` are not checked for \
                out-of-bounds addresses; first: {first}",
                shader.unsupported().len(),
                shader.name(),
            );
            tracing::warn!(module_id = shader.module_id(), "{description}");
            self.error_sink.report(&Message {
                severity: MessageSeverity::Warning,
                id: UNSUPPORTED_CONSTRUCT_ID,
                description: &description,
                command_buffer: None,
            });
        }

        Some(shader)
    }

    /// Called when recording of `command_buffer` begins. Returns the number of the recording,
    /// which must be passed to [`pre_submit`](Self::pre_submit).
    #[inline]
    pub fn on_begin_recording(
        &self,
        command_buffer: vk::CommandBuffer,
    ) -> Result<u64, MonitorError> {
        self.monitor.begin(command_buffer)
    }

    /// Called when `shader` is bound in `command_buffer`. Returns the diagnostic buffer that the
    /// shader writes to during the first submission of the recording, if it contains bounds
    /// checks. The bindings returned by [`pre_submit`](Self::pre_submit) are authoritative.
    #[inline]
    pub fn on_bind_shader(
        &self,
        command_buffer: vk::CommandBuffer,
        shader: &InstrumentedShader,
    ) -> Result<Option<Arc<DiagnosticBuffer>>, MonitorError> {
        self.monitor.bind_shader(command_buffer, shader)
    }

    /// Called right before `recording` of `command_buffer` is submitted. Returns what the
    /// instrumented shaders in the command buffer must be bound to.
    #[inline]
    pub fn pre_submit(
        &self,
        command_buffer: vk::CommandBuffer,
        recording: u64,
    ) -> Result<SubmissionBindings, MonitorError> {
        self.monitor
            .submit(command_buffer, recording, self.registry.snapshot())
    }

    /// Called once the host has observed that `command_buffer` finished executing. Reports the
    /// violations its execution recorded.
    #[inline]
    pub fn post_wait(
        &self,
        command_buffer: vk::CommandBuffer,
    ) -> Result<DrainSummary, MonitorError> {
        self.monitor.complete(
            command_buffer,
            &self.registry,
            &self.engine,
            &*self.error_sink,
        )
    }

    /// Called when `command_buffer` is freed.
    #[inline]
    pub fn on_command_buffer_freed(
        &self,
        command_buffer: vk::CommandBuffer,
    ) -> Result<(), MonitorError> {
        self.monitor.release(command_buffer)
    }
}

impl fmt::Debug for GpuAv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GpuAv")
            .field("diagnostic_capacity", &self.diagnostic_capacity)
            .field("instrumentation", &self.instrumentation)
            .field("registry", &self.registry)
            .field("engine", &self.engine)
            .field("monitor", &self.monitor)
            .finish_non_exhaustive()
    }
}

/// Parameters to create a new `GpuAv`.
#[derive(Clone)]
pub struct GpuAvCreateInfo {
    /// The number of violation records that one submission can report. More violations than
    /// this are reported as a single truncation message.
    ///
    /// The default value is `1024`.
    pub diagnostic_capacity: u32,

    /// Whether shaders are instrumented to check loads and stores through buffer references.
    ///
    /// The default value is `true`.
    pub validate_buffer_device_address: bool,

    /// Where validation messages are delivered.
    ///
    /// The default value is [`TracingSink`].
    pub error_sink: Arc<dyn ErrorSink>,

    pub _ne: NonExhaustive,
}

impl Default for GpuAvCreateInfo {
    #[inline]
    fn default() -> Self {
        GpuAvCreateInfo {
            diagnostic_capacity: 1024,
            validate_buffer_device_address: true,
            error_sink: Arc::new(TracingSink),
            _ne: NonExhaustive(()),
        }
    }
}

impl GpuAvCreateInfo {
    pub(crate) fn validate(&self) -> Result<(), Box<ValidationError>> {
        let &Self {
            diagnostic_capacity,
            ..
        } = self;

        if diagnostic_capacity == 0 {
            return Err(Box::new(ValidationError {
                context: "diagnostic_capacity".into(),
                problem: "is zero".into(),
                ..Default::default()
            }));
        }

        // The record words and the header must be addressable with a 32-bit word index.
        if diagnostic_capacity > (u32::MAX - 4) / 8 {
            return Err(Box::new(ValidationError {
                context: "diagnostic_capacity".into(),
                problem: "is too large for the diagnostic buffer to be indexed with 32-bit \
                    offsets"
                    .into(),
                ..Default::default()
            }));
        }

        Ok(())
    }
}

impl fmt::Debug for GpuAvCreateInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GpuAvCreateInfo")
            .field("diagnostic_capacity", &self.diagnostic_capacity)
            .field(
                "validate_buffer_device_address",
                &self.validate_buffer_device_address,
            )
            .finish_non_exhaustive()
    }
}

/// A helper type for non-exhaustive structs.
///
/// This type cannot be constructed outside this crate. Structures with a field of this type can
/// only be constructed by calling a constructor function or `Default::default()`. The effect is
/// similar to the standard Rust `#[non_exhaustive]` attribute, except that it does not prevent
/// update syntax from being used.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)] // add traits as needed
pub struct NonExhaustive(pub(crate) ());

/// The arguments or other context of a call to a function were not valid.
#[derive(Clone, Debug, Default)]
pub struct ValidationError {
    /// The context in which the problem exists (e.g. a specific parameter).
    pub context: Cow<'static, str>,

    /// A description of the problem.
    pub problem: Cow<'static, str>,

    /// *Valid Usage IDs* (VUIDs) in the Vulkan specification that relate to this error.
    pub vuids: &'static [&'static str],
}

impl ValidationError {
    pub(crate) fn add_context(
        mut self: Box<Self>,
        context: impl Into<Cow<'static, str>>,
    ) -> Box<Self> {
        if self.context.is_empty() {
            self.context = context.into();
        } else {
            self.context = format!("{}.{}", context.into(), self.context).into();
        }

        self
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.context.is_empty() {
            write!(f, "{}", self.problem)?;
        } else {
            write!(f, "{}: {}", self.context, self.problem)?;
        }

        if !self.vuids.is_empty() {
            write!(f, "\nVulkan VUIDs: {}", self.vuids.join(", "))?;
        }

        Ok(())
    }
}

impl Error for ValidationError {}
