//! Tracking of command buffers from recording until their diagnostics have been drained.
//!
//! Every command buffer moves through the states of [`CommandBufferState`]. A command buffer that
//! binds an instrumented shader while recording gets a [`DiagnosticBuffer`] of its own from the
//! pool. At submission the current [`RangeSnapshot`] is attached to it, and both are kept alive
//! until the command buffer is completed. Completing drains the diagnostic buffer and turns every
//! record into a message for the [`ErrorSink`].
//!
//! Each recording of a command buffer gets a number from [`SubmissionMonitor::begin`], which has
//! to be passed back on submission. Once a command buffer is recorded again, submitting an
//! earlier recording of it is an error. A completed recording can be submitted again, and gets a
//! fresh diagnostic buffer each time.

use crate::{
    address_range::{AccessStatus, AddressRange, AddressRangeRegistry, RangeSnapshot},
    diagnostic::{DiagnosticBuffer, DiagnosticBufferPool, ViolationRecord},
    report::{ErrorSink, Message, MessageSeverity, OUT_OF_BOUNDS_ID, OVERFLOW_ID},
    shader::{InstrumentationEngine, InstrumentedShader},
};
use ash::vk;
use foldhash::HashMap;
use parking_lot::Mutex;
use std::{error::Error, fmt, sync::Arc};

/// The state of a command buffer, as seen by the monitor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CommandBufferState {
    /// The command buffer is not tracked.
    Idle,
    Recording,
    Submitted,
    /// The command buffer finished executing and its diagnostics have been drained.
    Completed,
}

impl CommandBufferState {
    fn as_str(self) -> &'static str {
        match self {
            CommandBufferState::Idle => "idle",
            CommandBufferState::Recording => "recording",
            CommandBufferState::Submitted => "submitted",
            CommandBufferState::Completed => "completed",
        }
    }
}

#[derive(Debug)]
struct Tracked {
    state: CommandBufferState,
    recording: u64,
    // Whether the current recording binds a shader with bounds checks.
    instrumented: bool,
    diagnostic: Option<Arc<DiagnosticBuffer>>,
    snapshot: Option<Arc<RangeSnapshot>>,
}

/// What a submitted command buffer's instrumented shaders are bound to.
#[derive(Clone, Debug, Default)]
pub struct SubmissionBindings {
    /// The diagnostic buffer that violations are written to, if the command buffer uses any
    /// instrumented shader.
    pub diagnostic: Option<Arc<DiagnosticBuffer>>,

    /// The range table that bounds checks search.
    pub snapshot: Option<Arc<RangeSnapshot>>,
}

/// The outcome of draining a command buffer's diagnostics.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DrainSummary {
    /// The records that were found, in slot order.
    pub records: Vec<ViolationRecord>,

    /// Whether more violations happened than the diagnostic buffer could hold.
    pub overflowed: bool,
}

/// The submission monitor.
#[derive(Debug)]
pub struct SubmissionMonitor {
    command_buffers: Mutex<HashMap<vk::CommandBuffer, Tracked>>,
    pool: DiagnosticBufferPool,
}

impl SubmissionMonitor {
    /// Creates a monitor whose diagnostic buffers each hold `diagnostic_capacity` records.
    pub fn new(diagnostic_capacity: u32) -> Self {
        SubmissionMonitor {
            command_buffers: Mutex::new(HashMap::default()),
            pool: DiagnosticBufferPool::new(diagnostic_capacity),
        }
    }

    /// Returns the state of `command_buffer`.
    pub fn state(&self, command_buffer: vk::CommandBuffer) -> CommandBufferState {
        self.command_buffers
            .lock()
            .get(&command_buffer)
            .map_or(CommandBufferState::Idle, |tracked| tracked.state)
    }

    /// Starts recording `command_buffer`, and returns the number of the new recording.
    ///
    /// # Errors
    ///
    /// - Returns [`MonitorError::InvalidState`] if the command buffer is pending execution.
    pub fn begin(&self, command_buffer: vk::CommandBuffer) -> Result<u64, MonitorError> {
        let mut command_buffers = self.command_buffers.lock();
        let tracked = command_buffers.entry(command_buffer).or_insert(Tracked {
            state: CommandBufferState::Idle,
            recording: 0,
            instrumented: false,
            diagnostic: None,
            snapshot: None,
        });

        if tracked.state == CommandBufferState::Submitted {
            return Err(MonitorError::InvalidState {
                command_buffer,
                state: tracked.state,
                operation: "begin recording",
            });
        }

        if let Some(buffer) = tracked.diagnostic.take() {
            self.pool.release(buffer);
        }

        tracked.state = CommandBufferState::Recording;
        tracked.recording = tracked.recording.wrapping_add(1);
        tracked.instrumented = false;
        tracked.snapshot = None;

        Ok(tracked.recording)
    }

    /// Records that `shader` is bound in `command_buffer`.
    ///
    /// If the shader contains bounds checks, returns the diagnostic buffer they must write to.
    /// The buffer is taken from the pool and reset the first time this happens during a
    /// recording.
    ///
    /// # Errors
    ///
    /// - Returns [`MonitorError::UnknownCommandBuffer`] if the command buffer isn't tracked.
    /// - Returns [`MonitorError::InvalidState`] if the command buffer isn't recording.
    pub fn bind_shader(
        &self,
        command_buffer: vk::CommandBuffer,
        shader: &InstrumentedShader,
    ) -> Result<Option<Arc<DiagnosticBuffer>>, MonitorError> {
        let mut command_buffers = self.command_buffers.lock();
        let tracked = Self::tracked_in(
            &mut command_buffers,
            command_buffer,
            CommandBufferState::Recording,
            "bind a shader",
        )?;

        if shader.checked_accesses() == 0 {
            return Ok(None);
        }

        tracked.instrumented = true;
        let buffer = tracked
            .diagnostic
            .get_or_insert_with(|| self.pool.acquire())
            .clone();

        Ok(Some(buffer))
    }

    /// Marks `recording` of `command_buffer` as submitted, attaching `snapshot` to it if it uses
    /// instrumented shaders.
    ///
    /// A command buffer that was submitted before and has completed can be submitted again. It
    /// gets a reset diagnostic buffer from the pool in that case.
    ///
    /// # Errors
    ///
    /// - Returns [`MonitorError::UnknownCommandBuffer`] if the command buffer isn't tracked.
    /// - Returns [`MonitorError::InvalidState`] if the command buffer is idle or pending
    ///   execution.
    /// - Returns [`MonitorError::StaleRecording`] if the command buffer has been recorded again
    ///   since `recording`.
    pub fn submit(
        &self,
        command_buffer: vk::CommandBuffer,
        recording: u64,
        snapshot: Arc<RangeSnapshot>,
    ) -> Result<SubmissionBindings, MonitorError> {
        let mut command_buffers = self.command_buffers.lock();
        let tracked = command_buffers
            .get_mut(&command_buffer)
            .ok_or(MonitorError::UnknownCommandBuffer { command_buffer })?;

        if !matches!(
            tracked.state,
            CommandBufferState::Recording | CommandBufferState::Completed,
        ) {
            return Err(MonitorError::InvalidState {
                command_buffer,
                state: tracked.state,
                operation: "submit",
            });
        }

        if tracked.recording != recording {
            return Err(MonitorError::StaleRecording {
                command_buffer,
                recording,
                current: tracked.recording,
            });
        }

        tracked.state = CommandBufferState::Submitted;

        if tracked.instrumented && tracked.diagnostic.is_none() {
            tracked.diagnostic = Some(self.pool.acquire());
        }

        if tracked.diagnostic.is_some() {
            tracked.snapshot = Some(snapshot);
        }

        tracing::debug!(
            ?command_buffer,
            recording,
            instrumented = tracked.instrumented,
            "submitted command buffer",
        );

        Ok(SubmissionBindings {
            diagnostic: tracked.diagnostic.clone(),
            snapshot: tracked.snapshot.clone(),
        })
    }

    /// Marks `command_buffer` as completed, and reports every violation its execution recorded.
    ///
    /// Each record becomes one message, decoded using the live allocations in `registry` and
    /// the shader names known to `engine`. If the diagnostic buffer overflowed, one more message
    /// reports the truncation. The diagnostic buffer is then returned to the pool.
    ///
    /// # Errors
    ///
    /// - Returns [`MonitorError::UnknownCommandBuffer`] if the command buffer isn't tracked.
    /// - Returns [`MonitorError::InvalidState`] if the command buffer isn't submitted.
    pub fn complete(
        &self,
        command_buffer: vk::CommandBuffer,
        registry: &AddressRangeRegistry,
        engine: &InstrumentationEngine,
        sink: &dyn ErrorSink,
    ) -> Result<DrainSummary, MonitorError> {
        let (diagnostic, _snapshot) = {
            let mut command_buffers = self.command_buffers.lock();
            let tracked = Self::tracked_in(
                &mut command_buffers,
                command_buffer,
                CommandBufferState::Submitted,
                "complete",
            )?;
            tracked.state = CommandBufferState::Completed;

            (tracked.diagnostic.take(), tracked.snapshot.take())
        };

        let Some(diagnostic) = diagnostic else {
            return Ok(DrainSummary::default());
        };

        let drained = diagnostic.drain();
        let capacity = diagnostic.capacity();
        self.pool.release(diagnostic);

        tracing::debug!(
            ?command_buffer,
            records = drained.records.len(),
            overflowed = drained.overflowed,
            "drained diagnostic buffer",
        );

        for record in &drained.records {
            let description = describe_violation(record, registry, engine);
            tracing::trace!(?record, "decoded violation");

            sink.report(&Message {
                severity: MessageSeverity::Error,
                id: OUT_OF_BOUNDS_ID,
                description: &description,
                command_buffer: Some(command_buffer),
            });
        }

        if drained.overflowed {
            let description = format!(
                "too many violations, results truncated: the diagnostic buffer holds {} records \
                but {} violations were detected",
                capacity,
                drained.write_cursor,
            );
            tracing::warn!(?command_buffer, "{description}");

            sink.report(&Message {
                severity: MessageSeverity::Warning,
                id: OVERFLOW_ID,
                description: &description,
                command_buffer: Some(command_buffer),
            });
        }

        Ok(DrainSummary {
            records: drained.records,
            overflowed: drained.overflowed,
        })
    }

    /// Stops tracking `command_buffer`.
    ///
    /// # Errors
    ///
    /// - Returns [`MonitorError::InvalidState`] if the command buffer is pending execution.
    pub fn release(&self, command_buffer: vk::CommandBuffer) -> Result<(), MonitorError> {
        let mut command_buffers = self.command_buffers.lock();

        match command_buffers.get(&command_buffer) {
            None => return Ok(()),
            Some(tracked) if tracked.state == CommandBufferState::Submitted => {
                return Err(MonitorError::InvalidState {
                    command_buffer,
                    state: tracked.state,
                    operation: "release",
                });
            }
            Some(_) => {}
        }

        if let Some(buffer) = command_buffers
            .remove(&command_buffer)
            .and_then(|tracked| tracked.diagnostic)
        {
            self.pool.release(buffer);
        }

        Ok(())
    }

    fn tracked_in<'a>(
        command_buffers: &'a mut HashMap<vk::CommandBuffer, Tracked>,
        command_buffer: vk::CommandBuffer,
        expected: CommandBufferState,
        operation: &'static str,
    ) -> Result<&'a mut Tracked, MonitorError> {
        let tracked = command_buffers
            .get_mut(&command_buffer)
            .ok_or(MonitorError::UnknownCommandBuffer { command_buffer })?;

        if tracked.state != expected {
            return Err(MonitorError::InvalidState {
                command_buffer,
                state: tracked.state,
                operation,
            });
        }

        Ok(tracked)
    }
}

/// Builds the description of a violation record.
fn describe_violation(
    record: &ViolationRecord,
    registry: &AddressRangeRegistry,
    engine: &InstrumentationEngine,
) -> String {
    let name = engine
        .module_name(record.shader_module_id)
        .map_or_else(|| String::from("<unknown>"), |name| name.to_string());
    let address = record.address;

    let context = match registry.validate_access(address, record.access_size.into()) {
        AccessStatus::OutOfBounds { range } => format!(
            "the access overruns {} by {} bytes",
            describe_range(&range),
            address
                .saturating_add(record.access_size.into())
                .saturating_sub(range.end()),
        ),
        AccessStatus::Unregistered => match registry.nearest(address) {
            Some(range) => format!(
                "no allocation contains this address; the nearest is {}",
                describe_range(&range),
            ),
            None => String::from("no allocation contains this address and none are live"),
        },
        // The allocation was created between execution and draining.
        AccessStatus::Ok => String::from("the address was not valid when the shader executed"),
    };

    format!(
        "Device address out of bounds: {} of {} bytes at address {:#x} by instruction {} of \
        {:?} shader `{}` (module {}): {}",
        record.access_kind.as_str(),
        record.access_size,
        address,
        record.instruction_index,
        record.shader_stage,
        name,
        record.shader_module_id,
        context,
    )
}

fn describe_range(range: &AddressRange) -> String {
    format!(
        "the allocation of {:?} at {:#x}..{:#x} ({} bytes)",
        range.owner,
        range.base,
        range.end(),
        range.size,
    )
}

/// Error that can happen when moving a command buffer between states.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MonitorError {
    /// The operation is not allowed in the command buffer's current state.
    InvalidState {
        command_buffer: vk::CommandBuffer,
        state: CommandBufferState,
        operation: &'static str,
    },

    /// The command buffer was never begun, or was released.
    UnknownCommandBuffer { command_buffer: vk::CommandBuffer },

    /// The submitted recording was replaced by a newer recording of the same command buffer.
    StaleRecording {
        command_buffer: vk::CommandBuffer,
        recording: u64,
        current: u64,
    },
}

impl fmt::Display for MonitorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidState {
                command_buffer,
                state,
                operation,
            } => write!(
                f,
                "cannot {operation} {command_buffer:?}, because it is {}",
                state.as_str(),
            ),
            Self::UnknownCommandBuffer { command_buffer } => {
                write!(f, "{command_buffer:?} is not being tracked")
            }
            Self::StaleRecording {
                command_buffer,
                recording,
                current,
            } => write!(
                f,
                "recording {recording} of {command_buffer:?} was replaced by recording {current}",
            ),
        }
    }
}

impl Error for MonitorError {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        address_range::OwnerHandle,
        diagnostic::AccessKind,
        shader::{
            ir::{Instruction, Program, ShaderStage, Type},
            InstrumentationConfig,
        },
    };
    use ash::vk::Handle;

    const P: u64 = 0x1_0000_0000;

    fn command_buffer(raw: u64) -> vk::CommandBuffer {
        vk::CommandBuffer::from_raw(raw)
    }

    fn store_shader(engine: &InstrumentationEngine) -> Arc<InstrumentedShader> {
        let mut program = Program::new("store", ShaderStage::Vertex);
        let int = program.add_type(Type::Scalar { width: 4 });
        let long = program.add_type(Type::Scalar { width: 8 });
        let int_ptr = program.add_type(Type::BufferReference { pointee: int });
        let address = program.add_register(long);
        let pointer = program.add_register(int_ptr);
        let value = program.add_register(int);
        program.push(Instruction::LoadPushConstant {
            result: address,
            offset: 0,
        });
        program.push(Instruction::ConvertUToPtr {
            result: pointer,
            address,
        });
        program.push(Instruction::Constant { result: value, value: 1 });
        program.push(Instruction::Store { pointer, value });

        engine
            .instrument(&program, InstrumentationConfig::default())
            .unwrap()
            .0
    }

    fn violation(shader: &InstrumentedShader, address: u64) -> ViolationRecord {
        ViolationRecord {
            address,
            access_size: 4,
            shader_module_id: shader.module_id(),
            instruction_index: 3,
            shader_stage: shader.stage().into(),
            access_kind: AccessKind::Write,
        }
    }

    #[test]
    fn illegal_transitions() {
        let monitor = SubmissionMonitor::new(4);
        let registry = AddressRangeRegistry::new();
        let engine = InstrumentationEngine::new();
        let cb = command_buffer(1);
        let sink = |_: &Message<'_>| {};

        assert_eq!(monitor.state(cb), CommandBufferState::Idle);
        assert!(matches!(
            monitor.submit(cb, 1, registry.snapshot()),
            Err(MonitorError::UnknownCommandBuffer { .. }),
        ));

        let recording = monitor.begin(cb).unwrap();
        assert!(matches!(
            monitor.complete(cb, &registry, &engine, &sink),
            Err(MonitorError::InvalidState {
                state: CommandBufferState::Recording,
                ..
            }),
        ));

        monitor.submit(cb, recording, registry.snapshot()).unwrap();
        assert!(monitor.begin(cb).is_err());
        assert!(monitor.release(cb).is_err());
        assert!(matches!(
            monitor.submit(cb, recording, registry.snapshot()),
            Err(MonitorError::InvalidState {
                state: CommandBufferState::Submitted,
                ..
            }),
        ));

        monitor.complete(cb, &registry, &engine, &sink).unwrap();
        assert_eq!(monitor.state(cb), CommandBufferState::Completed);

        // Re-recording a completed command buffer is allowed, and retires the old recording.
        assert_eq!(monitor.begin(cb).unwrap(), recording + 1);
        assert_eq!(monitor.state(cb), CommandBufferState::Recording);
        assert_eq!(
            monitor.submit(cb, recording, registry.snapshot()).unwrap_err(),
            MonitorError::StaleRecording {
                command_buffer: cb,
                recording,
                current: recording + 1,
            },
        );
        assert_eq!(monitor.state(cb), CommandBufferState::Recording);
        monitor.release(cb).unwrap();
        assert_eq!(monitor.state(cb), CommandBufferState::Idle);
    }

    #[test]
    fn drain_reports_each_record() {
        let monitor = SubmissionMonitor::new(2);
        let registry = AddressRangeRegistry::new();
        registry
            .register(AddressRange::new(P, 64, OwnerHandle::from_raw(7)))
            .unwrap();
        let engine = InstrumentationEngine::new();
        let shader = store_shader(&engine);
        let messages = Mutex::new(Vec::new());
        let sink = |message: &Message<'_>| {
            messages
                .lock()
                .push((message.id.to_owned(), message.description.to_owned()));
        };
        let cb = command_buffer(2);

        let recording = monitor.begin(cb).unwrap();
        let diagnostic = monitor.bind_shader(cb, &shader).unwrap().unwrap();
        let bindings = monitor.submit(cb, recording, registry.snapshot()).unwrap();
        assert!(Arc::ptr_eq(bindings.diagnostic.as_ref().unwrap(), &diagnostic));
        assert!(bindings.snapshot.is_some());

        assert!(diagnostic.push(&violation(&shader, P - 16)));
        assert!(diagnostic.push(&violation(&shader, P + 62)));
        assert!(!diagnostic.push(&violation(&shader, P + 64)));

        let summary = monitor.complete(cb, &registry, &engine, &sink).unwrap();
        assert_eq!(summary.records.len(), 2);
        assert!(summary.overflowed);

        let messages = messages.into_inner();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0].0, OUT_OF_BOUNDS_ID);
        assert!(messages[0].1.contains("no allocation contains this address"));
        assert!(messages[0].1.contains("`store`"));
        assert!(messages[1].1.contains("overruns"));
        assert!(messages[1].1.contains("by 2 bytes"));
        assert_eq!(messages[2].0, OVERFLOW_ID);
        assert!(messages[2].1.contains("too many violations, results truncated"));

        // The buffer went back to the pool, reset.
        assert_eq!(diagnostic.write_cursor(), 0);
    }

    #[test]
    fn uninstrumented_command_buffer() {
        let monitor = SubmissionMonitor::new(2);
        let registry = AddressRangeRegistry::new();
        let engine = InstrumentationEngine::new();
        let cb = command_buffer(3);

        let mut program = Program::new("empty", ShaderStage::Compute);
        program.push(Instruction::Return);
        let (shader, _) = engine
            .instrument(&program, InstrumentationConfig::default())
            .unwrap();

        let recording = monitor.begin(cb).unwrap();
        assert!(monitor.bind_shader(cb, &shader).unwrap().is_none());
        let bindings = monitor.submit(cb, recording, registry.snapshot()).unwrap();
        assert!(bindings.diagnostic.is_none());
        assert!(bindings.snapshot.is_none());

        let summary = monitor
            .complete(cb, &registry, &engine, &|_: &Message<'_>| {})
            .unwrap();
        assert_eq!(summary, DrainSummary::default());
    }

    #[test]
    fn resubmission_after_completion() {
        let monitor = SubmissionMonitor::new(4);
        let registry = AddressRangeRegistry::new();
        let engine = InstrumentationEngine::new();
        let shader = store_shader(&engine);
        let sink = |_: &Message<'_>| {};
        let cb = command_buffer(4);

        let recording = monitor.begin(cb).unwrap();
        monitor.bind_shader(cb, &shader).unwrap();

        for _ in 0..2 {
            let bindings = monitor.submit(cb, recording, registry.snapshot()).unwrap();
            let diagnostic = bindings.diagnostic.unwrap();
            assert_eq!(diagnostic.write_cursor(), 0);
            assert!(diagnostic.push(&violation(&shader, P)));

            let summary = monitor.complete(cb, &registry, &engine, &sink).unwrap();
            assert_eq!(summary.records, [violation(&shader, P)]);
            assert_eq!(monitor.state(cb), CommandBufferState::Completed);
        }
    }
}
