use super::{
    command_buffer::CommandBuffer,
    executor::{self, DispatchContext, ExecutionError, ValidationBindings},
    Device,
};
use crate::monitor::{DrainSummary, MonitorError, SubmissionBindings};
use ash::vk::Handle;
use crossbeam_queue::SegQueue;
use std::{
    error::Error,
    fmt, io,
    sync::Arc,
    thread::{self, JoinHandle},
};

/// A queue that executes command buffers on a background thread per submission.
///
/// Submissions execute concurrently with the host and with each other. Their diagnostics are only
/// reported once the host calls [`wait`](Self::wait).
#[derive(Debug)]
pub struct Queue {
    device: Arc<Device>,
    pending: SegQueue<Submission>,
}

#[derive(Debug)]
struct Submission {
    command_buffer: Arc<CommandBuffer>,
    worker: JoinHandle<Result<(), ExecutionError>>,
}

impl Queue {
    #[inline]
    pub fn new(device: Arc<Device>) -> Self {
        Queue {
            device,
            pending: SegQueue::new(),
        }
    }

    #[inline]
    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    /// Returns the number of submissions that haven't been waited on.
    #[inline]
    pub fn pending_submissions(&self) -> usize {
        self.pending.len()
    }

    /// Submits `command_buffer` for execution.
    ///
    /// # Errors
    ///
    /// - Returns [`QueueError::MonitorError`] if the command buffer is already pending execution,
    ///   or if it has been reset since it was recorded.
    /// - Returns [`QueueError::Spawn`] if the thread that executes the command buffer couldn't
    ///   be started.
    pub fn submit(&self, command_buffer: Arc<CommandBuffer>) -> Result<(), QueueError> {
        let gpuav = self.device.gpuav();
        let handle = command_buffer.handle();
        let bindings = gpuav.pre_submit(handle, command_buffer.recording())?;

        let worker = thread::Builder::new()
            .name(format!("vulkano-gpuav queue {:#x}", handle.as_raw()))
            .spawn({
                let command_buffer = command_buffer.clone();

                move || execute(&command_buffer, &bindings)
            });

        match worker {
            Ok(worker) => {
                self.pending.push(Submission {
                    command_buffer,
                    worker,
                });

                Ok(())
            }
            Err(err) => {
                // Nothing was executed, but the command buffer must leave the submitted state.
                gpuav.post_wait(handle)?;

                Err(QueueError::Spawn(err))
            }
        }
    }

    /// Waits for every pending submission to finish, in submission order, and reports the
    /// violations each of them recorded.
    ///
    /// Returns the drained diagnostics of each submission.
    ///
    /// # Errors
    ///
    /// Every submission is waited on and drained even if an earlier one failed. The first error
    /// is returned.
    pub fn wait(&self) -> Result<Vec<DrainSummary>, QueueError> {
        let gpuav = self.device.gpuav();
        let mut summaries = Vec::with_capacity(self.pending.len());
        let mut first_error = None;

        while let Some(Submission {
            command_buffer,
            worker,
        }) = self.pending.pop()
        {
            let handle = command_buffer.handle();
            let executed = match worker.join() {
                Ok(result) => result.map_err(QueueError::from),
                Err(_) => Err(QueueError::WorkerPanicked),
            };

            if let Err(err) = &executed {
                tracing::error!(command_buffer = ?handle, "execution failed: {err}");
            }

            let drained = gpuav.post_wait(handle).map_err(QueueError::from);

            match executed.and(drained) {
                Ok(summary) => summaries.push(summary),
                Err(err) => {
                    first_error.get_or_insert(err);
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(summaries),
        }
    }
}

impl Drop for Queue {
    fn drop(&mut self) {
        if let Err(err) = self.wait() {
            tracing::error!("a submission failed while the queue was dropped: {err}");
        }
    }
}

fn execute(
    command_buffer: &CommandBuffer,
    bindings: &SubmissionBindings,
) -> Result<(), ExecutionError> {
    let device = command_buffer.device();

    for dispatch in command_buffer.commands() {
        let validation = match (
            &bindings.diagnostic,
            &bindings.snapshot,
            dispatch.shader.instrumented(),
        ) {
            (Some(diagnostic), Some(snapshot), Some(shader)) => Some(ValidationBindings {
                diagnostic,
                snapshot,
                module_id: shader.module_id(),
            }),
            _ => None,
        };

        let context = DispatchContext {
            memory: device.memory(),
            push_constants: &dispatch.push_constants,
            uniforms: &dispatch.uniforms,
            validation,
            max_steps: device.max_invocation_steps(),
        };

        executor::dispatch(
            dispatch.shader.executable(),
            &context,
            dispatch.invocations,
            device.worker_threads(),
        )?;
    }

    Ok(())
}

/// Error that can happen when submitting to or waiting on a queue.
#[derive(Debug)]
pub enum QueueError {
    MonitorError(MonitorError),

    /// A submission failed to execute.
    ExecutionError(ExecutionError),

    /// The thread that executes a submission couldn't be started.
    Spawn(io::Error),

    /// The thread that executed a submission panicked.
    WorkerPanicked,
}

impl fmt::Display for QueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MonitorError(_) => write!(f, "the command buffer is in the wrong state"),
            Self::ExecutionError(_) => write!(f, "a command buffer failed to execute"),
            Self::Spawn(_) => write!(f, "failed to start an execution thread"),
            Self::WorkerPanicked => write!(f, "an execution thread panicked"),
        }
    }
}

impl Error for QueueError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::MonitorError(err) => Some(err),
            Self::ExecutionError(err) => Some(err),
            Self::Spawn(err) => Some(err),
            Self::WorkerPanicked => None,
        }
    }
}

impl From<MonitorError> for QueueError {
    fn from(err: MonitorError) -> Self {
        Self::MonitorError(err)
    }
}

impl From<ExecutionError> for QueueError {
    fn from(err: ExecutionError) -> Self {
        Self::ExecutionError(err)
    }
}
