//! Delivery of validation messages.
//!
//! Everything that GPU-assisted validation finds is reported through an [`ErrorSink`]. By default
//! messages are forwarded to [`tracing`] by [`TracingSink`], but any closure taking a
//! [`Message`] can be used instead, which is how tests observe the messages.
//!
//! ```
//! use vulkano_gpuav::report::{ErrorSink, Message};
//! use std::sync::Mutex;
//!
//! let ids = Mutex::new(Vec::new());
//! let sink = |message: &Message<'_>| ids.lock().unwrap().push(message.id.to_owned());
//! # sink.report(&Message {
//! #     severity: vulkano_gpuav::report::MessageSeverity::Error,
//! #     id: "id",
//! #     description: "",
//! #     command_buffer: None,
//! # });
//! ```

use ash::vk;
use std::{fmt, sync::Arc};

/// The identifier of messages about shader accesses outside of any live allocation.
pub const OUT_OF_BOUNDS_ID: &str = "UNASSIGNED-Device address out of bounds";

/// The identifier of the message emitted when a submission produced more violations than the
/// diagnostic buffer could hold.
pub const OVERFLOW_ID: &str = "UNASSIGNED-GPU-Assisted-Validation-Overflow";

/// The identifier of warnings about accesses that were left unchecked.
pub const UNSUPPORTED_CONSTRUCT_ID: &str = "UNASSIGNED-GPU-Assisted-Validation-Unsupported";

/// The identifier of errors about shaders that could not be instrumented at all.
pub const INSTRUMENTATION_FAILED_ID: &str = "UNASSIGNED-GPU-Assisted-Validation-Instrumentation";

/// A validation message.
#[derive(Clone, Copy, Debug)]
pub struct Message<'a> {
    /// Severity of the message.
    pub severity: MessageSeverity,

    /// Stable identifier of the kind of message.
    pub id: &'a str,

    /// Human-readable description of what went wrong.
    pub description: &'a str,

    /// The command buffer whose execution caused the message, if any.
    pub command_buffer: Option<vk::CommandBuffer>,
}

impl fmt::Display for Message<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.id, self.description)
    }
}

/// Severity of a [`Message`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum MessageSeverity {
    Info,
    Warning,
    Error,
}

impl From<MessageSeverity> for vk::DebugUtilsMessageSeverityFlagsEXT {
    #[inline]
    fn from(val: MessageSeverity) -> Self {
        match val {
            MessageSeverity::Info => vk::DebugUtilsMessageSeverityFlagsEXT::INFO,
            MessageSeverity::Warning => vk::DebugUtilsMessageSeverityFlagsEXT::WARNING,
            MessageSeverity::Error => vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
        }
    }
}

/// Receives validation messages.
///
/// Messages may be reported from any thread that calls into the validation context, including
/// the thread that waits on a queue.
pub trait ErrorSink: Send + Sync {
    fn report(&self, message: &Message<'_>);
}

impl<F> ErrorSink for F
where
    F: Fn(&Message<'_>) + Send + Sync,
{
    #[inline]
    fn report(&self, message: &Message<'_>) {
        self(message)
    }
}

impl<T: ErrorSink + ?Sized> ErrorSink for Arc<T> {
    #[inline]
    fn report(&self, message: &Message<'_>) {
        (**self).report(message)
    }
}

/// An [`ErrorSink`] that forwards messages to `tracing` events at the matching level.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingSink;

impl ErrorSink for TracingSink {
    fn report(&self, message: &Message<'_>) {
        match message.severity {
            MessageSeverity::Error => tracing::error!(
                id = message.id,
                command_buffer = ?message.command_buffer,
                "{}",
                message.description,
            ),
            MessageSeverity::Warning => tracing::warn!(
                id = message.id,
                command_buffer = ?message.command_buffer,
                "{}",
                message.description,
            ),
            MessageSeverity::Info => tracing::info!(
                id = message.id,
                command_buffer = ?message.command_buffer,
                "{}",
                message.description,
            ),
        }
    }
}
