use super::{Buffer, Device, ShaderModule};
use crate::{monitor::MonitorError, shader::ir::ShaderStage, ValidationError};
use ash::vk;
use foldhash::HashMap;
use std::{error::Error, fmt, sync::Arc};

/// The number of bytes of push constant storage.
pub const MAX_PUSH_CONSTANTS_SIZE: u32 = 128;

/// Owns a command buffer handle, and releases it from the monitor when the last recording or
/// recorded command buffer using it is dropped.
#[derive(Debug)]
struct CommandBufferHandle {
    device: Arc<Device>,
    handle: vk::CommandBuffer,
}

impl Drop for CommandBufferHandle {
    fn drop(&mut self) {
        if let Err(err) = self.device.gpuav().on_command_buffer_freed(self.handle) {
            tracing::warn!(command_buffer = ?self.handle, "{err}");
        }
    }
}

/// A command that runs a shader.
#[derive(Debug)]
pub(crate) struct Dispatch {
    pub(crate) shader: Arc<ShaderModule>,
    pub(crate) push_constants: Arc<[u8]>,
    pub(crate) uniforms: Arc<HashMap<(u32, u32), Arc<Buffer>>>,
    pub(crate) invocations: u32,
}

/// A command buffer in the recording state.
#[derive(Debug)]
pub struct RecordingCommandBuffer {
    handle: Arc<CommandBufferHandle>,
    recording: u64,
    commands: Vec<Dispatch>,
    shader: Option<Arc<ShaderModule>>,
    push_constants: Vec<u8>,
    uniforms: Arc<HashMap<(u32, u32), Arc<Buffer>>>,
}

impl RecordingCommandBuffer {
    /// Allocates a new command buffer and begins recording it.
    pub fn new(device: &Arc<Device>) -> Result<Self, RecordError> {
        let handle = Arc::new(CommandBufferHandle {
            device: device.clone(),
            handle: device.allocate_handle(),
        });

        Self::begin(handle)
    }

    fn begin(handle: Arc<CommandBufferHandle>) -> Result<Self, RecordError> {
        let recording = handle.device.gpuav().on_begin_recording(handle.handle)?;

        Ok(RecordingCommandBuffer {
            handle,
            recording,
            commands: Vec::new(),
            shader: None,
            push_constants: vec![0; MAX_PUSH_CONSTANTS_SIZE as usize],
            uniforms: Arc::new(HashMap::default()),
        })
    }

    #[inline]
    pub fn handle(&self) -> vk::CommandBuffer {
        self.handle.handle
    }

    /// Binds `shader` for the following draws or dispatches.
    pub fn bind_shader(&mut self, shader: Arc<ShaderModule>) -> Result<&mut Self, RecordError> {
        if !Arc::ptr_eq(shader.device(), &self.handle.device) {
            return Err(Box::new(ValidationError {
                context: "shader".into(),
                problem: "was not created from the same device as the command buffer".into(),
                vuids: &["VUID-vkCmdBindShadersEXT-pShaders-parent"],
            })
            .into());
        }

        // Execution writes to the diagnostic buffer bound at submission, not this one.
        if let Some(instrumented) = shader.instrumented() {
            self.handle
                .device
                .gpuav()
                .on_bind_shader(self.handle.handle, instrumented)?;
        }

        self.shader = Some(shader);

        Ok(self)
    }

    /// Sets push constant data for the following draws or dispatches.
    pub fn push_constants(&mut self, offset: u32, data: &[u8]) -> Result<&mut Self, RecordError> {
        let end = offset as usize + data.len();

        if end > MAX_PUSH_CONSTANTS_SIZE as usize {
            return Err(Box::new(ValidationError {
                context: "data".into(),
                problem: "extends past the end of the push constant range".into(),
                vuids: &["VUID-vkCmdPushConstants-size-00371"],
            })
            .into());
        }

        self.push_constants[offset as usize..end].copy_from_slice(data);

        Ok(self)
    }

    /// Binds `buffer` as the uniform buffer at `set` and `binding` for the following draws or
    /// dispatches.
    pub fn bind_uniform_buffer(
        &mut self,
        set: u32,
        binding: u32,
        buffer: Arc<Buffer>,
    ) -> Result<&mut Self, RecordError> {
        if !buffer.usage().contains(vk::BufferUsageFlags::UNIFORM_BUFFER) {
            return Err(Box::new(ValidationError {
                context: "buffer.usage()".into(),
                problem: "does not contain `BufferUsageFlags::UNIFORM_BUFFER`".into(),
                vuids: &["VUID-VkWriteDescriptorSet-descriptorType-00330"],
            })
            .into());
        }

        Arc::make_mut(&mut self.uniforms).insert((set, binding), buffer);

        Ok(self)
    }

    /// Runs the bound graphics shader once for each of `vertex_count` vertices.
    pub fn draw(&mut self, vertex_count: u32) -> Result<&mut Self, RecordError> {
        self.record(vertex_count, false)
    }

    /// Runs the bound compute shader `invocations` times.
    pub fn dispatch(&mut self, invocations: u32) -> Result<&mut Self, RecordError> {
        self.record(invocations, true)
    }

    fn record(&mut self, invocations: u32, compute: bool) -> Result<&mut Self, RecordError> {
        let Some(shader) = &self.shader else {
            return Err(Box::new(ValidationError {
                problem: "no shader is bound".into(),
                vuids: &["VUID-vkCmdDraw-None-08606"],
                ..Default::default()
            })
            .into());
        };

        let stage = shader.program().stage;

        if (stage == ShaderStage::Compute) != compute {
            return Err(Box::new(ValidationError {
                problem: format!(
                    "the bound shader is a {} shader, which can't be used for this command",
                    stage.as_str(),
                )
                .into(),
                ..Default::default()
            })
            .into());
        }

        self.commands.push(Dispatch {
            shader: shader.clone(),
            push_constants: Arc::from(self.push_constants.as_slice()),
            uniforms: self.uniforms.clone(),
            invocations,
        });

        Ok(self)
    }

    /// Ends recording.
    pub fn end(self) -> Arc<CommandBuffer> {
        Arc::new(CommandBuffer {
            handle: self.handle,
            recording: self.recording,
            commands: self.commands,
        })
    }
}

/// A recorded command buffer, ready to be submitted to a queue.
#[derive(Debug)]
pub struct CommandBuffer {
    handle: Arc<CommandBufferHandle>,
    recording: u64,
    commands: Vec<Dispatch>,
}

impl CommandBuffer {
    #[inline]
    pub fn handle(&self) -> vk::CommandBuffer {
        self.handle.handle
    }

    #[inline]
    pub fn device(&self) -> &Arc<Device> {
        &self.handle.device
    }

    #[inline]
    pub(crate) fn recording(&self) -> u64 {
        self.recording
    }

    #[inline]
    pub(crate) fn commands(&self) -> &[Dispatch] {
        &self.commands
    }

    /// Begins recording the same command buffer again, from scratch.
    ///
    /// `self` can no longer be submitted afterwards.
    ///
    /// # Errors
    ///
    /// - Returns an error if the command buffer is pending execution.
    pub fn reset(&self) -> Result<RecordingCommandBuffer, RecordError> {
        RecordingCommandBuffer::begin(self.handle.clone())
    }
}

/// Error that can happen when recording a command buffer.
#[derive(Clone, Debug)]
pub enum RecordError {
    ValidationError(Box<ValidationError>),
    MonitorError(MonitorError),
}

impl fmt::Display for RecordError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ValidationError(_) => write!(f, "a validation error occurred"),
            Self::MonitorError(_) => write!(f, "the command buffer is in the wrong state"),
        }
    }
}

impl Error for RecordError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::ValidationError(err) => Some(err),
            Self::MonitorError(err) => Some(err),
        }
    }
}

impl From<Box<ValidationError>> for RecordError {
    fn from(err: Box<ValidationError>) -> Self {
        Self::ValidationError(err)
    }
}

impl From<MonitorError> for RecordError {
    fn from(err: MonitorError) -> Self {
        Self::MonitorError(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        device::DeviceCreateInfo,
        monitor::CommandBufferState,
        shader::ir::{Instruction, Program},
    };

    fn shader(device: &Arc<Device>, stage: ShaderStage) -> Arc<ShaderModule> {
        let mut program = Program::new("noop", stage);
        program.push(Instruction::Return);

        ShaderModule::new(device, program).unwrap()
    }

    #[test]
    fn recording_validation() {
        let device = Device::new(DeviceCreateInfo::default()).unwrap();
        let mut cb = RecordingCommandBuffer::new(&device).unwrap();

        assert!(matches!(
            cb.draw(1),
            Err(RecordError::ValidationError(_)),
        ));

        cb.bind_shader(shader(&device, ShaderStage::Compute)).unwrap();
        assert!(cb.draw(1).is_err());
        cb.dispatch(4).unwrap();

        assert!(cb.push_constants(120, &[0; 16]).is_err());
        cb.push_constants(112, &[0; 16]).unwrap();

        let storage = Buffer::new(
            &device,
            crate::device::BufferCreateInfo {
                size: 16,
                usage: vk::BufferUsageFlags::STORAGE_BUFFER,
                ..Default::default()
            },
        )
        .unwrap();
        assert!(cb.bind_uniform_buffer(0, 0, storage).is_err());

        let other = Device::new(DeviceCreateInfo::default()).unwrap();
        assert!(cb.bind_shader(shader(&other, ShaderStage::Vertex)).is_err());
    }

    #[test]
    fn handle_lifetime() {
        let device = Device::new(DeviceCreateInfo::default()).unwrap();
        let cb = RecordingCommandBuffer::new(&device).unwrap();
        let handle = cb.handle();
        let monitor = device.gpuav().monitor();

        assert_eq!(monitor.state(handle), CommandBufferState::Recording);

        let cb = cb.end();
        let again = cb.reset().unwrap();
        drop(cb);
        assert_eq!(monitor.state(handle), CommandBufferState::Recording);

        drop(again);
        assert_eq!(monitor.state(handle), CommandBufferState::Idle);
    }
}
