use super::Device;
use crate::shader::{
    ir::{Program, ProgramError},
    InstrumentedShader,
};
use ash::vk;
use std::sync::Arc;

/// A shader program, ready to be bound in a command buffer.
#[derive(Debug)]
pub struct ShaderModule {
    device: Arc<Device>,
    handle: vk::ShaderModule,
    program: Program,
    instrumented: Option<Arc<InstrumentedShader>>,
}

impl ShaderModule {
    /// Creates a shader module from `program`.
    ///
    /// The validation context gets the chance to replace the program with an instrumented
    /// version first.
    ///
    /// # Errors
    ///
    /// - Returns an error if `program` is malformed.
    pub fn new(device: &Arc<Device>, program: Program) -> Result<Arc<Self>, ProgramError> {
        program.validate()?;
        let instrumented = device.gpuav().on_shader_created(&program);

        Ok(Arc::new(ShaderModule {
            device: device.clone(),
            handle: device.allocate_handle(),
            program,
            instrumented,
        }))
    }

    #[inline]
    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    #[inline]
    pub fn handle(&self) -> vk::ShaderModule {
        self.handle
    }

    /// Returns the program the module was created from.
    #[inline]
    pub fn program(&self) -> &Program {
        &self.program
    }

    /// Returns the instrumented version of the program, if the validation context produced one.
    #[inline]
    pub fn instrumented(&self) -> Option<&Arc<InstrumentedShader>> {
        self.instrumented.as_ref()
    }

    /// Returns the program that is executed when the module is bound.
    #[inline]
    pub(crate) fn executable(&self) -> &Program {
        self.instrumented
            .as_ref()
            .map_or(&self.program, |shader| shader.program())
    }
}
