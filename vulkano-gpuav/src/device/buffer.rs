use super::{memory::Allocation, Device};
use crate::{
    address_range::{OverlapError, OwnerHandle},
    DeviceAddress, DeviceSize, NonExhaustive, ValidationError,
};
use ash::vk;
use std::{error::Error, fmt, sync::Arc};

/// The largest buffer the software device can create.
const MAX_BUFFER_SIZE: DeviceSize = 1 << 30;

/// A linear array of device memory.
///
/// If the buffer was created with the `SHADER_DEVICE_ADDRESS` usage, its address range is
/// registered with the device's validation context for as long as the buffer is alive.
#[derive(Debug)]
pub struct Buffer {
    device: Arc<Device>,
    handle: vk::Buffer,
    allocation: Arc<Allocation>,
    usage: vk::BufferUsageFlags,
}

impl Buffer {
    /// Creates a new `Buffer` and binds memory to it.
    pub fn new(
        device: &Arc<Device>,
        create_info: BufferCreateInfo,
    ) -> Result<Arc<Self>, BufferError> {
        create_info
            .validate()
            .map_err(|err| BufferError::ValidationError(err.add_context("create_info")))?;

        let BufferCreateInfo {
            size,
            usage,
            _ne: _,
        } = create_info;

        let allocation = device
            .memory()
            .allocate(size)
            .ok_or(BufferError::OutOfDeviceMemory)?;
        let handle: vk::Buffer = device.allocate_handle();

        if let Err(err) = device.gpuav().on_allocation_created(
            OwnerHandle::from_handle(handle),
            allocation.base(),
            size,
            usage.contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS),
        ) {
            device.memory().free(allocation.base());

            return Err(err.into());
        }

        Ok(Arc::new(Buffer {
            device: device.clone(),
            handle,
            allocation,
            usage,
        }))
    }

    #[inline]
    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    #[inline]
    pub fn handle(&self) -> vk::Buffer {
        self.handle
    }

    #[inline]
    pub fn size(&self) -> DeviceSize {
        self.allocation.size()
    }

    #[inline]
    pub fn usage(&self) -> vk::BufferUsageFlags {
        self.usage
    }

    /// Returns the device address of the start of the buffer.
    ///
    /// # Errors
    ///
    /// - Returns [`BufferError::MissingDeviceAddressUsage`] if the buffer wasn't created with
    ///   the `SHADER_DEVICE_ADDRESS` usage.
    pub fn device_address(&self) -> Result<DeviceAddress, BufferError> {
        if !self
            .usage
            .contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS)
        {
            return Err(BufferError::MissingDeviceAddressUsage);
        }

        Ok(self.allocation.base())
    }

    /// Writes `data` to the buffer at `offset`.
    pub fn write(&self, offset: DeviceSize, data: &[u8]) -> Result<(), BufferError> {
        let offset = self.check_range(offset, data.len())?;
        self.allocation.write_at(offset, data);

        Ok(())
    }

    /// Reads `len` bytes from the buffer at `offset`.
    pub fn read(&self, offset: DeviceSize, len: usize) -> Result<Vec<u8>, BufferError> {
        let offset = self.check_range(offset, len)?;
        let mut data = vec![0; len];
        self.allocation.read_at(offset, &mut data);

        Ok(data)
    }

    pub(crate) fn allocation(&self) -> &Allocation {
        &self.allocation
    }

    fn check_range(&self, offset: DeviceSize, len: usize) -> Result<usize, BufferError> {
        let in_range = offset
            .checked_add(len as DeviceSize)
            .is_some_and(|end| end <= self.size());

        if !in_range {
            return Err(BufferError::OutOfRange {
                offset,
                len: len as DeviceSize,
                buffer_size: self.size(),
            });
        }

        Ok(offset as usize)
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        self.device
            .gpuav()
            .on_allocation_destroyed(OwnerHandle::from_handle(self.handle));
        self.device.memory().free(self.allocation.base());
    }
}

/// Parameters to create a new `Buffer`.
#[derive(Clone, Debug)]
pub struct BufferCreateInfo {
    /// The size in bytes of the buffer.
    ///
    /// The default value is `0`, which must be overridden.
    pub size: DeviceSize,

    /// How the buffer is going to be used.
    ///
    /// The default value is empty, which must be overridden.
    pub usage: vk::BufferUsageFlags,

    pub _ne: NonExhaustive,
}

impl Default for BufferCreateInfo {
    #[inline]
    fn default() -> Self {
        BufferCreateInfo {
            size: 0,
            usage: vk::BufferUsageFlags::empty(),
            _ne: NonExhaustive(()),
        }
    }
}

impl BufferCreateInfo {
    pub(crate) fn validate(&self) -> Result<(), Box<ValidationError>> {
        let &Self { size, usage, _ne } = self;

        if size == 0 {
            return Err(Box::new(ValidationError {
                context: "size".into(),
                problem: "is zero".into(),
                vuids: &["VUID-VkBufferCreateInfo-size-00912"],
            }));
        }

        if size > MAX_BUFFER_SIZE {
            return Err(Box::new(ValidationError {
                context: "size".into(),
                problem: "exceeds the maximum buffer size of the device".into(),
                ..Default::default()
            }));
        }

        if usage.is_empty() {
            return Err(Box::new(ValidationError {
                context: "usage".into(),
                problem: "is empty".into(),
                vuids: &["VUID-VkBufferCreateInfo-usage-requiredbitmask"],
            }));
        }

        Ok(())
    }
}

/// Error that can happen when creating or accessing a buffer.
#[derive(Clone, Debug)]
pub enum BufferError {
    ValidationError(Box<ValidationError>),

    /// The device ran out of address space.
    OutOfDeviceMemory,

    /// The buffer's address range overlaps a live one.
    AddressOverlap(OverlapError),

    /// The buffer doesn't have the `SHADER_DEVICE_ADDRESS` usage.
    MissingDeviceAddressUsage,

    /// The accessed range is not inside the buffer.
    OutOfRange {
        offset: DeviceSize,
        len: DeviceSize,
        buffer_size: DeviceSize,
    },
}

impl fmt::Display for BufferError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ValidationError(_) => write!(f, "a validation error occurred"),
            Self::OutOfDeviceMemory => write!(f, "the device is out of address space"),
            Self::AddressOverlap(_) => {
                write!(f, "the buffer's address range overlaps that of a live buffer")
            }
            Self::MissingDeviceAddressUsage => write!(
                f,
                "the buffer was not created with the `SHADER_DEVICE_ADDRESS` usage",
            ),
            Self::OutOfRange {
                offset,
                len,
                buffer_size,
            } => write!(
                f,
                "the range {offset}..{} is out of bounds of the buffer of {buffer_size} bytes",
                offset.saturating_add(*len),
            ),
        }
    }
}

impl Error for BufferError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::ValidationError(err) => Some(err),
            Self::AddressOverlap(err) => Some(err),
            _ => None,
        }
    }
}

impl From<OverlapError> for BufferError {
    fn from(err: OverlapError) -> Self {
        Self::AddressOverlap(err)
    }
}
