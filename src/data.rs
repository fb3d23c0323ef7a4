use crate::context::VkCtx;
use crate::error::{vk_err, ComputeError, Result};
use ash;
use ash::vk::{self, Buffer, DeviceMemory};

#[derive(Clone, Debug)]
pub struct LinkedMemory {
    pub buffer: Buffer,
    pub memory: DeviceMemory,
    pub size: u64,
}

impl LinkedMemory {
    /// Creates a buffer with its own dedicated allocation. `preferred` memory
    /// flags are tried first, then `required` alone.
    pub fn create(
        ctx: &VkCtx,
        size: u64,
        usage: vk::BufferUsageFlags,
        preferred: vk::MemoryPropertyFlags,
        required: vk::MemoryPropertyFlags,
    ) -> Result<LinkedMemory> {
        let buffer = unsafe {
            let buffer_info = vk::BufferCreateInfo {
                size,
                usage,
                sharing_mode: vk::SharingMode::EXCLUSIVE,
                ..Default::default()
            };
            ctx.device.create_buffer(&buffer_info, None)
        }
        .map_err(vk_err("vkCreateBuffer"))?;

        let mem_requirements = unsafe { ctx.device.get_buffer_memory_requirements(buffer) };
        let memory_type_index =
            match ctx.find_memory_type(mem_requirements.memory_type_bits, preferred, required) {
                Ok(index) => index,
                Err(err) => {
                    unsafe { ctx.device.destroy_buffer(buffer, None) };
                    return Err(err);
                }
            };

        let memory = unsafe {
            let memory_info = vk::MemoryAllocateInfo {
                allocation_size: mem_requirements.size,
                memory_type_index,
                ..Default::default()
            };
            ctx.device.allocate_memory(&memory_info, None)
        };
        let memory = match memory {
            Ok(memory) => memory,
            Err(err) => {
                unsafe { ctx.device.destroy_buffer(buffer, None) };
                return Err(vk_err("vkAllocateMemory")(err));
            }
        };

        let linked = LinkedMemory { buffer, memory, size };
        if let Err(err) = unsafe { ctx.device.bind_buffer_memory(buffer, memory, 0) } {
            linked.destroy(&ctx.device);
            return Err(vk_err("vkBindBufferMemory")(err));
        }
        log::debug!("Created {size} byte buffer {buffer:?} in memory type {memory_type_index}");
        Ok(linked)
    }

    pub fn destroy(&self, device: &ash::Device) {
        unsafe {
            device.destroy_buffer(self.buffer, None);
            device.free_memory(self.memory, None);
        }
    }

    pub fn get_mapped_pointer(&self, ctx: &VkCtx) -> Result<MappedMemoryPointer> {
        let ptr = unsafe {
            ctx.device.map_memory(self.memory, 0, self.size, vk::MemoryMapFlags::empty())
        }
        .map_err(vk_err("vkMapMemory"))? as *mut u8;

        Ok(MappedMemoryPointer {
            ptr,
            len: self.size as usize,
            device: ctx.device.clone(),
            memory: self.memory,
        })
    }

    pub fn ensure_fits(&self, len: usize) -> Result<()> {
        if len as u64 > self.size {
            return Err(ComputeError::BufferOverflow { len: len as u64, size: self.size });
        }
        Ok(())
    }

    /// Copies `bytes` to the start of a host-visible buffer.
    pub fn write_bytes(&self, ctx: &VkCtx, bytes: &[u8]) -> Result<()> {
        self.ensure_fits(bytes.len())?;
        let pointer = self.get_mapped_pointer(ctx)?;
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), pointer.ptr, bytes.len());
        }
        Ok(())
    }

    /// Copies the whole content of a host-visible buffer out to the host.
    pub fn read_bytes(&self, ctx: &VkCtx) -> Result<Vec<u8>> {
        let pointer = self.get_mapped_pointer(ctx)?;
        Ok(pointer.as_slice().to_vec())
    }
}

/// A host mapping of a whole allocation, unmapped on drop.
pub struct MappedMemoryPointer {
    pub ptr: *mut u8,
    len: usize,
    device: ash::Device,
    memory: DeviceMemory,
}

impl MappedMemoryPointer {
    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }
}

impl Drop for MappedMemoryPointer {
    fn drop(&mut self) {
        unsafe { self.device.unmap_memory(self.memory) };
    }
}

/// Host-side values that travel to and from a GPU buffer.
pub trait GpuMappedMemory {
    fn as_bytes(&self) -> &[u8];

    /// Overwrites the host copy with bytes read back from the GPU.
    fn read_from(&mut self, bytes: &[u8]);

    fn buffer_size(&self) -> u64 {
        self.as_bytes().len() as u64
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IntBuffer {
    pub data: Vec<i32>,
}

impl IntBuffer {
    pub fn new(data: Vec<i32>) -> IntBuffer {
        IntBuffer { data }
    }

    pub fn zeroed(len: usize) -> IntBuffer {
        IntBuffer { data: vec![0; len] }
    }
}

impl GpuMappedMemory for IntBuffer {
    fn as_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.data)
    }

    fn read_from(&mut self, bytes: &[u8]) {
        let target: &mut [u8] = bytemuck::cast_slice_mut(&mut self.data);
        let len = target.len().min(bytes.len());
        target[..len].copy_from_slice(&bytes[..len]);
    }
}
