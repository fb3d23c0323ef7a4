use std::fs::File;
use std::path::Path;
use ash::util::read_spv;
use ash::vk;
use ash::vk::{
    ComputePipelineCreateInfo, DescriptorBufferInfo, DescriptorSetLayoutBinding,
    DescriptorSetLayoutCreateInfo, DescriptorType, PipelineBindPoint, PipelineCache,
    PipelineLayout, PipelineLayoutCreateInfo, PipelineShaderStageCreateInfo, ShaderStageFlags,
    WriteDescriptorSet,
};
use vk::{DescriptorSet, DescriptorSetLayout, Pipeline, ShaderModule};
use crate::context::{SyncPoint, VkCtx};
use crate::data::{GpuMappedMemory, LinkedMemory};
use crate::error::{vk_err, ComputeError, Result};
use crate::transfer;

#[derive(Clone, Debug, Default)]
pub struct ShaderExecutionContext {
    pub shader_module: ShaderModule,
    pub descriptor_set_layouts: Vec<DescriptorSetLayout>,
    pub descriptor_set: DescriptorSet,
    pub pipeline_layout: PipelineLayout,
    pub pipeline: Pipeline,
    /// Device-local buffers, in layout description order.
    pub device_buffers: Vec<LinkedMemory>,
    /// Host-visible copies for the bindings that are read back.
    pub readback_buffers: Vec<Option<LinkedMemory>>,
}

impl ShaderExecutionContext {
    pub fn destroy(&self, device: &ash::Device, descriptor_set_pool: &vk::DescriptorPool) {
        unsafe {
            log::debug!("Destroying buffers");
            for buffer in self.device_buffers.iter() {
                buffer.destroy(device);
            }
            for buffer in self.readback_buffers.iter().flatten() {
                buffer.destroy(device);
            }
            log::debug!("Destroying pipeline");
            device.destroy_pipeline(self.pipeline, None);
            log::debug!("Destroying pipeline layout");
            device.destroy_pipeline_layout(self.pipeline_layout, None);
            if self.descriptor_set != DescriptorSet::null() {
                log::debug!("Freeing descriptor sets");
                if let Err(err) = device.free_descriptor_sets(*descriptor_set_pool, &[self.descriptor_set]) {
                    log::warn!("vkFreeDescriptorSets failed: {err}");
                }
            }
            log::debug!("Destroying descriptor set layouts");
            for layout in self.descriptor_set_layouts.iter() {
                device.destroy_descriptor_set_layout(*layout, None);
            }
            log::debug!("Destroying shader module");
            device.destroy_shader_module(self.shader_module, None);
        }
    }
}

/// One storage buffer binding of a compute shader. `upload` and `readback`
/// index into the shader's writables and readables.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LayoutDescription {
    pub binding: u32,
    pub buffer_size: u64,
    pub upload: Option<usize>,
    pub readback: Option<usize>,
}

impl LayoutDescription {
    pub fn usage(&self) -> vk::BufferUsageFlags {
        let mut usage = vk::BufferUsageFlags::STORAGE_BUFFER;
        if self.upload.is_some() {
            usage |= vk::BufferUsageFlags::TRANSFER_DST;
        }
        if self.readback.is_some() {
            usage |= vk::BufferUsageFlags::TRANSFER_SRC;
        }
        usage
    }

    pub fn create_linked_memory(&self, ctx: &VkCtx) -> Result<LinkedMemory> {
        LinkedMemory::create(
            ctx,
            self.buffer_size,
            self.usage(),
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            vk::MemoryPropertyFlags::empty(),
        )
    }

    fn layout_binding(&self) -> DescriptorSetLayoutBinding<'static> {
        DescriptorSetLayoutBinding::default()
            .binding(self.binding)
            .descriptor_type(DescriptorType::STORAGE_BUFFER)
            .descriptor_count(1)
            .stage_flags(ShaderStageFlags::COMPUTE)
    }
}

/// Pipelines a failed batch creation still handed out; failed slots are null.
fn created_pipelines(pipelines: &[Pipeline]) -> impl Iterator<Item = Pipeline> + '_ {
    pipelines.iter().copied().filter(|pipeline| *pipeline != Pipeline::null())
}

/// Device API version the compiled kernels target.
pub const KERNEL_API_VERSION: u32 = vk::API_VERSION_1_1;

/// Compiles GLSL compute source to SPIR-V for a Vulkan 1.1 target, with
/// each entry of `defines` set as a preprocessor macro.
pub fn compile_to_spirv(
    source: &str,
    file_name: &str,
    entry_point: &str,
    defines: &[&str],
) -> Result<Vec<u32>> {
    let compiler = shaderc::Compiler::new().ok_or(ComputeError::CompilerUnavailable)?;
    let mut options = shaderc::CompileOptions::new().ok_or(ComputeError::CompilerUnavailable)?;
    options.set_target_env(shaderc::TargetEnv::Vulkan, shaderc::EnvVersion::Vulkan1_1 as u32);
    for define in defines {
        options.add_macro_definition(define, None);
    }
    let binary_result = compiler.compile_into_spirv(
        source,
        shaderc::ShaderKind::Compute,
        file_name,
        entry_point,
        Some(&options),
    )?;
    if binary_result.get_num_warnings() > 0 {
        log::warn!("{file_name}: {}", binary_result.get_warning_messages());
    }
    Ok(binary_result.as_binary().to_vec())
}

/// Reads a precompiled SPIR-V binary from disk.
pub fn load_spirv(path: &Path) -> Result<Vec<u32>> {
    let shader_file = |source| ComputeError::ShaderFile { path: path.to_path_buf(), source };
    let mut file = File::open(path).map_err(shader_file)?;
    read_spv(&mut file).map_err(shader_file)
}

pub trait ComputeShader<TPushConstants: bytemuck::Pod> {
    /**
     * Reads or creates the SPIR-V binary for the shader
     */
    fn get_spirv(&self) -> Result<Vec<u32>>;

    fn get_layout_descriptors(&self) -> Vec<LayoutDescription>;

    fn get_writables(&self) -> Vec<&dyn GpuMappedMemory>;

    fn get_readables(&mut self) -> Vec<&mut dyn GpuMappedMemory>;

    fn get_push_constants(&self) -> Option<TPushConstants> {
        None
    }

    fn get_group_vec(&self) -> (u32, u32, u32) {
        (1, 1, 1)
    }

    /**
     * Copies the writables into their device-local buffers and waits for the
     * copies to finish. Staging buffers are released before returning.
     */
    fn upload_inputs(&self, ctx: &VkCtx, module: &ShaderExecutionContext) -> Result<()> {
        let descriptors = self.get_layout_descriptors();
        let writables = self.get_writables();
        let mut staging_buffers = Vec::new();

        let recorded = (|| -> Result<()> {
            ctx.begin_commands()?;
            for (descriptor, device_buffer) in descriptors.iter().zip(module.device_buffers.iter()) {
                if let Some(index) = descriptor.upload {
                    let staging = transfer::create_staging(ctx, writables[index].as_bytes())?;
                    transfer::record_upload(ctx, &staging, device_buffer);
                    staging_buffers.push(staging);
                }
            }
            ctx.end_commands()
        })();
        let result = recorded.and_then(|_| ctx.submit_and_wait(SyncPoint::Upload));

        log::debug!("Releasing {} staging buffers", staging_buffers.len());
        for staging in staging_buffers.iter() {
            staging.destroy(&ctx.device);
        }
        result
    }

    /**
     * Reads the results of the compute shader from the readback buffers
     */
    fn read_result(&mut self, ctx: &VkCtx, module: &ShaderExecutionContext) -> Result<()> {
        let descriptors = self.get_layout_descriptors();
        let mut readables = self.get_readables();

        for (descriptor, readback) in descriptors.iter().zip(module.readback_buffers.iter()) {
            if let (Some(index), Some(readback)) = (descriptor.readback, readback) {
                let bytes = readback.read_bytes(ctx)?;
                readables[index].read_from(&bytes);
            }
        }
        Ok(())
    }

    /**
     * Dispatch the compute shader, copy its outputs to the readback buffers
     * and wait for the GPU to finish
     */
    fn run_shader(&self, ctx: &VkCtx, module: &ShaderExecutionContext) -> Result<()> {
        let command_buffer = ctx.command_buffer;
        let (group_count_x, group_count_y, group_count_z) = self.get_group_vec();

        ctx.reset_commands()?;
        ctx.begin_commands()?;
        unsafe {
            ctx.device.cmd_bind_pipeline(command_buffer, PipelineBindPoint::COMPUTE, module.pipeline);
            ctx.device.cmd_bind_descriptor_sets(
                command_buffer,
                PipelineBindPoint::COMPUTE,
                module.pipeline_layout,
                0,
                &[module.descriptor_set],
                &[],
            );

            if let Some(push_constants) = self.get_push_constants() {
                ctx.device.cmd_push_constants(
                    command_buffer,
                    module.pipeline_layout,
                    ShaderStageFlags::COMPUTE,
                    0,
                    bytemuck::bytes_of(&push_constants),
                );
            }

            log::info!("Dispatching {group_count_x}x{group_count_y}x{group_count_z} groups");
            ctx.device.cmd_dispatch(command_buffer, group_count_x, group_count_y, group_count_z);
        }

        let pairs = module
            .device_buffers
            .iter()
            .zip(module.readback_buffers.iter())
            .filter_map(|(source, readback)| readback.as_ref().map(|readback| (source, readback)))
            .collect::<Vec<_>>();
        transfer::record_readback(ctx, &pairs);

        ctx.end_commands()?;
        ctx.submit_and_wait(SyncPoint::Compute)
    }

    fn create_compute_pipeline(
        pipeline_layout: &PipelineLayout,
        ctx: &VkCtx,
        shader_module: &ShaderModule,
    ) -> Result<Pipeline> {
        let compute_pipeline_info = ComputePipelineCreateInfo::default()
            .stage(
                PipelineShaderStageCreateInfo::default()
                    .module(*shader_module)
                    .name(c"main")
                    .stage(ShaderStageFlags::COMPUTE),
            )
            .layout(*pipeline_layout);

        let pipelines = unsafe {
            ctx.device
                .create_compute_pipelines(PipelineCache::null(), &[compute_pipeline_info], None)
        }
        .map_err(|(partial, err)| {
            for pipeline in created_pipelines(&partial) {
                unsafe { ctx.device.destroy_pipeline(pipeline, None) };
            }
            vk_err("vkCreateComputePipelines")(err)
        })?;

        Ok(pipelines[0])
    }

    /**
     * Builds the shader context, which can be used multiple times to
     * upload the shader inputs, dispatch the shader, and read the results.
     * Whatever was created before a failure is released again.
     */
    fn build_shader_context(&self, ctx: &VkCtx) -> Result<ShaderExecutionContext> {
        let mut module = ShaderExecutionContext::default();
        match self.populate_shader_context(ctx, &mut module) {
            Ok(()) => Ok(module),
            Err(err) => {
                module.destroy(&ctx.device, &ctx.descriptor_pool);
                Err(err)
            }
        }
    }

    fn populate_shader_context(&self, ctx: &VkCtx, module: &mut ShaderExecutionContext) -> Result<()> {
        module.shader_module = ctx.create_shader_module(&self.get_spirv()?)?;

        let layout_descriptors = self.get_layout_descriptors();
        let bindings = layout_descriptors
            .iter()
            .map(LayoutDescription::layout_binding)
            .collect::<Vec<_>>();

        module.descriptor_set_layouts.push(
            unsafe {
                ctx.device.create_descriptor_set_layout(
                    &DescriptorSetLayoutCreateInfo::default().bindings(&bindings),
                    None,
                )
            }
            .map_err(vk_err("vkCreateDescriptorSetLayout"))?,
        );

        module.descriptor_set = unsafe {
            ctx.device.allocate_descriptor_sets(
                &vk::DescriptorSetAllocateInfo::default()
                    .descriptor_pool(ctx.descriptor_pool)
                    .set_layouts(&module.descriptor_set_layouts),
            )
        }
        .map_err(vk_err("vkAllocateDescriptorSets"))?[0];

        let push_constant_ranges = match self.get_push_constants() {
            Some(_) => vec![vk::PushConstantRange {
                stage_flags: ShaderStageFlags::COMPUTE,
                offset: 0,
                size: std::mem::size_of::<TPushConstants>() as u32,
            }],
            None => Vec::new(),
        };

        let pipeline_layout_info = PipelineLayoutCreateInfo::default()
            .set_layouts(&module.descriptor_set_layouts)
            .push_constant_ranges(&push_constant_ranges);

        module.pipeline_layout = unsafe { ctx.device.create_pipeline_layout(&pipeline_layout_info, None) }
            .map_err(vk_err("vkCreatePipelineLayout"))?;

        module.pipeline = Self::create_compute_pipeline(&module.pipeline_layout, ctx, &module.shader_module)?;

        for descriptor in layout_descriptors.iter() {
            module.device_buffers.push(descriptor.create_linked_memory(ctx)?);
            let readback = match descriptor.readback {
                Some(_) => Some(transfer::create_readback(ctx, descriptor.buffer_size)?),
                None => None,
            };
            module.readback_buffers.push(readback);
        }

        let buffer_infos = layout_descriptors
            .iter()
            .zip(module.device_buffers.iter())
            .map(|(descriptor, device_buffer)| DescriptorBufferInfo {
                buffer: device_buffer.buffer,
                offset: 0,
                range: descriptor.buffer_size,
            })
            .collect::<Vec<DescriptorBufferInfo>>();

        let write_descriptor_sets = buffer_infos
            .iter()
            .zip(layout_descriptors.iter())
            .map(|(buffer_info, descriptor)| {
                WriteDescriptorSet::default()
                    .dst_set(module.descriptor_set)
                    .dst_binding(descriptor.binding)
                    .descriptor_type(DescriptorType::STORAGE_BUFFER)
                    .buffer_info(std::slice::from_ref(buffer_info))
            })
            .collect::<Vec<WriteDescriptorSet>>();

        unsafe {
            ctx.device.update_descriptor_sets(&write_descriptor_sets, &[]);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    const SPIRV_MAGIC: u32 = 0x0723_0203;

    #[test]
    fn failed_pipeline_batches_release_only_real_handles() {
        let partial = [Pipeline::from_raw(7), Pipeline::null(), Pipeline::from_raw(9)];
        let created = created_pipelines(&partial).collect::<Vec<_>>();
        assert_eq!(created, vec![Pipeline::from_raw(7), Pipeline::from_raw(9)]);
        assert_eq!(created_pipelines(&[Pipeline::null()]).count(), 0);
    }

    const PASSTHROUGH: &str = r#"
        #version 450
        layout(local_size_x = 64) in;
        layout(std430, binding = 0) buffer Data { int data[]; };
        void main() {
        #ifdef DOUBLE
            data[gl_GlobalInvocationID.x] *= 2;
        #else
            data[gl_GlobalInvocationID.x] += 1;
        #endif
        }
    "#;

    fn description(upload: Option<usize>, readback: Option<usize>) -> LayoutDescription {
        LayoutDescription { binding: 0, buffer_size: 16, upload, readback }
    }

    #[test]
    fn buffer_usage_follows_transfer_direction() {
        assert_eq!(description(None, None).usage(), vk::BufferUsageFlags::STORAGE_BUFFER);
        assert_eq!(
            description(Some(0), None).usage(),
            vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::TRANSFER_DST
        );
        assert_eq!(
            description(Some(1), Some(0)).usage(),
            vk::BufferUsageFlags::STORAGE_BUFFER
                | vk::BufferUsageFlags::TRANSFER_DST
                | vk::BufferUsageFlags::TRANSFER_SRC
        );
    }

    #[test]
    fn every_binding_is_a_compute_storage_buffer() {
        let binding = LayoutDescription { binding: 2, ..description(None, Some(0)) }.layout_binding();
        assert_eq!(binding.binding, 2);
        assert_eq!(binding.descriptor_type, DescriptorType::STORAGE_BUFFER);
        assert_eq!(binding.descriptor_count, 1);
        assert_eq!(binding.stage_flags, ShaderStageFlags::COMPUTE);
    }

    #[test]
    fn compiles_glsl_with_and_without_defines() {
        let plain = compile_to_spirv(PASSTHROUGH, "passthrough.comp", "main", &[]).unwrap();
        let doubled = compile_to_spirv(PASSTHROUGH, "passthrough.comp", "main", &["DOUBLE"]).unwrap();
        assert_eq!(plain[0], SPIRV_MAGIC);
        assert_eq!(doubled[0], SPIRV_MAGIC);
        assert_ne!(plain, doubled);
    }

    #[test]
    fn compilation_errors_surface_as_shader_errors() {
        let err = compile_to_spirv("#version 450\nvoid main() { oops }", "broken.comp", "main", &[])
            .unwrap_err();
        assert!(matches!(err, ComputeError::ShaderCompilation(_)));
    }

    #[test]
    fn missing_spirv_file_names_the_path() {
        let err = load_spirv(Path::new("does/not/exist.spv")).unwrap_err();
        assert!(err.to_string().contains("does/not/exist.spv"), "{err}");
    }
}
