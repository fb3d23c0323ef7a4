use std::ffi::{c_char, CStr};
use std::io::{BufRead, Write};
use ash::vk;
use ash::vk::{API_VERSION_1_1, DescriptorPoolCreateFlags};
use vk::ApplicationInfo;
use crate::config::{parse_adapter_choice, RunConfig};
use crate::error::{vk_err, ComputeError, Result};

/// Adapters beyond this index are not considered.
pub const MAX_ADAPTER_COUNT: usize = 16;

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

/// Fence points the demo waits on, in submission order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncPoint {
    Upload = 1,
    Compute = 2,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SubgroupSupport {
    pub size: u32,
    pub compute_arithmetic: bool,
}

/// What a kernel needs from the adapter before it can be dispatched.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KernelRequirements {
    /// Lowest device API version the compiled SPIR-V targets.
    pub api_version: u32,
    pub workgroup_size: u32,
    pub workgroup_count: u32,
    pub shared_memory_bytes: u32,
    pub push_constant_bytes: u32,
}

#[derive(Clone, Debug)]
pub struct AdapterInfo {
    pub physical_device: vk::PhysicalDevice,
    pub name: String,
    pub device_type: vk::PhysicalDeviceType,
    pub api_version: u32,
    pub dedicated_memory: u64,
    pub shared_memory: u64,
    pub limits: vk::PhysicalDeviceLimits,
    pub subgroup: SubgroupSupport,
}

impl AdapterInfo {
    unsafe fn query(instance: &ash::Instance, physical_device: vk::PhysicalDevice) -> AdapterInfo {
        let properties = instance.get_physical_device_properties(physical_device);
        let memory_properties = instance.get_physical_device_memory_properties(physical_device);
        let (dedicated_memory, shared_memory) = heap_totals(&memory_properties);

        let mut subgroup = SubgroupSupport::default();
        if properties.api_version >= API_VERSION_1_1 {
            let mut subgroup_properties = vk::PhysicalDeviceSubgroupProperties::default();
            {
                let mut properties2 =
                    vk::PhysicalDeviceProperties2::default().push_next(&mut subgroup_properties);
                instance.get_physical_device_properties2(physical_device, &mut properties2);
            }
            subgroup = SubgroupSupport {
                size: subgroup_properties.subgroup_size,
                compute_arithmetic: subgroup_properties
                    .supported_stages
                    .contains(vk::ShaderStageFlags::COMPUTE)
                    && subgroup_properties.supported_operations.contains(
                        vk::SubgroupFeatureFlags::BASIC | vk::SubgroupFeatureFlags::ARITHMETIC,
                    ),
            };
        }

        AdapterInfo {
            physical_device,
            name: CStr::from_ptr(properties.device_name.as_ptr())
                .to_string_lossy()
                .into_owned(),
            device_type: properties.device_type,
            api_version: properties.api_version,
            dedicated_memory,
            shared_memory,
            limits: properties.limits,
            subgroup,
        }
    }

    pub fn api_version_string(&self) -> String {
        format!(
            "{}.{}.{}",
            vk::api_version_major(self.api_version),
            vk::api_version_minor(self.api_version),
            vk::api_version_patch(self.api_version)
        )
    }

    pub fn check_requirements(&self, required: &KernelRequirements) -> Result<()> {
        if self.api_version < required.api_version {
            return Err(ComputeError::ApiVersion {
                adapter: self.name.clone(),
                actual: self.api_version_string(),
                required: format!(
                    "{}.{}",
                    vk::api_version_major(required.api_version),
                    vk::api_version_minor(required.api_version)
                ),
            });
        }
        let limits = &self.limits;
        let checks = [
            ("maxComputeWorkGroupSize[0]", limits.max_compute_work_group_size[0], required.workgroup_size),
            ("maxComputeWorkGroupInvocations", limits.max_compute_work_group_invocations, required.workgroup_size),
            ("maxComputeWorkGroupCount[0]", limits.max_compute_work_group_count[0], required.workgroup_count),
            ("maxComputeSharedMemorySize", limits.max_compute_shared_memory_size, required.shared_memory_bytes),
            ("maxPushConstantsSize", limits.max_push_constants_size, required.push_constant_bytes),
        ];
        match checks.into_iter().find(|(_, actual, needed)| actual < needed) {
            Some((limit, actual, needed)) => Err(ComputeError::DeviceLimit {
                adapter: self.name.clone(),
                limit,
                actual,
                required: needed,
            }),
            None => Ok(()),
        }
    }

    fn print_description(&self) {
        println!("Adapter description: {}", self.name);
        println!("Device type: {:?}", self.device_type);
        println!("Dedicated Video Memory: {:.1} GB", gib(self.dedicated_memory));
        println!("Shared System Memory: {:.1} GB", gib(self.shared_memory));
        println!("Current device supports API version: {}", self.api_version_string());
        if self.subgroup.compute_arithmetic {
            println!("Current GPU supports subgroup arithmetic in compute shaders!!");
            println!("The subgroup lane count is: {}", self.subgroup.size);
        }
        println!(
            "Pipeline layout limits: {} push constant bytes, {} bound descriptor sets",
            self.limits.max_push_constants_size, self.limits.max_bound_descriptor_sets
        );
    }
}

/// Sums the device-local heaps and the remaining host heaps separately.
pub fn heap_totals(memory_properties: &vk::PhysicalDeviceMemoryProperties) -> (u64, u64) {
    memory_properties.memory_heaps[..memory_properties.memory_heap_count as usize]
        .iter()
        .fold((0, 0), |(dedicated, shared), heap| {
            if heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL) {
                (dedicated + heap.size, shared)
            } else {
                (dedicated, shared + heap.size)
            }
        })
}

pub fn gib(bytes: u64) -> f64 {
    bytes as f64 / (1024.0 * 1024.0 * 1024.0)
}

/// Maps a user choice onto a valid adapter index, falling back to 0.
pub fn resolve_adapter_index(choice: i64, adapter_count: usize) -> usize {
    if choice < 0 || choice as u64 >= adapter_count as u64 {
        log::warn!(
            "The index you input exceeds the range of available adapter count. So adapter[0] will be used!"
        );
        0
    } else {
        choice as usize
    }
}

pub fn select_memory_type(
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
    memory_type_bits: u32,
    flags: vk::MemoryPropertyFlags,
) -> Option<u32> {
    (0..memory_properties.memory_type_count).find(|&i| {
        (memory_type_bits & (1 << i)) != 0
            && memory_properties.memory_types[i as usize].property_flags.contains(flags)
    })
}

fn prompt_adapter_choice() -> Result<i64> {
    print!("Please choose which adapter to use: ");
    std::io::stdout().flush().map_err(ComputeError::Prompt)?;
    let mut line = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut line)
        .map_err(ComputeError::Prompt)?;
    Ok(parse_adapter_choice(&line))
}

pub struct VkCtx {
    pub command_buffer: vk::CommandBuffer,
    pub command_pool: vk::CommandPool,
    pub device: ash::Device,
    pub physical_device: vk::PhysicalDevice,
    pub instance: ash::Instance,
    pub queue: vk::Queue,
    pub queue_family_index: u32,
    pub descriptor_pool: vk::DescriptorPool,
    pub adapter: AdapterInfo,
}

impl VkCtx {
    pub fn destroy(&self) {
        log::info!("Destroying VkCtx");
        unsafe {
            log::debug!("Destroying descriptor pool {:?}", self.descriptor_pool);
            self.device.destroy_descriptor_pool(self.descriptor_pool, None);
            log::debug!("Destroying command buffers {:?}", self.command_buffer);
            self.device.free_command_buffers(self.command_pool, &[self.command_buffer]);
            log::debug!("Destroying command pool {:?}", self.command_pool);
            self.device.destroy_command_pool(self.command_pool, None);
            log::debug!("Destroying device {:?}", self.device.handle());
            self.device.destroy_device(None);
            log::debug!("Destroying instance");
            self.instance.destroy_instance(None);
        }
    }
}

impl VkCtx {
    unsafe fn create_instance(entry: &ash::Entry, config: &RunConfig) -> Result<ash::Instance> {
        let mut layer_names: Vec<*const c_char> = Vec::new();
        if config.validation {
            let layer_properties = entry
                .enumerate_instance_layer_properties()
                .map_err(vk_err("vkEnumerateInstanceLayerProperties"))?;
            let layer_found = layer_properties
                .iter()
                .any(|layer| (unsafe { CStr::from_ptr(layer.layer_name.as_ptr()) }) == VALIDATION_LAYER);
            if layer_found {
                layer_names.push(VALIDATION_LAYER.as_ptr());
            } else {
                log::warn!("Validation layer {VALIDATION_LAYER:?} not available, continuing without it");
            }
        }

        let app_info = ApplicationInfo {
            p_application_name: c"add-reduce".as_ptr(),
            application_version: 0,
            engine_version: 0,
            p_engine_name: c"No Engine".as_ptr(),
            api_version: API_VERSION_1_1,
            ..Default::default()
        };

        let create_info = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_layer_names(&layer_names);

        let instance = entry
            .create_instance(&create_info, None)
            .map_err(vk_err("vkCreateInstance"))?;
        log::debug!("Created instance {:?}", instance.handle());
        Ok(instance)
    }

    unsafe fn choose_adapter(instance: &ash::Instance, config: &RunConfig) -> Result<AdapterInfo> {
        let adapters = instance
            .enumerate_physical_devices()
            .map_err(vk_err("vkEnumeratePhysicalDevices"))?
            .into_iter()
            .take(MAX_ADAPTER_COUNT)
            .map(|physical_device| unsafe { AdapterInfo::query(instance, physical_device) })
            .collect::<Vec<_>>();
        if adapters.is_empty() {
            return Err(ComputeError::NoAdapters);
        }

        println!(
            "Found {} Vulkan capable device{} in all.",
            adapters.len(),
            if adapters.len() > 1 { "s" } else { "" }
        );
        for (i, adapter) in adapters.iter().enumerate() {
            println!("Adapter[{i}]: {}", adapter.name);
        }

        let choice = match config.adapter {
            Some(choice) => choice,
            None => prompt_adapter_choice()?,
        };
        let selected = resolve_adapter_index(choice, adapters.len());
        let adapter = adapters.into_iter().nth(selected).ok_or(ComputeError::NoAdapters)?;

        println!("\nYou have chosen adapter[{selected}]");
        adapter.print_description();
        println!("\n================================================\n");
        Ok(adapter)
    }

    pub unsafe fn create_compute_ctx(entry: &ash::Entry, config: &RunConfig) -> Result<VkCtx> {
        let instance = Self::create_instance(entry, config)?;
        match Self::create_device_objects(instance.clone(), config) {
            Ok(ctx) => Ok(ctx),
            Err(err) => {
                instance.destroy_instance(None);
                Err(err)
            }
        }
    }

    unsafe fn create_device_objects(instance: ash::Instance, config: &RunConfig) -> Result<VkCtx> {
        let adapter = Self::choose_adapter(&instance, config)?;
        let physical_device = adapter.physical_device;

        let queue_family_index = instance
            .get_physical_device_queue_family_properties(physical_device)
            .iter()
            .position(|family| family.queue_flags.contains(vk::QueueFlags::COMPUTE))
            .ok_or_else(|| ComputeError::NoComputeQueue { adapter: adapter.name.clone() })?
            as u32;

        let device = {
            let queue_priorities = [1.0f32];
            let queue_create_infos = [vk::DeviceQueueCreateInfo::default()
                .queue_family_index(queue_family_index)
                .queue_priorities(&queue_priorities)];
            let device_create_info =
                vk::DeviceCreateInfo::default().queue_create_infos(&queue_create_infos);
            instance.create_device(physical_device, &device_create_info, None)
        }
        .map_err(vk_err("vkCreateDevice"))?;
        log::debug!("Created device {:?}", device.handle());

        let queue = device.get_device_queue(queue_family_index, 0);
        log::debug!("Got queue {:?} from family {}", queue, queue_family_index);

        let command_pool = {
            let command_pool_create_info = vk::CommandPoolCreateInfo {
                queue_family_index,
                ..Default::default()
            };
            device.create_command_pool(&command_pool_create_info, None)
        };
        let command_pool = match command_pool {
            Ok(pool) => pool,
            Err(err) => {
                device.destroy_device(None);
                return Err(vk_err("vkCreateCommandPool")(err));
            }
        };

        let command_buffer = {
            let command_buffer_allocate_info = vk::CommandBufferAllocateInfo {
                command_pool,
                level: vk::CommandBufferLevel::PRIMARY,
                command_buffer_count: 1,
                ..Default::default()
            };
            device.allocate_command_buffers(&command_buffer_allocate_info)
        };
        let command_buffer = match command_buffer {
            Ok(buffers) => buffers[0],
            Err(err) => {
                device.destroy_command_pool(command_pool, None);
                device.destroy_device(None);
                return Err(vk_err("vkAllocateCommandBuffers")(err));
            }
        };

        let descriptor_pool = {
            // One storage descriptor per bound buffer: source, added, group values.
            let pool_sizes = [vk::DescriptorPoolSize {
                ty: vk::DescriptorType::STORAGE_BUFFER,
                descriptor_count: 3,
            }];
            let descriptor_pool_create_info = vk::DescriptorPoolCreateInfo::default()
                .max_sets(1)
                .pool_sizes(&pool_sizes)
                .flags(DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET);
            device.create_descriptor_pool(&descriptor_pool_create_info, None)
        };
        let descriptor_pool = match descriptor_pool {
            Ok(pool) => pool,
            Err(err) => {
                device.free_command_buffers(command_pool, &[command_buffer]);
                device.destroy_command_pool(command_pool, None);
                device.destroy_device(None);
                return Err(vk_err("vkCreateDescriptorPool")(err));
            }
        };
        log::debug!("Created descriptor pool {:?}", descriptor_pool);

        Ok(VkCtx {
            command_buffer,
            command_pool,
            device,
            physical_device,
            instance,
            queue,
            queue_family_index,
            descriptor_pool,
            adapter,
        })
    }

    pub fn create_shader_module(&self, code: &[u32]) -> Result<vk::ShaderModule> {
        log::info!("Creating shader module ({} words)", code.len());
        let shader_info = vk::ShaderModuleCreateInfo::default().code(code);
        unsafe { self.device.create_shader_module(&shader_info, None) }
            .map_err(vk_err("vkCreateShaderModule"))
    }

    /// Finds a memory type with `preferred` flags, else one with `required` flags.
    pub fn find_memory_type(
        &self,
        memory_type_bits: u32,
        preferred: vk::MemoryPropertyFlags,
        required: vk::MemoryPropertyFlags,
    ) -> Result<u32> {
        let memory_properties = unsafe {
            self.instance.get_physical_device_memory_properties(self.physical_device)
        };
        select_memory_type(&memory_properties, memory_type_bits, preferred)
            .or_else(|| select_memory_type(&memory_properties, memory_type_bits, required))
            .ok_or(ComputeError::NoMemoryType { memory_type_bits, flags: required })
    }

    /// Starts recording into the context's command buffer.
    pub fn begin_commands(&self) -> Result<()> {
        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe { self.device.begin_command_buffer(self.command_buffer, &begin_info) }
            .map_err(vk_err("vkBeginCommandBuffer"))
    }

    pub fn end_commands(&self) -> Result<()> {
        unsafe { self.device.end_command_buffer(self.command_buffer) }
            .map_err(vk_err("vkEndCommandBuffer"))
    }

    /// Makes the command buffer recordable again. Only valid once the
    /// previous submission has completed.
    pub fn reset_commands(&self) -> Result<()> {
        unsafe {
            self.device
                .reset_command_pool(self.command_pool, vk::CommandPoolResetFlags::empty())
        }
        .map_err(vk_err("vkResetCommandPool"))
    }

    /// Submits the recorded command buffer and blocks until the GPU reaches the fence.
    pub fn submit_and_wait(&self, sync_point: SyncPoint) -> Result<()> {
        log::info!("Submitting commands for {:?} (fence value {})", sync_point, sync_point as u64);
        unsafe {
            let fence = self
                .device
                .create_fence(&vk::FenceCreateInfo::default(), None)
                .map_err(vk_err("vkCreateFence"))?;
            let submit_info =
                vk::SubmitInfo::default().command_buffers(std::slice::from_ref(&self.command_buffer));
            let result = self
                .device
                .queue_submit(self.queue, &[submit_info], fence)
                .map_err(vk_err("vkQueueSubmit"))
                .and_then(|_| {
                    self.device
                        .wait_for_fences(&[fence], true, u64::MAX)
                        .map_err(vk_err("vkWaitForFences"))
                });
            self.device.destroy_fence(fence, None);
            result
        }
    }
}
