use std::path::PathBuf;
use bytemuck::{Pod, Zeroable};
use crate::context::{AdapterInfo, KernelRequirements};
use crate::data::{GpuMappedMemory, IntBuffer};
use crate::demo::workload::{Workload, GROUP_SIZE};
use crate::error::Result;
use crate::shader::{compile_to_spirv, load_spirv, ComputeShader, LayoutDescription, KERNEL_API_VERSION};

/// Push constants of `add_reduce.comp`.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Pod, Zeroable)]
pub struct KernelConstants {
    pub add_value: i32,
    pub element_count: u32,
}

/// Adds a constant to every source element and reduces each group's slice
/// of the group values into the slice's first element.
pub struct AddReduceShader {
    pub workload: Workload,
    pub added: IntBuffer,
    pub reduced: IntBuffer,
    pub use_subgroups: bool,
    pub spirv_path: Option<PathBuf>,
}

impl AddReduceShader {
    pub fn new(workload: Workload) -> AddReduceShader {
        let element_count = workload.element_count();
        AddReduceShader {
            workload,
            added: IntBuffer::zeroed(element_count),
            reduced: IntBuffer::zeroed(element_count),
            use_subgroups: false,
            spirv_path: None,
        }
    }

    /// Uses subgroup arithmetic for the first reduction step when the adapter has it.
    pub fn with_subgroups(mut self, adapter: &AdapterInfo, enabled: bool) -> AddReduceShader {
        self.use_subgroups = enabled && adapter.subgroup.compute_arithmetic;
        self
    }

    /// Loads the kernel from a SPIR-V file instead of compiling the embedded source.
    pub fn with_spirv_path(mut self, path: Option<PathBuf>) -> AddReduceShader {
        self.spirv_path = path;
        self
    }

    pub fn source() -> String {
        String::from(include_str!("../shaders/add_reduce.comp"))
    }

    pub fn defines(&self) -> Vec<&'static str> {
        if self.use_subgroups {
            vec!["USE_SUBGROUPS"]
        } else {
            Vec::new()
        }
    }

    pub fn requirements(&self) -> KernelRequirements {
        KernelRequirements {
            api_version: KERNEL_API_VERSION,
            workgroup_size: GROUP_SIZE as u32,
            workgroup_count: self.workload.group_count() as u32,
            shared_memory_bytes: (GROUP_SIZE * std::mem::size_of::<i32>()) as u32,
            push_constant_bytes: std::mem::size_of::<KernelConstants>() as u32,
        }
    }
}

impl ComputeShader<KernelConstants> for AddReduceShader {
    fn get_spirv(&self) -> Result<Vec<u32>> {
        match &self.spirv_path {
            Some(path) => {
                log::info!("Loading compiled shader {}", path.display());
                load_spirv(path)
            }
            None => {
                log::info!("Compiling add_reduce.comp (subgroups: {})", self.use_subgroups);
                compile_to_spirv(&Self::source(), "add_reduce.comp", "main", &self.defines())
            }
        }
    }

    fn get_layout_descriptors(&self) -> Vec<LayoutDescription> {
        vec![
            LayoutDescription {
                binding: 0,
                buffer_size: self.workload.source.buffer_size(),
                upload: Some(0),
                readback: None,
            },
            LayoutDescription {
                binding: 1,
                buffer_size: self.added.buffer_size(),
                upload: None,
                readback: Some(0),
            },
            LayoutDescription {
                binding: 2,
                buffer_size: self.workload.group_values.buffer_size(),
                upload: Some(1),
                readback: Some(1),
            },
        ]
    }

    fn get_writables(&self) -> Vec<&dyn GpuMappedMemory> {
        vec![&self.workload.source, &self.workload.group_values]
    }

    fn get_readables(&mut self) -> Vec<&mut dyn GpuMappedMemory> {
        vec![&mut self.added, &mut self.reduced]
    }

    fn get_group_vec(&self) -> (u32, u32, u32) {
        (self.workload.group_count() as u32, 1, 1)
    }

    fn get_push_constants(&self) -> Option<KernelConstants> {
        Some(KernelConstants {
            add_value: self.workload.add_value,
            element_count: self.workload.element_count() as u32,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::SubgroupSupport;
    use ash::vk;

    fn adapter(compute_arithmetic: bool) -> AdapterInfo {
        AdapterInfo {
            physical_device: vk::PhysicalDevice::null(),
            name: "test adapter".into(),
            device_type: vk::PhysicalDeviceType::INTEGRATED_GPU,
            api_version: vk::API_VERSION_1_1,
            dedicated_memory: 0,
            shared_memory: 0,
            limits: vk::PhysicalDeviceLimits::default(),
            subgroup: SubgroupSupport { size: 32, compute_arithmetic },
        }
    }

    #[test]
    fn push_constants_are_eight_bytes_in_declaration_order() {
        let constants = KernelConstants { add_value: -2, element_count: 4096 };
        let bytes = bytemuck::bytes_of(&constants);
        assert_eq!(bytes.len(), 8);
        assert_eq!(&bytes[..4], &(-2i32).to_ne_bytes());
        assert_eq!(&bytes[4..], &4096u32.to_ne_bytes());
    }

    #[test]
    fn layout_uploads_inputs_and_reads_back_outputs() {
        let shader = AddReduceShader::new(Workload::new(4096, 1));
        let descriptors = shader.get_layout_descriptors();
        assert_eq!(descriptors.iter().map(|d| d.binding).collect::<Vec<_>>(), vec![0, 1, 2]);
        assert!(descriptors.iter().all(|d| d.buffer_size == 4096 * 4));
        assert_eq!(descriptors[0].upload, Some(0));
        assert_eq!(descriptors[1].readback, Some(0));
        assert_eq!((descriptors[2].upload, descriptors[2].readback), (Some(1), Some(1)));
    }

    #[test]
    fn dispatches_one_group_per_started_slice() {
        assert_eq!(AddReduceShader::new(Workload::new(4096, 1)).get_group_vec(), (4, 1, 1));
        assert_eq!(AddReduceShader::new(Workload::new(4097, 1)).get_group_vec(), (5, 1, 1));
        assert_eq!(AddReduceShader::new(Workload::new(1, 1)).get_group_vec(), (1, 1, 1));
    }

    #[test]
    fn subgroups_need_adapter_support_and_permission() {
        let shader = || AddReduceShader::new(Workload::new(1024, 1));
        assert_eq!(shader().with_subgroups(&adapter(true), true).defines(), vec!["USE_SUBGROUPS"]);
        assert!(shader().with_subgroups(&adapter(true), false).defines().is_empty());
        assert!(shader().with_subgroups(&adapter(false), true).defines().is_empty());
    }

    #[test]
    fn requirements_cover_the_whole_dispatch() {
        let requirements = AddReduceShader::new(Workload::new(10_000, 1)).requirements();
        assert_eq!(requirements.api_version, ash::vk::API_VERSION_1_1);
        assert_eq!(requirements.workgroup_size, 1024);
        assert_eq!(requirements.workgroup_count, 10);
        assert_eq!(requirements.shared_memory_bytes, 4096);
        assert_eq!(requirements.push_constant_bytes, 8);
    }

    #[test]
    fn embedded_kernel_compiles_in_both_variants() {
        let plain = AddReduceShader::new(Workload::new(4096, 1));
        let subgroups = AddReduceShader::new(Workload::new(4096, 1)).with_subgroups(&adapter(true), true);
        let plain_spirv = plain.get_spirv().unwrap();
        let subgroup_spirv = subgroups.get_spirv().unwrap();
        assert_eq!(plain_spirv[0], 0x0723_0203);
        assert_eq!(subgroup_spirv[0], 0x0723_0203);
        assert_ne!(plain_spirv, subgroup_spirv);
    }

    #[test]
    fn readables_receive_gpu_bytes() {
        let mut shader = AddReduceShader::new(Workload::new(2, 1));
        let added = IntBuffer::new(vec![2, 3]);
        let reduced = IntBuffer::new(vec![2, 1]);
        {
            let mut readables = shader.get_readables();
            readables[0].read_from(added.as_bytes());
            readables[1].read_from(reduced.as_bytes());
        }
        assert_eq!(shader.added, added);
        assert_eq!(shader.reduced, reduced);
        assert!(shader.workload.verify(&shader.added.data, &shader.reduced.data).is_ok());
    }
}
