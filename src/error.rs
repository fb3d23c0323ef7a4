use ash::vk;
use std::path::PathBuf;
use thiserror::Error;

/// Error variants surfaced while setting up, dispatching and verifying the compute run.
#[derive(Debug, Error)]
pub enum ComputeError {
    #[error("Failed to load the Vulkan library: {0}")]
    Loading(#[from] ash::LoadingError),

    #[error("{call} failed: {source}")]
    Vulkan {
        call: &'static str,
        #[source]
        source: vk::Result,
    },

    #[error("There are no Vulkan capable adapters found on the current platform")]
    NoAdapters,

    #[error("Adapter `{adapter}` exposes no queue family with compute support")]
    NoComputeQueue { adapter: String },

    #[error("No memory type matches bits {memory_type_bits:#x} with flags {flags:?}")]
    NoMemoryType {
        memory_type_bits: u32,
        flags: vk::MemoryPropertyFlags,
    },

    #[error("Adapter `{adapter}` cannot run the kernel: {limit} is {actual}, need {required}")]
    DeviceLimit {
        adapter: String,
        limit: &'static str,
        actual: u32,
        required: u32,
    },

    #[error("Adapter `{adapter}` supports Vulkan {actual}, the kernel needs {required}")]
    ApiVersion {
        adapter: String,
        actual: String,
        required: String,
    },

    #[error("Cannot write {len} bytes into a {size} byte buffer")]
    BufferOverflow { len: u64, size: u64 },

    #[error("Failed to create the shader compiler")]
    CompilerUnavailable,

    #[error("Shader compilation error: {0}")]
    ShaderCompilation(#[from] shaderc::Error),

    #[error("Read compiled shader object file `{path}` failed: {source}")]
    ShaderFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to read adapter choice: {0}")]
    Prompt(#[source] std::io::Error),

    #[error("Verification failed: {0}")]
    Verification(String),
}

/// Builds a `map_err` adapter that tags a raw `vk::Result` with the failing call.
pub fn vk_err(call: &'static str) -> impl Fn(vk::Result) -> ComputeError {
    move |source| ComputeError::Vulkan { call, source }
}

pub type Result<T> = std::result::Result<T, ComputeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vulkan_errors_name_the_failing_call() {
        let err = vk_err("vkCreateBuffer")(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
        let message = err.to_string();
        assert!(message.starts_with("vkCreateBuffer failed"), "{message}");
        assert!(matches!(
            err,
            ComputeError::Vulkan {
                call: "vkCreateBuffer",
                source: vk::Result::ERROR_OUT_OF_DEVICE_MEMORY
            }
        ));
    }

    #[test]
    fn device_limit_message_reports_both_sides() {
        let err = ComputeError::DeviceLimit {
            adapter: "llvmpipe".into(),
            limit: "maxComputeWorkGroupInvocations",
            actual: 256,
            required: 1024,
        };
        assert_eq!(
            err.to_string(),
            "Adapter `llvmpipe` cannot run the kernel: maxComputeWorkGroupInvocations is 256, need 1024"
        );
    }
}
