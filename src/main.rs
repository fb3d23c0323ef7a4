// Program to add a constant to a vector and reduce it per workgroup using a vulkan compute shader

pub mod config;
pub mod context;
pub mod data;
pub mod demo;
pub mod error;
pub mod shader;
pub mod transfer;

use crate::config::{Args, RunConfig};
use crate::context::VkCtx;
use crate::demo::add_reduce_shader::AddReduceShader;
use crate::demo::workload::{VerificationReport, Workload};
use crate::error::{ComputeError, Result};
use crate::shader::{ComputeShader, ShaderExecutionContext};

use std::process::ExitCode;
use clap::Parser;

pub fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = RunConfig::from(Args::parse());
    exit_code(run(&config))
}

/// Logs a failed run once and maps it to the process status.
fn exit_code(result: Result<VerificationReport>) -> ExitCode {
    match result {
        Ok(_) => ExitCode::SUCCESS,
        Err(err) => {
            log::error!("{err}");
            ExitCode::FAILURE
        }
    }
}

/// Runs the whole pipeline once and releases every Vulkan object on the way out.
pub fn run(config: &RunConfig) -> Result<VerificationReport> {
    let entry = unsafe { ash::Entry::load() }?;

    log::info!("Creating Vulkan context");
    let ctx = unsafe { VkCtx::create_compute_ctx(&entry, config) }?;
    let result = run_on_context(&ctx, config);
    ctx.destroy();
    result
}

fn run_on_context(ctx: &VkCtx, config: &RunConfig) -> Result<VerificationReport> {
    let workload = Workload::new(config.elements as usize, config.add_value);
    let mut shader = AddReduceShader::new(workload)
        .with_subgroups(&ctx.adapter, config.use_subgroups)
        .with_spirv_path(config.shader.clone());
    ctx.adapter.check_requirements(&shader.requirements())?;

    log::info!("Building shader context");
    let shader_ctx = shader.build_shader_context(ctx)?;
    let result = execute(&mut shader, ctx, &shader_ctx);
    log::info!("Destroying shader context");
    shader_ctx.destroy(&ctx.device, &ctx.descriptor_pool);
    result
}

fn execute(
    shader: &mut AddReduceShader,
    ctx: &VkCtx,
    shader_ctx: &ShaderExecutionContext,
) -> Result<VerificationReport> {
    log::info!("Uploading {} elements", shader.workload.element_count());
    shader.upload_inputs(ctx, shader_ctx)?;
    log::info!("Running shader");
    shader.run_shader(ctx, shader_ctx)?;
    log::info!("Reading results from shader");
    shader.read_result(ctx, shader_ctx)?;

    let report = shader.workload.verify(&shader.added.data, &shader.reduced.data);
    report.print();
    let first_failure = report.failures().next();
    match first_failure {
        Some((check, mismatch)) => Err(ComputeError::Verification(format!("check {check}: {mismatch}"))),
        None => Ok(report),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failed_runs_exit_with_failure_status() {
        let failed = exit_code(Err(ComputeError::NoAdapters));
        assert_eq!(format!("{failed:?}"), format!("{:?}", ExitCode::FAILURE));
    }

    /// Exercises the shared-memory and subgroup reductions on real hardware.
    /// Without a GPU, install Mesa's lavapipe software driver and run
    ///
    /// ```text
    /// VK_ICD_FILENAMES=/usr/share/vulkan/icd.d/lvp_icd.x86_64.json \
    ///     cargo test -- --ignored runs_end_to_end
    /// ```
    ///
    /// The ICD path varies by distribution; `vulkaninfo --summary` lists the
    /// adapter that will be used as index 0.
    #[test]
    #[ignore = "requires a Vulkan capable adapter"]
    fn runs_end_to_end_on_the_first_adapter() {
        for use_subgroups in [false, true] {
            let config = RunConfig {
                adapter: Some(0),
                elements: 5000,
                add_value: 3,
                validation: false,
                use_subgroups,
                ..RunConfig::default()
            };
            let report = run(&config).unwrap();
            assert!(report.is_ok());
            assert_eq!(report.group_sums, vec![1024, 2048, 3072, 4096, 904 * 5]);
        }
    }
}
