//! Staging and readback copies between host-visible and device-local buffers.

use ash::vk;
use crate::context::VkCtx;
use crate::data::LinkedMemory;
use crate::error::Result;

const HOST_COHERENT: vk::MemoryPropertyFlags = vk::MemoryPropertyFlags::from_raw(
    vk::MemoryPropertyFlags::HOST_VISIBLE.as_raw() | vk::MemoryPropertyFlags::HOST_COHERENT.as_raw(),
);

/// Creates a host-visible buffer holding `bytes`, ready to be a copy source.
pub fn create_staging(ctx: &VkCtx, bytes: &[u8]) -> Result<LinkedMemory> {
    let staging = LinkedMemory::create(
        ctx,
        bytes.len() as u64,
        vk::BufferUsageFlags::TRANSFER_SRC,
        HOST_COHERENT,
        HOST_COHERENT,
    )?;
    if let Err(err) = staging.write_bytes(ctx, bytes) {
        staging.destroy(&ctx.device);
        return Err(err);
    }
    Ok(staging)
}

/// Creates a host-visible copy destination, cached when the adapter offers it.
pub fn create_readback(ctx: &VkCtx, size: u64) -> Result<LinkedMemory> {
    LinkedMemory::create(
        ctx,
        size,
        vk::BufferUsageFlags::TRANSFER_DST,
        HOST_COHERENT | vk::MemoryPropertyFlags::HOST_CACHED,
        HOST_COHERENT,
    )
}

fn whole_buffer_barrier<'a>(
    buffer: &LinkedMemory,
    src_access_mask: vk::AccessFlags,
    dst_access_mask: vk::AccessFlags,
) -> vk::BufferMemoryBarrier<'a> {
    vk::BufferMemoryBarrier::default()
        .src_access_mask(src_access_mask)
        .dst_access_mask(dst_access_mask)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .buffer(buffer.buffer)
        .offset(0)
        .size(vk::WHOLE_SIZE)
}

/// Records the copy of `staging` into `destination`, then makes the copy
/// visible to compute shader reads and writes.
pub fn record_upload(ctx: &VkCtx, staging: &LinkedMemory, destination: &LinkedMemory) {
    let region = vk::BufferCopy::default().size(staging.size.min(destination.size));
    let barrier = whole_buffer_barrier(
        destination,
        vk::AccessFlags::TRANSFER_WRITE,
        vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE,
    );
    unsafe {
        ctx.device
            .cmd_copy_buffer(ctx.command_buffer, staging.buffer, destination.buffer, &[region]);
        ctx.device.cmd_pipeline_barrier(
            ctx.command_buffer,
            vk::PipelineStageFlags::TRANSFER,
            vk::PipelineStageFlags::COMPUTE_SHADER,
            vk::DependencyFlags::empty(),
            &[],
            &[barrier],
            &[],
        );
    }
}

/// Records copies of each `(source, readback)` pair after the compute writes
/// land, followed by a barrier that publishes the copies to the host.
pub fn record_readback(ctx: &VkCtx, pairs: &[(&LinkedMemory, &LinkedMemory)]) {
    let before = pairs
        .iter()
        .map(|(source, _)| {
            whole_buffer_barrier(source, vk::AccessFlags::SHADER_WRITE, vk::AccessFlags::TRANSFER_READ)
        })
        .collect::<Vec<_>>();
    let after = pairs
        .iter()
        .map(|(_, readback)| {
            whole_buffer_barrier(readback, vk::AccessFlags::TRANSFER_WRITE, vk::AccessFlags::HOST_READ)
        })
        .collect::<Vec<_>>();

    unsafe {
        ctx.device.cmd_pipeline_barrier(
            ctx.command_buffer,
            vk::PipelineStageFlags::COMPUTE_SHADER,
            vk::PipelineStageFlags::TRANSFER,
            vk::DependencyFlags::empty(),
            &[],
            &before,
            &[],
        );
        for (source, readback) in pairs {
            let region = vk::BufferCopy::default().size(source.size.min(readback.size));
            ctx.device
                .cmd_copy_buffer(ctx.command_buffer, source.buffer, readback.buffer, &[region]);
        }
        ctx.device.cmd_pipeline_barrier(
            ctx.command_buffer,
            vk::PipelineStageFlags::TRANSFER,
            vk::PipelineStageFlags::HOST,
            vk::DependencyFlags::empty(),
            &[],
            &after,
            &[],
        );
    }
}
