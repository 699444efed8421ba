//! Matrix product with an atomic counter of computed cells.

use super::matmul::{Matrix, Operands, Precision, multiply_cell};
use super::{Scratch, WorkloadError};
use crate::backend::{Backend, DeviceBackend, HostKernel, ShaderSource};
use crate::core::{
    BindGroupEntry, BindGroupLayout, BindingKind, ComputeContext, ComputePipeline, LayoutEntry,
};

const COUNTED_SHADER: &str = include_str!("shaders/matmul_counted.wgsl");

const LAYOUT: [LayoutEntry; 4] = [
    LayoutEntry::new(0, BindingKind::ReadOnlyStorage),
    LayoutEntry::new(1, BindingKind::ReadOnlyStorage),
    LayoutEntry::new(2, BindingKind::Storage),
    LayoutEntry::new(3, BindingKind::Storage),
];

const COUNTER_SIZE: u64 = 4;

fn shader() -> ShaderSource {
    let tile = Precision::F32.tile();
    ShaderSource::wgsl(COUNTED_SHADER)
        .with_label("Counted Matmul Shader")
        .with_host_kernel(HostKernel::new([tile, tile, 1], |inv| {
            if multiply_cell(inv, Precision::F32) {
                inv.atomic_add_u32(3, 0, 1);
            }
        }))
}

/// Product and the number of result cells the device computed.
#[derive(Debug, Clone, PartialEq)]
pub struct CountedProduct {
    pub product: Matrix,
    pub computed: u32,
}

/// Single-precision matrix product that also counts computed cells.
#[derive(Debug)]
pub struct CountedMatrixMultiply<D: DeviceBackend> {
    layout: BindGroupLayout<D>,
    pipeline: ComputePipeline<D>,
}

impl<D: DeviceBackend> CountedMatrixMultiply<D> {
    pub async fn new<B>(ctx: &mut ComputeContext<B>) -> Result<Self, WorkloadError>
    where
        B: Backend<Device = D>,
    {
        let layout = ctx.create_bind_group_layout(Some("Counted Matmul Layout"), &LAYOUT)?;
        let pipeline = ctx.create_compute_pipeline(&layout, &shader()).await?;
        Ok(Self { layout, pipeline })
    }

    pub async fn run<B>(
        &self,
        ctx: &mut ComputeContext<B>,
        first: &Matrix,
        second: &Matrix,
    ) -> Result<CountedProduct, WorkloadError>
    where
        B: Backend<Device = D>,
    {
        let mut scratch = Scratch::default();
        let outcome = self.run_in(ctx, &mut scratch, first, second).await;
        scratch.release(ctx);
        outcome
    }

    async fn run_in<B>(
        &self,
        ctx: &mut ComputeContext<B>,
        scratch: &mut Scratch,
        first: &Matrix,
        second: &Matrix,
    ) -> Result<CountedProduct, WorkloadError>
    where
        B: Backend<Device = D>,
    {
        let operands = Operands::upload(ctx, scratch, first, second, Precision::F32)?;
        let counter = scratch.buffer_init(
            ctx,
            "Cell Counter",
            &0u32.to_le_bytes(),
            wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
        )?;
        // Product first, counter right behind it.
        let readback = scratch.buffer(
            ctx,
            "Counted Readback",
            operands.result_size + COUNTER_SIZE,
            wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
        )?;
        let bind_group = ctx.create_bind_group(
            Some("Counted Matmul Bind Group"),
            &self.layout,
            &[
                BindGroupEntry::new(0, operands.first),
                BindGroupEntry::new(1, operands.second),
                BindGroupEntry::new(2, operands.result),
                BindGroupEntry::new(3, counter),
            ],
        )?;

        let mut builder = ctx.command_builder()?;
        builder.dispatch(&self.pipeline, &bind_group, operands.workgroups(Precision::F32))?;
        builder.copy_buffer_to_buffer(&operands.result, 0, &readback, 0, operands.result_size)?;
        builder.copy_buffer_to_buffer(&counter, 0, &readback, operands.result_size, COUNTER_SIZE)?;
        let batch = builder.finish()?;
        let handle = ctx.submit(batch)?;
        ctx.await_completion(handle).await?;

        let (rows, cols, split) = (operands.rows, operands.cols, operands.result_size as usize);
        ctx.read_back_with(&readback, |bytes| {
            let (matrix, computed) = bytes
                .split_at_checked(split)
                .and_then(|(matrix, count)| {
                    let count = count.get(..COUNTER_SIZE as usize)?;
                    Some((matrix, bytemuck::pod_read_unaligned::<u32>(count)))
                })
                .ok_or_else(|| WorkloadError::Decode("counter missing from readback".to_string()))?;
            Ok(CountedProduct {
                product: Matrix::decode(matrix, rows, cols, Precision::F32)?,
                computed: u32::from_le(computed),
            })
        })
        .await
    }
}
