//! Matrix multiplication in single and half precision, with optional timing.

use std::time::Duration;

use half::f16;
use log::debug;

use super::{Scratch, WorkloadError, decode_f32, padded, workgroups};
use crate::backend::{Backend, DeviceBackend, HostKernel, Invocation, ShaderSource};
use crate::core::{
    BindGroup, BindGroupEntry, BindGroupLayout, BindingKind, Buffer, ComputeContext,
    ComputePipeline, CoreError, LayoutEntry, PassTimestampWrites, TIMESTAMP_SIZE,
    decode_timestamp_pair,
};
use crate::schema::Capability;

const MATMUL_SHADER: &str = include_str!("shaders/matmul.wgsl");
const MATMUL_F16_SHADER: &str = include_str!("shaders/matmul_f16.wgsl");

/// Two input matrices and the product.
const LAYOUT: [LayoutEntry; 3] = [
    LayoutEntry::new(0, BindingKind::ReadOnlyStorage),
    LayoutEntry::new(1, BindingKind::ReadOnlyStorage),
    LayoutEntry::new(2, BindingKind::Storage),
];

/// Element type of matrices on the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Precision {
    #[default]
    F32,
    /// Half precision; needs `shader-f16`.
    F16,
}

impl Precision {
    pub fn element_size(self) -> u64 {
        match self {
            Precision::F32 => 4,
            Precision::F16 => 2,
        }
    }

    /// Side of the square workgroup used by the shader.
    pub fn tile(self) -> u32 {
        match self {
            Precision::F32 => 8,
            Precision::F16 => 16,
        }
    }

    fn shader(self) -> ShaderSource {
        let tile = self.tile();
        let source = match self {
            Precision::F32 => ShaderSource::wgsl(MATMUL_SHADER).with_label("Matmul Shader"),
            Precision::F16 => ShaderSource::wgsl(MATMUL_F16_SHADER).with_label("Matmul F16 Shader"),
        };
        source.with_host_kernel(HostKernel::new([tile, tile, 1], move |inv| {
            multiply_cell(inv, self);
        }))
    }
}

fn load(inv: &mut Invocation<'_>, precision: Precision, binding: u32, index: u32) -> f32 {
    match precision {
        Precision::F32 => inv.load_f32(binding, index),
        Precision::F16 => inv.load_f16(binding, index),
    }
}

fn store(inv: &mut Invocation<'_>, precision: Precision, binding: u32, index: u32, value: f32) {
    match precision {
        Precision::F32 => inv.store_f32(binding, index, value),
        Precision::F16 => inv.store_f16(binding, index, value),
    }
}

/// Host twin of the matmul shaders: computes the result cell at
/// `global_id.xy` (row, column). Returns `false` outside the result.
pub(crate) fn multiply_cell(inv: &mut Invocation<'_>, precision: Precision) -> bool {
    let rows = load(inv, precision, 0, 0) as u32;
    let inner = load(inv, precision, 0, 1) as u32;
    let cols = load(inv, precision, 1, 1) as u32;
    let [row, col, _] = inv.global_id;
    if row >= rows || col >= cols {
        return false;
    }

    store(inv, precision, 2, 0, rows as f32);
    store(inv, precision, 2, 1, cols as f32);

    let mut sum = 0.0f32;
    for i in 0..inner {
        sum += load(inv, precision, 0, 2 + i + row * inner)
            * load(inv, precision, 1, 2 + col + i * cols);
    }
    store(inv, precision, 2, 2 + col + row * cols, sum);
    true
}

/// Row-major matrix. On the device it is laid out as `[rows, cols, values…]`
/// in the element type of the chosen [`Precision`].
#[derive(Debug, Clone, PartialEq)]
pub struct Matrix {
    rows: usize,
    cols: usize,
    values: Vec<f32>,
}

impl Matrix {
    pub fn new(rows: usize, cols: usize, values: Vec<f32>) -> Result<Self, WorkloadError> {
        if rows == 0 || cols == 0 || values.len() != rows * cols {
            return Err(WorkloadError::InvalidMatrix {
                rows,
                cols,
                len: values.len(),
            });
        }
        Ok(Self { rows, cols, values })
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    pub fn get(&self, row: usize, col: usize) -> Option<f32> {
        if row < self.rows && col < self.cols {
            self.values.get(row * self.cols + col).copied()
        } else {
            None
        }
    }

    /// Bytes a `rows`x`cols` matrix occupies on the device, padded to the
    /// copy alignment.
    pub fn encoded_size(rows: usize, cols: usize, precision: Precision) -> u64 {
        padded((2 + rows as u64 * cols as u64) * precision.element_size())
    }

    pub fn encode(&self, precision: Precision) -> Vec<u8> {
        let header = [self.rows as f32, self.cols as f32];
        let elements = header.iter().chain(&self.values).copied();
        let mut bytes: Vec<u8> = match precision {
            Precision::F32 => elements.flat_map(f32::to_le_bytes).collect(),
            Precision::F16 => elements
                .flat_map(|v| f16::from_f32(v).to_le_bytes())
                .collect(),
        };
        bytes.resize(Self::encoded_size(self.rows, self.cols, precision) as usize, 0);
        bytes
    }

    /// Read back a `rows`x`cols` matrix; the header written by the shader is
    /// skipped.
    pub fn decode(
        bytes: &[u8],
        rows: usize,
        cols: usize,
        precision: Precision,
    ) -> Result<Self, WorkloadError> {
        let count = rows * cols;
        let values: Vec<f32> = match precision {
            Precision::F32 => decode_f32(bytes).into_iter().skip(2).take(count).collect(),
            Precision::F16 => bytes
                .chunks_exact(2)
                .skip(2)
                .take(count)
                .map(|chunk| f16::from_le_bytes([chunk[0], chunk[1]]).to_f32())
                .collect(),
        };
        if values.len() != count {
            return Err(WorkloadError::Decode(format!(
                "expected {} values of a {}x{} matrix, found {}",
                count,
                rows,
                cols,
                values.len()
            )));
        }
        Self::new(rows, cols, values)
    }

    /// Host reference product.
    pub fn multiply(&self, other: &Matrix) -> Result<Matrix, WorkloadError> {
        self.check_product(other)?;
        let mut values = vec![0.0; self.rows * other.cols];
        for row in 0..self.rows {
            for col in 0..other.cols {
                values[row * other.cols + col] = (0..self.cols)
                    .map(|i| self.values[row * self.cols + i] * other.values[i * other.cols + col])
                    .sum();
            }
        }
        Matrix::new(self.rows, other.cols, values)
    }

    pub(crate) fn check_product(&self, other: &Matrix) -> Result<(), WorkloadError> {
        if self.cols != other.rows {
            return Err(WorkloadError::DimensionMismatch {
                left: (self.rows, self.cols),
                right: (other.rows, other.cols),
            });
        }
        Ok(())
    }
}

/// Device buffers of one product: both operands and the result.
pub(crate) struct Operands {
    pub first: Buffer,
    pub second: Buffer,
    pub result: Buffer,
    pub result_size: u64,
    pub rows: usize,
    pub cols: usize,
}

impl Operands {
    pub(crate) fn upload<B: Backend>(
        ctx: &mut ComputeContext<B>,
        scratch: &mut Scratch,
        first: &Matrix,
        second: &Matrix,
        precision: Precision,
    ) -> Result<Self, WorkloadError> {
        first.check_product(second)?;
        let storage = wgpu::BufferUsages::STORAGE;
        let first_buffer = scratch.buffer_init(ctx, "First Matrix", &first.encode(precision), storage)?;
        let second_buffer =
            scratch.buffer_init(ctx, "Second Matrix", &second.encode(precision), storage)?;
        let result_size = Matrix::encoded_size(first.rows, second.cols, precision);
        let result = scratch.buffer(
            ctx,
            "Result Matrix",
            result_size,
            storage | wgpu::BufferUsages::COPY_SRC,
        )?;
        Ok(Self {
            first: first_buffer,
            second: second_buffer,
            result,
            result_size,
            rows: first.rows,
            cols: second.cols,
        })
    }

    pub(crate) fn workgroups(&self, precision: Precision) -> [u32; 3] {
        let tile = precision.tile();
        [workgroups(self.rows, tile), workgroups(self.cols, tile), 1]
    }
}

/// Durations derived from the timestamps of a timed product.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatmulTimings {
    /// Start to end of the compute work.
    pub compute: Duration,
    /// End of compute to end of the result copy. Only available when the
    /// device can write timestamps between commands.
    pub transfer: Option<Duration>,
    pub total: Option<Duration>,
}

impl MatmulTimings {
    fn decode(raw: &[u8], period_ns: f32, marks: u32) -> Result<Self, CoreError> {
        let compute = decode_timestamp_pair(raw, 0, 1, period_ns)?;
        if marks < 3 {
            return Ok(Self {
                compute,
                transfer: None,
                total: None,
            });
        }
        Ok(Self {
            compute,
            transfer: Some(decode_timestamp_pair(raw, 1, 2, period_ns)?),
            total: Some(decode_timestamp_pair(raw, 0, 2, period_ns)?),
        })
    }
}

/// Matrix product on the device.
#[derive(Debug)]
pub struct MatrixMultiply<D: DeviceBackend> {
    precision: Precision,
    layout: BindGroupLayout<D>,
    pipeline: ComputePipeline<D>,
}

impl<D: DeviceBackend> MatrixMultiply<D> {
    pub async fn new<B>(ctx: &mut ComputeContext<B>, precision: Precision) -> Result<Self, WorkloadError>
    where
        B: Backend<Device = D>,
    {
        if precision == Precision::F16 {
            ctx.device()?.require(Capability::ShaderF16)?;
        }
        let layout = ctx.create_bind_group_layout(Some("Matmul Layout"), &LAYOUT)?;
        let pipeline = ctx
            .create_compute_pipeline(&layout, &precision.shader())
            .await?;
        Ok(Self {
            precision,
            layout,
            pipeline,
        })
    }

    pub fn precision(&self) -> Precision {
        self.precision
    }

    fn bind(&self, ctx: &mut ComputeContext<impl Backend<Device = D>>, operands: &Operands) -> Result<BindGroup<D>, CoreError> {
        ctx.create_bind_group(
            Some("Matmul Bind Group"),
            &self.layout,
            &[
                BindGroupEntry::new(0, operands.first),
                BindGroupEntry::new(1, operands.second),
                BindGroupEntry::new(2, operands.result),
            ],
        )
    }

    /// Multiply `first` by `second`.
    pub async fn run<B>(
        &self,
        ctx: &mut ComputeContext<B>,
        first: &Matrix,
        second: &Matrix,
    ) -> Result<Matrix, WorkloadError>
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
    ) -> Result<Matrix, WorkloadError>
    where
        B: Backend<Device = D>,
    {
        let operands = Operands::upload(ctx, scratch, first, second, self.precision)?;
        let readback = scratch.buffer(
            ctx,
            "Result Readback",
            operands.result_size,
            wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
        )?;
        let bind_group = self.bind(ctx, &operands)?;

        let mut builder = ctx.command_builder()?;
        builder.dispatch(&self.pipeline, &bind_group, operands.workgroups(self.precision))?;
        builder.copy_buffer_to_buffer(&operands.result, 0, &readback, 0, operands.result_size)?;
        let batch = builder.finish()?;
        let handle = ctx.submit(batch)?;
        ctx.await_completion(handle).await?;

        let (rows, cols, precision) = (operands.rows, operands.cols, self.precision);
        ctx.read_back_with(&readback, |bytes| Matrix::decode(bytes, rows, cols, precision))
            .await
    }

    /// Multiply and time the work.
    ///
    /// With `timestamp-query-inside-encoders` three marks are written:
    /// before the dispatch, after it and after the result copy. With only
    /// `timestamp-query` the compute pass boundaries are marked and the
    /// transfer time is unavailable.
    pub async fn run_timed<B>(
        &self,
        ctx: &mut ComputeContext<B>,
        first: &Matrix,
        second: &Matrix,
    ) -> Result<(Matrix, MatmulTimings), WorkloadError>
    where
        B: Backend<Device = D>,
    {
        let mut scratch = Scratch::default();
        let outcome = self.run_timed_in(ctx, &mut scratch, first, second).await;
        scratch.release(ctx);
        outcome
    }

    async fn run_timed_in<B>(
        &self,
        ctx: &mut ComputeContext<B>,
        scratch: &mut Scratch,
        first: &Matrix,
        second: &Matrix,
    ) -> Result<(Matrix, MatmulTimings), WorkloadError>
    where
        B: Backend<Device = D>,
    {
        let between_commands = ctx
            .device()?
            .has_capability(Capability::TimestampQueryInsideEncoders);
        let marks = if between_commands { 3 } else { 2 };
        let query_set = ctx.create_query_set(Some("Matmul Timestamps"), marks)?;

        let operands = Operands::upload(ctx, scratch, first, second, self.precision)?;
        let readback = scratch.buffer(
            ctx,
            "Result Readback",
            operands.result_size,
            wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
        )?;
        let stamps_size = u64::from(marks) * TIMESTAMP_SIZE;
        let resolved = scratch.buffer(
            ctx,
            "Timestamp Resolve",
            stamps_size,
            wgpu::BufferUsages::QUERY_RESOLVE | wgpu::BufferUsages::COPY_SRC,
        )?;
        let stamps = scratch.buffer(
            ctx,
            "Timestamp Readback",
            stamps_size,
            wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
        )?;
        let bind_group = self.bind(ctx, &operands)?;
        let groups = operands.workgroups(self.precision);

        let mut builder = ctx.command_builder()?;
        if between_commands {
            builder.write_timestamp(&query_set, 0)?;
            builder.dispatch(&self.pipeline, &bind_group, groups)?;
            builder.write_timestamp(&query_set, 1)?;
            builder.copy_buffer_to_buffer(&operands.result, 0, &readback, 0, operands.result_size)?;
            builder.write_timestamp(&query_set, 2)?;
        } else {
            builder.begin_compute_pass(Some(PassTimestampWrites {
                query_set: &query_set,
                beginning_of_pass_write_index: Some(0),
                end_of_pass_write_index: Some(1),
            }))?;
            builder.dispatch_compute(&self.pipeline, &bind_group, groups)?;
            builder.end_compute_pass()?;
            builder.copy_buffer_to_buffer(&operands.result, 0, &readback, 0, operands.result_size)?;
        }
        builder.resolve_query_set(&query_set, 0, marks, &resolved, 0)?;
        builder.copy_buffer_to_buffer(&resolved, 0, &stamps, 0, stamps_size)?;
        let batch = builder.finish()?;
        let handle = ctx.submit(batch)?;
        ctx.await_completion(handle).await?;

        let (rows, cols, precision) = (operands.rows, operands.cols, self.precision);
        let product = ctx
            .read_back_with(&readback, |bytes| Matrix::decode(bytes, rows, cols, precision))
            .await?;
        let period = ctx.info().timestamp_period;
        let timings = ctx
            .read_back_with(&stamps, |raw| MatmulTimings::decode(raw, period, marks))
            .await?;
        debug!("Matmul {}x{} timings: {:?}", rows, cols, timings);
        Ok((product, timings))
    }
}
