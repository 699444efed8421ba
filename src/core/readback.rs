//! Readback - scoped map/copy/unmap and timestamp decoding.

use std::time::Duration;

use super::command::TIMESTAMP_SIZE;
use super::error::{CoreError, Result};
use super::registry::{Buffer, BufferRegistry};
use super::session::Device;
use crate::backend::DeviceBackend;

/// Map `buffer` for reading, copy its contents out and unmap it.
pub async fn read_back<D: DeviceBackend>(
    device: &Device<D>,
    registry: &mut BufferRegistry<D>,
    buffer: &Buffer,
) -> Result<Vec<u8>> {
    read_back_with(device, registry, buffer, |bytes| Ok(bytes.to_vec())).await
}

/// Map `buffer`, run `decode` over the mapped bytes and unmap it.
///
/// The buffer is back in `Unmapped` on every exit path, including when
/// `decode` fails.
pub async fn read_back_with<D, T, E, F>(
    device: &Device<D>,
    registry: &mut BufferRegistry<D>,
    buffer: &Buffer,
    decode: F,
) -> std::result::Result<T, E>
where
    D: DeviceBackend,
    E: From<CoreError>,
    F: FnOnce(&[u8]) -> std::result::Result<T, E>,
{
    let decoded = {
        let view = registry.request_read_map(device, buffer).await?;
        decode(view)
    };
    registry.end_host_access(device, buffer)?;
    decoded
}

/// Read the raw tick value stored at timestamp slot `index`.
pub fn timestamp_at(raw: &[u8], index: u32) -> Result<u64> {
    let offset = u64::from(index) * TIMESTAMP_SIZE;
    let start = offset as usize;
    match raw.get(start..start + TIMESTAMP_SIZE as usize) {
        Some(bytes) => Ok(ticks(bytes)),
        None => Err(CoreError::RangeOutOfBounds {
            what: "timestamp data".to_string(),
            offset,
            size: TIMESTAMP_SIZE,
            limit: raw.len() as u64,
        }),
    }
}

/// Elapsed time between timestamp slots `start` and `end` of resolved query
/// data, with `period_ns` nanoseconds per tick.
///
/// A reversed pair is an error rather than a wrapped-around duration.
pub fn decode_timestamp_pair(raw: &[u8], start: u32, end: u32, period_ns: f32) -> Result<Duration> {
    let start_ticks = timestamp_at(raw, start)?;
    let end_ticks = timestamp_at(raw, end)?;
    if end_ticks < start_ticks {
        return Err(CoreError::NegativeInterval {
            start: start_ticks,
            end: end_ticks,
        });
    }
    Ok(ticks_to_duration(end_ticks - start_ticks, period_ns))
}

/// Every tick value in resolved query data.
pub fn decode_timestamps(raw: &[u8]) -> Result<Vec<u64>> {
    if raw.len() as u64 % TIMESTAMP_SIZE != 0 {
        return Err(CoreError::Misaligned {
            what: "timestamp data length",
            value: raw.len() as u64,
            alignment: TIMESTAMP_SIZE,
        });
    }
    Ok(raw
        .chunks_exact(TIMESTAMP_SIZE as usize)
        .map(ticks)
        .collect())
}

/// Little-endian tick value of one 8-byte timestamp slot.
fn ticks(slot: &[u8]) -> u64 {
    u64::from_le(bytemuck::pod_read_unaligned(slot))
}

pub fn ticks_to_duration(ticks: u64, period_ns: f32) -> Duration {
    Duration::from_nanos((ticks as f64 * f64::from(period_ns)).round() as u64)
}
