//! Scratch and output buffers of one acceleration structure.

use crate::buffer::TypedBuffer;
use crate::device::{Device, Stream};
use crate::rt::{
    accel_build, accel_compact, accel_compute_memory_usage, AccelBuildOptions, BuildInput,
    DeviceContext, TraversableHandle,
};
use crate::util::{CheckStatus, Error, Result};

/// Build workspace, build output and compacted-size slot of an
/// acceleration structure, grown to fit and reused across rebuilds.
#[derive(Debug)]
pub struct AccelBuildScratch {
    temp: TypedBuffer<u8>,
    full: TypedBuffer<u8>,
    compacted_size: TypedBuffer<u64>,
    compact: TypedBuffer<u8>,
}

impl AccelBuildScratch {
    pub fn new(device: &Device) -> Self {
        Self {
            temp: TypedBuffer::empty(device),
            full: TypedBuffer::empty(device),
            compacted_size: TypedBuffer::empty(device),
            compact: TypedBuffer::empty(device),
        }
    }

    /// Grow the buffers to what building `input` needs.
    ///
    /// Buffers never shrink. Returns whether any of them grew.
    pub fn resize_to_fit(
        &mut self,
        ctx: &DeviceContext,
        input: &BuildInput,
        options: &AccelBuildOptions,
    ) -> Result<bool> {
        let sizes = accel_compute_memory_usage(ctx, options, std::slice::from_ref(input))
            .checked("accel_compute_memory_usage")?;
        // All three must be resized; `||` would skip the rest after the first grows.
        let temp_grew = self.temp.resize_to_fit(sizes.temp_size_in_bytes)?;
        let full_grew = self.full.resize_to_fit(sizes.output_size_in_bytes)?;
        let slot_grew = self.compacted_size.resize_to_fit(1)?;
        Ok(temp_grew || full_grew || slot_grew)
    }

    /// Enqueue a build of `input` into the output buffer.
    ///
    /// Call [`resize_to_fit`](Self::resize_to_fit) first.
    pub fn build(
        &mut self,
        ctx: &DeviceContext,
        stream: &Stream,
        input: &BuildInput,
        options: &AccelBuildOptions,
    ) -> Result<TraversableHandle> {
        accel_build(
            ctx,
            stream,
            options,
            std::slice::from_ref(input),
            self.temp.device_ptr(),
            self.temp.byte_len(),
            self.full.device_ptr(),
            self.full.byte_len(),
            Some(self.compacted_size.device_ptr()),
        )
        .checked("accel_build")
    }

    /// Compaction is disabled.
    ///
    /// Reading the compacted size back to the host needs a stream
    /// synchronization per structure, which stalls the frame and measured
    /// slower than keeping the uncompacted output. It stays off until buffer
    /// management can batch these readbacks asynchronously.
    pub fn do_compaction(&mut self, _handle: &mut TraversableHandle) -> Result<()> {
        Err(Error::FeatureDisabled(
            "acceleration structure compaction is disabled due to performance reasons",
        ))
    }

    /// Blocking compaction of `handle` into the compact buffer.
    #[cfg_attr(not(test), allow(dead_code))]
    fn compact_blocking(
        &mut self,
        ctx: &DeviceContext,
        stream: &Stream,
        handle: &mut TraversableHandle,
    ) -> Result<()> {
        stream.synchronize().checked("Stream::synchronize")?;
        let compacted = self
            .compacted_size
            .to_vec()?
            .first()
            .copied()
            .ok_or_else(|| Error::invalid_argument("compacted size was never emitted"))?;
        let compacted = usize::try_from(compacted)
            .map_err(|_| Error::invalid_argument(format!("compacted size {compacted} overflows")))?;
        self.compact.resize_to_fit(compacted)?;
        *handle = accel_compact(
            ctx,
            stream,
            *handle,
            self.compact.device_ptr(),
            self.compact.byte_len(),
        )
        .checked("accel_compact")?;
        Ok(())
    }

    pub fn temp_bytes(&self) -> usize {
        self.temp.byte_len()
    }

    pub fn output_bytes(&self) -> usize {
        self.full.byte_len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rt::{InstanceArray, TriangleArray};
    use crate::util::{DeviceConfig, Vec3};

    fn triangles(device: &Device, n: usize) -> (TypedBuffer<Vec3>, TypedBuffer<[i32; 3]>, BuildInput) {
        let vertices: Vec<Vec3> = (0..n)
            .flat_map(|t| {
                let x = t as f32 * 2.0;
                [Vec3::new(x, 0.0, 5.0), Vec3::new(x + 1.0, 0.0, 5.0), Vec3::new(x, 1.0, 5.0)]
            })
            .collect();
        let indices: Vec<[i32; 3]> = (0..n as i32).map(|t| [3 * t, 3 * t + 1, 3 * t + 2]).collect();
        let vb = TypedBuffer::from_slice(device, &vertices).unwrap();
        let ib = TypedBuffer::from_slice(device, &indices).unwrap();
        let input = BuildInput::Triangles(TriangleArray {
            vertex_buffer: vb.device_ptr(),
            num_vertices: vertices.len() as u32,
            index_buffer: ib.device_ptr(),
            num_index_triplets: n as u32,
            ..Default::default()
        });
        (vb, ib, input)
    }

    #[test]
    fn test_resize_to_fit_grows_once() {
        let device = Device::new(&DeviceConfig::default()).unwrap();
        let ctx = DeviceContext::create(&device).unwrap();
        let mut scratch = AccelBuildScratch::new(&device);
        let options = AccelBuildOptions::default();

        let (_vb, _ib, big) = triangles(&device, 64);
        assert!(scratch.resize_to_fit(&ctx, &big, &options).unwrap());
        let (temp, out) = (scratch.temp_bytes(), scratch.output_bytes());

        let (_vb2, _ib2, small) = triangles(&device, 8);
        assert!(!scratch.resize_to_fit(&ctx, &small, &options).unwrap());
        assert!(!scratch.resize_to_fit(&ctx, &big, &options).unwrap());
        assert_eq!(scratch.temp_bytes(), temp);
        assert_eq!(scratch.output_bytes(), out);
    }

    #[test]
    fn test_compaction_is_disabled() {
        let device = Device::new(&DeviceConfig::default()).unwrap();
        let mut scratch = AccelBuildScratch::new(&device);
        for raw in [0, 0x1000, u64::MAX] {
            let mut handle = TraversableHandle::from_raw(raw);
            let err = scratch.do_compaction(&mut handle).unwrap_err();
            assert!(matches!(err, Error::FeatureDisabled(_)));
            assert_eq!(handle.as_raw(), raw);
        }
    }

    #[test]
    fn test_blocking_compaction_path() {
        let device = Device::new(&DeviceConfig::default()).unwrap();
        let ctx = DeviceContext::create(&device).unwrap();
        let stream = Stream::new(&device).unwrap();
        let mut scratch = AccelBuildScratch::new(&device);
        let options = AccelBuildOptions::default();

        let (_vb, _ib, input) = triangles(&device, 32);
        scratch.resize_to_fit(&ctx, &input, &options).unwrap();
        let mut handle = scratch.build(&ctx, &stream, &input, &options).unwrap();
        let built = handle;
        scratch.compact_blocking(&ctx, &stream, &mut handle).unwrap();
        stream.synchronize().unwrap();
        assert_ne!(handle, built);
        assert!(scratch.compact.byte_len() <= scratch.output_bytes());
    }

    #[test]
    fn test_empty_instance_input_fits() {
        let device = Device::new(&DeviceConfig::default()).unwrap();
        let ctx = DeviceContext::create(&device).unwrap();
        let mut scratch = AccelBuildScratch::new(&device);
        let input = BuildInput::Instances(InstanceArray::default());
        assert!(scratch
            .resize_to_fit(&ctx, &input, &AccelBuildOptions::default())
            .unwrap());
    }
}
