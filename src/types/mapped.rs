// CPU readback of a mapped resource

use bytemuck::Pod;

type Unmap = Box<dyn FnOnce() + Send>;

/// Scoped CPU view of a CPU_READ resource. The resource is unmapped when
/// this value is dropped.
pub struct MappedResource {
    data: Vec<u8>,
    row_pitch: u32,
    unmap: Option<Unmap>,
}

impl MappedResource {
    pub(crate) fn new(data: Vec<u8>, row_pitch: u32, unmap: impl FnOnce() + Send + 'static) -> Self {
        Self {
            data,
            row_pitch,
            unmap: Some(Box::new(unmap)),
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Bytes between two rows; the whole size for buffers
    pub fn row_pitch(&self) -> u32 {
        self.row_pitch
    }

    /// Contents reinterpreted as `T`, trailing bytes ignored
    pub fn to_vec<T: Pod>(&self) -> Vec<T> {
        let size = std::mem::size_of::<T>();
        let usable = self.data.len() / size * size;
        bytemuck::pod_collect_to_vec(&self.data[..usable])
    }

    /// One row of pixels, `row_bytes` long. `None` when the row does not
    /// lie within the mapped data.
    pub fn row(&self, y: u32, row_bytes: usize) -> Option<&[u8]> {
        let start = (y as usize).checked_mul(self.row_pitch as usize)?;
        self.data.get(start..start.checked_add(row_bytes)?)
    }
}

impl Drop for MappedResource {
    fn drop(&mut self) {
        if let Some(unmap) = self.unmap.take() {
            unmap();
        }
    }
}

impl std::fmt::Debug for MappedResource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappedResource")
            .field("len", &self.data.len())
            .field("row_pitch", &self.row_pitch)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[test]
    fn drop_runs_unmap_once() {
        let unmapped = Arc::new(AtomicBool::new(false));
        let flag = unmapped.clone();

        let mapped = MappedResource::new(vec![1, 0, 0, 0, 2, 0, 0, 0, 9], 9, move || {
            assert!(!flag.swap(true, Ordering::SeqCst));
        });

        assert_eq!(mapped.to_vec::<u32>(), vec![1, 2]);
        assert!(!unmapped.load(Ordering::SeqCst));

        drop(mapped);
        assert!(unmapped.load(Ordering::SeqCst));
    }

    #[test]
    fn rows_follow_the_pitch() {
        let mapped = MappedResource::new((0u8..16).collect(), 8, || {});
        assert_eq!(mapped.row(1, 4), Some(&[8u8, 9, 10, 11][..]));
        assert_eq!(mapped.row(1, 8).map(<[u8]>::len), Some(8));
    }

    #[test]
    fn rows_outside_the_data_are_none() {
        let mapped = MappedResource::new((0u8..16).collect(), 8, || {});

        assert!(mapped.row(2, 1).is_none());
        assert!(mapped.row(1, 9).is_none());
        assert!(mapped.row(u32::MAX, 4).is_none());
        assert!(mapped.row(0, usize::MAX).is_none());
    }
}
