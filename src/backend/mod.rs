// Backend engines
//
// immediate: wgpu, binding resolved per dispatch, no persistent state
// explicit:  Vulkan through ash, cached pipelines and descriptor sets,
//            manual barriers and a timeline semaphore

pub mod explicit;
pub mod immediate;

pub use explicit::ExplicitDevice;
pub use immediate::ImmediateDevice;

use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{DeviceError, Result};

/// Row pitch reported for a mapped buffer: its whole size, which has to fit
/// in 32 bits
pub(crate) fn mapped_buffer_pitch(size: u64) -> Result<u32> {
    u32::try_from(size).map_err(|_| {
        DeviceError::invalid(format!("buffer of {} bytes is too large to be mapped as one row", size))
    })
}

/// One outstanding map per allocation
pub(crate) trait MapGuard {
    fn map_flag(&self) -> &AtomicBool;

    fn begin_map(&self) -> anyhow::Result<()> {
        if self.map_flag().swap(true, Ordering::AcqRel) {
            anyhow::bail!("resource is already mapped");
        }
        Ok(())
    }

    fn end_map(&self) {
        self.map_flag().store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mapped_pitch_must_fit_in_32_bits() {
        assert_eq!(mapped_buffer_pitch(256).unwrap(), 256);
        assert_eq!(mapped_buffer_pitch(u32::MAX as u64).unwrap(), u32::MAX);

        let err = mapped_buffer_pitch(5 << 30).unwrap_err();
        assert!(matches!(err, DeviceError::InvalidDescriptor(_)), "{:?}", err);
    }
}
