// Command streams and the completion counter
//
// Three streams share the compute queue: one for layout/access transitions,
// one for copies, one for dispatches. Each has its own pool and a single
// primary command buffer. Every submission signals the next value of a
// timeline semaphore and the host waits for it before returning, so at most
// one submission is ever in flight.

use anyhow::{Context, Result};
use ash::vk;
use std::ffi::CString;
use std::sync::Arc;

use super::VulkanDevice;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Transition,
    Copy,
    Compute,
}

impl StreamKind {
    fn index(self) -> usize {
        match self {
            StreamKind::Transition => 0,
            StreamKind::Copy => 1,
            StreamKind::Compute => 2,
        }
    }
}

struct Stream {
    pool: vk::CommandPool,
    buffer: vk::CommandBuffer,
}

pub struct Streams {
    device: Arc<VulkanDevice>,
    streams: Vec<Stream>,
    timeline: vk::Semaphore,
    submitted: u64,
}

impl Streams {
    pub fn new(device: &Arc<VulkanDevice>) -> Result<Self> {
        let mut type_info = vk::SemaphoreTypeCreateInfo::builder()
            .semaphore_type(vk::SemaphoreType::TIMELINE)
            .initial_value(0);
        let semaphore_info = vk::SemaphoreCreateInfo::builder().push_next(&mut type_info);

        let timeline = unsafe { device.device.create_semaphore(&semaphore_info, None) }
            .context("Failed to create timeline semaphore")?;

        let mut streams = Self {
            device: device.clone(),
            streams: Vec::with_capacity(3),
            timeline,
            submitted: 0,
        };

        for _ in 0..3 {
            let pool_info = vk::CommandPoolCreateInfo::builder()
                .queue_family_index(device.compute_queue_family)
                .flags(vk::CommandPoolCreateFlags::TRANSIENT);

            let pool = unsafe { device.device.create_command_pool(&pool_info, None) }
                .context("Failed to create command pool")?;

            let alloc_info = vk::CommandBufferAllocateInfo::builder()
                .command_pool(pool)
                .level(vk::CommandBufferLevel::PRIMARY)
                .command_buffer_count(1);

            let buffers = match unsafe { device.device.allocate_command_buffers(&alloc_info) } {
                Ok(buffers) => buffers,
                Err(e) => {
                    unsafe { device.device.destroy_command_pool(pool, None) };
                    return Err(e).context("Failed to allocate command buffer");
                }
            };

            streams.streams.push(Stream {
                pool,
                buffer: buffers[0],
            });
        }

        Ok(streams)
    }

    /// Record into `kind`, submit and block until the GPU is done.
    /// `labels` wrap the recorded commands as nested debug labels.
    /// Returns the completion value that was reached.
    pub fn execute(
        &mut self,
        kind: StreamKind,
        labels: &[String],
        record: impl FnOnce(&ash::Device, vk::CommandBuffer),
    ) -> Result<u64> {
        let device = &self.device.device;
        let stream = &self.streams[kind.index()];
        let cb = stream.buffer;

        unsafe {
            device
                .reset_command_pool(stream.pool, vk::CommandPoolResetFlags::empty())
                .context("Failed to reset command pool")?;

            let begin_info =
                vk::CommandBufferBeginInfo::builder().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            device
                .begin_command_buffer(cb, &begin_info)
                .context("Failed to begin command buffer")?;
        }

        let debug_utils = self.device.debug_utils().filter(|_| !labels.is_empty());

        if let Some(utils) = debug_utils {
            for label in labels {
                let name = CString::new(label.as_str()).unwrap_or_default();
                let info = vk::DebugUtilsLabelEXT::builder().label_name(&name);
                unsafe { utils.cmd_begin_debug_utils_label(cb, &info) };
            }
        }

        record(device, cb);

        if let Some(utils) = debug_utils {
            for _ in labels {
                unsafe { utils.cmd_end_debug_utils_label(cb) };
            }
        }

        unsafe { device.end_command_buffer(cb) }.context("Failed to end command buffer")?;

        let value = self.submitted + 1;
        let signal_values = [value];
        let signal_semaphores = [self.timeline];
        let command_buffers = [cb];

        let mut timeline_info = vk::TimelineSemaphoreSubmitInfo::builder().signal_semaphore_values(&signal_values);

        let submit_info = vk::SubmitInfo::builder()
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores)
            .push_next(&mut timeline_info)
            .build();

        unsafe { device.queue_submit(self.device.compute_queue, &[submit_info], vk::Fence::null()) }
            .context("Failed to submit command buffer")?;

        self.submitted = value;
        self.wait(value)?;

        Ok(value)
    }

    /// Block until the completion counter reaches `value`
    pub fn wait(&self, value: u64) -> Result<()> {
        let semaphores = [self.timeline];
        let values = [value];
        let wait_info = vk::SemaphoreWaitInfo::builder().semaphores(&semaphores).values(&values);

        unsafe { self.device.device.wait_semaphores(&wait_info, u64::MAX) }
            .context("Failed to wait for the timeline semaphore")?;
        Ok(())
    }

    /// Last value the GPU has reached
    pub fn completed(&self) -> Result<u64> {
        let value = unsafe { self.device.device.get_semaphore_counter_value(self.timeline) }
            .context("Failed to read the timeline semaphore")?;
        Ok(value)
    }

    /// Last value handed to the queue
    pub fn submitted(&self) -> u64 {
        self.submitted
    }
}

impl Drop for Streams {
    fn drop(&mut self) {
        let _ = self.wait(self.submitted);

        unsafe {
            for stream in &self.streams {
                self.device.device.destroy_command_pool(stream.pool, None);
            }
            self.device.device.destroy_semaphore(self.timeline, None);
        }
    }
}
