use std::sync::Arc;
use color_eyre::Result;
use slotmap::SlotMap;
use crate::gpu::contexts::device_ctx::{QueueKind, SubmitInfo, SyncDevice, WAIT_FOREVER};
use crate::gpu::handle::Fence;

/// Submission path outside the frame ring, for one-shot work such as
/// uploads. Every call blocks until the device has finished the work, and
/// must not overlap frame submissions on the same queue.
pub struct ImmediateSubmitter<D: SyncDevice> {
    fence: D::Fence,
    command_pool: D::CommandPool,
    command_buffer: D::CommandBuffer,

    queue: QueueKind,
    device: Arc<D>,
}

impl<D: SyncDevice> ImmediateSubmitter<D> {
    pub fn new(
        queue: QueueKind,
        device: Arc<D>,
    ) -> Result<Self> {
        let fence = device.create_fence(false)?;
        let command_pool = match device.create_command_pool(queue, true) {
            Ok(pool) => pool,
            Err(err) => {
                device.destroy_fence(fence);
                return Err(err);
            }
        };
        let command_buffer = match device.allocate_command_buffer(command_pool) {
            Ok(command_buffer) => command_buffer,
            Err(err) => {
                device.destroy_command_pool(command_pool);
                device.destroy_fence(fence);
                return Err(err);
            }
        };

        Ok(Self {
            fence,
            command_pool,
            command_buffer,
            queue,
            device,
        })
    }

    pub fn command_buffer(&self) -> D::CommandBuffer {
        self.command_buffer
    }

    /// Records `func` into the transient command buffer, submits it and
    /// waits for completion. The pool is reset afterwards even if recording
    /// failed.
    pub fn submit<F>(&mut self, func: F) -> Result<()>
    where
        F: FnOnce(D::CommandBuffer) -> Result<()>,
    {
        let result = self.record_and_wait(func);
        let reset = self.device.reset_command_pool(self.command_pool);
        result.and(reset)
    }

    fn record_and_wait<F>(&self, func: F) -> Result<()>
    where
        F: FnOnce(D::CommandBuffer) -> Result<()>,
    {
        let cmd = self.command_buffer;

        self.device.begin_command_buffer(cmd)?;
        let recorded = func(cmd);
        self.device.end_command_buffer(cmd)?;
        recorded?;

        let command_buffers = [cmd];
        self.device.submit(
            self.queue,
            &SubmitInfo {
                command_buffers: &command_buffers,
                wait_semaphores: &[],
                signal_semaphores: &[],
                fence: Some(self.fence),
            },
        )?;

        self.device.wait_for_fences(&[self.fence], true, WAIT_FOREVER)?;
        self.device.reset_fences(&[self.fence])?;
        log::trace!("Immediate submission on {:?} queue retired", self.queue);

        Ok(())
    }
}

impl<D: SyncDevice> Drop for ImmediateSubmitter<D> {
    fn drop(&mut self) {
        self.device.destroy_command_pool(self.command_pool);
        self.device.destroy_fence(self.fence);
    }
}

/// Creates `count` fences. Either every fence is created or none is left
/// alive.
pub fn create_fences<D: SyncDevice>(
    device: &D,
    fences: &mut SlotMap<Fence, D::Fence>,
    count: u32,
    signaled: bool,
) -> Option<Vec<Fence>> {
    let mut created = Vec::with_capacity(count as usize);
    for _ in 0..count {
        match device.create_fence(signaled) {
            Ok(fence) => created.push(fences.insert(fence)),
            Err(err) => {
                log::error!("Failed to create fence: {}", err);
                destroy_fences(device, fences, &created);
                return None;
            }
        }
    }
    Some(created)
}

pub fn destroy_fences<D: SyncDevice>(
    device: &D,
    fences: &mut SlotMap<Fence, D::Fence>,
    handles: &[Fence],
) {
    for handle in handles {
        match fences.remove(*handle) {
            Some(fence) => device.destroy_fence(fence),
            None => log::warn!("Destroy requested for stale fence handle {:?}", handle),
        }
    }
}

/// Maps handles to device fences, skipping stale ones.
pub fn resolve_fences<D: SyncDevice>(
    fences: &SlotMap<Fence, D::Fence>,
    handles: &[Fence],
) -> Vec<D::Fence> {
    handles
        .iter()
        .filter_map(|handle| {
            let fence = fences.get(*handle).copied();
            if fence.is_none() {
                log::warn!("Ignoring stale fence handle {:?}", handle);
            }
            fence
        })
        .collect()
}

/// Returns `false` on timeout or device error.
pub fn wait_for_fences<D: SyncDevice>(
    device: &D,
    fences: &SlotMap<Fence, D::Fence>,
    handles: &[Fence],
    wait_all: bool,
    timeout_ns: u64,
) -> bool {
    let raw = resolve_fences::<D>(fences, handles);
    wait_for_resolved_fences(device, &raw, wait_all, timeout_ns)
}

/// Waits on fences already resolved by [`resolve_fences`], so callers can
/// release their storage lock before blocking.
pub fn wait_for_resolved_fences<D: SyncDevice>(
    device: &D,
    raw: &[D::Fence],
    wait_all: bool,
    timeout_ns: u64,
) -> bool {
    if raw.is_empty() {
        return true;
    }
    match device.wait_for_fences(raw, wait_all, timeout_ns) {
        Ok(signaled) => signaled,
        Err(err) => {
            log::error!("Failed to wait for fences: {}", err);
            false
        }
    }
}

pub fn reset_fences<D: SyncDevice>(
    device: &D,
    fences: &SlotMap<Fence, D::Fence>,
    handles: &[Fence],
) -> bool {
    let raw = resolve_fences::<D>(fences, handles);
    if raw.is_empty() {
        return true;
    }
    match device.reset_fences(&raw) {
        Ok(()) => true,
        Err(err) => {
            log::error!("Failed to reset fences: {}", err);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use crate::gpu::backends::headless::device::HeadlessDevice;

    #[test]
    fn immediate_submit_blocks_until_done() {
        let device = Arc::new(HeadlessDevice::new(Duration::from_millis(10), None));
        let mut submitter = ImmediateSubmitter::new(QueueKind::Transfer, device.clone()).unwrap();

        let mut recorded = false;
        submitter.submit(|_| {
            recorded = true;
            Ok(())
        }).unwrap();

        assert!(recorded);
        assert_eq!(device.submissions().len(), 1);
        assert!(device.violations().is_empty());
    }

    #[test]
    fn failed_recording_is_not_submitted() {
        let device = Arc::new(HeadlessDevice::new(Duration::ZERO, None));
        let mut submitter = ImmediateSubmitter::new(QueueKind::Graphics, device.clone()).unwrap();

        let result = submitter.submit(|_| Err(color_eyre::eyre::eyre!("bad upload")));
        assert!(result.is_err());
        assert!(device.submissions().is_empty());
    }

    #[test]
    fn fence_batch_round_trip() {
        let device = HeadlessDevice::new(Duration::ZERO, None);
        let mut fences = SlotMap::with_key();

        let handles = create_fences(&device, &mut fences, 3, true).unwrap();
        assert_eq!(handles.len(), 3);
        assert!(wait_for_fences(&device, &fences, &handles, true, 0));
        assert!(reset_fences(&device, &fences, &handles));
        assert!(!wait_for_fences(&device, &fences, &handles[..1], true, 1_000));

        destroy_fences(&device, &mut fences, &handles);
        assert!(fences.is_empty());
        // Stale handles are skipped.
        assert!(wait_for_fences(&device, &fences, &handles, true, 0));
    }
}
