pub mod command_list_pool;
pub mod frame;
pub mod frame_loop;

use std::sync::Arc;
use color_eyre::Result;
use color_eyre::eyre::eyre;
use crate::gpu::contexts::device_ctx::{QueueKind, SubmitInfo, SyncDevice, WAIT_FOREVER};
use crate::gpu::contexts::frame_ctx::command_list_pool::PooledCommandList;
use crate::gpu::contexts::frame_ctx::frame::Frame;

/// Fixed set of frames recorded and executed round-robin.
///
/// A frame's command pool is only reset after the fence of its previous
/// submission has been waited on, so the host never overwrites commands the
/// device is still executing. The active index starts at 0 and advances by
/// one per completed cycle.
pub struct FrameRing<D: SyncDevice, L> {
    frames: Vec<Frame<D, L>>,
    active: usize,
    queue: QueueKind,
    device: Arc<D>,
}

impl<D, L> FrameRing<D, L>
where
    D: SyncDevice,
    L: PooledCommandList<Raw = D::CommandBuffer>,
{
    pub fn new(
        device: Arc<D>,
        frame_count: u32,
        queue: QueueKind,
        presenting: bool,
    ) -> Result<Self> {
        if frame_count == 0 {
            return Err(eyre!("A frame ring needs at least one frame"));
        }

        let frames = (0..frame_count)
            .map(|index| Frame::new(index, queue, presenting, device.clone()))
            .collect::<Result<Vec<_>>>()?;

        log::debug!("Created frame ring with {} frames", frame_count);

        Ok(Self {
            frames,
            active: 0,
            queue,
            device,
        })
    }

    pub fn len(&self) -> u32 {
        self.frames.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn active_index(&self) -> u32 {
        self.active as u32
    }

    pub fn current(&self) -> &Frame<D, L> {
        &self.frames[self.active]
    }

    pub fn current_mut(&mut self) -> &mut Frame<D, L> {
        &mut self.frames[self.active]
    }

    pub fn frames(&self) -> &[Frame<D, L>] {
        &self.frames
    }

    pub fn queue(&self) -> QueueKind {
        self.queue
    }

    /// Blocks until the current frame's previous submission has finished.
    /// Returns `false` on timeout or device error, leaving the frame in flight.
    pub fn wait_current(&mut self, timeout_ns: u64) -> bool {
        let frame = &mut self.frames[self.active];
        if !frame.in_flight {
            return true;
        }

        match self.device.wait_for_fences(&[frame.fence], true, timeout_ns) {
            Ok(true) => {
                frame.in_flight = false;
                true
            }
            Ok(false) => {
                log::warn!("Timed out waiting for frame {} to retire", frame.index);
                false
            }
            Err(err) => {
                log::error!("Failed to wait for frame {}: {}", frame.index, err);
                false
            }
        }
    }

    /// Resets the current frame's command pool and hands out a list that is
    /// already recording. `create` wraps a freshly allocated command buffer
    /// when the frame's cache has no idle list.
    ///
    /// Refuses while the frame is still in flight.
    pub fn prepare_current<F>(&mut self, create: F) -> Option<L>
    where
        F: FnOnce(D::CommandBuffer) -> L,
    {
        let device = &self.device;
        let frame = &mut self.frames[self.active];

        if frame.in_flight {
            log::warn!("Frame {} is still in flight, not resetting its command pool", frame.index);
            return None;
        }

        if let Err(err) = device.reset_command_pool(frame.command_pool) {
            log::error!("Failed to reset command pool of frame {}: {}", frame.index, err);
            return None;
        }
        frame.command_lists.reset_for_new_cycle();

        let pool = frame.command_pool;
        let list = match frame
            .command_lists
            .checkout(|| Ok(create(device.allocate_command_buffer(pool)?)))
        {
            Ok(list) => list,
            Err(err) => {
                log::error!("Failed to allocate command list for frame {}: {}", frame.index, err);
                return None;
            }
        };

        if let Err(err) = device.begin_command_buffer(list.raw()) {
            log::error!("Failed to begin command list for frame {}: {}", frame.index, err);
            frame.command_lists.checkin(list);
            return None;
        }

        log::trace!("Frame {} recording", frame.index);
        Some(list)
    }

    /// Ends recording, submits the list with the current frame's fence and
    /// returns the list to the frame's cache.
    pub fn submit_current(
        &mut self,
        list: L,
        wait: Option<D::Semaphore>,
        signal: Option<D::Semaphore>,
    ) -> bool {
        let device = &self.device;
        let queue = self.queue;
        let frame = &mut self.frames[self.active];

        let submitted = Self::submit(device, queue, frame, &list, wait, signal);
        match &submitted {
            Ok(()) => log::trace!("Frame {} submitted", frame.index),
            Err(err) => log::error!("Failed to submit frame {}: {}", frame.index, err),
        }

        frame.in_flight = submitted.is_ok();
        frame.command_lists.checkin(list);
        submitted.is_ok()
    }

    fn submit(
        device: &D,
        queue: QueueKind,
        frame: &Frame<D, L>,
        list: &L,
        wait: Option<D::Semaphore>,
        signal: Option<D::Semaphore>,
    ) -> Result<()> {
        device.end_command_buffer(list.raw())?;
        device.reset_fences(&[frame.fence])?;

        let command_buffers = [list.raw()];
        let wait_semaphores: Vec<_> = wait.into_iter().collect();
        let signal_semaphores: Vec<_> = signal.into_iter().collect();
        device.submit(
            queue,
            &SubmitInfo {
                command_buffers: &command_buffers,
                wait_semaphores: &wait_semaphores,
                signal_semaphores: &signal_semaphores,
                fence: Some(frame.fence),
            },
        )
    }

    pub fn advance(&mut self) {
        self.active = (self.active + 1) % self.frames.len();
    }

    /// Blocks until every frame in flight has retired.
    pub fn wait_all(&mut self) -> bool {
        let fences: Vec<_> = self
            .frames
            .iter()
            .filter(|frame| frame.in_flight)
            .map(|frame| frame.fence)
            .collect();
        if fences.is_empty() {
            return true;
        }

        match self.device.wait_for_fences(&fences, true, WAIT_FOREVER) {
            Ok(true) => {
                for frame in &mut self.frames {
                    frame.in_flight = false;
                }
                true
            }
            Ok(false) => false,
            Err(err) => {
                log::error!("Failed to wait for frames in flight: {}", err);
                false
            }
        }
    }
}

impl<D: SyncDevice, L> Drop for FrameRing<D, L> {
    fn drop(&mut self) {
        let fences: Vec<_> = self
            .frames
            .iter()
            .filter(|frame| frame.in_flight)
            .map(|frame| frame.fence)
            .collect();
        if !fences.is_empty() {
            if let Err(err) = self.device.wait_for_fences(&fences, true, WAIT_FOREVER) {
                log::error!("Failed to wait for frames before teardown: {}", err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};
    use crate::gpu::backends::headless::device::{CommandBufferId, HeadlessDevice};

    struct TestList {
        raw: CommandBufferId,
        recycled: bool,
    }

    impl PooledCommandList for TestList {
        type Raw = CommandBufferId;

        fn raw(&self) -> CommandBufferId {
            self.raw
        }

        fn recycle(&mut self) {
            self.recycled = true;
        }
    }

    fn new_list(raw: CommandBufferId) -> TestList {
        TestList { raw, recycled: false }
    }

    fn ring(frame_count: u32) -> (Arc<HeadlessDevice>, FrameRing<HeadlessDevice, TestList>) {
        let device = Arc::new(HeadlessDevice::new(Duration::ZERO, None));
        let ring = FrameRing::new(device.clone(), frame_count, QueueKind::Graphics, false).unwrap();
        (device, ring)
    }

    fn cycle(ring: &mut FrameRing<HeadlessDevice, TestList>) -> bool {
        assert!(ring.wait_current(WAIT_FOREVER));
        let list = ring.prepare_current(new_list).unwrap();
        let submitted = ring.submit_current(list, None, None);
        ring.advance();
        submitted
    }

    #[test]
    fn active_index_is_cycle_count_mod_len() {
        let (_device, mut ring) = ring(3);
        for k in 0..10u32 {
            assert_eq!(ring.active_index(), k % 3);
            assert!(cycle(&mut ring));
        }
    }

    #[test]
    fn zero_frames_is_an_error() {
        let device = Arc::new(HeadlessDevice::new(Duration::ZERO, None));
        assert!(FrameRing::<_, TestList>::new(device, 0, QueueKind::Graphics, false).is_err());
    }

    #[test]
    fn wait_blocks_until_fence_signals() {
        let (device, mut ring) = ring(1);
        device.set_submit_latency(Duration::from_millis(40));

        let started = Instant::now();
        let list = ring.prepare_current(new_list).unwrap();
        assert!(ring.submit_current(list, None, None));
        ring.advance();

        assert!(ring.wait_current(WAIT_FOREVER));
        assert!(started.elapsed() >= Duration::from_millis(40));
        assert!(device.violations().is_empty());
    }

    #[test]
    fn in_flight_frame_is_not_reset() {
        let (device, mut ring) = ring(1);
        device.set_submit_latency(Duration::from_millis(200));

        let list = ring.prepare_current(new_list).unwrap();
        assert!(ring.submit_current(list, None, None));

        assert!(!ring.wait_current(1_000));
        assert!(ring.prepare_current(new_list).is_none());
        assert!(device.violations().is_empty());
    }

    #[test]
    fn lists_are_recycled_per_frame() {
        let (_device, mut ring) = ring(2);
        for _ in 0..6 {
            assert!(cycle(&mut ring));
        }
        for frame in ring.frames() {
            assert_eq!(frame.command_lists.capacity(), 1);
        }

        assert!(ring.wait_current(WAIT_FOREVER));
        let list = ring.prepare_current(new_list).unwrap();
        assert!(list.recycled);
        assert_eq!(ring.current().command_lists.used(), 1);
    }
}
