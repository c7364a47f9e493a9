use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use color_eyre::Result;
use color_eyre::eyre::{eyre, OptionExt};
use slotmap::{new_key_type, SlotMap};
use crate::gpu::backends::headless::command_list::Command;
use crate::gpu::contexts::device_ctx::{
    AcquireOutcome, PresentDevice, PresentOutcome, QueueKind, SubmitInfo, SurfaceCapabilities,
    SyncDevice, WAIT_FOREVER,
};
use crate::gpu::types::Extent2D;

/// Submissions kept for inspection; older ones are dropped.
pub const SUBMISSION_HISTORY: usize = 256;

new_key_type! {
    pub struct FenceId;
    pub struct SemaphoreId;
    pub struct CommandPoolId;
    pub struct CommandBufferId;
    pub struct SwapchainId;
}

/// Presentable image of a virtual swapchain.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct VirtualImage {
    pub swapchain: SwapchainId,
    pub index: u32,
}

/// Device misuse caught by the headless backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Violation {
    /// A command pool was reset while work recorded from it was executing.
    PoolResetWhilePending(CommandPoolId),
    /// A fence was reset while the submission it guards was executing.
    FenceResetWhilePending(FenceId),
    /// A command buffer was submitted while still recording.
    SubmittedWhileRecording(CommandBufferId),
    /// A semaphore with a pending signal was signaled again.
    SemaphoreSignaledTwice(SemaphoreId),
}

/// Device call that can be made to fail once with [`HeadlessDevice::fail_next`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultPoint {
    PoolReset,
    Submit,
}

#[derive(Clone, Debug)]
pub struct Submission {
    pub queue: QueueKind,
    pub commands: Vec<Command>,
    pub wait_semaphores: usize,
    pub signal_semaphores: usize,
    pub fence: Option<FenceId>,
    pub submitted_at: Instant,
    pub completes_at: Instant,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum FenceStatus {
    Unsignaled,
    Signaled,
    Pending(Instant),
}

impl FenceStatus {
    /// `now` is the moment the wait started; signaled fences count as reached then.
    fn ready_at(self, now: Instant) -> Option<Instant> {
        match self {
            Self::Unsignaled => None,
            Self::Signaled => Some(now),
            Self::Pending(at) => Some(at),
        }
    }
}

struct PoolState {
    // Latest completion time of work recorded from this pool.
    busy_until: Option<Instant>,
    buffers: Vec<CommandBufferId>,
    resets: u32,
}

struct CommandBufferState {
    pool: CommandPoolId,
    recording: bool,
    commands: Vec<Command>,
}

struct SwapchainState {
    extent: Extent2D,
    image_count: u32,
    next_image: u32,
    surface_generation: u64,
}

struct DeviceState {
    fences: SlotMap<FenceId, FenceStatus>,
    // `true` while a signal is pending and nobody has waited on it.
    semaphores: SlotMap<SemaphoreId, bool>,
    pools: SlotMap<CommandPoolId, PoolState>,
    command_buffers: SlotMap<CommandBufferId, CommandBufferState>,
    swapchains: SlotMap<SwapchainId, SwapchainState>,

    submit_latency: Duration,
    surface: Option<SurfaceCapabilities>,
    surface_generation: u64,

    submissions: VecDeque<Submission>,
    // Completion time of the latest submission, including dropped history.
    last_completion: Option<Instant>,
    presents: u32,
    violations: Vec<Violation>,
    faults: Vec<FaultPoint>,
}

/// Device without hardware. Submitted work completes `submit_latency` after
/// submission; fences become signaled once that time has passed.
pub struct HeadlessDevice {
    state: Mutex<DeviceState>,
}

impl HeadlessDevice {
    pub fn new(submit_latency: Duration, surface: Option<SurfaceCapabilities>) -> Self {
        Self {
            state: Mutex::new(DeviceState {
                fences: SlotMap::with_key(),
                semaphores: SlotMap::with_key(),
                pools: SlotMap::with_key(),
                command_buffers: SlotMap::with_key(),
                swapchains: SlotMap::with_key(),
                submit_latency,
                surface,
                surface_generation: 0,
                submissions: VecDeque::new(),
                last_completion: None,
                presents: 0,
                violations: Vec::new(),
                faults: Vec::new(),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, DeviceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Makes the next call at `point` fail.
    pub fn fail_next(&self, point: FaultPoint) {
        self.state().faults.push(point);
    }

    fn take_fault(state: &mut DeviceState, point: FaultPoint) -> bool {
        match state.faults.iter().position(|fault| *fault == point) {
            Some(i) => {
                state.faults.remove(i);
                true
            }
            None => false,
        }
    }

    fn signal_semaphore(
        semaphores: &mut SlotMap<SemaphoreId, bool>,
        violations: &mut Vec<Violation>,
        semaphore: SemaphoreId,
    ) {
        if let Some(pending) = semaphores.get_mut(semaphore) {
            if *pending {
                violations.push(Violation::SemaphoreSignaledTwice(semaphore));
            }
            *pending = true;
        }
    }

    /// Latency applied to submissions made from now on.
    pub fn set_submit_latency(&self, latency: Duration) {
        self.state().submit_latency = latency;
    }

    pub fn has_surface(&self) -> bool {
        self.state().surface.is_some()
    }

    /// Makes every existing swapchain out of date, as a window resize would.
    pub fn invalidate_surface(&self) {
        self.state().surface_generation += 1;
    }

    /// Changes the surface limits and invalidates existing swapchains.
    pub fn set_surface_capabilities(&self, caps: SurfaceCapabilities) {
        let mut state = self.state();
        state.surface = Some(caps);
        state.surface_generation += 1;
    }

    /// The most recent submissions, oldest first, up to [`SUBMISSION_HISTORY`].
    pub fn submissions(&self) -> Vec<Submission> {
        self.state().submissions.iter().cloned().collect()
    }

    /// Drains the submission history.
    pub fn take_submissions(&self) -> Vec<Submission> {
        self.state().submissions.drain(..).collect()
    }

    pub fn violations(&self) -> Vec<Violation> {
        self.state().violations.clone()
    }

    pub fn present_count(&self) -> u32 {
        self.state().presents
    }

    /// Resets performed on every command pool so far.
    pub fn pool_reset_count(&self) -> u32 {
        self.state().pools.values().map(|pool| pool.resets).sum()
    }

    pub fn live_fence_count(&self) -> usize {
        self.state().fences.len()
    }

    pub fn swapchain_extent(&self, swapchain: SwapchainId) -> Option<Extent2D> {
        self.state().swapchains.get(swapchain).map(|sc| sc.extent)
    }

    /// Appends a command to a recording command buffer.
    pub fn record(&self, command_buffer: CommandBufferId, command: Command) {
        let mut state = self.state();
        match state.command_buffers.get_mut(command_buffer) {
            Some(cb) if cb.recording => cb.commands.push(command),
            Some(_) => log::warn!("Command recorded outside begin/end: {:?}", command),
            None => log::warn!("Command recorded into freed command buffer {:?}", command_buffer),
        }
    }

    /// Commands recorded so far into a command buffer.
    pub fn recorded(&self, command_buffer: CommandBufferId) -> Vec<Command> {
        self.state()
            .command_buffers
            .get(command_buffer)
            .map(|cb| cb.commands.clone())
            .unwrap_or_default()
    }

    fn settle(state: &mut DeviceState, now: Instant) {
        for status in state.fences.values_mut() {
            if let FenceStatus::Pending(at) = *status {
                if at <= now {
                    *status = FenceStatus::Signaled;
                }
            }
        }
    }
}

impl SyncDevice for HeadlessDevice {
    type Fence = FenceId;
    type Semaphore = SemaphoreId;
    type CommandPool = CommandPoolId;
    type CommandBuffer = CommandBufferId;

    fn create_fence(&self, signaled: bool) -> Result<FenceId> {
        let status = if signaled {
            FenceStatus::Signaled
        } else {
            FenceStatus::Unsignaled
        };
        Ok(self.state().fences.insert(status))
    }

    fn destroy_fence(&self, fence: FenceId) {
        self.state().fences.remove(fence);
    }

    fn wait_for_fences(&self, fences: &[FenceId], wait_all: bool, timeout_ns: u64) -> Result<bool> {
        let started = Instant::now();
        let ready_at = {
            let state = self.state();
            let mut ready = Vec::with_capacity(fences.len());
            for fence in fences {
                let status = state
                    .fences
                    .get(*fence)
                    .ok_or_eyre("Wait on a destroyed fence")?;
                ready.push(status.ready_at(started));
            }
            if wait_all {
                ready.into_iter().collect::<Option<Vec<_>>>().and_then(|r| r.into_iter().max())
            } else {
                ready.into_iter().flatten().min()
            }
        };

        let deadline = if timeout_ns == WAIT_FOREVER {
            None
        } else {
            started.checked_add(Duration::from_nanos(timeout_ns))
        };

        let reached = match (ready_at, deadline) {
            (None, None) => return Err(eyre!("Waiting forever on fences that were never submitted")),
            (Some(at), None) => Some(at),
            (Some(at), Some(deadline)) if at <= deadline => Some(at),
            _ => None,
        };

        let wake_at = reached.or(deadline).unwrap_or_else(Instant::now);
        let now = Instant::now();
        if wake_at > now {
            std::thread::sleep(wake_at - now);
        }
        Self::settle(&mut self.state(), Instant::now());
        Ok(reached.is_some())
    }

    fn reset_fences(&self, fences: &[FenceId]) -> Result<()> {
        let mut state = self.state();
        let now = Instant::now();
        for fence in fences {
            let Some(status) = state.fences.get(*fence).copied() else {
                return Err(eyre!("Reset of a destroyed fence"));
            };
            if matches!(status, FenceStatus::Pending(at) if at > now) {
                state.violations.push(Violation::FenceResetWhilePending(*fence));
            }
            state.fences[*fence] = FenceStatus::Unsignaled;
        }
        Ok(())
    }

    fn create_semaphore(&self) -> Result<SemaphoreId> {
        Ok(self.state().semaphores.insert(false))
    }

    fn destroy_semaphore(&self, semaphore: SemaphoreId) {
        self.state().semaphores.remove(semaphore);
    }

    fn create_command_pool(&self, _queue: QueueKind, _transient: bool) -> Result<CommandPoolId> {
        Ok(self.state().pools.insert(PoolState {
            busy_until: None,
            buffers: Vec::new(),
            resets: 0,
        }))
    }

    fn destroy_command_pool(&self, pool: CommandPoolId) {
        let mut state = self.state();
        if let Some(pool) = state.pools.remove(pool) {
            for buffer in pool.buffers {
                state.command_buffers.remove(buffer);
            }
        }
    }

    fn reset_command_pool(&self, pool: CommandPoolId) -> Result<()> {
        let mut state = self.state();
        if Self::take_fault(&mut state, FaultPoint::PoolReset) {
            return Err(eyre!("Command pool reset failed"));
        }
        let now = Instant::now();
        let DeviceState {
            pools,
            command_buffers,
            violations,
            ..
        } = &mut *state;

        let pool_state = pools.get_mut(pool).ok_or_eyre("Reset of a destroyed command pool")?;
        if pool_state.busy_until.is_some_and(|at| at > now) {
            violations.push(Violation::PoolResetWhilePending(pool));
        }
        pool_state.busy_until = None;
        pool_state.resets += 1;

        for buffer in &pool_state.buffers {
            if let Some(cb) = command_buffers.get_mut(*buffer) {
                cb.recording = false;
                cb.commands.clear();
            }
        }
        Ok(())
    }

    fn allocate_command_buffer(&self, pool: CommandPoolId) -> Result<CommandBufferId> {
        let mut state = self.state();
        if !state.pools.contains_key(pool) {
            return Err(eyre!("Allocation from a destroyed command pool"));
        }
        let buffer = state.command_buffers.insert(CommandBufferState {
            pool,
            recording: false,
            commands: Vec::new(),
        });
        state.pools[pool].buffers.push(buffer);
        Ok(buffer)
    }

    fn begin_command_buffer(&self, command_buffer: CommandBufferId) -> Result<()> {
        let mut state = self.state();
        let cb = state
            .command_buffers
            .get_mut(command_buffer)
            .ok_or_eyre("Begin on a freed command buffer")?;
        cb.recording = true;
        cb.commands.clear();
        Ok(())
    }

    fn end_command_buffer(&self, command_buffer: CommandBufferId) -> Result<()> {
        let mut state = self.state();
        let cb = state
            .command_buffers
            .get_mut(command_buffer)
            .ok_or_eyre("End on a freed command buffer")?;
        if !cb.recording {
            return Err(eyre!("End on a command buffer that is not recording"));
        }
        cb.recording = false;
        Ok(())
    }

    fn submit(&self, queue: QueueKind, info: &SubmitInfo<'_, Self>) -> Result<()> {
        let mut state = self.state();
        if Self::take_fault(&mut state, FaultPoint::Submit) {
            return Err(eyre!("Queue submission failed"));
        }
        let DeviceState {
            fences,
            semaphores,
            pools,
            command_buffers,
            submit_latency,
            submissions,
            last_completion,
            violations,
            ..
        } = &mut *state;

        let now = Instant::now();
        let completes_at = now + *submit_latency;

        let mut commands = Vec::new();
        for buffer in info.command_buffers {
            let cb = command_buffers
                .get(*buffer)
                .ok_or_eyre("Submit of a freed command buffer")?;
            if cb.recording {
                violations.push(Violation::SubmittedWhileRecording(*buffer));
                return Err(eyre!("Submit of a command buffer that is still recording"));
            }
            commands.extend(cb.commands.iter().cloned());

            if let Some(pool) = pools.get_mut(cb.pool) {
                pool.busy_until = Some(pool.busy_until.map_or(completes_at, |at| at.max(completes_at)));
            }
        }

        if let Some(fence) = info.fence {
            let status = fences
                .get_mut(fence)
                .ok_or_eyre("Submit with a destroyed fence")?;
            *status = FenceStatus::Pending(completes_at);
        }

        for semaphore in info.wait_semaphores {
            if let Some(pending) = semaphores.get_mut(*semaphore) {
                *pending = false;
            }
        }
        for semaphore in info.signal_semaphores {
            Self::signal_semaphore(semaphores, violations, *semaphore);
        }

        *last_completion = Some(last_completion.map_or(completes_at, |at| at.max(completes_at)));
        if submissions.len() == SUBMISSION_HISTORY {
            submissions.pop_front();
        }
        submissions.push_back(Submission {
            queue,
            commands,
            wait_semaphores: info.wait_semaphores.len(),
            signal_semaphores: info.signal_semaphores.len(),
            fence: info.fence,
            submitted_at: now,
            completes_at,
        });
        Ok(())
    }

    fn wait_idle(&self) -> Result<()> {
        let latest = self.state().last_completion;
        if let Some(latest) = latest {
            let now = Instant::now();
            if latest > now {
                std::thread::sleep(latest - now);
            }
        }
        Self::settle(&mut self.state(), Instant::now());
        Ok(())
    }
}

impl PresentDevice for HeadlessDevice {
    type Swapchain = SwapchainId;
    type Image = VirtualImage;

    fn surface_capabilities(&self) -> Result<SurfaceCapabilities> {
        self.state()
            .surface
            .ok_or_eyre("Headless device was created without a surface")
    }

    fn create_swapchain(
        &self,
        extent: Extent2D,
        image_count: u32,
        _vsync: bool,
        old: Option<SwapchainId>,
    ) -> Result<SwapchainId> {
        let mut state = self.state();
        if state.surface.is_none() {
            return Err(eyre!("Headless device was created without a surface"));
        }
        if let Some(old) = old {
            // Retired: further acquires report out of date.
            if let Some(old) = state.swapchains.get_mut(old) {
                old.surface_generation = u64::MAX;
            }
        }
        let surface_generation = state.surface_generation;
        Ok(state.swapchains.insert(SwapchainState {
            extent,
            image_count: image_count.max(1),
            next_image: 0,
            surface_generation,
        }))
    }

    fn destroy_swapchain(&self, swapchain: SwapchainId) {
        self.state().swapchains.remove(swapchain);
    }

    fn swapchain_images(&self, swapchain: SwapchainId) -> Result<Vec<VirtualImage>> {
        let state = self.state();
        let sc = state
            .swapchains
            .get(swapchain)
            .ok_or_eyre("Images of a destroyed swapchain")?;
        Ok((0..sc.image_count)
            .map(|index| VirtualImage { swapchain, index })
            .collect())
    }

    fn acquire_next_image(
        &self,
        swapchain: SwapchainId,
        signal: SemaphoreId,
        _timeout_ns: u64,
    ) -> AcquireOutcome {
        let mut state = self.state();
        if !state.semaphores.contains_key(signal) {
            return AcquireOutcome::Failed;
        }
        let generation = state.surface_generation;
        let Some(sc) = state.swapchains.get_mut(swapchain) else {
            return AcquireOutcome::Failed;
        };
        if sc.surface_generation != generation {
            return AcquireOutcome::OutOfDate;
        }
        let index = sc.next_image;
        sc.next_image = (sc.next_image + 1) % sc.image_count;
        let DeviceState {
            semaphores,
            violations,
            ..
        } = &mut *state;
        Self::signal_semaphore(semaphores, violations, signal);
        AcquireOutcome::Acquired(index)
    }

    fn present(
        &self,
        _queue: QueueKind,
        swapchain: SwapchainId,
        image_index: u32,
        wait: SemaphoreId,
    ) -> PresentOutcome {
        let mut state = self.state();
        if !state.semaphores.contains_key(wait) {
            return PresentOutcome::Failed;
        }
        let generation = state.surface_generation;
        let Some(sc) = state.swapchains.get(swapchain) else {
            return PresentOutcome::Failed;
        };
        if image_index >= sc.image_count {
            return PresentOutcome::Failed;
        }
        let out_of_date = sc.surface_generation != generation;
        state.semaphores[wait] = false;
        if out_of_date {
            return PresentOutcome::OutOfDate;
        }
        state.presents += 1;
        PresentOutcome::Presented
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fence_signals_after_latency() {
        let device = HeadlessDevice::new(Duration::from_millis(20), None);
        let fence = device.create_fence(false).unwrap();
        let pool = device.create_command_pool(QueueKind::Graphics, true).unwrap();
        let cb = device.allocate_command_buffer(pool).unwrap();

        device.begin_command_buffer(cb).unwrap();
        device.end_command_buffer(cb).unwrap();
        device
            .submit(
                QueueKind::Graphics,
                &SubmitInfo {
                    command_buffers: &[cb],
                    wait_semaphores: &[],
                    signal_semaphores: &[],
                    fence: Some(fence),
                },
            )
            .unwrap();

        assert!(!device.wait_for_fences(&[fence], true, 0).unwrap());
        device.reset_command_pool(pool).unwrap();
        assert_eq!(device.violations(), vec![Violation::PoolResetWhilePending(pool)]);

        assert!(device.wait_for_fences(&[fence], true, WAIT_FOREVER).unwrap());
    }

    #[test]
    fn signaled_fence_poll_succeeds_without_timeout() {
        let device = HeadlessDevice::new(Duration::ZERO, None);
        let signaled = device.create_fence(true).unwrap();
        let idle = device.create_fence(false).unwrap();

        assert!(device.wait_for_fences(&[signaled], true, 0).unwrap());
        assert!(device.wait_for_fences(&[signaled, idle], false, 0).unwrap());
        assert!(!device.wait_for_fences(&[signaled, idle], true, 0).unwrap());
    }

    #[test]
    fn submission_history_is_bounded() {
        let device = HeadlessDevice::new(Duration::from_millis(5), None);
        let pool = device.create_command_pool(QueueKind::Graphics, true).unwrap();
        let cb = device.allocate_command_buffer(pool).unwrap();
        device.begin_command_buffer(cb).unwrap();
        device.end_command_buffer(cb).unwrap();

        let info = SubmitInfo {
            command_buffers: &[cb],
            wait_semaphores: &[],
            signal_semaphores: &[],
            fence: None,
        };
        for _ in 0..SUBMISSION_HISTORY + 10 {
            device.submit(QueueKind::Graphics, &info).unwrap();
        }
        assert_eq!(device.submissions().len(), SUBMISSION_HISTORY);

        let drained = device.take_submissions();
        assert_eq!(drained.len(), SUBMISSION_HISTORY);
        assert!(device.submissions().is_empty());

        // Draining history does not let wait_idle skip outstanding work.
        let last = drained.last().unwrap().completes_at;
        device.wait_idle().unwrap();
        assert!(Instant::now() >= last);
    }

    #[test]
    fn unbounded_wait_on_idle_fence_is_an_error() {
        let device = HeadlessDevice::new(Duration::ZERO, None);
        let fence = device.create_fence(false).unwrap();
        assert!(device.wait_for_fences(&[fence], true, WAIT_FOREVER).is_err());
        assert!(!device.wait_for_fences(&[fence], true, 1_000).unwrap());
    }

    #[test]
    fn invalidated_surface_reports_out_of_date() {
        let caps = SurfaceCapabilities {
            min_image_count: 2,
            max_image_count: 0,
            current_extent: None,
            min_extent: Extent2D::new(1, 1),
            max_extent: Extent2D::new(4096, 4096),
            format: crate::gpu::types::Format::B8G8R8A8Srgb,
        };
        let device = HeadlessDevice::new(Duration::ZERO, Some(caps));
        let semaphore = device.create_semaphore().unwrap();
        let swapchain = device.create_swapchain(Extent2D::new(64, 64), 2, true, None).unwrap();

        assert_eq!(device.acquire_next_image(swapchain, semaphore, 0), AcquireOutcome::Acquired(0));
        assert_eq!(device.acquire_next_image(swapchain, semaphore, 0), AcquireOutcome::Acquired(1));

        device.invalidate_surface();
        assert_eq!(device.acquire_next_image(swapchain, semaphore, 0), AcquireOutcome::OutOfDate);
    }
}
