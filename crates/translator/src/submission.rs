//! Submission and frame pipelining.
//!
//! Each submission is one recorded [`CommandList`] signalling the submission fence with its own
//! index. Frames group submissions and are queued at most `queue_frames` deep.
use std::collections::VecDeque;
use std::time::Duration;

use easyerr::Error;

use crate::host::{CommandAllocator, CommandList, Device, Heap, HostError, Resource};

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("graphics device lost")]
    DeviceLost,
    #[error(transparent)]
    Host { source: HostError },
}

impl From<HostError> for SubmitError {
    fn from(value: HostError) -> Self {
        match value {
            HostError::DeviceLost => Self::DeviceLost,
            source => Self::Host { source },
        }
    }
}

/// Something released once the GPU is done with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Retired {
    Resource(Resource),
    Heap(Heap),
}

/// Submission and frame indices, command allocators and deferred deletion.
pub struct Submissions {
    queue_frames: u64,
    fence_timeout: Duration,
    lost: bool,

    // submissions
    current: u64,
    completed: u64,
    open: bool,
    commands: CommandList,

    // frames
    frame_current: u64,
    frame_completed: u64,
    frame_open: bool,
    /// Last submission of each of the last `queue_frames` frames, indexed by frame modulo
    /// `queue_frames`.
    closed_frames: Vec<u64>,

    // pools
    writable: VecDeque<CommandAllocator>,
    submitted: VecDeque<(CommandAllocator, u64)>,
    retired: VecDeque<(u64, Retired)>,
}

impl Submissions {
    pub fn new(queue_frames: u32, fence_timeout: Duration) -> Self {
        assert!(queue_frames > 0);

        Self {
            queue_frames: u64::from(queue_frames),
            fence_timeout,
            lost: false,

            current: 1,
            completed: 0,
            open: false,
            commands: CommandList::default(),

            frame_current: 1,
            frame_completed: 0,
            frame_open: false,
            closed_frames: vec![0; queue_frames as usize],

            writable: VecDeque::new(),
            submitted: VecDeque::new(),
            retired: VecDeque::new(),
        }
    }

    /// Index of the submission being recorded, or of the next one if none is open.
    #[inline(always)]
    pub fn current(&self) -> u64 {
        self.current
    }

    #[inline(always)]
    pub fn completed(&self) -> u64 {
        self.completed
    }

    #[inline(always)]
    pub fn is_open(&self) -> bool {
        self.open
    }

    #[inline(always)]
    pub fn frame_current(&self) -> u64 {
        self.frame_current
    }

    #[inline(always)]
    pub fn frame_completed(&self) -> u64 {
        self.frame_completed
    }

    #[inline(always)]
    pub fn is_frame_open(&self) -> bool {
        self.frame_open
    }

    #[inline(always)]
    pub fn is_lost(&self) -> bool {
        self.lost
    }

    #[inline(always)]
    pub fn commands(&mut self) -> &mut CommandList {
        &mut self.commands
    }

    /// Marks the device as lost. Every later operation fails.
    pub fn lose(&mut self) -> SubmitError {
        if !self.lost {
            tracing::error!("graphics device lost, refusing further work");
            self.lost = true;
        }

        SubmitError::DeviceLost
    }

    fn fail(&mut self, err: HostError) -> SubmitError {
        match err {
            HostError::DeviceLost => self.lose(),
            source => SubmitError::Host { source },
        }
    }

    /// Submission that must complete before the next frame can be opened: the last one of the
    /// frame `queue_frames` frames ago.
    pub fn frame_wait_target(&self) -> u64 {
        self.closed_frames[(self.frame_current % self.queue_frames) as usize]
    }

    pub fn open_submission(&mut self) {
        debug_assert!(!self.open);
        debug_assert!(self.commands.is_empty());
        self.open = true;
    }

    /// Opens the current frame, updating the completed frame index first.
    pub fn open_frame(&mut self) {
        debug_assert!(!self.frame_open);

        // at most `queue_frames` frames are in flight, but the GPU might be closer than that
        self.frame_completed = self.frame_current.max(self.queue_frames) - self.queue_frames;
        for frame in self.frame_completed + 1..self.frame_current {
            if self.closed_frames[(frame % self.queue_frames) as usize] > self.completed {
                break;
            }

            self.frame_completed = frame;
        }

        self.frame_open = true;
    }

    /// Makes sure a command allocator is available for the open submission.
    pub fn ensure_allocator(&mut self, device: &mut dyn Device) -> Result<(), SubmitError> {
        if !self.writable.is_empty() {
            return Ok(());
        }

        match device.create_command_allocator() {
            Ok(allocator) => {
                tracing::debug!(allocator = allocator.0, "created a command allocator");
                self.writable.push_back(allocator);
                Ok(())
            }
            Err(err) => {
                tracing::error!("failed to create a command allocator: {err}");
                Err(self.fail(err))
            }
        }
    }

    /// Hands the recorded commands of the open submission to the GPU and signals its fence.
    pub fn submit(&mut self, device: &mut dyn Device) -> Result<(), SubmitError> {
        debug_assert!(self.open);

        let Some(allocator) = self.writable.front().copied() else {
            panic!("no writable command allocator for submission {}", self.current);
        };

        if let Err(err) = device.execute(allocator, self.commands.commands()) {
            return Err(self.fail(err));
        }

        let submission = self.current;
        self.writable.pop_front();
        self.submitted.push_back((allocator, submission));
        self.commands.clear();
        self.current += 1;
        self.open = false;

        // the commands are already running, and without the fence nothing can tell when they
        // finish, so the allocator and everything retired would never be reclaimed
        if let Err(err) = device.signal(submission) {
            tracing::error!("failed to signal submission {submission}: {err}");
            return Err(self.lose());
        }

        Ok(())
    }

    /// Closes the open frame. Its last submission becomes its completion token.
    pub fn close_frame(&mut self) {
        debug_assert!(self.frame_open);
        debug_assert!(!self.open);

        let slot = (self.frame_current % self.queue_frames) as usize;
        self.closed_frames[slot] = self.current - 1;
        self.frame_current += 1;
        self.frame_open = false;
    }

    /// Releases `resource` once the current submission completes.
    pub fn retire(&mut self, resource: Resource) {
        self.retired
            .push_back((self.current, Retired::Resource(resource)));
    }

    /// Releases `heap` once the current submission completes.
    pub fn retire_heap(&mut self, heap: Heap) {
        self.retired.push_back((self.current, Retired::Heap(heap)));
    }

    /// Polls the fence, waiting until `await_submission` completes. Returns whether the
    /// completed submission index moved forward, in which case allocators and retired objects
    /// have been reclaimed.
    pub fn poll(
        &mut self,
        device: &mut dyn Device,
        await_submission: u64,
    ) -> Result<bool, SubmitError> {
        debug_assert!(await_submission < self.current);
        if self.lost {
            return Err(SubmitError::DeviceLost);
        }

        let before = self.completed;
        self.completed = device.completed_value();

        while self.completed < await_submission {
            match device.wait(await_submission, self.fence_timeout) {
                Ok(()) => (),
                Err(HostError::Timeout) if !device.is_lost() => {
                    tracing::warn!(
                        awaiting = await_submission,
                        completed = self.completed,
                        "GPU is taking long to complete a submission"
                    );
                }
                Err(HostError::Timeout) => return Err(self.lose()),
                Err(err) => return Err(self.fail(err)),
            }

            self.completed = device.completed_value();
        }

        if self.completed <= before {
            return Ok(false);
        }

        while let Some(&(allocator, submission)) = self.submitted.front() {
            if submission > self.completed {
                break;
            }

            self.submitted.pop_front();
            self.writable.push_back(allocator);
        }

        while let Some(&(submission, retired)) = self.retired.front() {
            if submission > self.completed {
                break;
            }

            self.retired.pop_front();
            match retired {
                Retired::Resource(resource) => device.release(resource),
                Retired::Heap(heap) => device.release_heap(heap),
            }
        }

        Ok(true)
    }

    /// Allocators waiting for their submission to complete, with that submission's index.
    pub fn submitted_allocators(&self) -> impl Iterator<Item = (CommandAllocator, u64)> + '_ {
        self.submitted.iter().copied()
    }

    pub fn writable_allocators(&self) -> impl Iterator<Item = CommandAllocator> + '_ {
        self.writable.iter().copied()
    }
}
