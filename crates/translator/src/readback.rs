//! Copying GPU-written guest memory back to the CPU, and the scratch buffer.
//!
//! Readbacks are synchronous: the copies are recorded into the open submission, the queue is
//! drained and only then is the data written to guest memory. [`PendingReadback`] holds what
//! is needed to finish the readback once the drain is done.
use crate::barrier::Barriers;
use crate::host::{BufferKind, Command, Device, HostError, Resource, ResourceState};
use crate::modules::{MemoryModule, Recorder};
use crate::submission::Submissions;

/// Smallest readback buffer ever created.
const READBACK_MIN_SIZE: u64 = 4 * 1024 * 1024;
/// Scratch buffer sizes are a multiple of this.
const SCRATCH_ALIGNMENT: u64 = 16 * 1024 * 1024;

/// A host-readable buffer for readbacks. Grows when needed, never shrinks.
#[derive(Debug, Default)]
pub struct ReadbackBuffer {
    buffer: Option<(Resource, u64)>,
}

impl ReadbackBuffer {
    /// Returns a readback buffer of at least `size` bytes.
    pub fn request(
        &mut self,
        device: &mut dyn Device,
        submissions: &mut Submissions,
        size: u64,
    ) -> Result<Resource, HostError> {
        if let Some((buffer, capacity)) = self.buffer
            && capacity >= size
        {
            return Ok(buffer);
        }

        let capacity = size.max(READBACK_MIN_SIZE).next_power_of_two();
        let buffer = device.create_buffer(BufferKind::Readback, capacity)?;
        tracing::debug!(buffer = buffer.0, capacity, "created a readback buffer");

        // earlier copies into the old buffer might still be in flight
        if let Some((old, _)) = self.buffer.replace((buffer, capacity)) {
            submissions.retire(old);
        }

        Ok(buffer)
    }

    pub fn capacity(&self) -> u64 {
        self.buffer.map_or(0, |(_, capacity)| capacity)
    }
}

/// A guest memory range being read back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ReadbackRange {
    address: u32,
    length: u32,
    /// Offset in the readback buffer.
    offset: u64,
}

/// A readback recorded into a submission, finished by [`PendingReadback::complete`] after the
/// queue has been drained.
#[derive(Debug)]
#[must_use]
pub struct PendingReadback {
    buffer: Resource,
    ranges: Vec<ReadbackRange>,
}

impl PendingReadback {
    /// Records copies of the given guest memory ranges (address, length) into the readback
    /// buffer.
    pub fn record(
        rec: &mut Recorder,
        readback: &mut ReadbackBuffer,
        memory: &mut dyn MemoryModule,
        ranges: &[(u32, u32)],
    ) -> Result<Self, HostError> {
        let total = ranges
            .iter()
            .map(|&(_, length)| u64::from(length))
            .sum::<u64>();
        let buffer = readback.request(rec.device, rec.submissions, total)?;

        memory.use_as_copy_source(rec.barriers);
        rec.flush_barriers();

        let source = memory.buffer();
        let mut offset = 0;
        let mut recorded = Vec::with_capacity(ranges.len());
        for &(address, length) in ranges {
            if length == 0 {
                continue;
            }

            rec.push(Command::CopyBuffer {
                dst: buffer,
                dst_offset: offset,
                src: source,
                src_offset: u64::from(address),
                size: u64::from(length),
            });

            recorded.push(ReadbackRange {
                address,
                length,
                offset,
            });
            offset += u64::from(length);
        }

        Ok(Self {
            buffer,
            ranges: recorded,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Writes the read back data to guest memory. The copies must have completed.
    pub fn complete(self, device: &mut dyn Device, memory: &mut dyn MemoryModule) {
        let mut data = Vec::new();
        for range in self.ranges {
            data.resize(range.length as usize, 0);
            device.read_buffer(self.buffer, range.offset, &mut data);
            memory.write_guest(range.address, &data);

            tracing::trace!(
                "read back {:08X} -> {:08X}",
                range.address,
                range.address.wrapping_add(range.length)
            );
        }
    }
}

/// A GPU-only buffer for temporary data, used by one user at a time.
#[derive(Debug, Default)]
pub struct ScratchBuffer {
    buffer: Option<(Resource, u64)>,
    acquired: bool,
}

impl ScratchBuffer {
    /// Acquires the scratch buffer, at least `size` bytes large and in `state`.
    ///
    /// # Panics
    /// Panics if the buffer is already acquired.
    pub fn acquire(
        &mut self,
        device: &mut dyn Device,
        submissions: &mut Submissions,
        barriers: &mut Barriers,
        size: u64,
        state: ResourceState,
    ) -> Result<Resource, HostError> {
        assert!(!self.acquired, "scratch buffer acquired twice");

        let buffer = match self.buffer {
            Some((buffer, capacity)) if capacity >= size => buffer,
            _ => {
                let capacity = size.max(1).next_multiple_of(SCRATCH_ALIGNMENT);
                let buffer = device.create_buffer(BufferKind::Default, capacity)?;
                tracing::debug!(buffer = buffer.0, capacity, "created a scratch buffer");

                if let Some((old, _)) = self.buffer.replace((buffer, capacity)) {
                    barriers.forget(old);
                    submissions.retire(old);
                }

                barriers.track(buffer, ResourceState::Common);
                buffer
            }
        };

        barriers.transition(buffer, state);
        self.acquired = true;

        Ok(buffer)
    }

    /// Releases the scratch buffer, leaving it in `state` if it was moved to another state
    /// while acquired.
    ///
    /// # Panics
    /// Panics if the buffer is not acquired.
    pub fn release(&mut self, barriers: &mut Barriers, state: ResourceState) {
        assert!(self.acquired, "scratch buffer released without being acquired");

        if let Some((buffer, _)) = self.buffer {
            barriers.track(buffer, state);
        }

        self.acquired = false;
    }

    pub fn is_acquired(&self) -> bool {
        self.acquired
    }
}
