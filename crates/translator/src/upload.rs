//! Upload buffer pool.
//!
//! Per-draw data (constant buffers, descriptor index tables) is suballocated from large upload
//! pages. A page is only written again after the frame that last used it has completed.
use std::collections::VecDeque;

use crate::host::{BufferKind, Device, GpuAddress, HostError, Resource};

/// Alignment of constant buffers.
pub const CONSTANT_ALIGNMENT: u32 = 256;

#[derive(Debug)]
struct Page {
    buffer: Resource,
    address: GpuAddress,
    /// Frame that last used this page.
    frame: u64,
    used: u32,
}

#[derive(Debug)]
pub struct UploadPool {
    page_size: u32,
    current: Option<Page>,
    submitted: VecDeque<Page>,
    available: Vec<Page>,
}

impl UploadPool {
    pub fn new(page_size: u32) -> Self {
        Self {
            page_size,
            current: None,
            submitted: VecDeque::new(),
            available: Vec::new(),
        }
    }

    fn page(&mut self, device: &mut dyn Device) -> Result<Page, HostError> {
        if let Some(mut page) = self.available.pop() {
            page.used = 0;
            return Ok(page);
        }

        let buffer = device.create_buffer(BufferKind::Upload, u64::from(self.page_size))?;
        tracing::debug!(buffer = buffer.0, size = self.page_size, "created an upload page");

        Ok(Page {
            buffer,
            address: device.gpu_address(buffer),
            frame: 0,
            used: 0,
        })
    }

    /// Copies `data` into the pool, returning its GPU address.
    pub fn upload(
        &mut self,
        device: &mut dyn Device,
        frame: u64,
        data: &[u8],
        alignment: u32,
    ) -> Result<GpuAddress, HostError> {
        let size = data.len().next_multiple_of(alignment as usize) as u32;
        assert!(
            size <= self.page_size,
            "upload of {size} bytes does not fit in a page"
        );

        let full = self.current.as_ref().is_some_and(|page| {
            page.used.next_multiple_of(alignment) + size > self.page_size
        });

        if full && let Some(page) = self.current.take() {
            self.submitted.push_back(page);
        }

        let mut page = match self.current.take() {
            Some(page) => page,
            None => self.page(device)?,
        };

        let offset = page.used.next_multiple_of(alignment);
        device.write_buffer(page.buffer, u64::from(offset), data);
        page.used = offset + size;
        page.frame = frame;

        let address = page.address.offset(u64::from(offset));
        self.current = Some(page);

        Ok(address)
    }

    /// Makes full pages whose last frame is `completed_frame` or older writable again.
    pub fn reclaim(&mut self, completed_frame: u64) {
        while let Some(page) = self.submitted.front() {
            if page.frame > completed_frame {
                break;
            }

            if let Some(page) = self.submitted.pop_front() {
                self.available.push(page);
            }
        }
    }

    /// Number of pages the pool owns.
    pub fn page_count(&self) -> usize {
        usize::from(self.current.is_some()) + self.submitted.len() + self.available.len()
    }
}
