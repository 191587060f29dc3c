use anyhow::{Context, Result};
use memmap2::Mmap;
use std::fs::File;

#[derive(Debug)]
pub(crate) struct MemoryMapper {
    mmap: Mmap,
}

impl MemoryMapper {
    pub fn new(file: File) -> Result<Self> {
        let mmap = unsafe {
            memmap2::MmapOptions::new()
                .map(&file)
                .context("Failed to create memory mapping")?
        };
        Ok(Self { mmap })
    }

    pub fn bytes(&self) -> &[u8] {
        &self.mmap
    }

    /// Bounds-checked byte window into the mapping.
    pub fn window(&self, offset: usize, len: usize) -> Result<&[u8]> {
        let end = offset
            .checked_add(len)
            .filter(|&end| end <= self.mmap.len());
        match end {
            Some(end) => Ok(&self.mmap[offset..end]),
            None => anyhow::bail!(
                "Byte window [{offset}, {offset}+{len}) exceeds file size {}",
                self.mmap.len()
            ),
        }
    }

    /// Same window with the lifetime detached from the borrow.
    ///
    /// SAFETY: the caller keeps this mapper alive for as long as the returned
    /// slice is used; the model struct owns the mapper for exactly that reason.
    pub fn static_window(&self, offset: usize, len: usize) -> Result<&'static [u8]> {
        let window = self.window(offset, len)?;
        Ok(unsafe { std::mem::transmute::<&[u8], &'static [u8]>(window) })
    }
}
