use std::io;
use std::time::Duration;

use tracing::{debug, warn};

use crate::console::Console;
use crate::image::Image;

pub const MEMORY_SIZE: usize = 1 << 16;

/// Keyboard status register; bit 15 set when a key has been latched.
pub const KBSR: u16 = 0xFE00;
/// Keyboard data register; holds the last latched character.
pub const KBDR: u16 = 0xFE02;

const KBSR_READY: u16 = 1 << 15;

/// Flat 64K-word address space. Every `u16` is a valid address.
#[derive(Clone)]
pub struct Memory {
    cells: Vec<u16>,
    poll_timeout: Duration,
}

impl Default for Memory {
    fn default() -> Self {
        Self::new()
    }
}

impl Memory {
    pub fn new() -> Self {
        Self {
            cells: vec![0; MEMORY_SIZE],
            poll_timeout: Duration::ZERO,
        }
    }

    /// How long a read of [`KBSR`] waits for a keystroke.
    pub fn set_poll_timeout(&mut self, timeout: Duration) {
        self.poll_timeout = timeout;
    }

    /// Addressed read. Reading [`KBSR`] polls the console first and latches a
    /// pending key into [`KBDR`].
    pub fn read<C: Console + ?Sized>(&mut self, address: u16, console: &mut C) -> io::Result<u16> {
        if address == KBSR {
            match console.poll_key(self.poll_timeout)? {
                Some(key) => {
                    self.cells[usize::from(KBSR)] = KBSR_READY;
                    self.cells[usize::from(KBDR)] = u16::from(key);
                }
                None => self.cells[usize::from(KBSR)] = 0,
            }
        }
        Ok(self.peek(address))
    }

    /// Read without device side effects.
    pub fn peek(&self, address: u16) -> u16 {
        self.cells[usize::from(address)]
    }

    pub fn write(&mut self, address: u16, value: u16) {
        self.cells[usize::from(address)] = value;
    }

    /// Copy an image into memory at its origin. Words that would land past the
    /// top of the address space are dropped. Returns the number of words loaded.
    pub fn load_image(&mut self, image: &Image) -> usize {
        let start = usize::from(image.origin);
        let count = image.words.len().min(image.capacity());
        self.cells[start..start + count].copy_from_slice(&image.words[..count]);
        if count < image.words.len() {
            warn!(
                origin = image.origin,
                dropped = image.words.len() - count,
                "image truncated at top of memory"
            );
        }
        debug!(origin = image.origin, words = count, "loaded image");
        count
    }

    pub fn as_slice(&self) -> &[u16] {
        &self.cells
    }
}
