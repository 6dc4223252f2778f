//! Single-page RAM staging for the flash programming engine

use crate::{OK, PageFlash, SessionError, SessionResult};

// The buffer starts blank (0xFF) and is re-blanked after every full-page
// flush, so the unwritten tail of a final partial page programs as erased
// flash.
pub struct PageBuffer<const PAGE: usize> {
    buf: [u8; PAGE],
    cursor: usize,
}

impl<const PAGE: usize> PageBuffer<PAGE> {
    pub fn new() -> Self {
        const {
            assert!(PAGE != 0 && PAGE % 2 == 0, "flash pages are word-granular");
        }
        PageBuffer {
            buf: [0xFF; PAGE],
            cursor: 0,
        }
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn accept<F: PageFlash>(&mut self, flash: &mut F, value: u8) -> SessionResult {
        // bytes past the gate are consumed but never placed
        if self.cursor >= F::APP_END {
            return OK;
        }

        self.buf[self.cursor % PAGE] = value;
        self.cursor += 1;

        if self.cursor % PAGE == 0 {
            self.flush(flash, self.cursor - PAGE, PAGE)?;
            self.buf = [0xFF; PAGE];
        }
        OK
    }

    pub fn finish<F: PageFlash>(&mut self, flash: &mut F) -> SessionResult {
        let tail = self.cursor % PAGE;
        if tail != 0 {
            self.flush(flash, self.cursor - tail, tail)?;
        }
        OK
    }

    // The fill always covers the whole page; `valid` bounds the read-back
    // comparison, since a partial final page only verifies the bytes the
    // stream actually supplied.
    fn flush<F: PageFlash>(&mut self, flash: &mut F, base: usize, valid: usize) -> SessionResult {
        log::debug!("flushing page at {:#06x}", base);

        flash.erase_page(base);
        for offset in (0..PAGE).step_by(2) {
            let word = u16::from_le_bytes([self.buf[offset], self.buf[offset + 1]]);
            flash.fill_word(base + offset, word);
        }
        flash.commit_page(base);

        for offset in 0..valid {
            if flash.read_byte(base + offset) != self.buf[offset] {
                log::warn!("read-back mismatch at {:#06x}", base + offset);
                return Err(SessionError::Verify);
            }
        }
        OK
    }
}
