#![cfg_attr(not(test), no_std)]

pub mod hex;
pub mod page;
pub mod session;

#[cfg(test)]
pub(crate) mod testdev;

pub use session::{SessionEnd, run};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionError {
    Verify,
    Checksum,
    BadRecordType(u8),
    Timeout,
}

pub type SessionResult<T = ()> = Result<T, SessionError>;

pub const OK: SessionResult = Ok(());

pub trait ByteChannel {
    fn get_byte(&mut self) -> u8;
    fn put_byte(&mut self, b: u8);
    fn byte_available(&mut self) -> bool;
}

/// Page-granular program memory with erase-before-write semantics. Words
/// staged with `fill_word` become visible only after `commit_page`.
pub trait PageFlash {
    /// First address NOT writable by the session (the loader's own base).
    const APP_END: usize;

    fn erase_page(&mut self, base: usize);
    fn fill_word(&mut self, addr: usize, word: u16);
    fn commit_page(&mut self, base: usize);
    fn read_byte(&mut self, addr: usize) -> u8;
}

pub trait Board {
    fn delay_ms(&mut self, ms: u32);
    fn jump_to_application(&mut self) -> !;
}

pub fn boot<const PAGE: usize, C, F, B>(mut chan: C, mut flash: F, mut board: B) -> !
where
    C: ByteChannel,
    F: PageFlash,
    B: Board,
{
    match session::run::<PAGE, _, _, _>(
        &mut chan,
        &mut flash,
        &mut board,
        session::IDLE_TIMEOUT_MS,
    ) {
        Ok(SessionEnd::Complete) => {
            session::send_line(&mut chan, "Programming successful");
            log::info!("application image accepted, booting");
            board.jump_to_application()
        }
        // A quit or any error keeps the loader resident until external reset.
        Ok(SessionEnd::Quit) => {}
        Err(err) => {
            log::warn!("session failed: {:?}", err);
            session::send_line(&mut chan, "Programming failed");
        }
    }

    loop {
        board.delay_ms(1000);
        session::send_line(&mut chan, "Bootloader idle due to error");
    }
}
