#![no_main]
#![no_std]

use cortex_m_semihosting::hprintln;
use log::{Level, Log, Metadata, Record};
use volatile_register::{RO, RW, WO};

use hexloader::{Board, ByteChannel, PageFlash};

const PAGE_SIZE: usize = 128;
const APP_END: usize = 0x7000;

// 16 MHz core clock
const CYCLES_PER_MS: u32 = 16_000;

struct Logger {}
impl Log for Logger {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        hprintln!("[HL] LOG - {}", record.args());
    }

    fn flush(&self) {}
}
static LOGGER: Logger = Logger {};

#[cortex_m_rt::entry]
fn main() -> ! {
    unsafe {
        log::set_logger_racy(&LOGGER).unwrap();
        log::set_max_level_racy(Level::Info.to_level_filter());
    }

    hexloader::boot::<PAGE_SIZE, _, _, _>(Uart {}, FlashCtl {}, M0Board {})
}

#[panic_handler]
fn panic(_panic: &core::panic::PanicInfo<'_>) -> ! {
    loop {}
}

#[repr(C)]
struct UartRegs {
    status: RO<u32>,
    rxdata: RO<u32>,
    txdata: WO<u32>,
}

struct Uart {}

impl Uart {
    const REGS: *const UartRegs = 0x4001_0000 as *const UartRegs;
    const RXNE: u32 = 1 << 0;
    const TXE: u32 = 1 << 1;
}

impl ByteChannel for Uart {
    fn get_byte(&mut self) -> u8 {
        unsafe {
            while (*Self::REGS).status.read() & Self::RXNE == 0 {}
            (*Self::REGS).rxdata.read() as u8
        }
    }

    fn put_byte(&mut self, b: u8) {
        unsafe {
            while (*Self::REGS).status.read() & Self::TXE == 0 {}
            (*Self::REGS).txdata.write(u32::from(b));
        }
    }

    fn byte_available(&mut self) -> bool {
        unsafe { (*Self::REGS).status.read() & Self::RXNE != 0 }
    }
}

#[repr(C)]
struct FlashRegs {
    status: RO<u32>,
    addr: RW<u32>,
    data: RW<u32>,
    command: WO<u32>,
}

// Flash controller with a one-page write latch. Commands run to completion
// while BUSY is set.
struct FlashCtl {}

impl FlashCtl {
    const REGS: *const FlashRegs = 0x4000_0000 as *const FlashRegs;
    const BUSY: u32 = 1 << 0;

    const CMD_ERASE: u32 = 0x4c6f315f;
    const CMD_FILL: u32 = 0x71be9a04;
    const CMD_PROGRAM: u32 = 0x860cd758;

    const PAGE: pow2::Pow2 = pow2::pow2_const!(PAGE_SIZE);

    fn exec(command: u32) {
        unsafe {
            (*Self::REGS).command.write(command);
            while (*Self::REGS).status.read() & Self::BUSY != 0 {}
        }
    }
}

impl PageFlash for FlashCtl {
    const APP_END: usize = APP_END;

    fn erase_page(&mut self, base: usize) {
        debug_assert!(Self::PAGE.is_aligned(base));
        unsafe {
            (*Self::REGS).addr.write(base as u32);
        }
        Self::exec(Self::CMD_ERASE);
    }

    fn fill_word(&mut self, addr: usize, word: u16) {
        unsafe {
            (*Self::REGS).addr.write(addr as u32);
            (*Self::REGS).data.write(u32::from(word));
        }
        Self::exec(Self::CMD_FILL);
    }

    fn commit_page(&mut self, base: usize) {
        debug_assert!(Self::PAGE.is_aligned(base));
        unsafe {
            (*Self::REGS).addr.write(base as u32);
        }
        Self::exec(Self::CMD_PROGRAM);
    }

    fn read_byte(&mut self, addr: usize) -> u8 {
        // program memory is mapped from address 0
        unsafe { core::ptr::read_volatile(addr as *const u8) }
    }
}

struct M0Board {}

impl Board for M0Board {
    fn delay_ms(&mut self, ms: u32) {
        cortex_m::asm::delay(ms * CYCLES_PER_MS);
    }

    fn jump_to_application(&mut self) -> ! {
        // SAFETY: Writing to VTOR is always safe.
        unsafe {
            (*cortex_m::peripheral::SCB::PTR).vtor.write(0);
        }
        // SAFETY: Every programmed page was verified by read-back before the
        // session reported success.
        unsafe { cortex_m::asm::bootload(core::ptr::null()) }
    }
}
