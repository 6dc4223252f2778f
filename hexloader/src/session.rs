//! The update session: record dispatch, acknowledgement, idle timeout

use crate::hex::{RecordKind, RecordReader};
use crate::page::PageBuffer;
use crate::{Board, ByteChannel, PageFlash, SessionError, SessionResult};

// STK500 protocol bytes. Only STK_OK is ever produced; the rest belong to
// the dialect and are reserved for hosts that expect them.
pub const STK_OK: u8 = 0x10;
pub const STK_FAILED: u8 = 0x11;
pub const STK_UNKNOWN: u8 = 0x12;
pub const STK_INSYNC: u8 = 0x14;
pub const STK_NOSYNC: u8 = 0x15;
pub const CRC_EOP: u8 = 0x20;

// Idle window before an unattended session gives up, in ~1 ms ticks.
pub const IDLE_TIMEOUT_MS: u32 = 5000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    Complete,
    Quit,
}

// The countdown only advances between bytes; once a record introducer has
// been accepted the channel reads block without a deadline.
pub fn run<const PAGE: usize, C, F, B>(
    chan: &mut C,
    flash: &mut F,
    board: &mut B,
    idle_ms: u32,
) -> SessionResult<SessionEnd>
where
    C: ByteChannel,
    F: PageFlash,
    B: Board,
{
    let mut page = PageBuffer::<PAGE>::new();
    let mut idle = idle_ms;

    send_line(chan, "Bootloader started");
    log::info!("session open, {} ms idle window", idle_ms);

    while idle > 0 {
        if !chan.byte_available() {
            board.delay_ms(1);
            idle -= 1;
            continue;
        }

        let ch = chan.get_byte();
        idle = idle_ms;

        match ch {
            b':' => {
                if let RecordKind::EndOfFile = handle_record(chan, flash, &mut page)? {
                    return Ok(SessionEnd::Complete);
                }
            }
            b'Q' => {
                send_line(chan, "Quit command received");
                chan.put_byte(STK_OK);
                log::info!("host quit after {} bytes", page.cursor());
                return Ok(SessionEnd::Quit);
            }
            // line terminators and stray noise between records
            _ => {}
        }
    }

    send_line(chan, "Bootloader timed out");
    log::warn!("idle window expired");
    Err(SessionError::Timeout)
}

// Parses and applies one record, the introducer already consumed.
fn handle_record<const PAGE: usize, C, F>(
    chan: &mut C,
    flash: &mut F,
    page: &mut PageBuffer<PAGE>,
) -> SessionResult<RecordKind>
where
    C: ByteChannel,
    F: PageFlash,
{
    let mut rdr = RecordReader::new();
    let hdr = rdr.read_header(chan);

    match hdr.kind {
        RecordKind::Data => {
            send_line(chan, "Processing data record");
            log::debug!("data record, {} bytes", hdr.len);
            for _ in 0..hdr.len {
                let value = rdr.read_u8(chan);
                if let Err(err) = page.accept(flash, value) {
                    send_line(chan, "Verification failed");
                    return Err(err);
                }
            }
            if !rdr.finish(chan) {
                send_line(chan, "Checksum error");
                return Err(SessionError::Checksum);
            }
            chan.put_byte(STK_OK);
        }
        RecordKind::EndOfFile => {
            send_line(chan, "Processing end of file record");
            log::debug!("end of file after {} bytes", page.cursor());
            if !rdr.finish(chan) {
                send_line(chan, "Checksum error");
                return Err(SessionError::Checksum);
            }
            if let Err(err) = page.finish(flash) {
                send_line(chan, "Verification failed");
                return Err(err);
            }
            chan.put_byte(STK_OK);
        }
        RecordKind::Other(raw) => {
            send_line(chan, "Invalid record type");
            log::warn!("record type {:#04x} not supported", raw);
            return Err(SessionError::BadRecordType(raw));
        }
    }

    Ok(hdr.kind)
}

pub(crate) fn send_line<C: ByteChannel>(chan: &mut C, msg: &str) {
    for &b in msg.as_bytes() {
        chan.put_byte(b);
    }
    chan.put_byte(b'\r');
    chan.put_byte(b'\n');
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testdev::{FlashOp, ScriptChannel, SimBoard, SimFlash};

    // 16-byte pages, app region [0, 64), 128 bytes of flash
    type TestFlash = SimFlash<16, 64, 128>;
    const PAGE: usize = 16;
    const IDLE: u32 = 50;

    fn run_session(
        chan: &mut ScriptChannel,
        flash: &mut TestFlash,
    ) -> (SessionResult<SessionEnd>, u64) {
        let mut board = SimBoard::default();
        let end = run::<PAGE, _, _, _>(chan, flash, &mut board, IDLE);
        (end, board.ticks)
    }

    fn push_hex(stream: &mut Vec<u8>, value: u8) {
        const DIGITS: &[u8; 16] = b"0123456789ABCDEF";
        stream.push(DIGITS[usize::from(value >> 4)]);
        stream.push(DIGITS[usize::from(value & 0x0F)]);
    }

    fn push_record(stream: &mut Vec<u8>, addr: u16, kind: u8, payload: &[u8]) {
        stream.push(b':');
        let mut sum = 0u8;
        for field in [payload.len() as u8, (addr >> 8) as u8, addr as u8, kind] {
            push_hex(stream, field);
            sum = sum.wrapping_add(field);
        }
        for &b in payload {
            push_hex(stream, b);
            sum = sum.wrapping_add(b);
        }
        push_hex(stream, sum.wrapping_neg());
    }

    fn push_eof(stream: &mut Vec<u8>) {
        push_record(stream, 0, 0x01, &[]);
    }

    #[test]
    fn small_image_single_partial_page() {
        let payload = [0x0C, 0x94, 0x34, 0x00, 0x0C, 0x94, 0x3E, 0x00];
        let mut stream = Vec::new();
        push_record(&mut stream, 0, 0x00, &payload);
        push_eof(&mut stream);

        let mut chan = ScriptChannel::new(stream);
        let mut flash = TestFlash::new();
        let (end, _) = run_session(&mut chan, &mut flash);

        assert_eq!(end, Ok(SessionEnd::Complete));
        assert_eq!(chan.acks(), 2);
        assert_eq!(&flash.mem[..8], &payload);
        assert_eq!(&flash.mem[8..16], &[0xFF; 8]);
    }

    #[test]
    fn full_page_flushes_before_the_ack() {
        let payload: [u8; 16] = core::array::from_fn(|i| (i * 3) as u8);
        let mut stream = Vec::new();
        push_record(&mut stream, 0, 0x00, &payload);
        push_eof(&mut stream);

        let mut chan = ScriptChannel::new(stream);
        let mut flash = TestFlash::new();
        let (end, _) = run_session(&mut chan, &mut flash);

        assert_eq!(end, Ok(SessionEnd::Complete));
        assert_eq!(chan.acks(), 2);
        assert_eq!(&flash.mem[..16], &payload);
        // the boundary flush happened once, inside the data record
        assert_eq!(
            flash
                .ops
                .iter()
                .filter(|op| matches!(op, FlashOp::Commit(_)))
                .count(),
            1
        );
    }

    #[test]
    fn record_spanning_a_page_boundary() {
        let payload: [u8; 24] = core::array::from_fn(|i| !(i as u8));
        let mut stream = Vec::new();
        push_record(&mut stream, 0, 0x00, &payload);
        push_eof(&mut stream);

        let mut chan = ScriptChannel::new(stream);
        let mut flash = TestFlash::new();
        let (end, _) = run_session(&mut chan, &mut flash);

        assert_eq!(end, Ok(SessionEnd::Complete));
        assert_eq!(&flash.mem[..24], &payload);
        assert_eq!(&flash.mem[24..32], &[0xFF; 8]);
        assert_eq!(
            flash
                .ops
                .iter()
                .filter_map(|op| match op {
                    FlashOp::Commit(base) => Some(*base),
                    _ => None,
                })
                .collect::<Vec<_>>(),
            vec![0, 16]
        );
    }

    #[test]
    fn bad_checksum_on_second_record() {
        // 4+4 bytes: the corrupted record must not land on a page boundary,
        // or the flush would run before the checksum is even read
        let mut stream = Vec::new();
        push_record(&mut stream, 0, 0x00, &[0x42; 4]);
        let mark = stream.len();
        push_record(&mut stream, 4, 0x00, &[0x43; 4]);
        // corrupt the second record's checksum byte by +1
        let last = stream.len() - 1;
        stream[last] = if stream[last] == b'9' {
            b'A'
        } else {
            stream[last] + 1
        };
        assert!(stream.len() > mark);

        let mut chan = ScriptChannel::new(stream);
        let mut flash = TestFlash::new();
        let (end, _) = run_session(&mut chan, &mut flash);

        assert_eq!(end, Err(SessionError::Checksum));
        assert_eq!(chan.acks(), 1);
        assert!(chan.transcript().contains("Checksum error"));
        assert!(flash.ops.is_empty());
    }

    #[test]
    fn oversize_image_is_capped_at_app_end() {
        // 48 bytes in, then a 20-byte record that runs 4 bytes past the gate
        let mut stream = Vec::new();
        for i in 0..3u8 {
            push_record(&mut stream, u16::from(i) * 16, 0x00, &[i + 1; 16]);
        }
        let tail: [u8; 20] = core::array::from_fn(|i| 0x80 | i as u8);
        push_record(&mut stream, 48, 0x00, &tail);
        push_eof(&mut stream);

        let mut chan = ScriptChannel::new(stream);
        let mut flash = TestFlash::new();
        let (end, _) = run_session(&mut chan, &mut flash);

        assert_eq!(end, Ok(SessionEnd::Complete));
        assert_eq!(chan.acks(), 5);
        assert_eq!(&flash.mem[48..64], &tail[..16]);
        // the overhang was consumed but never placed
        assert_eq!(&flash.mem[64..], &[0xFF; 64]);
        assert!(flash.ops.iter().all(|op| match op {
            FlashOp::Erase(base) | FlashOp::Commit(base) => *base < 64,
            FlashOp::Fill(addr, _) => *addr < 64,
        }));
    }

    #[test]
    fn quit_without_records() {
        let mut chan = ScriptChannel::new(*b"Q");
        let mut flash = TestFlash::new();
        let (end, _) = run_session(&mut chan, &mut flash);

        assert_eq!(end, Ok(SessionEnd::Quit));
        assert_eq!(chan.acks(), 1);
        assert!(flash.ops.is_empty());
        assert!(chan.transcript().contains("Quit command received"));
    }

    #[test]
    fn silent_host_times_out() {
        let mut chan = ScriptChannel::new(Vec::new());
        let mut flash = TestFlash::new();
        let (end, ticks) = run_session(&mut chan, &mut flash);

        assert_eq!(end, Err(SessionError::Timeout));
        assert_eq!(ticks, u64::from(IDLE));
        assert_eq!(chan.acks(), 0);
        assert!(chan.transcript().contains("Bootloader timed out"));
    }

    #[test]
    fn unknown_record_type_terminates() {
        let mut stream = Vec::new();
        push_record(&mut stream, 0, 0x02, &[0xAB]);

        let mut chan = ScriptChannel::new(stream);
        let mut flash = TestFlash::new();
        let (end, _) = run_session(&mut chan, &mut flash);

        assert_eq!(end, Err(SessionError::BadRecordType(0x02)));
        assert_eq!(chan.acks(), 0);
        assert!(chan.transcript().contains("Invalid record type"));
    }

    #[test]
    fn line_terminators_between_records_are_ignored() {
        let mut stream = Vec::new();
        push_record(&mut stream, 0, 0x00, &[0x10; 4]);
        stream.extend_from_slice(b"\r\n");
        push_record(&mut stream, 4, 0x00, &[0x20; 4]);
        stream.extend_from_slice(b"\r\n");
        push_eof(&mut stream);

        let mut chan = ScriptChannel::new(stream);
        let mut flash = TestFlash::new();
        let (end, _) = run_session(&mut chan, &mut flash);

        assert_eq!(end, Ok(SessionEnd::Complete));
        assert_eq!(chan.acks(), 3);
        assert_eq!(&flash.mem[..4], &[0x10; 4]);
        assert_eq!(&flash.mem[4..8], &[0x20; 4]);
    }

    #[test]
    fn reflashing_the_same_stream_is_idempotent() {
        let payload: [u8; 16] = core::array::from_fn(|i| (i * 7) as u8);
        let mut stream = Vec::new();
        push_record(&mut stream, 0, 0x00, &payload);
        push_eof(&mut stream);

        let mut flash = TestFlash::new();

        let mut first = ScriptChannel::new(stream.clone());
        let (end, _) = run_session(&mut first, &mut flash);
        assert_eq!(end, Ok(SessionEnd::Complete));
        let image = flash.mem.clone();

        let mut second = ScriptChannel::new(stream);
        let (end, _) = run_session(&mut second, &mut flash);
        assert_eq!(end, Ok(SessionEnd::Complete));

        assert_eq!(flash.mem, image);
        assert_eq!(first.output, second.output);
    }

    #[test]
    fn read_back_mismatch_aborts_the_record() {
        let mut stream = Vec::new();
        push_record(&mut stream, 0, 0x00, &[0x5A; 16]);
        push_eof(&mut stream);

        let mut chan = ScriptChannel::new(stream);
        let mut flash = TestFlash::new();
        flash.corrupt = Some(3);
        let (end, _) = run_session(&mut chan, &mut flash);

        assert_eq!(end, Err(SessionError::Verify));
        assert_eq!(chan.acks(), 0);
        assert!(chan.transcript().contains("Verification failed"));
    }

    #[test]
    fn eof_with_bad_checksum_skips_the_final_flush() {
        let mut stream = Vec::new();
        push_record(&mut stream, 0, 0x00, &[0x66; 8]);
        stream.extend_from_slice(b":00000001FE");

        let mut chan = ScriptChannel::new(stream);
        let mut flash = TestFlash::new();
        let (end, _) = run_session(&mut chan, &mut flash);

        assert_eq!(end, Err(SessionError::Checksum));
        assert_eq!(chan.acks(), 1);
        assert!(flash.ops.is_empty());
    }
}
