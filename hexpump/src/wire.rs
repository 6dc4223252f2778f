//! Turning firmware images into the loader's wire dialect

use elf::ElfBytes;
use elf::endian::LittleEndian;

// The loader dialect carries no addressing, so anything that does not form
// one contiguous image starting at 0 is an error.
pub fn flatten(data: &[u8]) -> Result<Vec<u8>, String> {
    if data.starts_with(b"\x7fELF") {
        flatten_elf(data)
    } else {
        flatten_ihex(data)
    }
}

fn flatten_elf(data: &[u8]) -> Result<Vec<u8>, String> {
    let file =
        ElfBytes::<LittleEndian>::minimal_parse(data).or_else(|e| Err(format!("{e}")))?;

    let Some(segments) = file.segments() else {
        return Err(String::from("no segments found in ELF file"));
    };

    let mut image = Vec::new();
    let mut loadable: Vec<_> = segments
        .iter()
        .filter(|phdr| phdr.p_type == elf::abi::PT_LOAD && phdr.p_filesz > 0)
        .collect();
    loadable.sort_by_key(|phdr| phdr.p_paddr);

    for phdr in loadable {
        let data = file
            .segment_data(&phdr)
            .or_else(|e| Err(format!("{e}")))?;
        place(&mut image, phdr.p_paddr as usize, data)?;
    }
    Ok(image)
}

fn flatten_ihex(data: &[u8]) -> Result<Vec<u8>, String> {
    let hexstr =
        core::str::from_utf8(data).or_else(|e| Err(format!("Invalid UTF-8 string ({e:?})")))?;

    let mut image = Vec::new();
    let mut address_base = 0_usize;

    for rec in ihex::Reader::new(hexstr) {
        let rec = rec.or_else(|e| Err(format!("Invalid record: {e}")))?;
        match rec {
            ihex::Record::Data { offset, value } => {
                place(&mut image, address_base + offset as usize, &value)?;
            }
            ihex::Record::EndOfFile => return Ok(image),
            ihex::Record::ExtendedSegmentAddress(esa) => {
                address_base = (esa as usize) << 4;
            }
            ihex::Record::ExtendedLinearAddress(ela) => {
                address_base = (ela as usize) << 16;
            }
            _ => (),
        }
    }
    Err(String::from("Unexpected end of file"))
}

fn place(image: &mut Vec<u8>, addr: usize, data: &[u8]) -> Result<(), String> {
    if addr != image.len() {
        return Err(format!(
            "image is not contiguous: data at 0x{addr:05x}, expected 0x{:05x}",
            image.len()
        ));
    }
    image.extend_from_slice(data);
    Ok(())
}

// Renders `image` as the loader's record stream: 16-byte data records and
// the closing end-of-file record.
pub fn encode(image: &[u8], out: &mut Vec<u8>) {
    let mut addr = 0u16;
    for chunk in image.chunks(16) {
        // the address field is informational; the loader follows its cursor
        push_record(out, addr, 0x00, chunk);
        addr = addr.wrapping_add(chunk.len() as u16);
    }
    push_record(out, 0, 0x01, &[]);
}

fn push_record(out: &mut Vec<u8>, addr: u16, kind: u8, payload: &[u8]) {
    out.push(b':');
    let mut sum = 0u8;
    for field in [payload.len() as u8, (addr >> 8) as u8, addr as u8, kind] {
        push_byte(out, &mut sum, field);
    }
    for &b in payload {
        push_byte(out, &mut sum, b);
    }
    let checksum = sum.wrapping_neg();
    push_byte(out, &mut sum, checksum);
    out.extend_from_slice(b"\r\n");
}

fn push_byte(out: &mut Vec<u8>, sum: &mut u8, value: u8) {
    const DIGITS: &[u8; 16] = b"0123456789ABCDEF";
    out.push(DIGITS[usize::from(value >> 4)]);
    out.push(DIGITS[usize::from(value & 0x0F)]);
    *sum = sum.wrapping_add(value);
}
