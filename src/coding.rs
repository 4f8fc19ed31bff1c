//! Varint and length-prefixed slice helpers for the batch wire format.
//!
//! Varints use 7 bits per byte, low bits first.

/// Appends `value` as a varint32.
pub fn put_varint32(dst: &mut Vec<u8>, mut value: u32) {
    while value >= 0x80 {
        dst.push((value as u8) | 0x80);
        value >>= 7;
    }
    dst.push(value as u8);
}

/// Decodes a varint32 from the front of `input`, advancing it.
///
/// Returns `None` when the input ends mid-varint or the value overflows.
pub fn get_varint32(input: &mut &[u8]) -> Option<u32> {
    let mut result: u32 = 0;
    for (i, shift) in (0..=28).step_by(7).enumerate() {
        let byte = *input.get(i)?;
        result |= u32::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            if shift == 28 && byte > 0x0f {
                return None;
            }
            *input = &input[i + 1..];
            return Some(result);
        }
    }
    None
}

pub fn varint_length(mut value: u64) -> usize {
    let mut len = 1;
    while value >= 0x80 {
        value >>= 7;
        len += 1;
    }
    len
}

pub fn put_length_prefixed_slice(dst: &mut Vec<u8>, slice: &[u8]) {
    put_varint32(dst, slice.len() as u32);
    dst.extend_from_slice(slice);
}

pub fn get_length_prefixed_slice<'a>(input: &mut &'a [u8]) -> Option<&'a [u8]> {
    let mut rest = *input;
    let len = get_varint32(&mut rest)? as usize;
    if rest.len() < len {
        return None;
    }
    let (slice, tail) = rest.split_at(len);
    *input = tail;
    Some(slice)
}
