//! Start-code delimited byte-stream scanning

/// Units shorter than this are noise.
pub const MIN_UNIT_LEN: usize = 4;

pub const NAL_TYPE_IDR: u8 = 5;
pub const NAL_TYPE_SPS: u8 = 7;
pub const NAL_TYPE_PPS: u8 = 8;

/// Bytes in front of a unit's first start code that the scan never looks at.
const LOOKBACK: usize = 3;

/// Length of the unit at the head of `buf`: the offset of the next start code
/// found at or after byte 3, or the whole buffer.
pub fn unit_len(buf: &[u8]) -> usize {
    let size = buf.len();
    let mut pos = LOOKBACK;
    while pos + 3 <= size {
        if buf[pos..pos + 3] == [0, 0, 1] {
            return pos;
        }
        if pos + 4 <= size && buf[pos..pos + 4] == [0, 0, 0, 1] {
            return pos;
        }
        pos += 1;
    }
    size
}

/// Length of the start code `bytes` begins with.
fn start_code_len(bytes: &[u8]) -> Option<usize> {
    if bytes.starts_with(&[0, 0, 1]) {
        Some(3)
    } else if bytes.starts_with(&[0, 0, 0, 1]) {
        Some(4)
    } else {
        None
    }
}

/// True when `bytes` is nothing but back-to-back start codes.
fn only_start_codes(mut bytes: &[u8]) -> bool {
    while let Some(len) = start_code_len(bytes) {
        bytes = &bytes[len..];
    }
    bytes.is_empty()
}

/// Unit bytes behind its leading start code. The start code may sit behind
/// at most [`LOOKBACK`] stray bytes left by noise skipping. `None` when there
/// is no such start code or nothing but start codes behind it.
pub fn payload(unit: &[u8]) -> Option<&[u8]> {
    let skip = (0..LOOKBACK.min(unit.len())).find(|&i| start_code_len(&unit[i..]).is_some())?;
    let len = start_code_len(&unit[skip..])?;
    let rest = &unit[skip + len..];
    (!only_start_codes(rest)).then_some(rest)
}

pub fn nal_type(payload: &[u8]) -> Option<u8> {
    payload.first().map(|header| header & 0x1f)
}

/// Iterator over the units of a byte-stream, start codes included, skipping
/// noise a byte at a time.
pub struct NalUnits<'a> {
    rest: &'a [u8],
}

impl<'a> NalUnits<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { rest: data }
    }
}

impl<'a> Iterator for NalUnits<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<&'a [u8]> {
        while !self.rest.is_empty() {
            let len = unit_len(self.rest);
            if len < MIN_UNIT_LEN {
                self.rest = &self.rest[1..];
                continue;
            }
            let (unit, rest) = self.rest.split_at(len);
            self.rest = rest;
            return Some(unit);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_on_both_start_code_forms() {
        let mut stream = vec![0, 0, 0, 1, 0x67, 1, 2, 3];
        stream.extend_from_slice(&[0, 0, 1, 0x68, 4, 5]);
        stream.extend_from_slice(&[0, 0, 0, 1, 0x65, 6, 7, 8, 9]);

        let units: Vec<&[u8]> = NalUnits::new(&stream).collect();
        assert_eq!(units.len(), 3);
        assert_eq!(payload(units[0]), Some(&[0x67, 1, 2, 3][..]));
        assert_eq!(payload(units[1]), Some(&[0x68, 4, 5][..]));
        assert_eq!(payload(units[2]), Some(&[0x65, 6, 7, 8, 9][..]));
        assert_eq!(units.concat(), stream);
    }

    #[test]
    fn start_codes_only_yield_no_payload() {
        let stream = [0, 0, 1, 0, 0, 1, 0, 0, 1];
        assert_eq!(NalUnits::new(&stream).filter_map(payload).count(), 0);
    }

    #[test]
    fn never_reads_past_the_end() {
        assert_eq!(unit_len(&[]), 0);
        assert_eq!(unit_len(&[0, 0, 1]), 3);
        assert_eq!(unit_len(&[0, 0, 1, 0, 0, 1]), 3);
        assert_eq!(unit_len(&[0, 0, 1, 0]), 4);
        assert_eq!(NalUnits::new(&[0, 0]).count(), 0);
    }

    #[test]
    fn short_units_are_skipped_bytewise() {
        // Three-byte unit at the head, then a proper one.
        let stream = [0, 0, 1, 0, 0, 0, 1, 0x41, 0xaa, 0xbb];
        let units: Vec<&[u8]> = NalUnits::new(&stream).collect();
        assert_eq!(units.last().copied().and_then(payload), Some(&[0x41, 0xaa, 0xbb][..]));
    }

    #[test]
    fn trailing_start_code_ends_the_unit() {
        let stream = [0, 0, 0, 1, 0x65, 1, 2, 3, 4, 0, 0, 1];
        assert_eq!(unit_len(&stream), 9);
        let payloads: Vec<&[u8]> = NalUnits::new(&stream).filter_map(payload).collect();
        assert_eq!(payloads, vec![&[0x65, 1, 2, 3, 4][..]]);

        assert_eq!(unit_len(&[0, 0, 1, 9, 0, 0, 0, 1]), 4);
    }

    #[test]
    fn payload_requires_start_code_and_body() {
        assert_eq!(payload(&[0, 0, 0, 1]), None);
        assert_eq!(payload(&[1, 2, 3, 4]), None);
        assert_eq!(payload(&[0, 0, 1, 0, 0, 1]), None);
        assert_eq!(payload(&[0, 0, 1, 0, 0, 0, 1, 0, 0, 1]), None);
        assert_eq!(payload(&[1, 2, 3, 4, 0, 0, 1, 7]), None);
        assert_eq!(payload(&[0, 0, 1, 9]), Some(&[9][..]));
        assert_eq!(payload(&[1, 0, 0, 1, 7]), Some(&[7][..]));
        assert_eq!(nal_type(&[0x65, 0]), Some(NAL_TYPE_IDR));
    }
}
