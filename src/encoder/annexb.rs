//! H.264 Annex B helpers: NAL splitting, access-unit framing, AVCC conversion.

pub const NAL_SLICE: u8 = 1;
pub const NAL_IDR: u8 = 5;
pub const NAL_SEI: u8 = 6;
pub const NAL_SPS: u8 = 7;
pub const NAL_PPS: u8 = 8;
pub const NAL_AUD: u8 = 9;

fn find_start_code(data: &[u8], from: usize) -> Option<usize> {
    if from >= data.len() {
        return None;
    }
    data[from..]
        .windows(3)
        .position(|w| w == [0, 0, 1])
        .map(|p| p + from)
}

/// Iterator over NAL unit payloads (start codes and trailing zero bytes stripped).
pub struct NalUnits<'a> {
    data: &'a [u8],
    next: Option<usize>,
}

pub fn nal_units(data: &[u8]) -> NalUnits<'_> {
    NalUnits {
        data,
        next: find_start_code(data, 0),
    }
}

impl<'a> Iterator for NalUnits<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<&'a [u8]> {
        loop {
            let sc = self.next?;
            let begin = sc + 3;
            let following = find_start_code(self.data, begin);
            self.next = following;
            let mut nal = &self.data[begin..following.unwrap_or(self.data.len())];
            while let [rest @ .., 0] = nal {
                nal = rest;
            }
            if !nal.is_empty() {
                return Some(nal);
            }
        }
    }
}

pub fn nal_type(nal: &[u8]) -> u8 {
    nal.first().map(|b| b & 0x1F).unwrap_or(0)
}

pub fn contains_idr(au: &[u8]) -> bool {
    nal_units(au).any(|n| nal_type(n) == NAL_IDR)
}

/// First SPS and PPS found in `au`, if both are present.
pub fn parameter_sets(au: &[u8]) -> Option<(&[u8], &[u8])> {
    let mut sps = None;
    let mut pps = None;
    for nal in nal_units(au) {
        match nal_type(nal) {
            NAL_SPS if sps.is_none() => sps = Some(nal),
            NAL_PPS if pps.is_none() => pps = Some(nal),
            _ => {}
        }
    }
    Some((sps?, pps?))
}

/// Convert one Annex B access unit to length-prefixed (AVCC) form into `out`.
///
/// AUD, SPS and PPS are dropped: MP4 carries parameter sets in the sample description.
pub fn to_avcc(au: &[u8], out: &mut Vec<u8>) {
    out.clear();
    for nal in nal_units(au) {
        if matches!(nal_type(nal), NAL_AUD | NAL_SPS | NAL_PPS) {
            continue;
        }
        out.extend_from_slice(&(nal.len() as u32).to_be_bytes());
        out.extend_from_slice(nal);
    }
}

/// Splits a raw Annex B byte stream into access units, cutting before every AUD NAL.
///
/// The stream must carry access unit delimiters (`h264_metadata=aud=insert`).
#[derive(Debug, Default)]
pub struct AccessUnitSplitter {
    buf: Vec<u8>,
    scan_from: usize,
}

impl AccessUnitSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Move the next complete access unit into `out`. Returns false if none is complete yet.
    pub fn next_unit(&mut self, out: &mut Vec<u8>) -> bool {
        // An AU is complete once the *next* AUD shows up; skip the one the buffer starts with.
        let mut pos = self.scan_from.max(1);
        while let Some(sc) = find_start_code(&self.buf, pos) {
            let Some(&header) = self.buf.get(sc + 3) else {
                // Start code at the very end: wait for the NAL header byte.
                self.scan_from = sc;
                return false;
            };
            if header & 0x1F == NAL_AUD {
                let cut = if sc > 0 && self.buf[sc - 1] == 0 { sc - 1 } else { sc };
                if cut == 0 {
                    pos = sc + 3;
                    continue;
                }
                out.clear();
                out.extend_from_slice(&self.buf[..cut]);
                self.buf.drain(..cut);
                self.scan_from = 0;
                return true;
            }
            pos = sc + 3;
        }
        // Keep the last two bytes scannable: a start code may straddle the next push.
        self.scan_from = self.buf.len().saturating_sub(3).max(1);
        false
    }

    /// Flush whatever is buffered as the final access unit (end of stream).
    pub fn finish(&mut self, out: &mut Vec<u8>) -> bool {
        self.scan_from = 0;
        if self.buf.iter().all(|&b| b == 0) {
            self.buf.clear();
            return false;
        }
        out.clear();
        out.append(&mut self.buf);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const AUD: &[u8] = &[0, 0, 0, 1, 0x09, 0xF0];
    const SPS: &[u8] = &[0, 0, 0, 1, 0x67, 0x42, 0xC0, 0x1F, 0xDA];
    const PPS: &[u8] = &[0, 0, 0, 1, 0x68, 0xCE, 0x3C, 0x80];
    const IDR: &[u8] = &[0, 0, 1, 0x65, 0x88, 0x84, 0x00, 0x21];
    const P: &[u8] = &[0, 0, 0, 1, 0x41, 0x9A, 0x02];

    fn cat(parts: &[&[u8]]) -> Vec<u8> {
        parts.concat()
    }

    #[test]
    fn splits_nal_units_with_mixed_start_codes() {
        let au = cat(&[AUD, SPS, PPS, IDR]);
        let types: Vec<u8> = nal_units(&au).map(nal_type).collect();
        assert_eq!(types, vec![NAL_AUD, NAL_SPS, NAL_PPS, NAL_IDR]);
        // trailing zero of the 4-byte start code is not part of the previous NAL
        let sps = nal_units(&au).nth(1).unwrap();
        assert_eq!(sps, &SPS[4..]);
    }

    #[test]
    fn parameter_sets_and_idr_detection() {
        let key = cat(&[AUD, SPS, PPS, IDR]);
        let (sps, pps) = parameter_sets(&key).unwrap();
        assert_eq!(sps, &SPS[4..]);
        assert_eq!(pps, &PPS[4..]);
        assert!(contains_idr(&key));

        let delta = cat(&[AUD, P]);
        assert!(parameter_sets(&delta).is_none());
        assert!(!contains_idr(&delta));
    }

    #[test]
    fn avcc_drops_aud_and_parameter_sets() {
        let au = cat(&[AUD, SPS, PPS, IDR]);
        let mut out = Vec::new();
        to_avcc(&au, &mut out);
        let idr = &IDR[3..];
        let mut want = (idr.len() as u32).to_be_bytes().to_vec();
        want.extend_from_slice(idr);
        assert_eq!(out, want);
    }

    #[test]
    fn splitter_cuts_at_aud_across_pushes() {
        let stream = cat(&[AUD, SPS, PPS, IDR, AUD, P, AUD, P]);
        let mut sp = AccessUnitSplitter::new();
        let mut units = Vec::new();
        let mut out = Vec::new();
        // feed in awkward 3-byte chunks so start codes straddle pushes
        for chunk in stream.chunks(3) {
            sp.push(chunk);
            while sp.next_unit(&mut out) {
                units.push(out.clone());
            }
        }
        assert!(sp.finish(&mut out));
        units.push(out.clone());

        assert_eq!(units.len(), 3);
        assert_eq!(units[0], cat(&[AUD, SPS, PPS, IDR]));
        assert_eq!(units[1], cat(&[AUD, P]));
        assert_eq!(units[2], cat(&[AUD, P]));
        assert!(!sp.finish(&mut out));
    }
}
