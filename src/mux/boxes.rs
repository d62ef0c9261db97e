//! ISO base media file format boxes
//!
//! Everything here serializes into memory. The writer decides where the
//! bytes land in the sink.

use super::AudioFormat;

/// Identity 3x3 transform in 16.16 / 2.30 fixed point.
const UNITY_MATRIX: [u32; 9] = [0x0001_0000, 0, 0, 0, 0x0001_0000, 0, 0, 0, 0x4000_0000];

/// Size of the `mdat` header written ahead of sample data: 32-bit size of 1,
/// fourcc, 64-bit size.
pub const MDAT_HEADER_LEN: u64 = 16;

/// AAC sample rates by index, see ISO/IEC 14496-3.
const AAC_SAMPLE_RATES: [u32; 13] = [
    96_000, 88_200, 64_000, 48_000, 44_100, 32_000, 24_000, 22_050, 16_000, 12_000, 11_025, 8_000,
    7_350,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sample {
    pub offset: u64,
    pub size: u32,
    pub duration: u32,
    pub sync: bool,
}

#[derive(Debug, Clone)]
pub enum SampleEntry<'a> {
    Avc {
        width: u32,
        height: u32,
        sps: Option<&'a [u8]>,
        pps: Option<&'a [u8]>,
    },
    Aac(AudioFormat),
}

/// Everything `moov` needs to know about one track.
#[derive(Debug, Clone)]
pub struct TrackInfo<'a> {
    pub id: u32,
    pub timescale: u32,
    pub entry: SampleEntry<'a>,
    pub samples: &'a [Sample],
}

impl TrackInfo<'_> {
    pub fn media_duration(&self) -> u64 {
        self.samples.iter().map(|s| s.duration as u64).sum()
    }

    fn movie_duration(&self, movie_timescale: u32) -> u64 {
        if self.timescale == 0 {
            return 0;
        }
        self.media_duration() * movie_timescale as u64 / self.timescale as u64
    }

    fn is_video(&self) -> bool {
        matches!(self.entry, SampleEntry::Avc { .. })
    }
}

/// Append a box, patching its size once `content` has written the body.
pub fn write_box(buf: &mut Vec<u8>, fourcc: &[u8; 4], content: impl FnOnce(&mut Vec<u8>)) {
    let start = buf.len();
    buf.extend_from_slice(&[0; 4]);
    buf.extend_from_slice(fourcc);
    content(buf);
    let size = (buf.len() - start) as u32;
    buf[start..start + 4].copy_from_slice(&size.to_be_bytes());
}

pub fn write_full_box(
    buf: &mut Vec<u8>,
    fourcc: &[u8; 4],
    version: u8,
    flags: u32,
    content: impl FnOnce(&mut Vec<u8>),
) {
    write_box(buf, fourcc, |buf| {
        buf.push(version);
        buf.extend_from_slice(&flags.to_be_bytes()[1..]);
        content(buf);
    });
}

fn clamp32(value: u64) -> u32 {
    u32::try_from(value).unwrap_or(u32::MAX)
}

pub fn ftyp(buf: &mut Vec<u8>) {
    write_box(buf, b"ftyp", |buf| {
        buf.extend_from_slice(b"isom"); // major brand
        buf.extend_from_slice(&0x200u32.to_be_bytes()); // minor version
        for brand in [b"isom", b"iso2", b"avc1", b"mp41"] {
            buf.extend_from_slice(brand);
        }
    });
}

/// Header of an `mdat` box with the large-size field still zero.
pub fn mdat_header() -> [u8; MDAT_HEADER_LEN as usize] {
    let mut header = [0u8; MDAT_HEADER_LEN as usize];
    header[..4].copy_from_slice(&1u32.to_be_bytes());
    header[4..8].copy_from_slice(b"mdat");
    header
}

pub fn moov(buf: &mut Vec<u8>, movie_timescale: u32, tracks: &[TrackInfo<'_>]) {
    let duration = tracks
        .iter()
        .map(|t| t.movie_duration(movie_timescale))
        .max()
        .unwrap_or(0);
    let next_track_id = tracks.iter().map(|t| t.id).max().unwrap_or(0) + 1;

    write_box(buf, b"moov", |buf| {
        write_full_box(buf, b"mvhd", 0, 0, |buf| {
            buf.extend_from_slice(&0u32.to_be_bytes()); // creation time
            buf.extend_from_slice(&0u32.to_be_bytes()); // modification time
            buf.extend_from_slice(&movie_timescale.to_be_bytes());
            buf.extend_from_slice(&clamp32(duration).to_be_bytes());
            buf.extend_from_slice(&0x0001_0000u32.to_be_bytes()); // rate 1.0
            buf.extend_from_slice(&0x0100u16.to_be_bytes()); // volume 1.0
            buf.extend_from_slice(&[0; 10]); // reserved
            for m in UNITY_MATRIX {
                buf.extend_from_slice(&m.to_be_bytes());
            }
            buf.extend_from_slice(&[0; 24]); // pre_defined
            buf.extend_from_slice(&next_track_id.to_be_bytes());
        });
        for track in tracks {
            trak(buf, movie_timescale, track);
        }
    });
}

fn trak(buf: &mut Vec<u8>, movie_timescale: u32, track: &TrackInfo<'_>) {
    write_box(buf, b"trak", |buf| {
        // enabled | in movie | in preview
        write_full_box(buf, b"tkhd", 0, 0x7, |buf| {
            buf.extend_from_slice(&0u32.to_be_bytes());
            buf.extend_from_slice(&0u32.to_be_bytes());
            buf.extend_from_slice(&track.id.to_be_bytes());
            buf.extend_from_slice(&0u32.to_be_bytes()); // reserved
            buf.extend_from_slice(&clamp32(track.movie_duration(movie_timescale)).to_be_bytes());
            buf.extend_from_slice(&[0; 8]); // reserved
            buf.extend_from_slice(&0u16.to_be_bytes()); // layer
            buf.extend_from_slice(&0u16.to_be_bytes()); // alternate group
            let volume: u16 = if track.is_video() { 0 } else { 0x0100 };
            buf.extend_from_slice(&volume.to_be_bytes());
            buf.extend_from_slice(&0u16.to_be_bytes());
            for m in UNITY_MATRIX {
                buf.extend_from_slice(&m.to_be_bytes());
            }
            let (width, height) = match track.entry {
                SampleEntry::Avc { width, height, .. } => (width, height),
                SampleEntry::Aac(_) => (0, 0),
            };
            buf.extend_from_slice(&(width << 16).to_be_bytes());
            buf.extend_from_slice(&(height << 16).to_be_bytes());
        });
        mdia(buf, track);
    });
}

fn mdia(buf: &mut Vec<u8>, track: &TrackInfo<'_>) {
    write_box(buf, b"mdia", |buf| {
        write_full_box(buf, b"mdhd", 0, 0, |buf| {
            buf.extend_from_slice(&0u32.to_be_bytes());
            buf.extend_from_slice(&0u32.to_be_bytes());
            buf.extend_from_slice(&track.timescale.to_be_bytes());
            buf.extend_from_slice(&clamp32(track.media_duration()).to_be_bytes());
            buf.extend_from_slice(&0x55c4u16.to_be_bytes()); // language "und"
            buf.extend_from_slice(&0u16.to_be_bytes());
        });
        let (handler, name): (&[u8; 4], &[u8]) = if track.is_video() {
            (b"vide", b"VideoHandler\0")
        } else {
            (b"soun", b"SoundHandler\0")
        };
        write_full_box(buf, b"hdlr", 0, 0, |buf| {
            buf.extend_from_slice(&0u32.to_be_bytes()); // pre_defined
            buf.extend_from_slice(handler);
            buf.extend_from_slice(&[0; 12]);
            buf.extend_from_slice(name);
        });
        write_box(buf, b"minf", |buf| {
            if track.is_video() {
                write_full_box(buf, b"vmhd", 0, 1, |buf| {
                    buf.extend_from_slice(&[0; 8]); // graphics mode, opcolor
                });
            } else {
                write_full_box(buf, b"smhd", 0, 0, |buf| {
                    buf.extend_from_slice(&[0; 4]); // balance, reserved
                });
            }
            write_box(buf, b"dinf", |buf| {
                write_full_box(buf, b"dref", 0, 0, |buf| {
                    buf.extend_from_slice(&1u32.to_be_bytes());
                    // media data lives in this file
                    write_full_box(buf, b"url ", 0, 1, |_| {});
                });
            });
            stbl(buf, track);
        });
    });
}

fn stbl(buf: &mut Vec<u8>, track: &TrackInfo<'_>) {
    let samples = track.samples;
    write_box(buf, b"stbl", |buf| {
        write_full_box(buf, b"stsd", 0, 0, |buf| {
            buf.extend_from_slice(&1u32.to_be_bytes());
            match &track.entry {
                SampleEntry::Avc {
                    width,
                    height,
                    sps,
                    pps,
                } => avc1(buf, *width, *height, *sps, *pps),
                SampleEntry::Aac(format) => mp4a(buf, format),
            }
        });

        let runs = duration_runs(samples);
        write_full_box(buf, b"stts", 0, 0, |buf| {
            buf.extend_from_slice(&(runs.len() as u32).to_be_bytes());
            for (count, duration) in runs {
                buf.extend_from_slice(&count.to_be_bytes());
                buf.extend_from_slice(&duration.to_be_bytes());
            }
        });

        if track.is_video() && samples.iter().any(|s| !s.sync) {
            write_full_box(buf, b"stss", 0, 0, |buf| {
                let sync: Vec<u32> = samples
                    .iter()
                    .enumerate()
                    .filter(|(_, s)| s.sync)
                    .map(|(i, _)| i as u32 + 1)
                    .collect();
                buf.extend_from_slice(&(sync.len() as u32).to_be_bytes());
                for number in sync {
                    buf.extend_from_slice(&number.to_be_bytes());
                }
            });
        }

        // One sample per chunk, tracks interleave freely inside mdat.
        write_full_box(buf, b"stsc", 0, 0, |buf| {
            if samples.is_empty() {
                buf.extend_from_slice(&0u32.to_be_bytes());
            } else {
                buf.extend_from_slice(&1u32.to_be_bytes());
                buf.extend_from_slice(&1u32.to_be_bytes()); // first chunk
                buf.extend_from_slice(&1u32.to_be_bytes()); // samples per chunk
                buf.extend_from_slice(&1u32.to_be_bytes()); // description index
            }
        });

        write_full_box(buf, b"stsz", 0, 0, |buf| {
            buf.extend_from_slice(&0u32.to_be_bytes()); // sizes vary
            buf.extend_from_slice(&(samples.len() as u32).to_be_bytes());
            for sample in samples {
                buf.extend_from_slice(&sample.size.to_be_bytes());
            }
        });

        if samples.iter().any(|s| s.offset > u32::MAX as u64) {
            write_full_box(buf, b"co64", 0, 0, |buf| {
                buf.extend_from_slice(&(samples.len() as u32).to_be_bytes());
                for sample in samples {
                    buf.extend_from_slice(&sample.offset.to_be_bytes());
                }
            });
        } else {
            write_full_box(buf, b"stco", 0, 0, |buf| {
                buf.extend_from_slice(&(samples.len() as u32).to_be_bytes());
                for sample in samples {
                    buf.extend_from_slice(&(sample.offset as u32).to_be_bytes());
                }
            });
        }
    });
}

/// Run-length encode sample durations as (count, duration) pairs.
pub fn duration_runs(samples: &[Sample]) -> Vec<(u32, u32)> {
    let mut runs: Vec<(u32, u32)> = Vec::new();
    for sample in samples {
        match runs.last_mut() {
            Some((count, duration)) if *duration == sample.duration => *count += 1,
            _ => runs.push((1, sample.duration)),
        }
    }
    runs
}

fn avc1(buf: &mut Vec<u8>, width: u32, height: u32, sps: Option<&[u8]>, pps: Option<&[u8]>) {
    write_box(buf, b"avc1", |buf| {
        buf.extend_from_slice(&[0; 6]); // reserved
        buf.extend_from_slice(&1u16.to_be_bytes()); // data reference index
        buf.extend_from_slice(&[0; 16]); // pre_defined, reserved
        // Callers validate the size; saturate rather than wrap.
        buf.extend_from_slice(&u16::try_from(width).unwrap_or(u16::MAX).to_be_bytes());
        buf.extend_from_slice(&u16::try_from(height).unwrap_or(u16::MAX).to_be_bytes());
        buf.extend_from_slice(&0x0048_0000u32.to_be_bytes()); // 72 dpi
        buf.extend_from_slice(&0x0048_0000u32.to_be_bytes());
        buf.extend_from_slice(&0u32.to_be_bytes());
        buf.extend_from_slice(&1u16.to_be_bytes()); // frame count
        buf.extend_from_slice(&[0; 32]); // compressor name
        buf.extend_from_slice(&0x0018u16.to_be_bytes()); // depth
        buf.extend_from_slice(&(-1i16).to_be_bytes());

        write_box(buf, b"avcC", |buf| {
            buf.push(1); // configuration version
            match sps {
                Some(sps) if sps.len() >= 4 => buf.extend_from_slice(&sps[1..4]),
                _ => buf.extend_from_slice(&[0x42, 0x00, 0x1f]),
            }
            buf.push(0xff); // 4-byte length prefixes
            buf.push(0xe0 | sps.is_some() as u8);
            if let Some(sps) = sps {
                buf.extend_from_slice(&(sps.len() as u16).to_be_bytes());
                buf.extend_from_slice(sps);
            }
            buf.push(pps.is_some() as u8);
            if let Some(pps) = pps {
                buf.extend_from_slice(&(pps.len() as u16).to_be_bytes());
                buf.extend_from_slice(pps);
            }
        });
    });
}

fn mp4a(buf: &mut Vec<u8>, format: &AudioFormat) {
    write_box(buf, b"mp4a", |buf| {
        buf.extend_from_slice(&[0; 6]);
        buf.extend_from_slice(&1u16.to_be_bytes());
        buf.extend_from_slice(&[0; 8]); // reserved
        buf.extend_from_slice(&format.channels.to_be_bytes());
        buf.extend_from_slice(&16u16.to_be_bytes()); // sample size
        buf.extend_from_slice(&[0; 4]);
        // 16.16, only the integer part fits
        buf.extend_from_slice(&((format.sample_rate.min(u16::MAX as u32)) << 16).to_be_bytes());

        write_full_box(buf, b"esds", 0, 0, |buf| {
            let asc = audio_specific_config(format);
            // ES_Descriptor
            buf.push(0x03);
            buf.push((3 + 15 + asc.len() + 2 + 3) as u8);
            buf.extend_from_slice(&1u16.to_be_bytes()); // ES_ID
            buf.push(0);
            // DecoderConfigDescriptor
            buf.push(0x04);
            buf.push((13 + 2 + asc.len()) as u8);
            buf.push(0x40); // MPEG-4 audio
            buf.push(0x15); // audio stream
            buf.extend_from_slice(&[0; 3]); // buffer size
            buf.extend_from_slice(&0u32.to_be_bytes()); // max bitrate
            buf.extend_from_slice(&0u32.to_be_bytes()); // avg bitrate
            // DecoderSpecificInfo
            buf.push(0x05);
            buf.push(asc.len() as u8);
            buf.extend_from_slice(&asc);
            // SLConfigDescriptor
            buf.push(0x06);
            buf.push(1);
            buf.push(0x02);
        });
    });
}

/// AAC-LC AudioSpecificConfig.
fn audio_specific_config(format: &AudioFormat) -> [u8; 2] {
    let index = AAC_SAMPLE_RATES
        .iter()
        .position(|&rate| rate == format.sample_rate)
        .unwrap_or(3) as u16;
    let object_type: u16 = 2;
    let channels = format.channels.min(7);
    let config = (object_type << 11) | (index << 7) | (channels << 3);
    config.to_be_bytes()
}
