//! ILDA-WAV input
//!
//! An ILDA-WAV file is a plain RIFF WAVE with exactly 8 interleaved
//! channels: X, Y, R, G, B, unused, and a stereo audio pair. Samples must
//! be 16- or 24-bit signed little-endian PCM; the sample rate doubles as
//! the laser point rate.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use crate::constants::ILDA_WAV_CHANNELS;
use crate::error::WavError;

/// Validating reader over an 8-channel ILDA WAV file.
pub struct IldaWavReader {
    reader: hound::WavReader<BufReader<File>>,
    spec: hound::WavSpec,
    len_frames: u32,
}

impl IldaWavReader {
    /// Open and validate a file. Channel-count and sample-format violations
    /// are reported synchronously with user-readable messages.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, WavError> {
        let reader = hound::WavReader::open(path)?;
        let spec = reader.spec();

        if spec.channels != ILDA_WAV_CHANNELS {
            return Err(WavError::ChannelCount(spec.channels));
        }
        if spec.sample_format != hound::SampleFormat::Int
            || !(spec.bits_per_sample == 16 || spec.bits_per_sample == 24)
        {
            return Err(WavError::SampleFormat {
                bits: spec.bits_per_sample,
                format: match spec.sample_format {
                    hound::SampleFormat::Int => "integer",
                    hound::SampleFormat::Float => "float",
                },
            });
        }

        let len_frames = reader.duration();
        Ok(Self {
            reader,
            spec,
            len_frames,
        })
    }

    /// Sample rate in Hz; passed through to the DAC as the point rate.
    pub fn sample_rate(&self) -> u32 {
        self.spec.sample_rate
    }

    /// Total length in frames (one frame = one sample per channel).
    pub fn len_frames(&self) -> u32 {
        self.len_frames
    }

    pub fn bits_per_sample(&self) -> u16 {
        self.spec.bits_per_sample
    }

    pub fn bytes_per_sample(&self) -> usize {
        (self.spec.bits_per_sample / 8) as usize
    }

    /// Read up to `frames` interleaved frames into `out` (cleared first).
    ///
    /// Samples are sign-extended to `i32` at their native depth; a 24-bit
    /// file yields values in the 24-bit range. Returns the number of whole
    /// frames read; 0 means end of stream.
    pub fn read_frames(&mut self, frames: usize, out: &mut Vec<i32>) -> Result<usize, WavError> {
        out.clear();
        let wanted = frames * ILDA_WAV_CHANNELS as usize;

        for sample in self.reader.samples::<i32>().take(wanted) {
            out.push(sample?);
        }

        let whole = out.len() / ILDA_WAV_CHANNELS as usize;
        out.truncate(whole * ILDA_WAV_CHANNELS as usize);
        Ok(whole)
    }

    /// Reposition the stream to an absolute frame index.
    pub fn seek_to_frame(&mut self, frame: u32) -> Result<(), WavError> {
        self.reader
            .seek(frame)
            .map_err(|e| WavError::Seek(e.to_string()))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::path::PathBuf;

    /// Write an 8-channel test file where channel `c` of frame `f` holds
    /// `base(f) + c`, so any (frame, channel) cell is recognizable.
    pub(crate) fn write_fixture(dir: &Path, bits: u16, frames: u32) -> PathBuf {
        let path = dir.join(format!("fixture-{bits}bit.wav"));
        let spec = hound::WavSpec {
            channels: 8,
            sample_rate: 48_000,
            bits_per_sample: bits,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(&path, spec).unwrap();
        for frame in 0..frames {
            for channel in 0..8 {
                let value = frame as i32 * 100 + channel;
                match bits {
                    16 => writer.write_sample(value as i16).unwrap(),
                    24 => writer.write_sample(value).unwrap(),
                    _ => unreachable!(),
                }
            }
        }
        writer.finalize().unwrap();
        path
    }

    #[test]
    fn open_validates_channel_count() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stereo.wav");
        let spec = hound::WavSpec {
            channels: 2,
            sample_rate: 48_000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(&path, spec).unwrap();
        writer.write_sample(0i16).unwrap();
        writer.write_sample(0i16).unwrap();
        writer.finalize().unwrap();

        match IldaWavReader::open(&path) {
            Err(WavError::ChannelCount(2)) => {}
            other => panic!("expected ChannelCount error, got {:?}", other.err()),
        }
    }

    #[test]
    fn open_rejects_float_samples() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("float.wav");
        let spec = hound::WavSpec {
            channels: 8,
            sample_rate: 48_000,
            bits_per_sample: 32,
            sample_format: hound::SampleFormat::Float,
        };
        let mut writer = hound::WavWriter::create(&path, spec).unwrap();
        for _ in 0..8 {
            writer.write_sample(0.0f32).unwrap();
        }
        writer.finalize().unwrap();

        assert!(matches!(
            IldaWavReader::open(&path),
            Err(WavError::SampleFormat { bits: 32, .. })
        ));
    }

    #[test]
    fn read_frames_returns_interleaved_frames() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_fixture(dir.path(), 16, 10);
        let mut reader = IldaWavReader::open(&path).unwrap();

        assert_eq!(reader.sample_rate(), 48_000);
        assert_eq!(reader.len_frames(), 10);
        assert_eq!(reader.bytes_per_sample(), 2);

        let mut buf = Vec::new();
        let read = reader.read_frames(4, &mut buf).unwrap();
        assert_eq!(read, 4);
        assert_eq!(buf.len(), 32);
        assert_eq!(buf[0], 0); // frame 0, channel 0
        assert_eq!(buf[7], 7); // frame 0, channel 7
        assert_eq!(buf[8], 100); // frame 1, channel 0
        assert_eq!(buf[3 * 8 + 5], 305); // frame 3, channel 5
    }

    #[test]
    fn read_frames_hits_end_of_stream() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_fixture(dir.path(), 16, 3);
        let mut reader = IldaWavReader::open(&path).unwrap();

        let mut buf = Vec::new();
        assert_eq!(reader.read_frames(10, &mut buf).unwrap(), 3);
        assert_eq!(reader.read_frames(10, &mut buf).unwrap(), 0);
        assert!(buf.is_empty());
    }

    #[test]
    fn seek_repositions_the_stream() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_fixture(dir.path(), 16, 10);
        let mut reader = IldaWavReader::open(&path).unwrap();

        reader.seek_to_frame(7).unwrap();
        let mut buf = Vec::new();
        assert_eq!(reader.read_frames(1, &mut buf).unwrap(), 1);
        assert_eq!(buf[0], 700);

        // seeking backwards works too
        reader.seek_to_frame(2).unwrap();
        assert_eq!(reader.read_frames(1, &mut buf).unwrap(), 1);
        assert_eq!(buf[0], 200);
    }

    #[test]
    fn reads_24_bit_samples_at_native_depth() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wide.wav");
        let spec = hound::WavSpec {
            channels: 8,
            sample_rate: 48_000,
            bits_per_sample: 24,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(&path, spec).unwrap();
        writer.write_sample(0x123456i32).unwrap();
        writer.write_sample(-0x123456i32).unwrap();
        for _ in 2..8 {
            writer.write_sample(0i32).unwrap();
        }
        writer.finalize().unwrap();

        let mut reader = IldaWavReader::open(&path).unwrap();
        assert_eq!(reader.bytes_per_sample(), 3);

        let mut buf = Vec::new();
        assert_eq!(reader.read_frames(1, &mut buf).unwrap(), 1);
        assert_eq!(buf[0], 0x123456);
        assert_eq!(buf[1], -0x123456);
    }
}
