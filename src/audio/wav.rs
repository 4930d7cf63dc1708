//! RIFF/WAVE framing for synthesized PCM chunks.
//!
//! Every chunk received from the realtime model is wrapped as a complete
//! WAV file so it becomes a self-describing playable unit.

use std::io::Cursor;

use hound::{SampleFormat, WavReader, WavSpec, WavWriter};

use super::REALTIME_SAMPLE_RATE;
use crate::{Error, Result};

/// Mono, 24 kHz, 16-bit: the realtime output format.
pub const REALTIME_SPEC: WavSpec = WavSpec {
    channels: 1,
    sample_rate: REALTIME_SAMPLE_RATE,
    bits_per_sample: 16,
    sample_format: SampleFormat::Int,
};

fn playback_error(e: hound::Error) -> Error {
    Error::Playback(e.to_string())
}

/// Wrap a PCM16 chunk as a complete WAV file in the realtime format.
///
/// # Errors
///
/// Returns error if WAV encoding fails
pub fn wrap_pcm16(pcm: &[i16]) -> Result<Vec<u8>> {
    let mut cursor = Cursor::new(Vec::with_capacity(44 + pcm.len() * 2));
    {
        let mut writer = WavWriter::new(&mut cursor, REALTIME_SPEC).map_err(playback_error)?;
        for &sample in pcm {
            writer.write_sample(sample).map_err(playback_error)?;
        }
        writer.finalize().map_err(playback_error)?;
    }
    Ok(cursor.into_inner())
}

/// Decode a mono 16-bit WAV back into its sample rate and samples.
pub fn unwrap_pcm16(bytes: &[u8]) -> Result<(u32, Vec<i16>)> {
    let mut reader = WavReader::new(Cursor::new(bytes)).map_err(playback_error)?;
    let spec = reader.spec();
    if spec.channels != 1 || spec.bits_per_sample != 16 || spec.sample_format != SampleFormat::Int
    {
        return Err(Error::Playback(format!(
            "unsupported wav: {} ch, {} bit {:?}",
            spec.channels, spec.bits_per_sample, spec.sample_format
        )));
    }
    let samples = reader
        .samples::<i16>()
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(playback_error)?;
    Ok((spec.sample_rate, samples))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrapped_chunk_reads_back() {
        for len in [0usize, 1, 4096, 12_345] {
            let pcm: Vec<i16> = (0..len).map(|i| (i % 2000) as i16 - 1000).collect();
            let bytes = wrap_pcm16(&pcm).unwrap();
            assert_eq!(bytes.len(), 44 + 2 * len);
            let (rate, decoded) = unwrap_pcm16(&bytes).unwrap();
            assert_eq!(rate, 24000);
            assert_eq!(decoded, pcm);
        }
    }

    #[test]
    fn header_fields_are_bit_exact() {
        let bytes = wrap_pcm16(&[1, -1]).unwrap();
        let expected: [u8; 44] = [
            b'R', b'I', b'F', b'F', 40, 0, 0, 0, b'W', b'A', b'V', b'E', b'f', b'm', b't', b' ',
            16, 0, 0, 0, 1, 0, 1, 0, 0xc0, 0x5d, 0, 0, 0x80, 0xbb, 0, 0, 2, 0, 16, 0, b'd', b'a',
            b't', b'a', 4, 0, 0, 0,
        ];
        assert_eq!(&bytes[..44], &expected);
        assert_eq!(&bytes[44..], &[1, 0, 0xff, 0xff]);
    }

    #[test]
    fn unwrap_rejects_truncated_data() {
        let mut bytes = wrap_pcm16(&[1, 2, 3]).unwrap();
        bytes.pop();
        assert!(matches!(unwrap_pcm16(&bytes), Err(Error::Playback(_))));
        assert!(matches!(unwrap_pcm16(&bytes[..10]), Err(Error::Playback(_))));
    }

    #[test]
    fn unwrap_rejects_stereo() {
        let spec = WavSpec {
            channels: 2,
            ..REALTIME_SPEC
        };
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = WavWriter::new(&mut cursor, spec).unwrap();
            writer.write_sample(1i16).unwrap();
            writer.write_sample(2i16).unwrap();
            writer.finalize().unwrap();
        }
        assert!(matches!(
            unwrap_pcm16(&cursor.into_inner()),
            Err(Error::Playback(_))
        ));
    }
}
