//! Encoding and decoding of command words and response blocks.
//!
//! This is the one place that knows the byte order. Command words are packed
//! code/channel/payload into a `u64` and written byte-reversed; response
//! integers are read the same way.

use super::{
    Command, CommandCode, HistogramBuffer, OscilloscopeBuffer, DATA_BLOCK_LEN, HISTOGRAM_BINS,
    MAX_PAYLOAD, OSCILLOSCOPE_SAMPLES,
};
use crate::error::{BridgeError, BridgeResult};
use bytes::{Buf, BufMut, BytesMut};

const SHIFT_CODE: u32 = 56;
const SHIFT_CHANNEL: u32 = 52;
const PAYLOAD_BITS: u32 = 52;
const PAYLOAD_MASK: u64 = MAX_PAYLOAD;

/// Clamp a channel number into `{0, 1}`.
pub fn validate_channel(channel: i64) -> u8 {
    channel.clamp(0, 1) as u8
}

/// Pack a command into its 8-byte wire form.
///
/// Fails if the payload does not fit in the low 52 bits.
pub fn encode_command(command: &Command) -> BridgeResult<[u8; 8]> {
    if command.payload & !PAYLOAD_MASK != 0 {
        return Err(BridgeError::PayloadOverflow {
            payload: command.payload,
            bits: PAYLOAD_BITS,
        });
    }

    let word = (u64::from(command.code as u8) << SHIFT_CODE)
        | (u64::from(validate_channel(i64::from(command.channel))) << SHIFT_CHANNEL)
        | command.payload;

    Ok(word.swap_bytes().to_be_bytes())
}

/// Unpack an 8-byte wire command. Used by the simulated instrument.
pub fn decode_command(bytes: [u8; 8]) -> BridgeResult<Command> {
    let word = u64::from_be_bytes(bytes).swap_bytes();
    let code = CommandCode::try_from((word >> SHIFT_CODE) as u8)?;
    let channel = ((word >> SHIFT_CHANNEL) & 0x0f) as u8;

    Ok(Command {
        code,
        channel,
        payload: word & PAYLOAD_MASK,
    })
}

fn check_len(block: &[u8], expected: usize) -> BridgeResult<()> {
    if block.len() != expected {
        return Err(BridgeError::BlockSize {
            expected,
            actual: block.len(),
        });
    }
    Ok(())
}

/// Decode the 8-byte timer block into a tick count.
pub fn decode_timer(mut block: &[u8]) -> BridgeResult<u64> {
    check_len(block, 8)?;
    Ok(block.get_u64_le())
}

/// Encode a tick count as a timer block.
pub fn encode_timer(ticks: u64) -> [u8; 8] {
    ticks.to_le_bytes()
}

/// Decode the 4-byte oscilloscope status block.
pub fn decode_status(mut block: &[u8]) -> BridgeResult<u32> {
    check_len(block, 4)?;
    Ok(block.get_u32_le())
}

/// Encode an oscilloscope status word.
pub fn encode_status(status: u32) -> [u8; 4] {
    status.to_le_bytes()
}

/// Decode a 65536-byte histogram block into 16384 bins.
pub fn decode_histogram(mut block: &[u8]) -> BridgeResult<HistogramBuffer> {
    check_len(block, DATA_BLOCK_LEN)?;
    let mut bins = Vec::with_capacity(HISTOGRAM_BINS);
    while block.has_remaining() {
        bins.push(block.get_u32_le());
    }
    Ok(HistogramBuffer::new(bins))
}

/// Encode a histogram as a data block, zero-padding or truncating to 16384 bins.
pub fn encode_histogram(histogram: &HistogramBuffer) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(DATA_BLOCK_LEN);
    for &bin in histogram.bins().iter().take(HISTOGRAM_BINS) {
        buf.put_u32_le(bin);
    }
    buf.resize(DATA_BLOCK_LEN, 0);
    buf.to_vec()
}

/// Decode a 65536-byte oscilloscope block into 32768 interleaved samples.
pub fn decode_oscilloscope(mut block: &[u8]) -> BridgeResult<OscilloscopeBuffer> {
    check_len(block, DATA_BLOCK_LEN)?;
    let mut samples = Vec::with_capacity(OSCILLOSCOPE_SAMPLES);
    while block.has_remaining() {
        samples.push(block.get_i16_le());
    }
    Ok(OscilloscopeBuffer::new(samples))
}

/// Encode oscilloscope samples as a data block, zero-padding or truncating.
pub fn encode_oscilloscope(buffer: &OscilloscopeBuffer) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(DATA_BLOCK_LEN);
    for &sample in buffer.samples().iter().take(OSCILLOSCOPE_SAMPLES) {
        buf.put_i16_le(sample);
    }
    buf.resize(DATA_BLOCK_LEN, 0);
    buf.to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_known_word_least_significant_byte_first() {
        let cmd = Command::new(CommandCode::SetTimerMode, 1, 1);
        // word = 0x0C10_0000_0000_0001
        let bytes = encode_command(&cmd).unwrap();
        assert_eq!(bytes, [0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x10, 0x0C]);
    }

    #[test]
    fn decode_inverts_encode() {
        let cases = [
            (CommandCode::ResetTimer, 0, 0),
            (CommandCode::SetSampleRate, 0, 4),
            (CommandCode::SetPhaMaxThreshold, 1, 16_300),
            (CommandCode::SetTimerValue, 1, 125_000_000 * 3600),
            (CommandCode::ReadOscilloscopeData, 0, PAYLOAD_MASK),
        ];
        for (code, channel, payload) in cases {
            let cmd = Command::new(code, channel, payload);
            let decoded = decode_command(encode_command(&cmd).unwrap()).unwrap();
            assert_eq!(decoded, cmd);
        }
    }

    #[test]
    fn channel_is_clamped() {
        assert_eq!(validate_channel(-3), 0);
        assert_eq!(validate_channel(0), 0);
        assert_eq!(validate_channel(1), 1);
        assert_eq!(validate_channel(7), 1);

        let cmd = Command::new(CommandCode::ResetHistogram, 9, 0);
        assert_eq!(cmd.channel, 1);
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let cmd = Command::new(CommandCode::SetTimerValue, 0, 1 << 52);
        assert!(matches!(
            encode_command(&cmd),
            Err(BridgeError::PayloadOverflow { bits: 52, .. })
        ));
    }

    #[test]
    fn timer_block_is_little_endian() {
        let block = [0x05, 0, 0, 0, 0, 0, 0, 0];
        assert_eq!(decode_timer(&block).unwrap(), 5);
        assert_eq!(decode_timer(&encode_timer(0x0102_0304_0506)).unwrap(), 0x0102_0304_0506);
        assert!(decode_timer(&block[..7]).is_err());
    }

    #[test]
    fn histogram_block_decodes_all_bins() {
        let mut bins = vec![0u32; HISTOGRAM_BINS];
        bins[0] = 1;
        bins[HISTOGRAM_BINS - 1] = 0xdead_beef;
        let block = encode_histogram(&HistogramBuffer::new(bins.clone()));
        assert_eq!(block.len(), DATA_BLOCK_LEN);
        assert_eq!(&block[..4], &[1, 0, 0, 0]);

        let decoded = decode_histogram(&block).unwrap();
        assert_eq!(decoded.bins(), bins.as_slice());
    }

    #[test]
    fn short_histogram_block_is_an_error() {
        let err = decode_histogram(&[0u8; 100]).unwrap_err();
        assert!(matches!(
            err,
            BridgeError::BlockSize {
                expected: DATA_BLOCK_LEN,
                actual: 100
            }
        ));
    }

    #[test]
    fn oscilloscope_block_keeps_sign() {
        let samples: Vec<i16> = vec![-32768, 32767, -1, 0];
        let block = encode_oscilloscope(&OscilloscopeBuffer::new(samples.clone()));
        let decoded = decode_oscilloscope(&block).unwrap();
        assert_eq!(&decoded.samples()[..4], samples.as_slice());
        assert_eq!(decoded.samples().len(), OSCILLOSCOPE_SAMPLES);
    }
}
