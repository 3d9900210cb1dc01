//! Incremental capture of a serialized value off a non-blocking socket.
//!
//! Shared-object messages carry the value's wire bytes, preceded by a
//! VarInt length when the type is not fixed-size. The reader collects
//! the raw bytes without blocking; callers parse and validate them once
//! complete, and can reuse them verbatim when caching a notification.

use conduit::error::{ErrorKind, NetError, NetResult};
use conduit::wire::cursor::WireRead;
use conduit::wire::varint;

pub(crate) enum Progress {
    NeedBytes(usize),
    Done(Vec<u8>),
}

enum State {
    SizeFirst,
    SizeRest { remaining: usize, acc: u64 },
    Bytes { remaining: usize, bytes: Vec<u8> },
}

pub(crate) struct ValueBytesReader {
    state: State,
}

impl ValueBytesReader {
    /// For fixed-size types: the length is known up front.
    pub(crate) fn fixed(size: usize) -> ValueBytesReader {
        ValueBytesReader {
            state: State::Bytes {
                remaining: size,
                bytes: Vec::new(),
            },
        }
    }

    /// For variable-size types: a VarInt length precedes the bytes.
    pub(crate) fn explicit() -> ValueBytesReader {
        ValueBytesReader {
            state: State::SizeFirst,
        }
    }

    pub(crate) fn step<R: WireRead>(&mut self, reader: &mut R) -> NetResult<Progress> {
        loop {
            match &mut self.state {
                State::SizeFirst => {
                    if reader.unread() < 1 {
                        return Ok(Progress::NeedBytes(1));
                    }
                    let first = reader.read_u8()?;
                    let trailing = varint::trailing_count(first)?;
                    let acc = varint::first_payload(first, trailing) as u64;
                    if trailing == 0 {
                        self.state = State::Bytes {
                            remaining: acc as usize,
                            bytes: Vec::new(),
                        };
                    } else {
                        self.state = State::SizeRest {
                            remaining: trailing,
                            acc,
                        };
                    }
                }
                State::SizeRest { remaining, acc } => {
                    if reader.unread() < *remaining {
                        return Ok(Progress::NeedBytes(*remaining));
                    }
                    let mut value = *acc;
                    for _ in 0..*remaining {
                        value = varint::accumulate(value, reader.read_u8()?);
                    }
                    if value > u32::MAX as u64 {
                        return Err(NetError::Fatal(ErrorKind::MalformedVarInt));
                    }
                    self.state = State::Bytes {
                        remaining: value as usize,
                        bytes: Vec::new(),
                    };
                }
                State::Bytes { remaining, bytes } => {
                    if *remaining == 0 {
                        return Ok(Progress::Done(std::mem::take(bytes)));
                    }
                    let available = reader.unread().min(*remaining);
                    if available == 0 {
                        return Ok(Progress::NeedBytes(1));
                    }
                    let start = bytes.len();
                    bytes.resize(start + available, 0);
                    reader.fetch(&mut bytes[start..])?;
                    *remaining -= available;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conduit::wire::cursor::{MessageReader, MessageWriter};

    #[test]
    fn test_fixed_size_capture() {
        let mut writer = MessageWriter::with_capacity(1, 4);
        writer.write_u32(0xAABBCCDD).unwrap();
        let buffer = writer.into_buffer();

        let mut reader = MessageReader::over_body(&buffer, false);
        let mut capture = ValueBytesReader::fixed(4);
        match capture.step(&mut reader).unwrap() {
            Progress::Done(bytes) => assert_eq!(bytes, buffer.body()),
            Progress::NeedBytes(_) => panic!("capture stalled on complete input"),
        }
    }

    #[test]
    fn test_explicit_size_capture() {
        let mut writer = MessageWriter::with_capacity(1, 1 + 3);
        varint::write(&mut writer, 3).unwrap();
        writer.write_bytes(&[7, 8, 9]).unwrap();
        let buffer = writer.into_buffer();

        let mut reader = MessageReader::over_body(&buffer, false);
        let mut capture = ValueBytesReader::explicit();
        match capture.step(&mut reader).unwrap() {
            Progress::Done(bytes) => assert_eq!(bytes, &[7, 8, 9]),
            Progress::NeedBytes(_) => panic!("capture stalled on complete input"),
        }
    }

    #[test]
    fn test_capture_reports_needed_bytes_on_empty_input() {
        let buffer = conduit::wire::MessageBuffer::create(1, 0);
        let mut reader = MessageReader::over_body(&buffer, false);

        let mut capture = ValueBytesReader::explicit();
        match capture.step(&mut reader).unwrap() {
            Progress::NeedBytes(needed) => assert_eq!(needed, 1),
            Progress::Done(_) => panic!("capture completed without input"),
        }
    }
}
