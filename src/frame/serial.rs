use super::*;

const ERROR_CODE_UNKNOWN_CONNECTION: u32 = 0x01;
const ERROR_CODE_REMOTE_ID_MISMATCH: u32 = 0x02;

/// Bounds-checked big-endian reader over a byte slice.
pub struct Reader<'a> {
    buffer: &'a [u8],
    bytes_read: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buffer: &'a [u8]) -> Self {
        Self {
            buffer,
            bytes_read: 0,
        }
    }

    pub fn bytes_read(&self) -> usize {
        self.bytes_read
    }

    fn take<const N: usize>(&mut self) -> Option<[u8; N]> {
        let end = self.bytes_read.checked_add(N)?;
        let bytes = self.buffer.get(self.bytes_read..end)?;
        self.bytes_read = end;
        bytes.try_into().ok()
    }

    pub fn read_u8(&mut self) -> Option<u8> {
        self.take::<1>().map(|b| b[0])
    }

    pub fn read_u16(&mut self) -> Option<u16> {
        self.take::<2>().map(u16::from_be_bytes)
    }

    pub fn read_u32(&mut self) -> Option<u32> {
        self.take::<4>().map(u32::from_be_bytes)
    }
}

/// Big-endian writer appending to a growable buffer.
pub struct Writer<'a> {
    buffer: &'a mut Vec<u8>,
    bytes_written: usize,
}

impl<'a> Writer<'a> {
    pub fn new(buffer: &'a mut Vec<u8>) -> Self {
        Self {
            buffer,
            bytes_written: 0,
        }
    }

    pub fn bytes_written(&self) -> usize {
        self.bytes_written
    }

    pub fn write_u8(&mut self, value: u8) {
        self.write_slice(&[value]);
    }

    pub fn write_u16(&mut self, value: u16) {
        self.write_slice(&value.to_be_bytes());
    }

    pub fn write_u32(&mut self, value: u32) {
        self.write_slice(&value.to_be_bytes());
    }

    pub fn write_slice(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
        self.bytes_written += bytes.len();
    }
}

pub fn verify_minimum_size(datagram: &[u8]) -> bool {
    datagram.len() >= HEADER_SIZE
}

pub fn read_signature(datagram: &[u8]) -> Option<Signature> {
    Reader::new(datagram).read_u16()
}

/// Reads the full low-level header. Returns `None` if the datagram is too short.
pub fn read_header(datagram: &[u8]) -> Option<Header> {
    let rd = &mut Reader::new(datagram);

    let signature = rd.read_u16()?;
    let remote_id = rd.read_u16()?;
    let local_id = rd.read_u16()?;

    Some(Header {
        signature,
        remote_id,
        local_id,
    })
}

/// Writes a header from the sender's point of view: its own ID first, then the ID it
/// addresses.
pub fn write_header(
    wr: &mut Writer,
    signature: Signature,
    local_id: ConnectionId,
    remote_id: ConnectionId,
) {
    wr.write_u16(signature);
    wr.write_u16(local_id);
    wr.write_u16(remote_id);
}

pub fn payload(datagram: &[u8]) -> &[u8] {
    debug_assert!(verify_minimum_size(datagram));

    &datagram[HEADER_SIZE..]
}

fn write_version_range(wr: &mut Writer, range: &VersionRange<u8>) {
    wr.write_u8(range.minimum);
    wr.write_u8(range.maximum);
}

fn read_version_range(rd: &mut Reader) -> Option<VersionRange<u8>> {
    let minimum = rd.read_u8()?;
    let maximum = rd.read_u8()?;

    if minimum > maximum {
        return None;
    }

    Some(VersionRange::new(minimum, maximum))
}

impl LowLevelPacket for StartConnectionPacket {
    const SIGNATURE: Signature = signature::START_CONNECTION;

    fn serialize(&self, wr: &mut Writer, _version: u8) {
        write_version_range(wr, &self.lowlevel_versions);
        write_version_range(wr, &self.highlevel_versions);
    }

    fn deserialize(rd: &mut Reader, _version: u8) -> Option<Self> {
        let lowlevel_versions = read_version_range(rd)?;
        let highlevel_versions = read_version_range(rd)?;

        Some(Self {
            lowlevel_versions,
            highlevel_versions,
        })
    }
}

impl LowLevelPacket for AcceptConnectionPacket {
    const SIGNATURE: Signature = signature::ACCEPT_CONNECTION;

    fn serialize(&self, wr: &mut Writer, _version: u8) {
        wr.write_u8(self.lowlevel_version);
        wr.write_u8(self.highlevel_version);
    }

    fn deserialize(rd: &mut Reader, _version: u8) -> Option<Self> {
        let lowlevel_version = rd.read_u8()?;
        let highlevel_version = rd.read_u8()?;

        Some(Self {
            lowlevel_version,
            highlevel_version,
        })
    }
}

impl From<u32> for ErrorCode {
    fn from(code: u32) -> Self {
        match code {
            ERROR_CODE_UNKNOWN_CONNECTION => ErrorCode::UnknownConnection,
            ERROR_CODE_REMOTE_ID_MISMATCH => ErrorCode::RemoteIdMismatch,
            other => ErrorCode::Other(other),
        }
    }
}

impl From<ErrorCode> for u32 {
    fn from(code: ErrorCode) -> Self {
        match code {
            ErrorCode::UnknownConnection => ERROR_CODE_UNKNOWN_CONNECTION,
            ErrorCode::RemoteIdMismatch => ERROR_CODE_REMOTE_ID_MISMATCH,
            ErrorCode::Other(other) => other,
        }
    }
}

impl LowLevelPacket for ErrorPacket {
    const SIGNATURE: Signature = signature::ERROR;

    fn serialize(&self, wr: &mut Writer, _version: u8) {
        wr.write_u32(self.code.into());
    }

    fn deserialize(rd: &mut Reader, _version: u8) -> Option<Self> {
        let code = rd.read_u32()?;

        Some(Self { code: code.into() })
    }
}
