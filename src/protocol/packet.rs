use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};

/// MySQL packet header size: 3 bytes length + 1 byte sequence
pub const PACKET_HEADER_SIZE: usize = 4;
/// MySQL compressed packet header size: 3 bytes compressed length + 1 byte
/// sequence + 3 bytes uncompressed length
pub const COMPRESSED_HEADER_SIZE: usize = 7;

/// Read a 3-byte little endian integer
pub(crate) fn get_u24_le(buf: &mut impl Buf) -> u32 {
    let b0 = buf.get_u8() as u32;
    let b1 = buf.get_u8() as u32;
    let b2 = buf.get_u8() as u32;
    b0 | (b1 << 8) | (b2 << 16)
}

/// Write the low 3 bytes of `value`, little endian
pub(crate) fn put_u24_le(buf: &mut impl BufMut, value: u32) {
    buf.put_u8((value & 0xFF) as u8);
    buf.put_u8(((value >> 8) & 0xFF) as u8);
    buf.put_u8(((value >> 16) & 0xFF) as u8);
}

/// MySQL compressed packet header
///
/// OB20 packets reuse this envelope. The compressed length covers everything
/// after these 7 bytes; the uncompressed length is 0 when the body is sent
/// as is.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompressedHeader {
    pub compressed_len: u32,
    pub seq: u8,
    pub uncompressed_len: u32,
}

impl CompressedHeader {
    pub fn new(compressed_len: u32, seq: u8) -> Self {
        Self {
            compressed_len,
            seq,
            uncompressed_len: 0,
        }
    }

    pub fn encode(&self, dst: &mut impl BufMut) {
        put_u24_le(dst, self.compressed_len);
        dst.put_u8(self.seq);
        put_u24_le(dst, self.uncompressed_len);
    }

    /// Read from the first 7 bytes of `src`; the caller checks the length
    pub fn read(src: &mut impl Buf) -> Self {
        let compressed_len = get_u24_le(src);
        let seq = src.get_u8();
        let uncompressed_len = get_u24_le(src);
        Self {
            compressed_len,
            seq,
            uncompressed_len,
        }
    }
}

impl fmt::Display for CompressedHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "compressed_len={}, seq={}, uncompressed_len={}",
            self.compressed_len, self.seq, self.uncompressed_len
        )
    }
}

/// MySQL wire protocol packet
#[derive(Debug, Clone)]
pub struct Packet {
    pub sequence_id: u8,
    pub payload: Bytes,
}

impl Packet {
    pub fn new(sequence_id: u8, payload: impl Into<Bytes>) -> Self {
        Self {
            sequence_id,
            payload: payload.into(),
        }
    }

    /// Encode packet to bytes (header + payload)
    pub fn encode(&self, dst: &mut BytesMut) {
        put_u24_le(dst, self.payload.len() as u32);
        dst.put_u8(self.sequence_id);
        dst.extend_from_slice(&self.payload);
    }

    /// Try to decode packet from bytes, returns None if not enough data
    pub fn decode(src: &mut BytesMut) -> Option<Self> {
        if src.len() < PACKET_HEADER_SIZE {
            return None;
        }

        let len = src[0] as usize | ((src[1] as usize) << 8) | ((src[2] as usize) << 16);
        if src.len() < PACKET_HEADER_SIZE + len {
            return None;
        }

        let sequence_id = src[3];
        src.advance(PACKET_HEADER_SIZE);
        let payload = src.split_to(len).freeze();

        Some(Self {
            sequence_id,
            payload,
        })
    }

    /// Command byte of a client request packet
    pub fn command(&self) -> Option<Command> {
        self.payload.first().map(|b| Command::from(*b))
    }
}

/// MySQL command types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum Command {
    Sleep = 0x00,
    Quit = 0x01,
    InitDb = 0x02,
    Query = 0x03,
    FieldList = 0x04,
    CreateDb = 0x05,
    DropDb = 0x06,
    Refresh = 0x07,
    Shutdown = 0x08,
    Statistics = 0x09,
    ProcessInfo = 0x0a,
    Connect = 0x0b,
    ProcessKill = 0x0c,
    Debug = 0x0d,
    Ping = 0x0e,
    Time = 0x0f,
    DelayedInsert = 0x10,
    ChangeUser = 0x11,
    BinlogDump = 0x12,
    TableDump = 0x13,
    ConnectOut = 0x14,
    RegisterSlave = 0x15,
    StmtPrepare = 0x16,
    StmtExecute = 0x17,
    StmtSendLongData = 0x18,
    StmtClose = 0x19,
    StmtReset = 0x1a,
    SetOption = 0x1b,
    StmtFetch = 0x1c,
    Daemon = 0x1d,
    BinlogDumpGtid = 0x1e,
    ResetConnection = 0x1f,
    #[default]
    Unknown = 0xff,
}

impl Command {
    /// Protocol name, as MySQL spells it
    pub fn name(&self) -> &'static str {
        match self {
            Command::Sleep => "COM_SLEEP",
            Command::Quit => "COM_QUIT",
            Command::InitDb => "COM_INIT_DB",
            Command::Query => "COM_QUERY",
            Command::FieldList => "COM_FIELD_LIST",
            Command::CreateDb => "COM_CREATE_DB",
            Command::DropDb => "COM_DROP_DB",
            Command::Refresh => "COM_REFRESH",
            Command::Shutdown => "COM_SHUTDOWN",
            Command::Statistics => "COM_STATISTICS",
            Command::ProcessInfo => "COM_PROCESS_INFO",
            Command::Connect => "COM_CONNECT",
            Command::ProcessKill => "COM_PROCESS_KILL",
            Command::Debug => "COM_DEBUG",
            Command::Ping => "COM_PING",
            Command::Time => "COM_TIME",
            Command::DelayedInsert => "COM_DELAYED_INSERT",
            Command::ChangeUser => "COM_CHANGE_USER",
            Command::BinlogDump => "COM_BINLOG_DUMP",
            Command::TableDump => "COM_TABLE_DUMP",
            Command::ConnectOut => "COM_CONNECT_OUT",
            Command::RegisterSlave => "COM_REGISTER_SLAVE",
            Command::StmtPrepare => "COM_STMT_PREPARE",
            Command::StmtExecute => "COM_STMT_EXECUTE",
            Command::StmtSendLongData => "COM_STMT_SEND_LONG_DATA",
            Command::StmtClose => "COM_STMT_CLOSE",
            Command::StmtReset => "COM_STMT_RESET",
            Command::SetOption => "COM_SET_OPTION",
            Command::StmtFetch => "COM_STMT_FETCH",
            Command::Daemon => "COM_DAEMON",
            Command::BinlogDumpGtid => "COM_BINLOG_DUMP_GTID",
            Command::ResetConnection => "COM_RESET_CONNECTION",
            Command::Unknown => "COM_UNKNOWN",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl From<u8> for Command {
    fn from(value: u8) -> Self {
        match value {
            0x00 => Command::Sleep,
            0x01 => Command::Quit,
            0x02 => Command::InitDb,
            0x03 => Command::Query,
            0x04 => Command::FieldList,
            0x05 => Command::CreateDb,
            0x06 => Command::DropDb,
            0x07 => Command::Refresh,
            0x08 => Command::Shutdown,
            0x09 => Command::Statistics,
            0x0a => Command::ProcessInfo,
            0x0b => Command::Connect,
            0x0c => Command::ProcessKill,
            0x0d => Command::Debug,
            0x0e => Command::Ping,
            0x0f => Command::Time,
            0x10 => Command::DelayedInsert,
            0x11 => Command::ChangeUser,
            0x12 => Command::BinlogDump,
            0x13 => Command::TableDump,
            0x14 => Command::ConnectOut,
            0x15 => Command::RegisterSlave,
            0x16 => Command::StmtPrepare,
            0x17 => Command::StmtExecute,
            0x18 => Command::StmtSendLongData,
            0x19 => Command::StmtClose,
            0x1a => Command::StmtReset,
            0x1b => Command::SetOption,
            0x1c => Command::StmtFetch,
            0x1d => Command::Daemon,
            0x1e => Command::BinlogDumpGtid,
            0x1f => Command::ResetConnection,
            _ => Command::Unknown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compressed_header_layout() {
        let mut buf = BytesMut::new();
        CompressedHeader::new(0x01_02_03, 7).encode(&mut buf);
        assert_eq!(&buf[..], &[0x03, 0x02, 0x01, 7, 0, 0, 0]);

        let hdr = CompressedHeader::read(&mut &buf[..]);
        assert_eq!(hdr.compressed_len, 0x01_02_03);
        assert_eq!(hdr.seq, 7);
        assert_eq!(hdr.uncompressed_len, 0);
    }

    #[test]
    fn test_packet_decode_waits_for_full_payload() {
        let mut buf = BytesMut::new();
        Packet::new(0, vec![0x03, b'S']).encode(&mut buf);
        let mut partial = BytesMut::from(&buf[..5]);
        assert!(Packet::decode(&mut partial).is_none());

        let packet = Packet::decode(&mut buf).unwrap();
        assert_eq!(packet.command(), Some(Command::Query));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_command_names() {
        assert_eq!(Command::from(0x01), Command::Quit);
        assert_eq!(Command::Quit.to_string(), "COM_QUIT");
        assert_eq!(Command::from(0x42), Command::Unknown);
    }
}
