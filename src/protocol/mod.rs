pub mod checksum;
pub mod codec;
pub mod error;
pub mod extra_info;
pub mod flags;
pub mod header;
pub mod packet;

pub use codec::{Ob20Codec, Ob20Packet};
pub use error::{ProtocolError, OB_ALLOCATE_MEMORY_FAILED, OB_ERR_UNEXPECTED, OB_INVALID_ARGUMENT};
pub use extra_info::{
    ExtraInfoKey, KeyRange, Ob20ExtraInfo, SessionSyncFragment, SessionSyncInfoType,
};
pub use flags::{Ob20ProtocolFlags, Ob20ProtocolHeaderParam};
pub use header::{Ob20ProtocolHeader, OB20_HEADER_LEN, OB20_MAGIC_NUM, OB20_VERSION};
pub use packet::{Command, CompressedHeader, Packet};
