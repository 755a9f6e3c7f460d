/// Version byte written at the start of every frame.
pub const PROTOCOL_VERSION: u8 = 1;

/// Largest frame that fits in a single UDP datagram.
pub const MAX_FRAME_SIZE: usize = 65_507;

/// Upper bound for the JSON header of a frame.
pub const MAX_HEADER_SIZE: usize = 4 * 1024;

/// Largest chunk size a manifest may declare (60 KiB).
///
/// Leaves room for the frame prefix and header inside [`MAX_FRAME_SIZE`].
pub const MAX_CHUNK_SIZE: u32 = 60 * 1024;

/// Default chunk size: 16 KiB.
pub const DEFAULT_CHUNK_SIZE: u32 = 16 * 1024;

/// Length of a transfer identifier in hex characters.
pub const TRANSFER_ID_LEN: usize = 32;

/// Frame prefix: 1 version byte + 4 header length bytes.
pub(crate) const FRAME_PREFIX_LEN: usize = 5;
