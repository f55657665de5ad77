use bytes::Bytes;
use lazy_static::lazy_static;

pub const HELLOWORLD_CONTENTS: &[u8] = b"Hello World!";

/// Small block size used throughout the tests, so multi-block layouts stay
/// readable.
pub const SMALL_BLOCK_SIZE: u64 = 4;

lazy_static! {
    // 2 bytes
    pub static ref BLOB_A: Bytes = vec![0x00, 0x01].into();

    // 1MB
    pub static ref BLOB_B: Bytes = (0..255).collect::<Vec<u8>>().repeat(4 * 1024).into();
}
