//! Chunked concurrent multipart uploader.

mod buffer;
mod uploader;

pub use buffer::{
    get_buffer, outstanding_buffers, peak_outstanding_buffers, put_buffer,
    reset_peak_outstanding, POOL_BLOCK_SIZE,
};
pub use uploader::Uploader;
