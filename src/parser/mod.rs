//! Message parsing: header/body split, header unfolding and encoded-word decoding.

pub mod header;
pub mod message;
