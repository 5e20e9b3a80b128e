pub mod sorted_buffer;

pub use sorted_buffer::{BufferMode, SortedPointBuffer};
