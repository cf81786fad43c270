pub mod allocator;
pub mod buffer;
pub mod commands;
pub mod context;
pub mod devices;
pub mod handle;
