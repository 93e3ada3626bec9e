pub mod allocator;
pub mod clock;
pub mod server;
pub mod sink;
