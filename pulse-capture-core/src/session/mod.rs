//! Record-stream sessions on top of a [`Connection`](crate::mainloop::connection::Connection).

pub mod capture;
pub mod live;
