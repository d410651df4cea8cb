pub mod device;
pub mod route_all;
