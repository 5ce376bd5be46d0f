mod socket;

pub(crate) const UDP_MAX_SIZE: usize = 2048;

pub(crate) use socket::{bind_tcp_listener, bind_udp_socket, is_transient_accept_error};
