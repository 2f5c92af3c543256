mod socket_state;

pub(crate) use socket_state::SocketState;
