mod rcv_buffer;
mod rcv_queue;
mod snd_buffer;
mod snd_queue;

pub(crate) use rcv_buffer::RcvBuffer;
pub(crate) use rcv_queue::{maintenance_worker, receive_worker};
pub(crate) use snd_buffer::SndBuffer;
pub(crate) use snd_queue::{scheduler_worker, UdtSndQueue};
