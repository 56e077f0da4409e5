// carbond-receiver - Wire listeners for the plaintext and pickle protocols
//
// Each listener parses its protocol, counts what it sees, forwards batches
// into the cache ingress channel and reports its counters once a minute as
// synthetic metrics through the same channel.

mod pickle;
mod receiver;
mod tcp;
mod udp;

pub use receiver::{Protocol, Receiver, ReceiverSettings};
