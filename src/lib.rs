// qport public library surface.
//
// Userspace I/O queues over kernel-bypass network stacks: applications open
// queues, submit non-blocking push/pop operations, and wait on or poll
// queue tokens for completion. Two interchangeable backends sit underneath
// a TCP-style byte-stream transport and a UDP-over-raw-Ethernet packet
// device, both consumed through traits.

pub mod api;

pub mod config;

mod dgram;

pub mod io;

pub mod metrics;

pub mod packet;

pub mod pending;

pub mod queue;

mod stream;

pub mod token;

pub mod wire;

pub use api::{
    Completion, PacketDevice, Sga, SgaError, SocketType, StreamTransport, MAX_SGA_SEGMENTS,
};

pub use config::{AddrTable, Config, ConfigError, Neighbor, PacketConfig, StreamConfig};

pub use io::host::{HostSock, HostStream};
pub use io::loopback::{LoopDevice, LoopSock, LoopStream};
pub use io::poll::{Event, Interest, Poller};

pub use metrics::{Metrics, MetricsError};

pub use packet::{
    build_frame, ip_checksum, parse_frame, DropReason, MacAddr, PacketError, ETHER_HDR_LEN,
    IPV4_HDR_LEN, UDP_HDR_LEN,
};

pub use pending::RequestFailure;

pub use queue::{QueueError, Stack};

pub use token::{OpKind, QToken, Qd, TokenMint};

pub use wire::{
    decode_frame, encode_frame, FrameHeader, WireError, FRAME_HDR_LEN, FRAME_MAGIC,
    MAX_FRAME_PAYLOAD,
};
