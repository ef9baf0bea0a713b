// Operation codes for the replication RPC protocol

// Peer protocol
pub const OP_VERSION: u16 = 1;
pub const OP_ADD_PEER: u16 = 2;    // key: node id, value: hint (u64) + announce address
pub const OP_IDENTIFY: u16 = 3;
pub const OP_GET: u16 = 4;
pub const OP_READ_STREAM: u16 = 5; // value: JSON range options

// Client writes, routed through the replicating store
pub const OP_PUT: u16 = 10;
pub const OP_DEL: u16 = 11;

// Stats and status
pub const OP_STATS: u16 = 20;

// Replies
pub const OP_ACK: u16 = 100;
pub const OP_VALUE: u16 = 101;
pub const OP_NOT_FOUND: u16 = 102;
pub const OP_RECORD: u16 = 103;
pub const OP_STREAM_END: u16 = 104;
pub const OP_ERROR: u16 = 105;
