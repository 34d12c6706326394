/*
    core_sync - Replication of operation-log entries through a relay

    Components:
    - OperationEnvelope: opaque (device, seq, bytes) wrapper a relay can store
    - RelayTransport: async boundary to whatever relay carries envelopes
    - MemoryRelay: in-process relay with online/offline and latency switches
    - ExponentialBackoff: retry policy for transient transport failures
    - SyncEngine: push/pull with persisted checkpoints

    The relay never sees plaintext: field values inside each op are sealed
    before the op reaches the log.
*/

pub mod backoff;
pub mod engine;
pub mod memory_relay;
pub mod transport;

pub use backoff::ExponentialBackoff;
pub use engine::{SyncCheckpoint, SyncEngine, SyncReport};
pub use memory_relay::MemoryRelay;
pub use transport::{OperationEnvelope, RelayTransport};
