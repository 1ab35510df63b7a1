use std::time::Duration;

/// Tunables for the gateway, sessions and rooms.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Room persistence tick cadence.
    pub persist_interval: Duration,
    /// Merged updates between forced snapshots.
    pub snapshot_update_threshold: u64,
    /// Max age of the newest snapshot while the room is dirty.
    pub snapshot_time_threshold: Duration,
    /// How long an empty, clean room survives before the sweeper destroys it.
    pub room_idle_ttl: Duration,
    /// Registry sweep cadence.
    pub sweep_interval: Duration,
    /// Outbound queue bound per session, in frames.
    pub session_outbound_capacity: usize,
    /// Room inbox bound, in messages.
    pub room_inbox_capacity: usize,
    /// Server-initiated ping cadence.
    pub heartbeat_interval: Duration,
    /// Consecutive missed pongs before the socket is closed.
    pub heartbeat_miss_limit: u32,
    /// Time allowed from connect to successful authentication.
    pub auth_deadline: Duration,
    /// Time allowed for a join, including the state load.
    pub join_deadline: Duration,
    /// Per-frame socket write budget; also the bounded wait for a full
    /// room inbox.
    pub write_timeout: Duration,
    /// Wall-clock budget for graceful shutdown.
    pub shutdown_grace: Duration,
    /// Minimum spacing of cursor broadcasts per session (30 Hz cap).
    pub cursor_min_interval: Duration,
    /// Ceiling for the persistence retry backoff.
    pub persist_backoff_cap: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            persist_interval: Duration::from_secs(2),
            snapshot_update_threshold: 100,
            snapshot_time_threshold: Duration::from_secs(300),
            room_idle_ttl: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(10),
            session_outbound_capacity: 1024,
            room_inbox_capacity: 256,
            heartbeat_interval: Duration::from_secs(15),
            heartbeat_miss_limit: 2,
            auth_deadline: Duration::from_secs(10),
            join_deadline: Duration::from_secs(15),
            write_timeout: Duration::from_secs(10),
            shutdown_grace: Duration::from_secs(30),
            cursor_min_interval: Duration::from_millis(33),
            persist_backoff_cap: Duration::from_secs(60),
        }
    }
}
