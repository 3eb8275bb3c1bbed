use std::net::SocketAddr;
use std::time::Duration;
use anyhow::bail;

#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// address the transport accepts incoming connections on
    pub listen_addr: SocketAddr,

    /// size of the buffer a connection reads into. Each read is delivered to the protocol
    ///  handler as a single `on_bytes_received` call, so this is also the maximum chunk size a
    ///  handler sees.
    pub read_buffer_size: usize,

    /// This is the number of buffers that can be queued for sending on a connection before
    ///  `send()` starts failing. Sending never blocks the caller, so a slow peer eventually
    ///  surfaces as failed sends rather than as back pressure.
    pub send_queue_capacity: usize,

    /// interval for `on_timer` upcalls, `None` for no timer
    pub timer_interval: Option<Duration>,

    /// number of context slots kept for reuse after their connections are gone
    pub context_pool_size: usize,

    /// number of tasks executing the scheduler's jobs
    pub scheduler_workers: usize,
}

impl TransportConfig {
    pub fn new(listen_addr: SocketAddr) -> TransportConfig {
        TransportConfig {
            listen_addr,
            read_buffer_size: 16*1024,
            send_queue_capacity: 1024,
            timer_interval: None,
            context_pool_size: 256,
            scheduler_workers: 1,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.read_buffer_size == 0 {
            bail!("read buffer size must be positive");
        }
        if self.send_queue_capacity == 0 {
            bail!("send queue capacity must be positive");
        }
        if self.scheduler_workers == 0 {
            bail!("at least one scheduler worker is required");
        }
        if let Some(interval) = self.timer_interval {
            if interval.is_zero() {
                bail!("timer interval must be positive");
            }
        }

        Ok(())
    }
}
