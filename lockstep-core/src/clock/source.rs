use async_trait::async_trait;

/// The reply to a ping, carrying the reference clock's reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimePong {
    /// The local send time the ping carried, echoed back unchanged
    pub client_send_time_ms: i64,
    /// The reference clock's reading when the pong was produced
    pub reference_time_ms: i64,
}

/// Represents a channel to the reference clock that can be pinged.
///
/// Implementors bridge the session to whatever transport carries the
/// time messages. Pongs are expected in the order pings were sent, but
/// stray replies for older pings are tolerated.
#[async_trait]
pub trait TimeSource: Send + Sync + 'static {
    /// Sends a ping carrying the local send time.
    async fn send_ping(&self, client_send_time_ms: i64);

    /// Waits for the next pong. Returns None if the source is gone.
    async fn recv_pong(&self) -> Option<TimePong>;
}
