/// Errors that stop the relay server.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("invalid bind address: {0}")]
    InvalidAddress(String),

    #[error("stream listener: {0}")]
    Listen(#[from] nebula_net::NetError),

    #[error("udp host: {0}")]
    Host(#[from] nebula_rudp::HostError),
}
