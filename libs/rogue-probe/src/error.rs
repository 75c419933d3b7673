use ipam_core::dhcproto::error::EncodeError;

#[derive(thiserror::Error, Debug)]
pub enum ProbeError {
    #[error("io error: {0:?}")]
    Io(#[from] std::io::Error),
    #[error("failed to encode probe message")]
    Encode(#[from] EncodeError),
    #[error("no usable {family} interface")]
    NoInterface { family: &'static str },
    #[error("datalink channel on {iface}: {reason}")]
    Datalink { iface: String, reason: String },
}

pub type Result<T> = std::result::Result<T, ProbeError>;
