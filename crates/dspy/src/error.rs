use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("unknown message id {0:#x}")]
    UnknownMessage(i32),
    #[error("message length {0} out of range")]
    BadLength(i32),
    #[error("unknown sample format code {0}")]
    UnknownFormat(i32),
    #[error("unexpected message {got} while {expected}")]
    Handshake { expected: &'static str, got: &'static str },
    #[error("display client `{0}` could not be spawned: {1}")]
    Spawn(String, std::io::Error),
    #[error("image save failed: {0}")]
    Save(#[from] image::ImageError),
    #[error("data rectangle outside the declared image window")]
    DataOutOfWindow,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
