use std::fmt;

#[derive(Debug)]
pub enum Error {
    InvalidScheme,
    InvalidAuthority,
    InvalidPort,
    WhitespaceInUri,
    PortOutOfRange,
    DeclaredSizeOverflow,
    ShortRead,
    MalformedHeader,
    MalformedExtension,
    Z85Decode,
    Z85PadLen,
}

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}
