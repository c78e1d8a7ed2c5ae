/// A payload message that can cross the group framing layer.
///
/// The framing core treats message bodies as opaque bytes; this trait is the
/// only seam between it and concrete payload schemas. Implementations decide
/// their own encoding (protobuf, bincode-style, hand-rolled).
pub trait Message: Sized + Send + 'static {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Parse one message body.
    fn decode(buf: &[u8]) -> std::result::Result<Self, Self::Error>;

    /// Append this message's encoding to `out`.
    fn encode(&self, out: &mut Vec<u8>);
}
