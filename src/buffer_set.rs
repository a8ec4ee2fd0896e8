//! Scratch buffers shared by the request actor and the protocol engine.

/// The buffers a single in-flight request needs: space to stage an inbound frame and space to
/// stage an outbound message batch. Column layout from `RowDescription` is copied into owned
/// `String`s by the engine as it arrives, so no buffer needs to outlive the message it came in.
#[derive(Debug, Default)]
pub struct BufferSet {
    /// Holds the payload of the frame currently being decoded.
    pub read_buffer: Vec<u8>,
    /// Type byte of the message currently in `read_buffer`.
    pub type_byte: u8,
    /// Staged outbound bytes for the next socket write.
    pub write_buffer: Vec<u8>,
}

impl BufferSet {
    pub fn new() -> Self {
        Self {
            read_buffer: Vec::with_capacity(8192),
            type_byte: 0,
            write_buffer: Vec::with_capacity(8192),
        }
    }

    pub fn clear(&mut self) {
        self.read_buffer.clear();
        self.type_byte = 0;
        self.write_buffer.clear();
    }
}
