//! Chunked file transfer over an established data channel.

pub mod crypto;
pub mod message;
pub mod receiver;
pub mod sender;

pub use crypto::SessionCipher;
pub use message::DataMessage;
pub use receiver::{save_completed, CompletedFile, ReceiveEvent, TransferReceiver};
pub use sender::{send_file, wait_for_drain, ChunkSink, OutgoingFile, SendOptions};
