//! Outbound calls: HTTP transport, callback channels and fan-out

pub mod blob;
pub mod broker;
pub mod client;
pub mod fanout;
pub mod transport;

pub use blob::{BlobStore, FsBlobStore, MemoryBlobStore};
pub use broker::{CallbackBroker, Delivery, DeliveryStream, LocalBroker};
pub use client::ServiceClient;
pub use fanout::{
    Dispatcher, Round, RoundStatus, Submission, collect_replies, end_message, is_end_message,
};
pub use transport::{ReqwestTransport, Transport, TransportReply};
