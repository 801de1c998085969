/// Sync protocol: digests, wire frames, outbound delivery.
///
/// Sync is pull-based. A device sends its `SyncDigest`; the peer answers
/// with the ops the digest shows missing, in chunks, and asks back when the
/// digest lists ops it lacks itself. Missing dependencies are fetched by id.
pub mod digest;
pub mod dispatcher;
pub mod frame;

pub use digest::{AuthorSummary, SyncDigest};
pub use dispatcher::{DispatchPolicy, Dispatcher, PeerAddress, Transport, TransportError};
pub use frame::{
    chunk_ops, sync_response_frames, FetchRequest, Frame, FrameMessage, RequestBody,
    SecretRequest, SignedRequest, SyncError, SyncRequest, FRAME_WIRE_VERSION,
};
