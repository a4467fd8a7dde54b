//! `Skein` Core: observable primitive, operation model, error codes, and wire messages.

pub mod error;
pub mod fingerprint;
pub mod messages;
pub mod observable;
pub mod operation;

pub use error::{ErrorCode, ErrorShape, RpcError};
pub use fingerprint::Fingerprint;
pub use observable::{
    Callbacks, Incomplete, Observable, ObservableFuture, Observer, Subscriber, Subscription,
    Tap, Teardown,
};
pub use operation::{Operation, OperationId, OperationKind};
