//! Domain layer: models, errors and ports. No I/O lives here.

pub mod errors;
pub mod models;
pub mod ports;

pub use errors::{
    BusError, CouncilError, DenialKind, DispatchError, PatchError, RouteError, StorageError, TransportError,
};
