//! pgfleet-infra — the controller's view of the outside world.
//!
//! Three collaborators are reached through dyn-safe traits so the control
//! loop can be driven by a real platform client or by the in-process
//! simulation in [`sim`]:
//!
//! - [`Infrastructure`]: volumes, database instances, fencing, promotion,
//!   probing, base backups and WAL fetches. Every request is idempotent and
//!   keyed by the instance id.
//! - [`ObjectStore`]: backup artifact storage.
//! - [`CredentialSource`]: resolves `SecretRef`s at dispatch time.

pub mod error;
pub mod sim;
pub mod traits;
pub mod types;

pub use error::{InfraError, InfraErrorKind, InfraResult};
pub use traits::{CredentialSource, InfraFuture, Infrastructure, ObjectStore};
pub use types::*;
