//! HTTP gateways
//!
//! The host serves two routers on two listeners:
//!
//! - the control plane ([`control_router`]) exposes lifecycle operations and
//!   is meant for the internal interface only;
//! - the data plane ([`data_router`]) routes invocations to active plugins
//!   and is the only router bound to the external port.
//!
//! The routers share no routes. Control operations are unreachable from the
//! external port because they are simply not part of that router.

mod auth;
mod error;
mod external;
mod internal;

pub use error::{ControlError, RoutingError};
pub use external::{data_router, DataPlane, TIMEOUT_HEADER};
pub use internal::control_router;
