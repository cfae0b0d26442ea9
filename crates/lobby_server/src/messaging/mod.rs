//! The lobby wire protocol and request dispatch.
//!
//! [`types`] defines both directions of the protocol as closed enums and
//! [`router`] runs an authenticated client's requests against the lobby
//! services.

pub mod router;
pub mod types;

pub use router::{route_client_request, RequestContext};
pub use types::{ClientEnvelope, ClientRequest, ServerEvent};
