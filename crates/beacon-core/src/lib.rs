pub mod errors;
pub mod ids;
pub mod link;
pub mod request;
pub mod session;
pub mod transport;

pub use errors::SdkError;
pub use ids::{IdentityId, RequestId, SessionId};
pub use link::{LinkContext, Trigger};
pub use request::{Request, RequestKind, SessionPayload};
pub use session::{SessionData, SessionResult};
pub use transport::{DispatchMeta, ServerResponse, Transport};
