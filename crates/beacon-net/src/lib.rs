pub mod http;
pub mod mock;

pub use http::{HttpTransport, DEFAULT_API_URL};
pub use mock::{MockCall, MockReply, MockTransport};
