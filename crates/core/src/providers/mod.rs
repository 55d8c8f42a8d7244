pub mod http;
pub mod resolver;
pub mod stub;

pub use http::{HttpClientFactory, HttpReasoningClient};
pub use resolver::StaticProviderResolver;
pub use stub::StubReasoningClient;
