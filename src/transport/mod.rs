mod http_transport;

pub use http_transport::{read_body, UpstreamClient};
