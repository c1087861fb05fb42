use crate::registry::EndpointFactory;

/// StubFactory backs the optional schemes (grpc, rtsp, email, webhook).
/// Both roles fall through to the trait defaults, which report the
/// scheme as not implemented; embedders replace the registration to
/// supply a real driver.
pub struct StubFactory;

impl EndpointFactory for StubFactory {}
