pub mod loopback_transport;
pub mod void_transport;
